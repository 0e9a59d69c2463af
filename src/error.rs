//! Error types for the containerd task driver.

use std::time::Duration;

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the driver.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// Task description failed validation. Raised before any daemon call.
    #[error("invalid task config: {0}")]
    InvalidTaskConfig(String),

    /// Privileged task submitted while the plugin forbids them.
    #[error(
        "running privileged jobs is not allowed; set allow_privileged=true in plugin config"
    )]
    PrivilegedNotAllowed,

    /// A human memory string ("128m", "1g") could not be parsed.
    #[error("invalid memory string: {0}")]
    InvalidMemoryString(String),

    /// A duration string ("30s", "5m") could not be parsed.
    #[error("invalid duration string: {0}")]
    InvalidDuration(String),

    /// An image reference did not match the Docker reference grammar.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidImageReference { reference: String, reason: String },

    /// An extra-host entry was not of the form `name:ip`.
    #[error("invalid extra host '{0}': expected name:ip")]
    InvalidExtraHost(String),

    /// Signal name not in the supported signal table.
    #[error("invalid signal: {0}")]
    InvalidSignal(String),

    // =========================================================================
    // Task Lifecycle Errors
    // =========================================================================
    /// Task id not present in the store.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// Start called twice for the same task id.
    #[error("task with ID {0} already started")]
    TaskAlreadyStarted(String),

    /// Destroy refused because the task is still running.
    #[error("cannot destroy running task")]
    TaskStillRunning,

    // =========================================================================
    // Image/Registry Errors
    // =========================================================================
    /// Image pull failed.
    #[error("failed to pull image '{reference}': {reason}")]
    ImagePullFailed { reference: String, reason: String },

    /// Credentials helper program failed or returned an empty pair.
    #[error("auth helper '{helper}' failed: {reason}")]
    AuthHelperFailed { helper: String, reason: String },

    /// No credential source produced a usable pair.
    #[error("no auth credentials found")]
    NoCredentials,

    // =========================================================================
    // Daemon Errors
    // =========================================================================
    /// Connecting to the containerd socket failed.
    #[error("failed to connect to containerd at {socket}: {reason}")]
    DaemonUnavailable { socket: String, reason: String },

    /// A daemon RPC returned an error status.
    #[error("containerd request failed: {0}")]
    Rpc(#[from] tonic::Status),

    /// Container creation failed.
    #[error("failed to create container '{id}': {reason}")]
    ContainerCreateFailed { id: String, reason: String },

    /// Task creation failed. The container has already been rolled back.
    #[error("failed to create task for container '{id}': {reason}")]
    TaskCreateFailed { id: String, reason: String },

    /// Exec session failed.
    #[error("exec failed in container '{container}': {reason}")]
    ExecFailed { container: String, reason: String },

    /// A metrics payload could not be decoded.
    #[error("failed to decode metrics payload '{type_url}': {reason}")]
    MetricsDecode { type_url: String, reason: String },

    /// Operation exceeded its deadline.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// The driver is shutting down; in-flight operations are cancelled.
    #[error("driver is shutting down")]
    ShuttingDown,

    /// Operation not supported by this driver.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// FIFO open failed.
    #[error("failed to open fifo {path}: {reason}")]
    FifoOpen { path: String, reason: String },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// True when the underlying daemon status is NotFound. Used where a
    /// missing object is an acceptable outcome (idempotent deletes).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Rpc(status) if status.code() == tonic::Code::NotFound)
    }
}
