//! # nomad-containerd-driver
//!
//! **Task-driver plugin core bridging a workload orchestrator to containerd**
//!
//! For each scheduled task the driver pulls an image, assembles an OCI
//! spec, creates a container and task in the daemon, and keeps an
//! in-memory handle synchronized with daemon-side reality across plugin
//! restarts. Long-running operations (wait, stats, exec, shutdown) run
//! under cancellable deadlines derived from the driver root context.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Driver (lifecycle)                         │
//! │   Start │ Recover │ Wait │ Stop │ Destroy │ Inspect │ Stats     │
//! │         │ Signal │ Exec │ Fingerprint                           │
//! ├───────────────┬──────────────────────┬──────────────────────────┤
//! │  Spec builder │      Task store      │       Task handle        │
//! │  task config →│  task id → handle    │  state · exit watcher ·  │
//! │  OCI document │  (rwlock map)        │  stats · exec · cleanup  │
//! ├───────────────┴──────────────────────┴──────────────────────────┤
//! │                     Runtime gateway (gRPC)                      │
//! │   pull │ containers │ snapshots │ tasks │ metrics │ health      │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ unix socket
//!                     /run/containerd/containerd.sock
//! ```
//!
//! # Lifecycle
//!
//! ```text
//!  <none> ──StartTask──▶ Running ──task exit──▶ Exited
//!            │              │                     │
//!            │              ├─StopTask──▶ Stopping┘
//!            │              └─plugin restart──▶ Recover ──▶ Running | Exited
//!            ▼
//!  validation error: no side effects, nothing to destroy
//!  Exited ──DestroyTask──▶ <deleted>
//! ```
//!
//! # Guarantees
//!
//! - Validation failures happen before any daemon call: a rejected task
//!   pulled nothing and created nothing.
//! - Partial start failures roll back in place: the container and its
//!   snapshot are deleted before the error returns.
//! - The exit watcher issues its wait before the task starts, so a Wait
//!   subscriber can never miss the exit status.
//! - Wait and stats producers re-send their terminal value until the
//!   consumer goes away; slow consumers still observe it.
//!
//! # Example
//!
//! ```rust,ignore
//! use nomad_containerd_driver::{Compute, Driver, DriverConfig};
//!
//! #[tokio::main]
//! async fn main() -> nomad_containerd_driver::Result<()> {
//!     let config = DriverConfig {
//!         containerd_runtime: "io.containerd.runc.v2".to_string(),
//!         ..Default::default()
//!     };
//!     let driver = Driver::connect(config, Compute { total_ticks: 4000.0 }).await?;
//!
//!     let state = driver.start_task(&request).await?;
//!     let mut exits = driver.wait_task(&request.id)?;
//!     let result = exits.recv().await;
//!
//!     driver.destroy_task(&request.id, false).await?;
//!     Ok(())
//! }
//! ```

// =============================================================================
// Internal Modules
// =============================================================================

mod auth;
mod cgroup;
mod client;
mod constants;
mod error;
mod etchosts;
mod fifo;
mod metrics;
mod reference;
mod stats;

// =============================================================================
// Public Modules
// =============================================================================

/// Plugin and task configuration, plus the string parsers they rely on.
pub mod config;

/// OCI image documents and the pulled-image handle.
pub mod image;

/// The driver lifecycle and its orchestrator-facing types.
pub mod driver;

/// The OCI runtime spec document model.
pub mod oci;

/// Seccomp profiles: document model, default allowlist, file loading.
pub mod seccomp;

/// OCI spec assembly: ordered mutations from a task description.
pub mod spec;

/// Task handles, the task store, and task state types.
pub mod task;

// =============================================================================
// Facade
// =============================================================================

pub use config::{memory_in_bytes, parse_duration, DriverConfig, MountSpec, RegistryAuth, TaskConfig};
pub use driver::{
    Driver, DnsConfig, NetworkIsolation, RecoverRequest, TaskDirs, TaskRequest, TaskResources,
    VolumeMount,
};
pub use error::{Error, Result};
pub use reference::{normalize, parse_container_image, parse_repository_tag, ImageReference};
pub use stats::Compute;
pub use task::{
    ExecOptions, ExitResult, Fingerprint, HealthState, ProcessState, TaskResourceUsage, TaskState,
    TaskStatus, TtyResize,
};
