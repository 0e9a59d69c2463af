//! Constants for the containerd task driver.
//!
//! All timeouts, identifiers, and protocol strings are defined here to
//! ensure consistency and prevent magic numbers throughout the codebase.

use std::time::Duration;

// =============================================================================
// Plugin Identity
// =============================================================================

/// Name the plugin reports to the orchestrator.
pub const PLUGIN_NAME: &str = "containerd-driver";

/// Plugin version, part of the fingerprint identity.
pub const PLUGIN_VERSION: &str = "0.1.0";

// =============================================================================
// Daemon Endpoint and Namespacing
// =============================================================================

/// Default containerd unix socket path.
pub const CONTAINERD_SOCKET: &str = "/run/containerd/containerd.sock";

/// Daemon namespace for all API calls on a cgroup v1 host.
pub const NAMESPACE_CGROUP_V1: &str = "nomad";

/// Daemon namespace on a cgroup v2 host. Doubles as the cgroup parent slice.
pub const NAMESPACE_CGROUP_V2: &str = "nomad.slice";

/// Snapshotter used for container rootfs layers.
pub const DEFAULT_SNAPSHOTTER: &str = "overlayfs";

// =============================================================================
// Timeouts
// =============================================================================

/// Deadline applied to every short daemon call (create, load, kill, delete,
/// status, metrics, version, liveness).
pub const DAEMON_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval at which fingerprints are published. The first tick fires
/// immediately.
pub const FINGERPRINT_INTERVAL: Duration = Duration::from_secs(30);

// =============================================================================
// Task Environment Keys
// =============================================================================

/// Env key holding the in-container secrets directory path.
pub const ENV_SECRETS_DIR: &str = "NOMAD_SECRETS_DIR";

/// Env key holding the in-container task-local directory path.
pub const ENV_TASK_DIR: &str = "NOMAD_TASK_DIR";

/// Env key holding the in-container shared alloc directory path.
pub const ENV_ALLOC_DIR: &str = "NOMAD_ALLOC_DIR";

/// Environment variables never copied from the orchestrator into the
/// container.
pub const SKIP_ENV_OVERRIDE: &[&str] = &["PATH"];

// =============================================================================
// Exit Codes
// =============================================================================

/// Exit code reported when waiting on the task process fails.
pub const EXIT_CODE_WAIT_FAILED: i32 = 255;

// =============================================================================
// Type URLs (containerd Any envelopes)
// =============================================================================

/// Type URL of a JSON-encoded OCI runtime spec.
pub const TYPE_URL_SPEC: &str = "types.containerd.io/opencontainers.runtime-spec.1.Spec";

/// Type URL of a JSON-encoded OCI process document (exec).
pub const TYPE_URL_PROCESS: &str = "types.containerd.io/opencontainers.runtime-spec.1.Process";

/// Type URL of the transfer-service registry source.
pub const TYPE_URL_OCI_REGISTRY: &str = "types.containerd.io/containerd.types.transfer.OCIRegistry";

/// Type URL of the transfer-service image-store destination.
pub const TYPE_URL_IMAGE_STORE: &str = "types.containerd.io/containerd.types.transfer.ImageStore";

/// Type URL suffix of cgroup v1 metrics payloads.
pub const TYPE_URL_METRICS_V1: &str = "io.containerd.cgroups.v1.Metrics";

/// Type URL suffix of cgroup v2 metrics payloads.
pub const TYPE_URL_METRICS_V2: &str = "io.containerd.cgroups.v2.Metrics";

// =============================================================================
// OCI Media Types
// =============================================================================

/// OCI image index media type.
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Docker schema2 manifest list media type.
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
