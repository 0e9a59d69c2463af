//! Task runtime: per-task handles and the store that owns them.

pub mod handle;
pub mod state;
pub mod store;

pub use handle::{ExecOptions, TaskHandle, TtyResize};
pub use state::{
    ExitResult, Fingerprint, HealthState, ProcessState, TaskResourceUsage, TaskState, TaskStatus,
};
pub use store::TaskStore;
