//! Task state types.
//!
//! This module defines the runtime state types for tasks:
//! - `ProcessState`: high-level task lifecycle state
//! - `TaskState`: the driver state persisted through the orchestrator
//! - `TaskStatus`: detailed snapshot returned by Inspect
//! - `ExitResult`: terminal outcome of a task or exec session
//! - Resource-usage and fingerprint DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

// =============================================================================
// Process State
// =============================================================================

/// High-level task lifecycle state. Transitions are monotone: `Running`
/// may move to `Exited` or `Unknown`; terminal states do not move back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Running,
    Exited,
    Unknown,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Running => write!(f, "running"),
            ProcessState::Exited => write!(f, "exited"),
            ProcessState::Unknown => write!(f, "unknown"),
        }
    }
}

// =============================================================================
// Persisted Driver State
// =============================================================================

/// The driver state handed back to the orchestrator at start and returned
/// on recovery. This is the only information that survives a plugin
/// restart; everything else is rebuilt from the daemon's view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub started_at: DateTime<Utc>,
    pub container_name: String,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

// =============================================================================
// Exit Result
// =============================================================================

/// Terminal outcome of a task or exec session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExitResult {
    pub exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl ExitResult {
    /// Successful exit.
    pub fn code(exit_code: i32) -> Self {
        Self {
            exit_code,
            err: None,
        }
    }

    /// Failed wait: the reserved exit code plus the wrapped error.
    pub fn wait_failed(err: impl std::fmt::Display) -> Self {
        Self {
            exit_code: crate::constants::EXIT_CODE_WAIT_FAILED,
            err: Some(format!("error waiting on process: {err}")),
        }
    }
}

// =============================================================================
// Task Status
// =============================================================================

/// Detailed task status snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub id: String,
    pub name: String,
    pub state: ProcessState,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_result: Option<ExitResult>,
    /// Driver attributes surfaced to operators.
    pub container_name: String,
}

// =============================================================================
// Resource Usage
// =============================================================================

/// CPU usage sample, percentages computed between consecutive samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuUsage {
    pub system_mode: f64,
    pub user_mode: f64,
    pub percent: f64,
    pub total_ticks: f64,
    pub measured: Vec<String>,
}

/// Memory usage sample in bytes. Cgroup v2 reports only swap and usage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub rss: u64,
    pub cache: u64,
    pub swap: u64,
    pub usage: u64,
    pub max_usage: u64,
    pub measured: Vec<String>,
}

/// A resource-usage sample emitted by the stats producer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResourceUsage {
    pub cpu: CpuUsage,
    pub memory: MemoryUsage,
    /// Sample time in nanoseconds since the unix epoch.
    pub timestamp: i64,
}

// =============================================================================
// Fingerprint
// =============================================================================

/// Plugin health as reported to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

/// Periodic health + attribute snapshot published to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub health: HealthState,
    pub health_description: String,
    pub attributes: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_state_round_trips_through_json() {
        let state = TaskState {
            started_at: Utc::now(),
            container_name: "redis-a1b2".to_string(),
            stdout_path: PathBuf::from("/run/fifo.out"),
            stderr_path: PathBuf::from("/run/fifo.err"),
        };
        let raw = serde_json::to_vec(&state).unwrap();
        let decoded: TaskState = serde_json::from_slice(&raw).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn wait_failed_uses_reserved_exit_code() {
        let result = ExitResult::wait_failed("daemon gone");
        assert_eq!(result.exit_code, 255);
        assert!(result.err.as_ref().unwrap().contains("daemon gone"));
    }
}
