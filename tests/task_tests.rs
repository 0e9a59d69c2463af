//! Tests for task state types and the task store.

use nomad_containerd_driver::task::TaskStore;
use nomad_containerd_driver::{ExitResult, ProcessState, TaskState};
use std::path::PathBuf;

// =============================================================================
// Store
// =============================================================================

#[test]
fn store_lookup_misses_return_none() {
    let store = TaskStore::new();
    assert!(!store.contains("missing"));
    assert!(store.get("missing").is_none());
}

#[test]
fn store_delete_of_missing_id_is_a_noop() {
    let store = TaskStore::new();
    store.delete("missing");
    assert!(!store.contains("missing"));
}

// =============================================================================
// State Types
// =============================================================================

#[test]
fn process_state_serializes_lowercase() {
    assert_eq!(
        serde_json::to_string(&ProcessState::Running).unwrap(),
        "\"running\""
    );
    assert_eq!(
        serde_json::to_string(&ProcessState::Exited).unwrap(),
        "\"exited\""
    );
    assert_eq!(
        serde_json::to_string(&ProcessState::Unknown).unwrap(),
        "\"unknown\""
    );
}

#[test]
fn persisted_state_survives_a_round_trip() {
    let state = TaskState {
        started_at: chrono::Utc::now(),
        container_name: "web-a1b2c3".to_string(),
        stdout_path: PathBuf::from("/alloc/logs/.web.stdout.fifo"),
        stderr_path: PathBuf::from("/alloc/logs/.web.stderr.fifo"),
    };

    let encoded = serde_json::to_string(&state).unwrap();
    let decoded: TaskState = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded, state);
}

#[test]
fn exit_results_carry_codes_verbatim() {
    let result = ExitResult::code(7);
    assert_eq!(result.exit_code, 7);
    assert!(result.err.is_none());
}

#[test]
fn wait_failure_reserves_255() {
    let result = ExitResult::wait_failed("transport closed");
    assert_eq!(result.exit_code, 255);
    let message = result.err.unwrap();
    assert!(message.contains("error waiting on process"));
    assert!(message.contains("transport closed"));
}
