//! Tests for task validation and configuration parsing.
//!
//! Every validation failure here must happen without a daemon: a rejected
//! task description has no side effects.

use nomad_containerd_driver::{memory_in_bytes, parse_duration, DriverConfig, TaskConfig};
use std::time::Duration;

fn driver_config() -> DriverConfig {
    DriverConfig {
        containerd_runtime: "io.containerd.runc.v2".to_string(),
        ..Default::default()
    }
}

fn task(image: &str) -> TaskConfig {
    TaskConfig {
        image: image.to_string(),
        ..Default::default()
    }
}

// =============================================================================
// Validation Invariants
// =============================================================================

#[test]
fn command_and_entrypoint_are_mutually_exclusive() {
    let mut config = task("redis:7");
    config.command = "/bin/sh".to_string();
    config.entrypoint = Some(vec!["/entry".to_string()]);

    let err = config.validate(&driver_config(), false).unwrap_err();
    assert!(err.to_string().contains("command and entrypoint"));
}

#[test]
fn either_command_or_entrypoint_alone_is_fine() {
    let mut config = task("redis:7");
    config.command = "/bin/sh".to_string();
    assert!(config.validate(&driver_config(), false).is_ok());

    let mut config = task("redis:7");
    config.entrypoint = Some(vec!["/entry".to_string()]);
    assert!(config.validate(&driver_config(), false).is_ok());
}

#[test]
fn privileged_requires_plugin_permission() {
    let mut config = task("redis:7");
    config.privileged = true;

    let mut driver = driver_config();
    driver.allow_privileged = false;
    assert!(config.validate(&driver, false).is_err());

    driver.allow_privileged = true;
    assert!(config.validate(&driver, false).is_ok());
}

#[test]
fn seccomp_profile_requires_seccomp_enabled() {
    let mut config = task("redis:7");
    config.seccomp_profile = "/etc/seccomp/custom.json".to_string();
    config.seccomp = false;
    assert!(config.validate(&driver_config(), false).is_err());

    config.seccomp = true;
    assert!(config.validate(&driver_config(), false).is_ok());
}

#[test]
fn pid_mode_domain_is_empty_or_host() {
    let mut config = task("redis:7");
    config.pid_mode = "host".to_string();
    assert!(config.validate(&driver_config(), false).is_ok());

    config.pid_mode = "HOST".to_string();
    assert!(config.validate(&driver_config(), false).is_ok());

    config.pid_mode = "private".to_string();
    assert!(config.validate(&driver_config(), false).is_err());
}

#[test]
fn host_network_conflicts_with_network_isolation() {
    let mut config = task("redis:7");
    config.host_network = true;

    assert!(config.validate(&driver_config(), false).is_ok());
    assert!(config.validate(&driver_config(), true).is_err());
}

#[test]
fn bind_and_volume_mounts_need_options() {
    let mut config = task("redis:7");
    config.mounts = vec![nomad_containerd_driver::MountSpec {
        r#type: "bind".to_string(),
        target: "/data".to_string(),
        source: "/srv/data".to_string(),
        options: vec![],
    }];
    assert!(config.validate(&driver_config(), false).is_err());

    config.mounts[0].options = vec!["rbind".to_string(), "ro".to_string()];
    assert!(config.validate(&driver_config(), false).is_ok());

    // tmpfs mounts have no such requirement.
    config.mounts[0].r#type = "tmpfs".to_string();
    config.mounts[0].options = vec![];
    assert!(config.validate(&driver_config(), false).is_ok());
}

// =============================================================================
// Parsers
// =============================================================================

#[test]
fn memory_string_laws() {
    assert_eq!(memory_in_bytes("128m").unwrap(), 128 * 1024 * 1024);
    assert_eq!(memory_in_bytes("1g").unwrap(), 1 << 30);
    assert_eq!(memory_in_bytes("512k").unwrap(), 1 << 19);
    assert!(memory_in_bytes("0").is_err());
    assert!(memory_in_bytes("").is_err());
    assert!(memory_in_bytes("64t").is_err());
}

#[test]
fn pull_timeout_defaults_to_five_minutes() {
    let config: TaskConfig = serde_json::from_value(serde_json::json!({
        "image": "redis:7"
    }))
    .unwrap();
    assert_eq!(config.pull_timeout().unwrap(), Duration::from_secs(300));
}

#[test]
fn pull_timeout_honours_task_override() {
    let config: TaskConfig = serde_json::from_value(serde_json::json!({
        "image": "redis:7",
        "image_pull_timeout": "1ms"
    }))
    .unwrap();
    assert_eq!(config.pull_timeout().unwrap(), Duration::from_millis(1));
}

#[test]
fn duration_parser_rejects_unitless_strings() {
    assert!(parse_duration("300").is_err());
    assert!(parse_duration("5x").is_err());
    assert_eq!(parse_duration("1500ms").unwrap(), Duration::from_millis(1500));
}

// =============================================================================
// Decoding
// =============================================================================

#[test]
fn full_task_config_decodes() {
    let config: TaskConfig = serde_json::from_value(serde_json::json!({
        "image": "docker.io/library/redis:7",
        "command": "redis-server",
        "args": ["--appendonly", "yes"],
        "cap_add": ["CAP_NET_ADMIN"],
        "cap_drop": ["CAP_MKNOD"],
        "cwd": "/data",
        "devices": ["/dev/fuse"],
        "privileged": false,
        "pids_limit": 256,
        "pid_mode": "",
        "file_limit": 4096,
        "shm_size": "128m",
        "sysctl": {"net.core.somaxconn": "16384"},
        "seccomp": true,
        "readonly_rootfs": true,
        "host_network": false,
        "host_dns": false,
        "extra_hosts": ["db:10.0.0.5"],
        "image_pull_timeout": "10m",
        "auth": {"username": "u", "password": "p"},
        "mounts": [
            {"type": "bind", "target": "/cfg", "source": "local/cfg", "options": ["rbind", "ro"]}
        ]
    }))
    .unwrap();

    assert_eq!(config.command, "redis-server");
    assert_eq!(config.pids_limit, 256);
    assert_eq!(config.file_limit, 4096);
    assert!(!config.host_dns);
    assert_eq!(config.mounts.len(), 1);
    assert!(config.validate(&driver_config(), false).is_ok());
}

#[test]
fn driver_config_defaults() {
    let config: DriverConfig = serde_json::from_value(serde_json::json!({
        "containerd_runtime": "io.containerd.runc.v2"
    }))
    .unwrap();
    assert!(config.enabled);
    assert!(config.allow_privileged);
    assert!(config.stats_interval.is_none());
    assert!(config.auth.is_empty());
}
