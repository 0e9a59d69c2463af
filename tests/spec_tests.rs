//! Tests for OCI spec assembly.
//!
//! The builder is a pure function of its inputs: these tests drive it with
//! synthetic task descriptions and image configs and inspect the emitted
//! document.

use nomad_containerd_driver::image::RuntimeConfig;
use nomad_containerd_driver::oci::NamespaceType;
use nomad_containerd_driver::spec::{build_spec, task_environment, ContainerOptions};
use nomad_containerd_driver::{MountSpec, TaskConfig};
use std::collections::BTreeMap;
use std::path::Path;
use tempfile::TempDir;

fn image() -> RuntimeConfig {
    RuntimeConfig {
        env: vec!["APP_HOME=/srv/app".to_string()],
        cmd: vec!["serve".to_string()],
        entrypoint: vec!["/srv/app/bin/app".to_string()],
        working_dir: "/srv/app".to_string(),
        user: String::new(),
    }
}

fn task(image: &str) -> TaskConfig {
    TaskConfig {
        image: image.to_string(),
        ..Default::default()
    }
}

fn options(dir: &Path) -> ContainerOptions {
    ContainerOptions {
        container_name: "web-a1b2c3".to_string(),
        snapshot_name: "web-a1b2c3-snapshot".to_string(),
        memory_limit: 300 * 1024 * 1024,
        memory_hard_limit: 0,
        cpu_shares: 1024,
        task_dir_src: dir.to_string_lossy().to_string(),
        ..Default::default()
    }
}

// =============================================================================
// Process
// =============================================================================

#[test]
fn args_follow_image_entrypoint_and_cmd() {
    let dir = TempDir::new().unwrap();
    let spec = build_spec(&task("app:1"), &options(dir.path()), &image()).unwrap();
    assert_eq!(
        spec.process.unwrap().args,
        vec!["/srv/app/bin/app", "serve"]
    );
}

#[test]
fn command_and_args_replace_image_cmd() {
    let dir = TempDir::new().unwrap();
    let mut config = task("app:1");
    config.command = "/bin/busybox".to_string();
    config.args = vec!["httpd".to_string()];

    let spec = build_spec(&config, &options(dir.path()), &image()).unwrap();
    assert_eq!(
        spec.process.unwrap().args,
        vec!["/srv/app/bin/app", "/bin/busybox", "httpd"]
    );
}

#[test]
fn task_entrypoint_discards_image_args() {
    let dir = TempDir::new().unwrap();
    let mut config = task("app:1");
    config.entrypoint = Some(vec!["/init".to_string(), "--".to_string()]);
    config.args = vec!["worker".to_string()];

    let spec = build_spec(&config, &options(dir.path()), &image()).unwrap();
    assert_eq!(spec.process.unwrap().args, vec!["/init", "--", "worker"]);
}

#[test]
fn cwd_override_beats_image_working_dir() {
    let dir = TempDir::new().unwrap();
    let mut config = task("app:1");
    config.cwd = "/tmp".to_string();

    let spec = build_spec(&config, &options(dir.path()), &image()).unwrap();
    assert_eq!(spec.process.unwrap().cwd, "/tmp");
}

#[test]
fn hostname_defaults_to_container_name() {
    let dir = TempDir::new().unwrap();
    let spec = build_spec(&task("app:1"), &options(dir.path()), &image()).unwrap();
    assert_eq!(spec.hostname.as_deref(), Some("web-a1b2c3"));

    let mut config = task("app:1");
    config.hostname = "api-1".to_string();
    let spec = build_spec(&config, &options(dir.path()), &image()).unwrap();
    assert_eq!(spec.hostname.as_deref(), Some("api-1"));
}

// =============================================================================
// Environment
// =============================================================================

#[test]
fn path_is_never_copied_from_the_orchestrator() {
    let env: BTreeMap<String, String> = [
        ("PATH".to_string(), "/orchestrator/bin".to_string()),
        ("NOMAD_ALLOC_ID".to_string(), "a1b2".to_string()),
    ]
    .into_iter()
    .collect();

    let copied = task_environment(&env);
    assert!(copied.iter().all(|e| !e.starts_with("PATH=")));
    assert!(copied.iter().any(|e| e == "NOMAD_ALLOC_ID=a1b2"));
}

#[test]
fn orchestrator_env_lands_in_the_spec() {
    let dir = TempDir::new().unwrap();
    let mut opts = options(dir.path());
    opts.env = vec!["NOMAD_TASK_NAME=web".to_string()];

    let spec = build_spec(&task("app:1"), &opts, &image()).unwrap();
    let env = spec.process.unwrap().env;
    assert!(env.iter().any(|e| e == "NOMAD_TASK_NAME=web"));
    // Image env survives alongside.
    assert!(env.iter().any(|e| e == "APP_HOME=/srv/app"));
    // The default PATH from the seed spec is still present.
    assert!(env.iter().any(|e| e.starts_with("PATH=")));
}

// =============================================================================
// Resources
// =============================================================================

#[test]
fn pids_limit_lands_in_resources() {
    let dir = TempDir::new().unwrap();
    let mut config = task("app:1");
    config.pids_limit = 512;

    let spec = build_spec(&config, &options(dir.path()), &image()).unwrap();
    let pids = spec.linux.unwrap().resources.unwrap().pids.unwrap();
    assert_eq!(pids.limit, 512);
}

#[test]
fn cpu_shares_always_set() {
    let dir = TempDir::new().unwrap();
    let spec = build_spec(&task("app:1"), &options(dir.path()), &image()).unwrap();
    let cpu = spec.linux.unwrap().resources.unwrap().cpu.unwrap();
    assert_eq!(cpu.shares, Some(1024));
}

#[test]
fn swap_and_swappiness_only_when_positive() {
    let dir = TempDir::new().unwrap();
    let spec = build_spec(&task("app:1"), &options(dir.path()), &image()).unwrap();
    let memory = spec.linux.unwrap().resources.unwrap().memory.unwrap();
    assert_eq!(memory.swap, None);
    assert_eq!(memory.swappiness, None);

    let mut config = task("app:1");
    config.memory_swap = "256m".to_string();
    config.memory_swappiness = 30;
    let spec = build_spec(&config, &options(dir.path()), &image()).unwrap();
    let memory = spec.linux.unwrap().resources.unwrap().memory.unwrap();
    assert_eq!(memory.swap, Some(256 * 1024 * 1024));
    assert_eq!(memory.swappiness, Some(30));
}

// =============================================================================
// Namespaces and Rootfs
// =============================================================================

#[test]
fn host_network_removes_network_namespace_and_mounts_host_files() {
    let dir = TempDir::new().unwrap();
    let mut config = task("app:1");
    config.host_network = true;
    config.host_dns = false;

    let spec = build_spec(&config, &options(dir.path()), &image()).unwrap();

    let namespaces = &spec.linux.as_ref().unwrap().namespaces;
    assert!(namespaces.iter().all(|ns| ns.r#type != NamespaceType::Network));

    let hosts: Vec<_> = spec
        .mounts
        .iter()
        .filter(|m| m.destination == "/etc/hosts" && m.source == "/etc/hosts")
        .collect();
    assert_eq!(hosts.len(), 1);
    assert!(hosts[0].options.iter().any(|o| o == "ro"));
}

#[test]
fn readonly_rootfs_toggles_root() {
    let dir = TempDir::new().unwrap();
    let mut config = task("app:1");
    config.readonly_rootfs = true;

    let spec = build_spec(&config, &options(dir.path()), &image()).unwrap();
    assert!(spec.root.unwrap().readonly);
}

#[test]
fn sysctls_merge_into_linux() {
    let dir = TempDir::new().unwrap();
    let mut config = task("app:1");
    config.sysctl = [
        ("net.core.somaxconn".to_string(), "16384".to_string()),
        ("net.ipv4.ip_forward".to_string(), "1".to_string()),
    ]
    .into_iter()
    .collect();

    let spec = build_spec(&config, &options(dir.path()), &image()).unwrap();
    let sysctl = spec.linux.unwrap().sysctl;
    assert_eq!(sysctl.get("net.core.somaxconn").map(String::as_str), Some("16384"));
    assert_eq!(sysctl.get("net.ipv4.ip_forward").map(String::as_str), Some("1"));
}

#[test]
fn seccomp_default_profile_applied_when_enabled() {
    let dir = TempDir::new().unwrap();
    let mut config = task("app:1");
    config.seccomp = true;

    let spec = build_spec(&config, &options(dir.path()), &image()).unwrap();
    let seccomp = spec.linux.unwrap().seccomp.expect("seccomp applied");
    assert_eq!(seccomp.default_action, "SCMP_ACT_ERRNO");

    // Without the flag no seccomp section is emitted.
    let spec = build_spec(&task("app:1"), &options(dir.path()), &image()).unwrap();
    assert!(spec.linux.unwrap().seccomp.is_none());
}

// =============================================================================
// Mounts
// =============================================================================

#[test]
fn mount_order_is_task_then_dns_then_dirs_then_hosts() {
    let dir = TempDir::new().unwrap();
    let mut config = task("app:1");
    config.mounts = vec![MountSpec {
        r#type: "bind".to_string(),
        target: "/data".to_string(),
        source: "/srv/data".to_string(),
        options: vec!["rbind".to_string(), "rw".to_string()],
    }];

    let mut opts = options(dir.path());
    opts.secrets_dir_src = "/host/secrets".to_string();
    opts.secrets_dir_dest = "/secrets".to_string();
    opts.task_dir_dest = "/local".to_string();
    opts.alloc_dir_src = "/host/alloc".to_string();
    opts.alloc_dir_dest = "/alloc".to_string();

    let spec = build_spec(&config, &opts, &image()).unwrap();

    // Appended mounts come after the seed defaults, in builder order.
    let appended: Vec<&str> = spec
        .mounts
        .iter()
        .skip_while(|m| m.destination != "/data")
        .map(|m| m.destination.as_str())
        .collect();
    assert_eq!(
        appended,
        vec![
            "/data",
            "/etc/resolv.conf",
            "/secrets",
            "/local",
            "/alloc",
            "/etc/hosts"
        ]
    );
}

#[test]
fn host_dns_disabled_omits_resolv_conf() {
    let dir = TempDir::new().unwrap();
    let mut config = task("app:1");
    config.host_dns = false;

    let spec = build_spec(&config, &options(dir.path()), &image()).unwrap();
    assert!(spec
        .mounts
        .iter()
        .all(|m| m.destination != "/etc/resolv.conf"));
}

#[test]
fn default_hosts_file_written_for_isolated_network() {
    let dir = TempDir::new().unwrap();
    let spec = build_spec(&task("app:1"), &options(dir.path()), &image()).unwrap();

    assert!(spec.mounts.iter().any(|m| m.destination == "/etc/hosts"));
    let content = std::fs::read_to_string(dir.path().join("etc_hosts")).unwrap();
    assert!(content.contains("127.0.0.1\tlocalhost"));
}

#[test]
fn empty_mount_options_rejected_in_builder_too() {
    let dir = TempDir::new().unwrap();
    let mut config = task("app:1");
    config.mounts = vec![MountSpec {
        r#type: "volume".to_string(),
        target: "/data".to_string(),
        source: "scratch".to_string(),
        options: vec![],
    }];

    assert!(build_spec(&config, &options(dir.path()), &image()).is_err());
}

// =============================================================================
// Determinism
// =============================================================================

#[test]
fn equal_inputs_produce_equal_documents() {
    let dir = TempDir::new().unwrap();
    let mut config = task("app:1");
    config.cap_add = vec!["NET_ADMIN".to_string()];
    config.sysctl = [("kernel.msgmax".to_string(), "65536".to_string())]
        .into_iter()
        .collect();
    config.file_limit = 8192;
    config.shm_size = "64m".to_string();

    let opts = options(dir.path());
    let a = build_spec(&config, &opts, &image()).unwrap();
    let b = build_spec(&config, &opts, &image()).unwrap();
    assert_eq!(
        serde_json::to_string(&a).unwrap(),
        serde_json::to_string(&b).unwrap()
    );
}
