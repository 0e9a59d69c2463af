//! OCI runtime spec document model.
//!
//! The subset of the runtime spec the driver emits, as serde types with
//! config.json field casing. The daemon consumes the serialized document
//! verbatim, so mount, namespace, capability, device, resource, and
//! hostname semantics follow the spec exactly.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;

/// Runtime spec version emitted in generated documents.
pub const OCI_SPEC_VERSION: &str = "1.1.0";

/// Default PATH inside containers, matching the daemon's default spec.
pub const DEFAULT_PATH_ENV: &str =
    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

// =============================================================================
// Document Types
// =============================================================================

/// An OCI runtime spec document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    pub oci_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<Root>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<Process>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linux: Option<Linux>,
}

/// Root filesystem configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Root {
    pub path: String,
    #[serde(default)]
    pub readonly: bool,
}

/// Container process configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    #[serde(default)]
    pub terminal: bool,
    #[serde(default)]
    pub user: User,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub cwd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<LinuxCapabilities>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rlimits: Vec<PosixRlimit>,
    #[serde(default)]
    pub no_new_privileges: bool,
}

/// Process user identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub uid: u32,
    pub gid: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_gids: Vec<u32>,
}

/// Capability sets. Vectors keep generated documents deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinuxCapabilities {
    #[serde(default)]
    pub bounding: Vec<String>,
    #[serde(default)]
    pub effective: Vec<String>,
    #[serde(default)]
    pub permitted: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inheritable: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ambient: Vec<String>,
}

/// A POSIX resource limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosixRlimit {
    pub r#type: String,
    pub hard: u64,
    pub soft: u64,
}

/// A mountpoint in the container's filesystem.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mount {
    pub destination: String,
    pub r#type: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl Mount {
    /// Builds a mountpoint. fstab style options ride through unchanged.
    pub fn new(r#type: &str, destination: &str, source: &str, options: &[&str]) -> Self {
        Self {
            destination: destination.to_string(),
            r#type: r#type.to_string(),
            source: source.to_string(),
            options: options.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Linux-specific configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Linux {
    #[serde(default)]
    pub namespaces: Vec<LinuxNamespace>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sysctl: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<LinuxResources>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seccomp: Option<crate::seccomp::LinuxSeccomp>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<LinuxDevice>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub masked_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub readonly_paths: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cgroups_path: Option<String>,
}

/// Namespace kinds in config.json vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceType {
    Pid,
    Network,
    Mount,
    Ipc,
    Uts,
    User,
    Cgroup,
}

/// A namespace the container joins or creates. An absent path means a new
/// namespace; a present path pins the container to an existing one. Host
/// namespaces are expressed by omitting the entry entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinuxNamespace {
    pub r#type: NamespaceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl LinuxNamespace {
    pub fn new(r#type: NamespaceType) -> Self {
        Self { r#type, path: None }
    }

    pub fn with_path(r#type: NamespaceType, path: &str) -> Self {
        Self {
            r#type,
            path: Some(path.to_string()),
        }
    }
}

/// Cgroup resource controls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinuxResources {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<LinuxDeviceCgroup>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<LinuxMemory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<LinuxCpu>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pids: Option<LinuxPids>,
}

/// A device cgroup rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinuxDeviceCgroup {
    pub allow: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub major: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minor: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access: Option<String>,
}

/// Memory limits, in bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinuxMemory {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swap: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swappiness: Option<u64>,
}

/// CPU controls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinuxCpu {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shares: Option<u64>,
}

/// Pid-count limit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinuxPids {
    pub limit: i64,
}

/// A device node created inside the container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinuxDevice {
    pub path: String,
    pub r#type: String,
    pub major: i64,
    pub minor: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_mode: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
}

// =============================================================================
// Capability Sets
// =============================================================================

/// Capabilities granted to unprivileged containers, matching the daemon's
/// default spec.
pub const DEFAULT_CAPABILITIES: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_FSETID",
    "CAP_FOWNER",
    "CAP_MKNOD",
    "CAP_NET_RAW",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETFCAP",
    "CAP_SETPCAP",
    "CAP_NET_BIND_SERVICE",
    "CAP_SYS_CHROOT",
    "CAP_KILL",
    "CAP_AUDIT_WRITE",
];

/// Every capability the kernel defines; granted to privileged containers.
pub const FULL_CAPABILITIES: &[&str] = &[
    "CAP_AUDIT_CONTROL",
    "CAP_AUDIT_READ",
    "CAP_AUDIT_WRITE",
    "CAP_BLOCK_SUSPEND",
    "CAP_BPF",
    "CAP_CHECKPOINT_RESTORE",
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_DAC_READ_SEARCH",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_IPC_LOCK",
    "CAP_IPC_OWNER",
    "CAP_KILL",
    "CAP_LEASE",
    "CAP_LINUX_IMMUTABLE",
    "CAP_MAC_ADMIN",
    "CAP_MAC_OVERRIDE",
    "CAP_MKNOD",
    "CAP_NET_ADMIN",
    "CAP_NET_BIND_SERVICE",
    "CAP_NET_BROADCAST",
    "CAP_NET_RAW",
    "CAP_PERFMON",
    "CAP_SETFCAP",
    "CAP_SETGID",
    "CAP_SETPCAP",
    "CAP_SETUID",
    "CAP_SYS_ADMIN",
    "CAP_SYS_BOOT",
    "CAP_SYS_CHROOT",
    "CAP_SYS_MODULE",
    "CAP_SYS_NICE",
    "CAP_SYS_PACCT",
    "CAP_SYS_PTRACE",
    "CAP_SYS_RAWIO",
    "CAP_SYS_RESOURCE",
    "CAP_SYS_TIME",
    "CAP_SYS_TTY_CONFIG",
    "CAP_SYSLOG",
    "CAP_WAKE_ALARM",
];

// =============================================================================
// Default Spec Seed
// =============================================================================

impl Spec {
    /// A fresh Linux spec with the daemon's defaults: standard mounts
    /// (including `/dev/shm` at 64 MiB), private pid/ipc/uts/mount/network
    /// namespaces, the default capability set, a deny-all device cgroup,
    /// and the default PATH.
    pub fn with_defaults() -> Self {
        let caps: Vec<String> = DEFAULT_CAPABILITIES.iter().map(|c| c.to_string()).collect();

        Spec {
            oci_version: OCI_SPEC_VERSION.to_string(),
            root: Some(Root {
                path: "rootfs".to_string(),
                readonly: false,
            }),
            process: Some(Process {
                terminal: false,
                user: User::default(),
                args: Vec::new(),
                env: vec![DEFAULT_PATH_ENV.to_string()],
                cwd: "/".to_string(),
                capabilities: Some(LinuxCapabilities {
                    bounding: caps.clone(),
                    effective: caps.clone(),
                    permitted: caps,
                    inheritable: Vec::new(),
                    ambient: Vec::new(),
                }),
                rlimits: vec![PosixRlimit {
                    r#type: "RLIMIT_NOFILE".to_string(),
                    hard: 1024,
                    soft: 1024,
                }],
                no_new_privileges: true,
            }),
            hostname: None,
            mounts: default_mounts(),
            annotations: BTreeMap::new(),
            linux: Some(Linux {
                namespaces: vec![
                    LinuxNamespace::new(NamespaceType::Pid),
                    LinuxNamespace::new(NamespaceType::Ipc),
                    LinuxNamespace::new(NamespaceType::Uts),
                    LinuxNamespace::new(NamespaceType::Mount),
                    LinuxNamespace::new(NamespaceType::Network),
                ],
                sysctl: BTreeMap::new(),
                resources: Some(LinuxResources {
                    devices: vec![LinuxDeviceCgroup {
                        allow: false,
                        access: Some("rwm".to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
                seccomp: None,
                devices: Vec::new(),
                masked_paths: default_masked_paths(),
                readonly_paths: default_readonly_paths(),
                cgroups_path: None,
            }),
        }
    }

    /// Linux section, created on demand.
    pub fn linux_mut(&mut self) -> &mut Linux {
        self.linux.get_or_insert_with(Linux::default)
    }

    /// Process section, created on demand.
    pub fn process_mut(&mut self) -> &mut Process {
        self.process.get_or_insert_with(Process::default)
    }

    /// Resource controls, created on demand.
    pub fn resources_mut(&mut self) -> &mut LinuxResources {
        self.linux_mut()
            .resources
            .get_or_insert_with(LinuxResources::default)
    }

    /// Memory controls, created on demand.
    pub fn memory_mut(&mut self) -> &mut LinuxMemory {
        self.resources_mut()
            .memory
            .get_or_insert_with(LinuxMemory::default)
    }
}

fn default_mounts() -> Vec<Mount> {
    vec![
        Mount::new("proc", "/proc", "proc", &[]),
        Mount::new(
            "tmpfs",
            "/dev",
            "tmpfs",
            &["nosuid", "strictatime", "mode=755", "size=65536k"],
        ),
        Mount::new(
            "devpts",
            "/dev/pts",
            "devpts",
            &[
                "nosuid",
                "noexec",
                "newinstance",
                "ptmxmode=0666",
                "mode=0620",
                "gid=5",
            ],
        ),
        Mount::new(
            "tmpfs",
            "/dev/shm",
            "shm",
            &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"],
        ),
        Mount::new("mqueue", "/dev/mqueue", "mqueue", &["nosuid", "noexec", "nodev"]),
        Mount::new("sysfs", "/sys", "sysfs", &["nosuid", "noexec", "nodev", "ro"]),
        Mount::new(
            "cgroup",
            "/sys/fs/cgroup",
            "cgroup",
            &["nosuid", "noexec", "nodev", "relatime", "ro"],
        ),
    ]
}

fn default_masked_paths() -> Vec<String> {
    [
        "/proc/acpi",
        "/proc/asound",
        "/proc/kcore",
        "/proc/keys",
        "/proc/latency_stats",
        "/proc/timer_list",
        "/proc/timer_stats",
        "/proc/sched_debug",
        "/sys/firmware",
        "/proc/scsi",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_readonly_paths() -> Vec<String> {
    [
        "/proc/bus",
        "/proc/fs",
        "/proc/irq",
        "/proc/sys",
        "/proc/sysrq-trigger",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

// =============================================================================
// Host Devices
// =============================================================================

/// Describes a host device node as a spec device plus its cgroup rule.
pub fn device_from_path(path: &Path) -> Result<(LinuxDevice, LinuxDeviceCgroup)> {
    let metadata = std::fs::metadata(path)?;
    let file_type = metadata.file_type();

    let kind = if file_type.is_char_device() {
        "c"
    } else if file_type.is_block_device() {
        "b"
    } else {
        return Err(Error::InvalidTaskConfig(format!(
            "{} is not a device node",
            path.display()
        )));
    };

    let rdev = metadata.rdev();
    let major = nix::sys::stat::major(rdev) as i64;
    let minor = nix::sys::stat::minor(rdev) as i64;

    let device = LinuxDevice {
        path: path.to_string_lossy().to_string(),
        r#type: kind.to_string(),
        major,
        minor,
        file_mode: Some(metadata.mode() & 0o7777),
        uid: Some(metadata.uid()),
        gid: Some(metadata.gid()),
    };
    let rule = LinuxDeviceCgroup {
        allow: true,
        r#type: Some(kind.to_string()),
        major: Some(major),
        minor: Some(minor),
        access: Some("rwm".to_string()),
    };
    Ok((device, rule))
}

/// Enumerates the host's `/dev` device nodes for privileged containers.
/// Pseudo-terminal and fd entries stay behind their own mounts.
pub fn host_devices() -> Result<Vec<(LinuxDevice, LinuxDeviceCgroup)>> {
    let mut devices = Vec::new();
    let mut names: Vec<_> = std::fs::read_dir("/dev")?
        .filter_map(|e| e.ok())
        .collect();
    names.sort_by_key(|e| e.file_name());

    for entry in names {
        let name = entry.file_name();
        if matches!(
            name.to_string_lossy().as_ref(),
            "pts" | "fd" | "shm" | "mqueue" | "console" | "ptmx"
        ) {
            continue;
        }
        let path = entry.path();
        if let Ok(pair) = device_from_path(&path) {
            devices.push(pair);
        }
    }
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_spec_has_shm_mount() {
        let spec = Spec::with_defaults();
        let shm = spec
            .mounts
            .iter()
            .find(|m| m.destination == "/dev/shm")
            .expect("default spec carries /dev/shm");
        assert!(shm.options.iter().any(|o| o == "size=65536k"));
    }

    #[test]
    fn default_spec_has_private_namespaces() {
        let spec = Spec::with_defaults();
        let namespaces = &spec.linux.as_ref().unwrap().namespaces;
        assert_eq!(namespaces.len(), 5);
        assert!(namespaces.iter().all(|ns| ns.path.is_none()));
    }

    #[test]
    fn default_caps_are_a_subset_of_full_caps() {
        for cap in DEFAULT_CAPABILITIES {
            assert!(FULL_CAPABILITIES.contains(cap), "{cap} missing from full set");
        }
    }

    #[test]
    fn spec_serializes_with_config_json_casing() {
        let spec = Spec::with_defaults();
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["ociVersion"], OCI_SPEC_VERSION);
        assert!(value["process"]["noNewPrivileges"].as_bool().unwrap());
        assert_eq!(value["linux"]["namespaces"][0]["type"], "pid");
    }

    #[test]
    fn namespace_types_serialize_lowercase() {
        let ns = LinuxNamespace::with_path(NamespaceType::Network, "/var/run/netns/x");
        let value = serde_json::to_value(&ns).unwrap();
        assert_eq!(value["type"], "network");
        assert_eq!(value["path"], "/var/run/netns/x");
    }
}
