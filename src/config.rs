//! Plugin and task configuration.
//!
//! `DriverConfig` is the process-wide plugin configuration set once by the
//! orchestrator. `TaskConfig` is the per-task description decoded from the
//! job submission. Validation of a task description happens here, before
//! any daemon call is made on its behalf.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

// =============================================================================
// Plugin Configuration
// =============================================================================

/// Registry credentials, either plugin-wide or per job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryAuth {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl RegistryAuth {
    /// True when both fields are empty.
    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }

    /// True when both fields are set.
    pub fn is_complete(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

/// Process-wide plugin configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Whether the driver accepts tasks.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Runtime id handed to containerd, e.g. `io.containerd.runc.v2`, or a
    /// runc-compatible binary name.
    pub containerd_runtime: String,

    /// Optional override for the orchestrator's stats cadence, as a
    /// duration string.
    #[serde(default)]
    pub stats_interval: Option<String>,

    /// Whether privileged tasks are allowed.
    #[serde(default = "default_true")]
    pub allow_privileged: bool,

    /// Plugin-wide registry credentials. Job credentials take precedence.
    #[serde(default)]
    pub auth: RegistryAuth,

    /// Path to a docker-credential-helper style executable consulted when
    /// static credentials are absent.
    #[serde(default)]
    pub auth_helper: Option<String>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            containerd_runtime: String::new(),
            stats_interval: None,
            allow_privileged: true,
            auth: RegistryAuth::default(),
            auth_helper: None,
        }
    }
}

fn default_true() -> bool {
    true
}

// =============================================================================
// Task Configuration
// =============================================================================

/// A mountpoint requested by the task. Volume, bind, and tmpfs types are
/// supported; fstab style options ride through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    #[serde(default = "default_mount_type")]
    pub r#type: String,
    pub target: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub options: Vec<String>,
}

fn default_mount_type() -> String {
    "volume".to_string()
}

/// Per-task description, decoded from the job submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskConfig {
    pub image: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default)]
    pub cap_add: Vec<String>,
    #[serde(default)]
    pub cap_drop: Vec<String>,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub devices: Vec<String>,
    #[serde(default)]
    pub seccomp: bool,
    #[serde(default)]
    pub seccomp_profile: String,
    #[serde(default)]
    pub shm_size: String,
    #[serde(default)]
    pub sysctl: BTreeMap<String, String>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub pids_limit: i64,
    #[serde(default)]
    pub pid_mode: String,
    #[serde(default)]
    pub file_limit: i64,
    #[serde(default)]
    pub memory_swap: String,
    #[serde(default)]
    pub memory_swappiness: i64,
    #[serde(default)]
    pub hostname: String,
    #[serde(default = "default_true")]
    pub host_dns: bool,
    #[serde(default = "default_pull_timeout")]
    pub image_pull_timeout: String,
    #[serde(default)]
    pub extra_hosts: Vec<String>,
    #[serde(default)]
    pub readonly_rootfs: bool,
    #[serde(default)]
    pub host_network: bool,
    #[serde(default)]
    pub auth: RegistryAuth,
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
}

fn default_pull_timeout() -> String {
    "5m".to_string()
}

impl TaskConfig {
    /// Validates the description against the plugin configuration and the
    /// orchestrator-provided network isolation. Runs before any daemon
    /// call: a task that fails here has had no side effects.
    pub fn validate(&self, driver: &DriverConfig, isolation_provided: bool) -> Result<()> {
        if !self.command.is_empty() && self.entrypoint.is_some() {
            return Err(Error::InvalidTaskConfig(
                "both command and entrypoint are set; only one of them may be set".into(),
            ));
        }

        if self.privileged && !driver.allow_privileged {
            return Err(Error::PrivilegedNotAllowed);
        }

        if !self.seccomp && !self.seccomp_profile.is_empty() {
            return Err(Error::InvalidTaskConfig(
                "seccomp must be set to true when using a custom seccomp_profile".into(),
            ));
        }

        if !self.pid_mode.is_empty() && !self.pid_mode.eq_ignore_ascii_case("host") {
            return Err(Error::InvalidTaskConfig(
                "invalid pid_mode; set pid_mode=host to enable the host pid namespace".into(),
            ));
        }

        if self.host_network && isolation_provided {
            return Err(Error::InvalidTaskConfig(
                "host_network and bridge network mode are mutually exclusive".into(),
            ));
        }

        for mount in &self.mounts {
            if (mount.r#type == "bind" || mount.r#type == "volume") && mount.options.is_empty() {
                return Err(Error::InvalidTaskConfig(format!(
                    "options cannot be empty for mount type {}; pass at least rbind and ro",
                    mount.r#type
                )));
            }
        }

        Ok(())
    }

    /// Image pull deadline, parsed from the task's duration string.
    pub fn pull_timeout(&self) -> Result<Duration> {
        parse_duration(&self.image_pull_timeout)
    }
}

// =============================================================================
// String Parsers
// =============================================================================

/// Parses a human memory string (`512b`, `128k`, `128m`, `1g`) into bytes.
/// The suffix is mandatory; bare numbers are rejected.
pub fn memory_in_bytes(strmem: &str) -> Result<i64> {
    if strmem.len() < 2 || !strmem.is_ascii() {
        return Err(Error::InvalidMemoryString(strmem.to_string()));
    }
    let (value, suffix) = strmem.split_at(strmem.len() - 1);
    let ival: i64 = value
        .parse()
        .map_err(|_| Error::InvalidMemoryString(strmem.to_string()))?;

    match suffix {
        "b" => Ok(ival),
        "k" => Ok(ival * 1024),
        "m" => Ok(ival * 1024 * 1024),
        "g" => Ok(ival * 1024 * 1024 * 1024),
        _ => Err(Error::InvalidMemoryString(strmem.to_string())),
    }
}

/// Parses a duration string of the form `300ms`, `30s`, `5m`, `1h`.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let (value, unit) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(idx) if idx > 0 => s.split_at(idx),
        _ => return Err(Error::InvalidDuration(s.to_string())),
    };

    let n: f64 = value
        .parse()
        .map_err(|_| Error::InvalidDuration(s.to_string()))?;
    if n < 0.0 {
        return Err(Error::InvalidDuration(s.to_string()));
    }

    let millis = match unit {
        "ms" => n,
        "s" => n * 1_000.0,
        "m" => n * 60_000.0,
        "h" => n * 3_600_000.0,
        _ => return Err(Error::InvalidDuration(s.to_string())),
    };

    Ok(Duration::from_millis(millis as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_string_suffixes() {
        assert_eq!(memory_in_bytes("128m").unwrap(), 128 * 1024 * 1024);
        assert_eq!(memory_in_bytes("1g").unwrap(), 1 << 30);
        assert_eq!(memory_in_bytes("512k").unwrap(), 1 << 19);
        assert_eq!(memory_in_bytes("64b").unwrap(), 64);
    }

    #[test]
    fn memory_string_rejects_bad_input() {
        assert!(memory_in_bytes("0").is_err());
        assert!(memory_in_bytes("").is_err());
        assert!(memory_in_bytes("128q").is_err());
        assert!(memory_in_bytes("xm").is_err());
    }

    #[test]
    fn duration_strings() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1ms").unwrap(), Duration::from_millis(1));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("10d").is_err());
    }

    #[test]
    fn task_config_defaults() {
        let config: TaskConfig = serde_json::from_value(serde_json::json!({
            "image": "docker.io/library/redis:7"
        }))
        .unwrap();
        assert!(config.host_dns);
        assert_eq!(config.image_pull_timeout, "5m");
        assert!(!config.privileged);
    }

    #[test]
    fn mount_type_defaults_to_volume() {
        let mount: MountSpec = serde_json::from_value(serde_json::json!({
            "target": "/data",
            "source": "scratch",
            "options": ["rbind", "rw"]
        }))
        .unwrap();
        assert_eq!(mount.r#type, "volume");
    }
}
