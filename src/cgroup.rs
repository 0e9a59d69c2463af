//! Cgroup mode detection and the naming conventions that depend on it.
//!
//! The daemon namespace and the container naming scheme both follow the
//! host's cgroup layout: on a unified (v2) hierarchy the namespace doubles
//! as the cgroup parent slice and container names use systemd scope syntax.

use crate::constants::{NAMESPACE_CGROUP_V1, NAMESPACE_CGROUP_V2};

/// Magic number of a cgroup2 superblock, from `linux/magic.h`.
const CGROUP2_SUPER_MAGIC: i64 = 0x63677270;

/// True when `/sys/fs/cgroup` is a unified (v2) hierarchy.
pub fn is_cgroup2_unified_mode() -> bool {
    match nix::sys::statfs::statfs("/sys/fs/cgroup") {
        Ok(stat) => stat.filesystem_type().0 as i64 == CGROUP2_SUPER_MAGIC,
        Err(_) => false,
    }
}

/// Daemon namespace for the detected cgroup mode. Chosen once at plugin
/// construction.
pub fn daemon_namespace(cgroup2: bool) -> &'static str {
    if cgroup2 {
        NAMESPACE_CGROUP_V2
    } else {
        NAMESPACE_CGROUP_V1
    }
}

/// Container name for a task. The name is operator-visible and follows the
/// docker-driver convention on cgroup v1 hosts and systemd scope syntax on
/// cgroup v2 hosts.
pub fn container_name(task_name: &str, alloc_id: &str, cgroup2: bool) -> String {
    if cgroup2 {
        format!("{alloc_id}.{task_name}.scope")
    } else {
        format!("{task_name}-{alloc_id}")
    }
}

/// Snapshot key bound to a container's lifetime.
pub fn snapshot_name(container_name: &str) -> String {
    format!("{container_name}-snapshot")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn naming_follows_cgroup_mode() {
        assert_eq!(container_name("redis", "a1b2", false), "redis-a1b2");
        assert_eq!(container_name("redis", "a1b2", true), "a1b2.redis.scope");
    }

    #[test]
    fn snapshot_name_appends_suffix() {
        assert_eq!(snapshot_name("redis-a1b2"), "redis-a1b2-snapshot");
    }

    #[test]
    fn namespace_follows_cgroup_mode() {
        assert_eq!(daemon_namespace(false), "nomad");
        assert_eq!(daemon_namespace(true), "nomad.slice");
    }
}
