//! `/etc/hosts` file builder for containers.
//!
//! Each task gets its own hosts file under the task-local directory. The
//! file is written once at start, bind-mounted into the container, and
//! never mutated afterwards.

use crate::error::{Error, Result};
use std::fmt::Write as _;
use std::fs;
use std::net::IpAddr;
use std::path::Path;

/// A single hosts-file record.
#[derive(Debug, Clone, Copy)]
struct Record {
    hosts: &'static str,
    ip: &'static str,
}

/// Default IPv4/IPv6 localhost records seeded into a fresh hosts file.
const DEFAULT_CONTENT: &[Record] = &[
    Record { hosts: "localhost", ip: "127.0.0.1" },
    Record { hosts: "localhost ip6-localhost ip6-loopback", ip: "::1" },
    Record { hosts: "ip6-localnet", ip: "fe00::0" },
    Record { hosts: "ip6-mcastprefix", ip: "ff00::0" },
    Record { hosts: "ip6-allnodes", ip: "ff02::1" },
    Record { hosts: "ip6-allrouters", ip: "ff02::2" },
];

/// Path of the host's own hosts file, cloned for host-network tasks.
const HOST_ETC_HOSTS: &str = "/etc/hosts";

/// Writes a hosts file seeded with the default localhost records.
pub fn build(hosts_file: &Path) -> Result<()> {
    let mut content = String::new();
    for record in DEFAULT_CONTENT {
        // Infallible on String.
        let _ = writeln!(content, "{}\t{}", record.ip, record.hosts);
    }
    fs::write(hosts_file, content)?;
    Ok(())
}

/// Clones the host's `/etc/hosts` into the task's hosts file.
pub fn copy(hosts_file: &Path) -> Result<()> {
    copy_from(Path::new(HOST_ETC_HOSTS), hosts_file)
}

fn copy_from(source: &Path, hosts_file: &Path) -> Result<()> {
    fs::copy(source, hosts_file)?;
    Ok(())
}

/// Appends validated `name:ip` entries to an existing hosts file. IPv6
/// addresses are allowed; only the first colon separates name from ip.
pub fn add_extra_hosts(hosts_file: &Path, extra_hosts: &[String]) -> Result<()> {
    let mut content = fs::read_to_string(hosts_file)?;
    for extra in extra_hosts {
        let (name, ip) = parse_extra_host(extra)?;
        let _ = writeln!(content, "{ip}\t{name}");
    }
    fs::write(hosts_file, content)?;
    Ok(())
}

/// Validates a `name:ip` entry and splits it.
fn parse_extra_host(extra: &str) -> Result<(&str, &str)> {
    let (name, ip) = extra
        .split_once(':')
        .ok_or_else(|| Error::InvalidExtraHost(extra.to_string()))?;
    if name.is_empty() || ip.parse::<IpAddr>().is_err() {
        return Err(Error::InvalidExtraHost(extra.to_string()));
    }
    Ok((name, ip))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn build_seeds_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("etc_hosts");
        build(&path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("127.0.0.1\tlocalhost"));
        assert!(content.contains("::1\tlocalhost ip6-localhost ip6-loopback"));
        assert_eq!(content.lines().count(), 6);
    }

    #[test]
    fn add_extra_hosts_appends_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("etc_hosts");
        build(&path).unwrap();

        add_extra_hosts(
            &path,
            &["db:10.0.0.5".to_string(), "cache:::1".to_string()],
        )
        .unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("10.0.0.5\tdb"));
        assert!(content.contains("::1\tcache"));
    }

    #[test]
    fn add_extra_hosts_rejects_malformed_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("etc_hosts");
        build(&path).unwrap();

        assert!(add_extra_hosts(&path, &["no-colon".to_string()]).is_err());
        assert!(add_extra_hosts(&path, &["db:not-an-ip".to_string()]).is_err());
        assert!(add_extra_hosts(&path, &[":10.0.0.5".to_string()]).is_err());
    }

    #[test]
    fn copy_clones_source_file() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("hosts_src");
        let dest = dir.path().join("etc_hosts");
        fs::write(&source, "10.1.1.1\texample\n").unwrap();

        copy_from(&source, &dest).unwrap();
        assert_eq!(fs::read_to_string(&dest).unwrap(), "10.1.1.1\texample\n");
    }
}
