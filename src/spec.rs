//! OCI spec assembly.
//!
//! Translates a task description plus its resource allotment into an
//! ordered list of spec mutations. Each mutation is applied in order to a
//! fresh spec seeded with the daemon defaults; ordering matters where later
//! mutations overwrite earlier ones (process args, rlimits, namespaces).
//!
//! Given equal inputs the generated document is identical: the builder
//! reads no clocks and keeps every map ordered.

use crate::config::{memory_in_bytes, TaskConfig};
use crate::error::{Error, Result};
use crate::etchosts;
use crate::image::RuntimeConfig;
use crate::oci::{
    self, LinuxDeviceCgroup, LinuxNamespace, LinuxPids, Mount, NamespaceType, PosixRlimit, Spec,
};
use crate::seccomp;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Per-container settings computed by the driver from the resource
/// allotment: naming, directory bindings, limits, and the environment.
#[derive(Debug, Clone, Default)]
pub struct ContainerOptions {
    pub container_name: String,
    pub snapshot_name: String,
    /// `KEY=VALUE` pairs, orchestrator PATH already skipped.
    pub env: Vec<String>,
    pub annotations: BTreeMap<String, String>,
    /// Soft memory limit in bytes.
    pub memory_limit: i64,
    /// Hard memory limit in bytes; zero when the job sets none.
    pub memory_hard_limit: i64,
    pub cpu_shares: i64,
    pub user: String,
    /// Network namespace path supplied by the orchestrator, if any.
    pub network_ns_path: Option<String>,
    pub secrets_dir_src: String,
    pub secrets_dir_dest: String,
    pub task_dir_src: String,
    pub task_dir_dest: String,
    pub alloc_dir_src: String,
    pub alloc_dir_dest: String,
}

/// Copies the orchestrator environment into `KEY=VALUE` form, skipping the
/// variables the driver never overrides (PATH stays whatever the image or
/// the default spec says).
pub fn task_environment(env: &BTreeMap<String, String>) -> Vec<String> {
    env.iter()
        .filter(|(key, _)| !crate::constants::SKIP_ENV_OVERRIDE.contains(&key.as_str()))
        .map(|(key, value)| format!("{key}={value}"))
        .collect()
}

/// A single spec mutation. Applied in order; later mutations may overwrite
/// the work of earlier ones.
pub struct SpecOpt(Box<dyn Fn(&mut Spec) -> Result<()> + Send + Sync>);

impl SpecOpt {
    fn new(f: impl Fn(&mut Spec) -> Result<()> + Send + Sync + 'static) -> Self {
        Self(Box::new(f))
    }

    /// Applies this mutation to the spec.
    pub fn apply(&self, spec: &mut Spec) -> Result<()> {
        (self.0)(spec)
    }
}

/// Applies an ordered mutation list to a spec.
pub fn apply(spec: &mut Spec, opts: &[SpecOpt]) -> Result<()> {
    for opt in opts {
        opt.apply(spec)?;
    }
    Ok(())
}

/// Builds the final spec for a task: daemon defaults, then the full
/// mutation list in order.
pub fn build_spec(
    task: &TaskConfig,
    container: &ContainerOptions,
    image: &RuntimeConfig,
) -> Result<Spec> {
    let opts = build_spec_opts(task, container, image)?;
    let mut spec = Spec::with_defaults();
    apply(&mut spec, &opts)?;
    Ok(spec)
}

/// Builds the ordered mutation list for a task description and its
/// allotment. The task description must already have passed
/// [`TaskConfig::validate`].
pub fn build_spec_opts(
    task: &TaskConfig,
    container: &ContainerOptions,
    image: &RuntimeConfig,
) -> Result<Vec<SpecOpt>> {
    let mut opts = Vec::new();

    // Process args. An explicit entrypoint takes the image config without
    // its args; otherwise the image CMD is replaced when the task names a
    // command.
    let mut args: Vec<String> = Vec::new();
    if !task.command.is_empty() {
        args.push(task.command.clone());
    }
    args.extend(task.args.iter().cloned());

    match &task.entrypoint {
        Some(entrypoint) if !entrypoint.is_empty() && !entrypoint[0].is_empty() => {
            let mut full = entrypoint.clone();
            full.extend(task.args.iter().cloned());
            opts.push(with_image_config(image.clone()));
            opts.push(with_process_args(full));
        }
        _ => {
            opts.push(with_image_config_args(image.clone(), args));
        }
    }

    if task.privileged {
        opts.push(with_privileged());
    }

    if task.pids_limit > 0 {
        opts.push(with_pids_limit(task.pids_limit));
    }

    if !task.pid_mode.is_empty() {
        if !task.pid_mode.eq_ignore_ascii_case("host") {
            return Err(Error::InvalidTaskConfig(
                "invalid pid_mode; set pid_mode=host to enable the host pid namespace".into(),
            ));
        }
        opts.push(with_host_namespace(NamespaceType::Pid));
    }

    if task.file_limit > 0 {
        opts.push(with_file_limit(task.file_limit as u64));
    }

    if !task.shm_size.is_empty() {
        let shm_bytes = memory_in_bytes(&task.shm_size)?;
        opts.push(with_dev_shm_size(shm_bytes / 1024));
    }

    if !task.sysctl.is_empty() {
        opts.push(with_sysctls(task.sysctl.clone()));
    }

    if !task.seccomp && !task.seccomp_profile.is_empty() {
        return Err(Error::InvalidTaskConfig(
            "seccomp must be set to true when using a custom seccomp_profile".into(),
        ));
    }
    if task.seccomp {
        let profile = if task.seccomp_profile.is_empty() {
            seccomp::default_profile()
        } else {
            seccomp::load_profile(&task.seccomp_profile)?
        };
        opts.push(with_seccomp(profile));
    }

    if task.readonly_rootfs {
        opts.push(with_readonly_rootfs());
    }

    if task.host_network {
        opts.push(with_host_namespace(NamespaceType::Network));
        opts.push(with_mount(Mount::new(
            "bind",
            "/etc/hosts",
            "/etc/hosts",
            &["rbind", "ro"],
        )));
        opts.push(with_mount(Mount::new(
            "bind",
            "/etc/resolv.conf",
            "/etc/resolv.conf",
            &["rbind", "ro"],
        )));
    }

    if !task.cap_add.is_empty() {
        opts.push(with_added_capabilities(task.cap_add.clone()));
    }
    if !task.cap_drop.is_empty() {
        opts.push(with_dropped_capabilities(task.cap_drop.clone()));
    }

    if !task.cwd.is_empty() {
        opts.push(with_cwd(task.cwd.clone()));
    }
    opts.push(with_env(container.env.clone()));

    opts.push(with_memory_limits(
        container.memory_limit,
        container.memory_hard_limit,
    ));

    let memory_swap = if task.memory_swap.is_empty() {
        0
    } else {
        memory_in_bytes(&task.memory_swap)?
    };
    if memory_swap > 0 || task.memory_swappiness > 0 {
        opts.push(with_swap(memory_swap, task.memory_swappiness as u64));
    }

    if !container.annotations.is_empty() {
        opts.push(with_annotations(container.annotations.clone()));
    }
    opts.push(with_cpu_shares(container.cpu_shares as u64));

    let hostname = if task.hostname.is_empty() {
        container.container_name.clone()
    } else {
        task.hostname.clone()
    };
    opts.push(with_hostname(hostname));

    for device in &task.devices {
        opts.push(with_linux_device(PathBuf::from(device)));
    }

    opts.push(with_mounts(task_mounts(task, container)?));

    if let Some(path) = &container.network_ns_path {
        if !path.is_empty() {
            opts.push(with_network_namespace_path(path.clone()));
        }
    }

    if !container.user.is_empty() {
        opts.push(with_user(parse_user(&container.user)?));
    }

    Ok(opts)
}

// =============================================================================
// Mutations
// =============================================================================

/// Applies the image config (env, cwd, user) without touching args.
fn with_image_config(image: RuntimeConfig) -> SpecOpt {
    SpecOpt::new(move |spec| {
        apply_image_config(spec, &image);
        Ok(())
    })
}

/// Applies the image config and sets the process args from its entrypoint,
/// with `args` replacing the image CMD when non-empty.
fn with_image_config_args(image: RuntimeConfig, args: Vec<String>) -> SpecOpt {
    SpecOpt::new(move |spec| {
        apply_image_config(spec, &image);
        let cmd = if args.is_empty() {
            image.cmd.clone()
        } else {
            args.clone()
        };
        let mut full = image.entrypoint.clone();
        full.extend(cmd);
        spec.process_mut().args = full;
        Ok(())
    })
}

fn apply_image_config(spec: &mut Spec, image: &RuntimeConfig) {
    for entry in &image.env {
        set_env_entry(&mut spec.process_mut().env, entry);
    }
    if !image.working_dir.is_empty() {
        spec.process_mut().cwd = image.working_dir.clone();
    }
    // Only numeric uid[:gid] image users can be honoured without the
    // rootfs mounted; named users keep the spec default.
    if !image.user.is_empty() {
        if let Ok(user) = parse_user(&image.user) {
            spec.process_mut().user = user;
        }
    }
}

/// Replaces the process args outright.
fn with_process_args(args: Vec<String>) -> SpecOpt {
    SpecOpt::new(move |spec| {
        spec.process_mut().args = args.clone();
        Ok(())
    })
}

/// Privileged mode: every capability, every device, host device nodes, no
/// masked or readonly paths, privilege escalation allowed.
fn with_privileged() -> SpecOpt {
    SpecOpt::new(move |spec| {
        let caps: Vec<String> = oci::FULL_CAPABILITIES.iter().map(|c| c.to_string()).collect();
        let process = spec.process_mut();
        process.no_new_privileges = false;
        if let Some(capabilities) = &mut process.capabilities {
            capabilities.bounding = caps.clone();
            capabilities.effective = caps.clone();
            capabilities.permitted = caps;
        }

        spec.resources_mut().devices = vec![LinuxDeviceCgroup {
            allow: true,
            access: Some("rwm".to_string()),
            ..Default::default()
        }];

        for (device, _rule) in oci::host_devices()? {
            spec.linux_mut().devices.push(device);
        }

        let linux = spec.linux_mut();
        linux.masked_paths.clear();
        linux.readonly_paths.clear();
        Ok(())
    })
}

fn with_pids_limit(limit: i64) -> SpecOpt {
    SpecOpt::new(move |spec| {
        spec.resources_mut().pids = Some(LinuxPids { limit });
        Ok(())
    })
}

/// Shares the host's namespace of the given kind by removing its entry.
fn with_host_namespace(kind: NamespaceType) -> SpecOpt {
    SpecOpt::new(move |spec| {
        spec.linux_mut().namespaces.retain(|ns| ns.r#type != kind);
        Ok(())
    })
}

/// Replaces any RLIMIT_NOFILE entry; other rlimits are preserved.
fn with_file_limit(limit: u64) -> SpecOpt {
    SpecOpt::new(move |spec| {
        let process = spec.process_mut();
        process.rlimits.retain(|r| r.r#type != "RLIMIT_NOFILE");
        process.rlimits.push(PosixRlimit {
            r#type: "RLIMIT_NOFILE".to_string(),
            hard: limit,
            soft: limit,
        });
        Ok(())
    })
}

/// Resizes the `/dev/shm` mount. The size is expressed in kilobytes.
fn with_dev_shm_size(size_kb: i64) -> SpecOpt {
    SpecOpt::new(move |spec| {
        for mount in &mut spec.mounts {
            if mount.destination == "/dev/shm" {
                mount.options = vec![
                    "nosuid".to_string(),
                    "noexec".to_string(),
                    "nodev".to_string(),
                    "mode=1777".to_string(),
                    format!("size={size_kb}k"),
                ];
            }
        }
        Ok(())
    })
}

fn with_sysctls(sysctls: BTreeMap<String, String>) -> SpecOpt {
    SpecOpt::new(move |spec| {
        spec.linux_mut().sysctl.extend(
            sysctls
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        Ok(())
    })
}

fn with_seccomp(profile: seccomp::LinuxSeccomp) -> SpecOpt {
    SpecOpt::new(move |spec| {
        spec.linux_mut().seccomp = Some(profile.clone());
        Ok(())
    })
}

fn with_readonly_rootfs() -> SpecOpt {
    SpecOpt::new(move |spec| {
        if let Some(root) = &mut spec.root {
            root.readonly = true;
        }
        Ok(())
    })
}

/// Adds capabilities to the bounding, effective, and permitted sets.
fn with_added_capabilities(caps: Vec<String>) -> SpecOpt {
    SpecOpt::new(move |spec| {
        let process = spec.process_mut();
        let capabilities = process
            .capabilities
            .get_or_insert_with(Default::default);
        for cap in &caps {
            let cap = canonical_capability(cap);
            for set in [
                &mut capabilities.bounding,
                &mut capabilities.effective,
                &mut capabilities.permitted,
            ] {
                if !set.contains(&cap) {
                    set.push(cap.clone());
                }
            }
        }
        Ok(())
    })
}

/// Drops capabilities from every set. Applied after additions, so a drop
/// wins over a conflicting add.
fn with_dropped_capabilities(caps: Vec<String>) -> SpecOpt {
    SpecOpt::new(move |spec| {
        let process = spec.process_mut();
        if let Some(capabilities) = &mut process.capabilities {
            for cap in &caps {
                let cap = canonical_capability(cap);
                for set in [
                    &mut capabilities.bounding,
                    &mut capabilities.effective,
                    &mut capabilities.permitted,
                    &mut capabilities.inheritable,
                    &mut capabilities.ambient,
                ] {
                    set.retain(|c| c != &cap);
                }
            }
        }
        Ok(())
    })
}

/// Capability names are accepted with or without the `CAP_` prefix.
fn canonical_capability(cap: &str) -> String {
    let upper = cap.to_ascii_uppercase();
    if upper.starts_with("CAP_") {
        upper
    } else {
        format!("CAP_{upper}")
    }
}

fn with_cwd(cwd: String) -> SpecOpt {
    SpecOpt::new(move |spec| {
        spec.process_mut().cwd = cwd.clone();
        Ok(())
    })
}

/// Merges `KEY=VALUE` entries into the process env, replacing existing
/// keys and appending new ones.
fn with_env(env: Vec<String>) -> SpecOpt {
    SpecOpt::new(move |spec| {
        for entry in &env {
            set_env_entry(&mut spec.process_mut().env, entry);
        }
        Ok(())
    })
}

fn set_env_entry(env: &mut Vec<String>, entry: &str) {
    let key = entry.split('=').next().unwrap_or(entry);
    let prefix = format!("{key}=");
    match env.iter_mut().find(|e| e.starts_with(&prefix)) {
        Some(existing) => *existing = entry.to_string(),
        None => env.push(entry.to_string()),
    }
}

/// Memory limits in bytes. A hard limit turns the soft limit into a
/// reservation; otherwise the soft limit is the limit.
fn with_memory_limits(soft: i64, hard: i64) -> SpecOpt {
    SpecOpt::new(move |spec| {
        let memory = spec.memory_mut();
        if hard > 0 {
            memory.limit = Some(hard);
            memory.reservation = Some(soft);
        } else {
            memory.limit = Some(soft);
        }
        Ok(())
    })
}

fn with_swap(swap: i64, swappiness: u64) -> SpecOpt {
    SpecOpt::new(move |spec| {
        let memory = spec.memory_mut();
        if swap > 0 {
            memory.swap = Some(swap);
        }
        if swappiness > 0 {
            memory.swappiness = Some(swappiness);
        }
        Ok(())
    })
}

fn with_annotations(annotations: BTreeMap<String, String>) -> SpecOpt {
    SpecOpt::new(move |spec| {
        spec.annotations
            .extend(annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    })
}

fn with_cpu_shares(shares: u64) -> SpecOpt {
    SpecOpt::new(move |spec| {
        spec.resources_mut()
            .cpu
            .get_or_insert_with(Default::default)
            .shares = Some(shares);
        Ok(())
    })
}

fn with_hostname(hostname: String) -> SpecOpt {
    SpecOpt::new(move |spec| {
        spec.hostname = Some(hostname.clone());
        Ok(())
    })
}

/// Adds a host device node with rwm access.
fn with_linux_device(path: PathBuf) -> SpecOpt {
    SpecOpt::new(move |spec| {
        let (device, rule) = oci::device_from_path(&path)?;
        spec.linux_mut().devices.push(device);
        spec.resources_mut().devices.push(rule);
        Ok(())
    })
}

fn with_mount(mount: Mount) -> SpecOpt {
    SpecOpt::new(move |spec| {
        spec.mounts.push(mount.clone());
        Ok(())
    })
}

fn with_mounts(mounts: Vec<Mount>) -> SpecOpt {
    SpecOpt::new(move |spec| {
        spec.mounts.extend(mounts.iter().cloned());
        Ok(())
    })
}

/// Pins the network namespace to an orchestrator-created path.
fn with_network_namespace_path(path: String) -> SpecOpt {
    SpecOpt::new(move |spec| {
        let namespaces = &mut spec.linux_mut().namespaces;
        namespaces.retain(|ns| ns.r#type != NamespaceType::Network);
        namespaces.push(LinuxNamespace::with_path(NamespaceType::Network, &path));
        Ok(())
    })
}

fn with_user(user: oci::User) -> SpecOpt {
    SpecOpt::new(move |spec| {
        spec.process_mut().user = user.clone();
        Ok(())
    })
}

/// Parses a numeric `uid[:gid]` user string.
fn parse_user(user: &str) -> Result<oci::User> {
    let (uid_str, gid_str) = match user.split_once(':') {
        Some((uid, gid)) => (uid, Some(gid)),
        None => (user, None),
    };
    let uid: u32 = uid_str.parse().map_err(|_| {
        Error::InvalidTaskConfig(format!("user must be numeric uid[:gid], got '{user}'"))
    })?;
    let gid: u32 = match gid_str {
        Some(gid) => gid.parse().map_err(|_| {
            Error::InvalidTaskConfig(format!("user must be numeric uid[:gid], got '{user}'"))
        })?,
        None => uid,
    };
    Ok(oci::User {
        uid,
        gid,
        additional_gids: Vec::new(),
    })
}

// =============================================================================
// Mount Assembly
// =============================================================================

/// Builds the task's mount list in its fixed order: task mounts, host DNS,
/// the secrets/local/alloc directory binds, then the generated hosts file.
fn task_mounts(task: &TaskConfig, container: &ContainerOptions) -> Result<Vec<Mount>> {
    let mut mounts = Vec::new();

    for mount in &task.mounts {
        if (mount.r#type == "bind" || mount.r#type == "volume") && mount.options.is_empty() {
            return Err(Error::InvalidTaskConfig(format!(
                "options cannot be empty for mount type {}; pass at least rbind and ro",
                mount.r#type
            )));
        }

        let mut source = mount.source.clone();
        if mount.r#type == "bind" && source.starts_with("local") {
            source = format!("{}{}", container.task_dir_src, &source["local".len()..]);
        }

        mounts.push(Mount {
            destination: mount.target.clone(),
            r#type: mount.r#type.clone(),
            source,
            options: mount.options.clone(),
        });
    }

    if task.host_dns {
        mounts.push(Mount::new(
            "bind",
            "/etc/resolv.conf",
            "/etc/resolv.conf",
            &["rbind", "ro"],
        ));
    }

    for (src, dest) in [
        (&container.secrets_dir_src, &container.secrets_dir_dest),
        (&container.task_dir_src, &container.task_dir_dest),
        (&container.alloc_dir_src, &container.alloc_dir_dest),
    ] {
        if !src.is_empty() && !dest.is_empty() {
            mounts.push(Mount::new("bind", dest, src, &["rbind", "rw"]));
        }
    }

    if let Some(hosts_mount) = prepare_hosts_file(task, container)? {
        mounts.push(hosts_mount);
    }

    Ok(mounts)
}

/// Writes the task's hosts file and returns its bind mount. With
/// `extra_hosts` the file starts from the host's own table under host
/// networking and from the default table otherwise; without them only
/// non-host-network tasks get a generated file.
fn prepare_hosts_file(task: &TaskConfig, container: &ContainerOptions) -> Result<Option<Mount>> {
    if container.task_dir_src.is_empty() {
        return Ok(None);
    }
    let hosts_file = format!("{}/etc_hosts", container.task_dir_src);
    let hosts_path = Path::new(&hosts_file);

    if !task.extra_hosts.is_empty() {
        if task.host_network {
            etchosts::copy(hosts_path)?;
        } else {
            etchosts::build(hosts_path)?;
        }
        etchosts::add_extra_hosts(hosts_path, &task.extra_hosts)?;
    } else if !task.host_network {
        etchosts::build(hosts_path)?;
    } else {
        return Ok(None);
    }

    Ok(Some(Mount::new(
        "bind",
        "/etc/hosts",
        &hosts_file,
        &["rbind", "rw"],
    )))
}
