//! Driver lifecycle.
//!
//! The orchestrator-facing surface: Start, Recover, Wait, Stop, Destroy,
//! Inspect, Stats, Signal, Exec, and the periodic Fingerprint. The driver
//! owns the root context; shutdown cancels it, which propagates into every
//! in-flight daemon call and producer.

use crate::auth::resolve_registry_auth;
use crate::cgroup::{self, container_name, daemon_namespace, snapshot_name};
use crate::client::{Containerd, TaskStatusKind};
use crate::config::{parse_duration, DriverConfig, MountSpec, TaskConfig};
use crate::constants::{
    CONTAINERD_SOCKET, ENV_ALLOC_DIR, ENV_SECRETS_DIR, ENV_TASK_DIR, FINGERPRINT_INTERVAL,
    PLUGIN_NAME, PLUGIN_VERSION,
};
use crate::error::{Error, Result};
use crate::fifo::TaskStdio;
use crate::reference;
use crate::spec::{self, ContainerOptions};
use crate::stats::Compute;
use crate::task::handle::{ExecOptions, TaskHandle};
use crate::task::state::{
    ExitResult, Fingerprint, HealthState, TaskResourceUsage, TaskState, TaskStatus,
};
use crate::task::store::TaskStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Orchestrator-Facing Types
// =============================================================================

/// Memory and CPU allotment from the job's resources stanza.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskResources {
    /// Soft memory limit in MB.
    pub memory_mb: i64,
    /// Hard memory limit in MB; zero when the job sets none.
    #[serde(default)]
    pub memory_max_mb: i64,
    pub cpu_shares: i64,
}

/// Host paths of the task's directory set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskDirs {
    /// Task directory root; generated files (resolv.conf) land here.
    pub dir: PathBuf,
    pub local_dir: PathBuf,
    pub secrets_dir: PathBuf,
    pub shared_alloc_dir: PathBuf,
}

/// A pre-created network namespace the container joins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkIsolation {
    pub path: String,
}

/// DNS configuration the orchestrator wants inside the container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DnsConfig {
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub searches: Vec<String>,
    #[serde(default)]
    pub options: Vec<String>,
}

/// A volume mount the orchestrator resolved on the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeMount {
    pub host_path: String,
    pub task_path: String,
    #[serde(default)]
    pub readonly: bool,
}

/// Everything the orchestrator supplies for one StartTask call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub id: String,
    pub name: String,
    pub alloc_id: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub user: String,
    pub resources: TaskResources,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub task_dir: TaskDirs,
    #[serde(default)]
    pub network_isolation: Option<NetworkIsolation>,
    #[serde(default)]
    pub dns: Option<DnsConfig>,
    #[serde(default)]
    pub mounts: Vec<VolumeMount>,
    /// Raw task description, decoded into [`TaskConfig`] at start.
    pub driver_config: serde_json::Value,
}

/// A RecoverTask call: the task identity plus the persisted driver state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverRequest {
    pub id: String,
    pub name: String,
    pub state: TaskState,
}

// =============================================================================
// Driver
// =============================================================================

/// The task driver. One instance per plugin process, sharing one daemon
/// client.
pub struct Driver {
    config: DriverConfig,
    compute: Compute,
    gateway: Arc<Containerd>,
    tasks: TaskStore,
    cgroup2: bool,
    shutdown: CancellationToken,
}

impl Driver {
    /// Connects to the daemon at the default socket, detecting the host's
    /// cgroup mode.
    pub async fn connect(config: DriverConfig, compute: Compute) -> Result<Self> {
        let cgroup2 = cgroup::is_cgroup2_unified_mode();
        Self::connect_at(Path::new(CONTAINERD_SOCKET), config, compute, cgroup2).await
    }

    /// Connects to a specific socket with an explicit cgroup mode.
    pub async fn connect_at(
        socket: &Path,
        config: DriverConfig,
        compute: Compute,
        cgroup2: bool,
    ) -> Result<Self> {
        let shutdown = CancellationToken::new();
        let gateway = Containerd::connect(
            socket,
            daemon_namespace(cgroup2),
            &config.containerd_runtime,
            shutdown.child_token(),
        )
        .await?;

        info!(
            plugin = PLUGIN_NAME,
            version = PLUGIN_VERSION,
            namespace = daemon_namespace(cgroup2),
            "connected to containerd"
        );

        Ok(Self {
            config,
            compute,
            gateway: Arc::new(gateway),
            tasks: TaskStore::new(),
            cgroup2,
            shutdown,
        })
    }

    /// Cancels the root context. Every in-flight daemon call and producer
    /// ends.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    // =========================================================================
    // Fingerprint
    // =========================================================================

    /// Publishes a health + attribute snapshot every 30 seconds. The first
    /// fingerprint is sent immediately.
    pub fn fingerprint(&self) -> mpsc::Receiver<Fingerprint> {
        let (tx, rx) = mpsc::channel(1);
        let gateway = self.gateway.clone();
        let shutdown = self.shutdown.clone();
        let enabled = self.config.enabled;

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(FINGERPRINT_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tx.closed() => return,
                    _ = timer.tick() => {}
                }

                let fingerprint = build_fingerprint(&gateway, enabled).await;
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    sent = tx.send(fingerprint) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        rx
    }

    // =========================================================================
    // StartTask
    // =========================================================================

    /// Starts a task: validate, pull, create container, open FIFOs, create
    /// task, store the handle, and launch the run routine. Partial
    /// failures roll back the daemon-side container and snapshot before
    /// the error returns.
    pub async fn start_task(&self, request: &TaskRequest) -> Result<TaskState> {
        if self.tasks.contains(&request.id) {
            return Err(Error::TaskAlreadyStarted(request.id.clone()));
        }

        let mut task: TaskConfig = serde_json::from_value(request.driver_config.clone())
            .map_err(|e| Error::InvalidTaskConfig(format!("failed to decode driver config: {e}")))?;

        task.validate(&self.config, request.network_isolation.is_some())?;
        self.merge_orchestrator_mounts(&mut task, request)?;

        info!(task = %request.id, image = %task.image, "starting task");

        let container_name = container_name(&request.name, &request.alloc_id, self.cgroup2);
        let snapshot = snapshot_name(&container_name);

        // Pull. Validation precedes this point, so a rejected task has
        // performed no daemon calls.
        let image_ref = reference::normalize(&task.image)?;
        let pull_timeout = task.pull_timeout()?;
        let credentials = resolve_registry_auth(&self.config, &task.auth, &image_ref).await;
        let image = self
            .gateway
            .pull_image(&image_ref, pull_timeout, credentials.as_ref())
            .await?;
        info!(image = %image.name, "successfully pulled image");

        let container_opts = self.container_options(request, &container_name, &snapshot);
        let oci_spec = spec::build_spec(&task, &container_opts, &image.config)?;

        self.gateway
            .create_container(&container_name, &snapshot, &image, &oci_spec)
            .await?;
        info!(container = %container_name, "successfully created container");

        let stdio = match TaskStdio::open(&request.stdout_path, &request.stderr_path) {
            Ok(stdio) => stdio,
            Err(e) => {
                self.rollback_container(&container_name, &snapshot).await;
                return Err(e);
            }
        };

        if let Err(e) = self
            .gateway
            .new_task(&container_name, &snapshot, &request.stdout_path, &request.stderr_path)
            .await
        {
            self.rollback_container(&container_name, &snapshot).await;
            return Err(e);
        }
        info!(container = %container_name, "successfully created task");

        let started_at = Utc::now();
        let handle = TaskHandle::new(
            request.id.clone(),
            request.name.clone(),
            container_name.clone(),
            snapshot,
            started_at,
            stdio,
            self.gateway.clone(),
            self.compute,
            self.shutdown.clone(),
        );

        self.tasks.set(&request.id, handle.clone());
        handle.spawn_run();

        Ok(TaskState {
            started_at,
            container_name,
            stdout_path: request.stdout_path.clone(),
            stderr_path: request.stderr_path.clone(),
        })
    }

    /// Folds the orchestrator's volume mounts and DNS mount into the task
    /// description. An appended DNS mount takes over from host DNS.
    fn merge_orchestrator_mounts(&self, task: &mut TaskConfig, request: &TaskRequest) -> Result<()> {
        for mount in &request.mounts {
            let mut options = vec!["rbind".to_string()];
            if mount.readonly {
                options.push("ro".to_string());
            }
            task.mounts.push(MountSpec {
                r#type: "bind".to_string(),
                target: mount.task_path.clone(),
                source: mount.host_path.clone(),
                options,
            });
        }

        if let Some(dns) = &request.dns {
            let resolv_path = write_resolv_conf(&request.task_dir.dir, dns)?;
            task.host_dns = false;
            task.mounts.push(MountSpec {
                r#type: "bind".to_string(),
                target: "/etc/resolv.conf".to_string(),
                source: resolv_path.display().to_string(),
                options: vec!["bind".to_string(), "ro".to_string()],
            });
        }
        Ok(())
    }

    /// Computes the per-container settings from the resource allotment.
    fn container_options(
        &self,
        request: &TaskRequest,
        container_name: &str,
        snapshot: &str,
    ) -> ContainerOptions {
        let env = spec::task_environment(&request.env);

        ContainerOptions {
            container_name: container_name.to_string(),
            snapshot_name: snapshot.to_string(),
            env,
            annotations: BTreeMap::new(),
            memory_limit: request.resources.memory_mb * 1024 * 1024,
            memory_hard_limit: request.resources.memory_max_mb * 1024 * 1024,
            cpu_shares: request.resources.cpu_shares,
            user: request.user.clone(),
            network_ns_path: request
                .network_isolation
                .as_ref()
                .map(|n| n.path.clone())
                .filter(|p| !p.is_empty()),
            secrets_dir_src: request.task_dir.secrets_dir.display().to_string(),
            secrets_dir_dest: request.env.get(ENV_SECRETS_DIR).cloned().unwrap_or_default(),
            task_dir_src: request.task_dir.local_dir.display().to_string(),
            task_dir_dest: request.env.get(ENV_TASK_DIR).cloned().unwrap_or_default(),
            alloc_dir_src: request.task_dir.shared_alloc_dir.display().to_string(),
            alloc_dir_dest: request.env.get(ENV_ALLOC_DIR).cloned().unwrap_or_default(),
        }
    }

    /// Deletes a container and its snapshot after a partial start failure,
    /// so nothing daemon-side waits for a Destroy that will never come.
    async fn rollback_container(&self, container_name: &str, snapshot: &str) {
        if let Err(e) = self
            .gateway
            .delete_container_with_snapshot(container_name, snapshot)
            .await
        {
            warn!(container = %container_name, error = %e,
                "failed to roll back container after start failure");
        }
    }

    // =========================================================================
    // RecoverTask
    // =========================================================================

    /// Rebuilds the in-memory handle for a task that survived a plugin
    /// restart. Recovering an already-tracked task is a no-op.
    pub async fn recover_task(&self, request: &RecoverRequest) -> Result<()> {
        if self.tasks.contains(&request.id) {
            return Ok(());
        }

        let state = &request.state;
        self.gateway.load_container(&state.container_name).await?;

        let stdio = TaskStdio::open(&state.stdout_path, &state.stderr_path)?;
        let probe = self
            .gateway
            .task_status(&state.container_name, "")
            .await?;

        let handle = TaskHandle::new(
            request.id.clone(),
            request.name.clone(),
            state.container_name.clone(),
            snapshot_name(&state.container_name),
            state.started_at,
            stdio,
            self.gateway.clone(),
            self.compute,
            self.shutdown.clone(),
        );
        self.tasks.set(&request.id, handle.clone());

        if probe.status == TaskStatusKind::Stopped {
            handle.spawn_run();
        } else {
            // The task is already live; arm the watcher so Wait still
            // observes the exit.
            let _ = handle.arm_exit_watcher();
        }

        info!(task = %request.id, container = %state.container_name,
            "task recovered successfully");
        Ok(())
    }

    // =========================================================================
    // WaitTask
    // =========================================================================

    /// Returns a channel that yields the task's exit result. The producer
    /// re-sends the terminal value until the consumer goes away, so a slow
    /// consumer still sees it.
    pub fn wait_task(&self, task_id: &str) -> Result<mpsc::Receiver<ExitResult>> {
        let handle = self
            .tasks
            .get(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;

        let (tx, rx) = mpsc::channel(1);
        let mut exit_rx = handle.subscribe_exit();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = shutdown.cancelled() => return,
                observed = exit_rx.wait_for(|v| v.is_some()) => match observed {
                    Ok(guard) => guard.clone(),
                    Err(_) => return,
                },
            };
            let Some(result) = result else { return };

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    sent = tx.send(result.clone()) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    // =========================================================================
    // StopTask
    // =========================================================================

    /// Gracefully stops a task with the given signal and timeout window.
    /// Empty or unknown signal names fall back to SIGTERM.
    pub async fn stop_task(&self, task_id: &str, timeout: Duration, signal: &str) -> Result<()> {
        let handle = self
            .tasks
            .get(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;

        let signal = if signal.is_empty() {
            SIGTERM
        } else {
            match signal_from_name(signal) {
                Some(sig) => sig,
                None => {
                    warn!(task = %task_id, signal = %signal,
                        "unknown stop signal, falling back to SIGTERM");
                    SIGTERM
                }
            }
        };

        handle.shutdown(timeout, signal).await
    }

    // =========================================================================
    // DestroyTask
    // =========================================================================

    /// Removes a terminated task's daemon-side objects and forgets the
    /// handle. Running tasks are refused unless forced.
    pub async fn destroy_task(&self, task_id: &str, force: bool) -> Result<()> {
        let handle = self
            .tasks
            .get(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;

        let running = match handle.is_running().await {
            Ok(running) => running,
            Err(ref e) if e.is_not_found() => false,
            Err(e) => return Err(e),
        };

        if running && !force {
            return Err(Error::TaskStillRunning);
        }

        handle.cleanup().await?;
        self.tasks.delete(task_id);
        Ok(())
    }

    // =========================================================================
    // Inspect, Stats, Signal, Exec
    // =========================================================================

    /// Detailed status snapshot for a task.
    pub async fn inspect_task(&self, task_id: &str) -> Result<TaskStatus> {
        let handle = self
            .tasks
            .get(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
        Ok(handle.task_status().await)
    }

    /// Streams resource-usage samples. A parseable `stats_interval` in the
    /// plugin config overrides the orchestrator's cadence.
    pub fn task_stats(
        &self,
        task_id: &str,
        interval: Duration,
    ) -> Result<mpsc::Receiver<TaskResourceUsage>> {
        let handle = self
            .tasks
            .get(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;

        let mut interval = interval;
        if let Some(configured) = &self.config.stats_interval {
            match parse_duration(configured) {
                Ok(overridden) => {
                    debug!(task = %task_id, interval = ?overridden,
                        "overriding client stats interval with driver stats interval");
                    interval = overridden;
                }
                Err(_) => {
                    warn!("error parsing driver stats interval, fallback on default interval");
                }
            }
        }

        Ok(handle.stats(interval))
    }

    /// Forwards a symbolic signal to a task.
    pub async fn signal_task(&self, task_id: &str, signal: &str) -> Result<()> {
        let handle = self
            .tasks
            .get(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;

        let sig =
            signal_from_name(signal).ok_or_else(|| Error::InvalidSignal(signal.to_string()))?;
        handle.signal(sig).await
    }

    /// Runs a command in a task's container, streaming through the FIFO
    /// paths in `opts`.
    pub async fn exec_task_streaming(
        &self,
        task_id: &str,
        opts: ExecOptions,
    ) -> Result<ExitResult> {
        let handle = self
            .tasks
            .get(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
        handle.exec(opts).await
    }

    /// One-shot exec is not supported by this driver.
    pub async fn exec_task(&self, _task_id: &str, _cmd: &[String]) -> Result<ExitResult> {
        Err(Error::NotSupported(
            "this driver does not support exec".to_string(),
        ))
    }
}

// =============================================================================
// Fingerprint Assembly
// =============================================================================

async fn build_fingerprint(gateway: &Containerd, enabled: bool) -> Fingerprint {
    if !enabled {
        return Fingerprint {
            health: HealthState::Unhealthy,
            health_description: "driver disabled".to_string(),
            attributes: BTreeMap::new(),
        };
    }

    let serving = match gateway.is_serving().await {
        Ok(serving) => serving,
        Err(e) => {
            error!(error = %e, "failed to get containerd status");
            false
        }
    };
    if !serving {
        return Fingerprint {
            health: HealthState::Unhealthy,
            health_description: "Unhealthy".to_string(),
            attributes: BTreeMap::new(),
        };
    }

    let mut fingerprint = Fingerprint {
        health: HealthState::Healthy,
        health_description: "Healthy".to_string(),
        attributes: BTreeMap::new(),
    };

    match gateway.version().await {
        Ok(version) => {
            fingerprint.attributes.insert(
                "driver.containerd.containerd_version".to_string(),
                version.version,
            );
            fingerprint.attributes.insert(
                "driver.containerd.containerd_revision".to_string(),
                version.revision,
            );
        }
        Err(e) => {
            warn!(error = %e, "failed to get containerd version");
        }
    }

    fingerprint
}

// =============================================================================
// Signals and resolv.conf
// =============================================================================

const SIGTERM: u32 = 15;

/// Looks up a symbolic signal name, with or without the SIG prefix.
pub fn signal_from_name(name: &str) -> Option<u32> {
    let upper = name.to_ascii_uppercase();
    let stripped = upper.strip_prefix("SIG").unwrap_or(&upper);
    let number = match stripped {
        "HUP" => 1,
        "INT" => 2,
        "QUIT" => 3,
        "ILL" => 4,
        "TRAP" => 5,
        "ABRT" | "IOT" => 6,
        "BUS" => 7,
        "FPE" => 8,
        "KILL" => 9,
        "USR1" => 10,
        "SEGV" => 11,
        "USR2" => 12,
        "PIPE" => 13,
        "ALRM" => 14,
        "TERM" => 15,
        "CHLD" => 17,
        "CONT" => 18,
        "STOP" => 19,
        "TSTP" => 20,
        "TTIN" => 21,
        "TTOU" => 22,
        "URG" => 23,
        "XCPU" => 24,
        "XFSZ" => 25,
        "VTALRM" => 26,
        "PROF" => 27,
        "WINCH" => 28,
        "IO" => 29,
        "SYS" => 31,
        _ => return None,
    };
    Some(number)
}

/// Writes the orchestrator's DNS configuration as a resolv.conf file under
/// the task directory, returning its path.
fn write_resolv_conf(task_dir: &Path, dns: &DnsConfig) -> Result<PathBuf> {
    use std::fmt::Write as _;

    let mut content = String::new();
    for server in &dns.servers {
        let _ = writeln!(content, "nameserver {server}");
    }
    if !dns.searches.is_empty() {
        let _ = writeln!(content, "search {}", dns.searches.join(" "));
    }
    if !dns.options.is_empty() {
        let _ = writeln!(content, "options {}", dns.options.join(" "));
    }

    let path = task_dir.join("resolv.conf");
    std::fs::write(&path, content)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_lookup_accepts_both_spellings() {
        assert_eq!(signal_from_name("SIGTERM"), Some(15));
        assert_eq!(signal_from_name("TERM"), Some(15));
        assert_eq!(signal_from_name("sigkill"), Some(9));
        assert_eq!(signal_from_name("usr1"), Some(10));
        assert_eq!(signal_from_name("SIGWINCH"), Some(28));
        assert_eq!(signal_from_name("NOPE"), None);
        assert_eq!(signal_from_name(""), None);
    }

    #[test]
    fn resolv_conf_contains_all_sections() {
        let dir = tempfile::TempDir::new().unwrap();
        let dns = DnsConfig {
            servers: vec!["10.0.0.2".to_string(), "10.0.0.3".to_string()],
            searches: vec!["svc.cluster".to_string()],
            options: vec!["ndots:2".to_string()],
        };
        let path = write_resolv_conf(dir.path(), &dns).unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("nameserver 10.0.0.2"));
        assert!(content.contains("nameserver 10.0.0.3"));
        assert!(content.contains("search svc.cluster"));
        assert!(content.contains("options ndots:2"));
    }
}
