//! Per-task handle.
//!
//! The handle is the in-memory record of one task: its lifecycle state,
//! timestamps, exit result, CPU accumulators, and the names binding it to
//! the daemon-side container and task objects. A reader/writer lock
//! serialises state reads against run/exit/cleanup writes; daemon probes
//! never hold the lock across the wire.
//!
//! The exit watcher issues the daemon wait before the start call is made
//! and publishes the result on a watch channel, so a Wait subscriber can
//! never miss the exit status regardless of timing.

use crate::client::{Containerd, TaskStatusKind};
use crate::error::{Error, Result};
use crate::fifo::TaskStdio;
use crate::stats::{Compute, CpuTrackers};
use crate::task::state::{ExitResult, ProcessState, TaskResourceUsage, TaskStatus};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// SIGKILL, the escalation signal after a graceful shutdown times out.
const SIGKILL: u32 = 9;

/// A terminal resize event forwarded to an exec session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtyResize {
    pub height: u32,
    pub width: u32,
}

/// Options for an exec session. Stdio attaches through FIFO paths the
/// orchestrator created; resize events arrive on the optional channel and
/// are forwarded until the channel closes or the exec ends.
pub struct ExecOptions {
    pub command: Vec<String>,
    pub tty: bool,
    pub stdin: Option<PathBuf>,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub resize: Option<mpsc::Receiver<TtyResize>>,
}

/// Mutable handle state, guarded by the handle's rwlock.
struct HandleState {
    state: ProcessState,
    completed_at: Option<DateTime<Utc>>,
    exit_result: Option<ExitResult>,
    stdio: Option<TaskStdio>,
}

/// In-memory record of one task.
pub struct TaskHandle {
    task_id: String,
    task_name: String,
    container_name: String,
    snapshot_name: String,
    started_at: DateTime<Utc>,
    gateway: Arc<Containerd>,
    compute: Compute,
    state: RwLock<HandleState>,
    cpu: Mutex<CpuTrackers>,
    exit: watch::Sender<Option<ExitResult>>,
    watcher_armed: AtomicBool,
    shutdown: CancellationToken,
}

impl TaskHandle {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        task_id: String,
        task_name: String,
        container_name: String,
        snapshot_name: String,
        started_at: DateTime<Utc>,
        stdio: TaskStdio,
        gateway: Arc<Containerd>,
        compute: Compute,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (exit, _) = watch::channel(None);
        Arc::new(Self {
            task_id,
            task_name,
            container_name,
            snapshot_name,
            started_at,
            gateway,
            compute,
            state: RwLock::new(HandleState {
                state: ProcessState::Running,
                completed_at: None,
                exit_result: None,
                stdio: Some(stdio),
            }),
            cpu: Mutex::new(CpuTrackers::default()),
            exit,
            watcher_armed: AtomicBool::new(false),
            shutdown,
        })
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Subscribes to the task's exit result. The value is `Some` once the
    /// exit watcher has observed the task leave the daemon.
    pub fn subscribe_exit(&self) -> watch::Receiver<Option<ExitResult>> {
        self.exit.subscribe()
    }

    // =========================================================================
    // Run
    // =========================================================================

    /// Spawns the run routine: arm the exit watcher, then start the task.
    pub(crate) fn spawn_run(self: &Arc<Self>) {
        let handle = self.clone();
        tokio::spawn(async move {
            handle.run().await;
        });
    }

    async fn run(self: Arc<Self>) {
        // The barrier resolves once the watcher's wait call has been
        // dispatched; starting before that could lose the exit status.
        let armed = self.arm_exit_watcher();
        let _ = armed.await;

        if let Err(e) = self.gateway.start_task(&self.container_name, "").await {
            error!(task = %self.task_id, error = %e, "failed to start task");
        }
    }

    /// Spawns the exit watcher exactly once per handle. Returns a barrier
    /// that resolves when the watcher's wait call has been issued; the
    /// gateway fires it as part of dispatching the wait request, not
    /// before. If the wait ends without dispatching, the dropped sender
    /// resolves the barrier with an error instead of hanging the caller.
    pub(crate) fn arm_exit_watcher(self: &Arc<Self>) -> oneshot::Receiver<()> {
        let (barrier_tx, barrier_rx) = oneshot::channel();
        if self.watcher_armed.swap(true, Ordering::SeqCst) {
            // Already armed: the live watcher's wait is registered.
            let _ = barrier_tx.send(());
            return barrier_rx;
        }

        let handle = self.clone();
        tokio::spawn(async move {
            match handle
                .gateway
                .wait_task(&handle.container_name, "", Some(barrier_tx))
                .await
            {
                Ok((code, exited_at)) => {
                    handle
                        .mark_exited(ExitResult::code(code as i32), exited_at)
                        .await;
                }
                Err(Error::ShuttingDown) => {}
                Err(e) => {
                    handle.mark_exited(ExitResult::wait_failed(e), None).await;
                }
            }
        });
        barrier_rx
    }

    /// Records the terminal state. The first recorded outcome wins; an
    /// Unknown observation may still refine to Exited, Exited never
    /// changes again.
    async fn mark_exited(&self, result: ExitResult, exited_at: Option<DateTime<Utc>>) {
        {
            let mut state = self.state.write().await;
            if state.state == ProcessState::Exited {
                return;
            }
            state.state = ProcessState::Exited;
            if state.completed_at.is_none() {
                state.completed_at = Some(exited_at.unwrap_or_else(Utc::now));
            }
            state.exit_result = Some(result.clone());
        }
        self.exit.send_replace(Some(result));
    }

    /// Folds a failed daemon probe into the handle: a running task moves
    /// to Unknown. No exit result is recorded; only Exited carries one.
    async fn mark_unknown(&self) {
        let mut state = self.state.write().await;
        if state.state == ProcessState::Running {
            state.state = ProcessState::Unknown;
            if state.completed_at.is_none() {
                state.completed_at = Some(Utc::now());
            }
        }
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// True when the daemon reports the task Running.
    pub async fn is_running(&self) -> Result<bool> {
        let probe = self.gateway.task_status(&self.container_name, "").await?;
        Ok(probe.status == TaskStatusKind::Running)
    }

    /// Probes the daemon and returns a status snapshot. A terminal
    /// observation folds through the same path as the exit watcher, with
    /// the exit status the daemon recorded, so an Exited snapshot always
    /// carries an exit result.
    pub async fn task_status(&self) -> TaskStatus {
        match self.gateway.task_status(&self.container_name, "").await {
            Ok(probe) if probe.status == TaskStatusKind::Running => {}
            Ok(probe) => {
                self.mark_exited(ExitResult::code(probe.exit_status as i32), probe.exited_at)
                    .await;
            }
            Err(e) => {
                warn!(task = %self.task_id, error = %e, "task status probe failed");
                self.mark_unknown().await;
            }
        }

        let state = self.state.read().await;
        TaskStatus {
            id: self.task_id.clone(),
            name: self.task_name.clone(),
            state: state.state,
            started_at: self.started_at,
            completed_at: state.completed_at,
            exit_result: state.exit_result.clone(),
            container_name: self.container_name.clone(),
        }
    }

    // =========================================================================
    // Signals and Shutdown
    // =========================================================================

    /// Forwards a signal to the task process.
    pub async fn signal(&self, signal: u32) -> Result<()> {
        self.gateway
            .kill_task(&self.container_name, "", signal, false)
            .await
    }

    /// Graceful shutdown: deliver `signal`, wait out the timeout, then
    /// SIGKILL anything still running.
    pub async fn shutdown(&self, timeout: Duration, signal: u32) -> Result<()> {
        self.gateway
            .kill_task(&self.container_name, "", signal, false)
            .await?;

        tokio::time::sleep(timeout).await;

        let probe = self.gateway.task_status(&self.container_name, "").await?;
        if probe.status != TaskStatusKind::Running {
            info!(task = %self.task_id, "task is not running anymore, no need to SIGKILL");
            return Ok(());
        }

        self.gateway
            .kill_task(&self.container_name, "", SIGKILL, false)
            .await
    }

    // =========================================================================
    // Cleanup
    // =========================================================================

    /// Deletes the daemon-side task and then the container with its
    /// snapshot. Already-gone objects are tolerated; the FIFO descriptors
    /// are released either way.
    pub async fn cleanup(&self) -> Result<()> {
        self.state.write().await.stdio.take();

        match self.gateway.delete_task(&self.container_name).await {
            Ok(()) => {}
            Err(ref e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        self.gateway
            .delete_container_with_snapshot(&self.container_name, &self.snapshot_name)
            .await
    }

    // =========================================================================
    // Stats
    // =========================================================================

    /// Emits a resource-usage sample every `interval` until the consumer
    /// goes away, the driver shuts down, or a metrics call fails. The
    /// first sample is immediate.
    pub fn stats(self: &Arc<Self>, interval: Duration) -> mpsc::Receiver<TaskResourceUsage> {
        let (tx, rx) = mpsc::channel(1);
        let handle = self.clone();

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = handle.shutdown.cancelled() => return,
                    _ = tx.closed() => return,
                    _ = timer.tick() => {}
                }

                let metrics = match handle.gateway.task_metrics(&handle.container_name).await {
                    Ok(metrics) => metrics,
                    Err(e) => {
                        error!(task = %handle.task_id, error = %e, "failed to get task metrics");
                        return;
                    }
                };

                let usage = handle
                    .cpu
                    .lock()
                    .await
                    .convert(&metrics, &handle.compute);

                tokio::select! {
                    _ = handle.shutdown.cancelled() => return,
                    sent = tx.send(usage) => {
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
    // Exec
    // =========================================================================

    /// Runs a process in the task's container and returns its exit result.
    ///
    /// The process spec starts from the container's stored spec with args
    /// and terminal mode overridden. The wait is issued before start, and
    /// the resize forwarder ends with the exec rather than outliving it.
    pub async fn exec(&self, mut opts: ExecOptions) -> Result<ExitResult> {
        let spec = self.gateway.container_spec(&self.container_name).await?;
        let mut process = spec.process.unwrap_or_default();
        process.args = opts.command.clone();
        process.terminal = opts.tty;

        let exec_id: String = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();

        self.gateway
            .exec_process(
                &self.container_name,
                &exec_id,
                &process,
                opts.stdin.as_deref(),
                &opts.stdout,
                &opts.stderr,
                opts.tty,
            )
            .await?;

        // The guard cancels the forwarder when this call returns.
        let exec_done = CancellationToken::new();
        let _guard = exec_done.clone().drop_guard();
        if let Some(resize) = opts.resize.take() {
            self.spawn_resize_forwarder(exec_id.clone(), resize, exec_done.clone());
        }

        // The gateway fires the barrier once the wait request for the
        // exec process has been dispatched.
        let (barrier_tx, barrier_rx) = oneshot::channel();
        let waiter = {
            let gateway = self.gateway.clone();
            let container = self.container_name.clone();
            let exec = exec_id.clone();
            tokio::spawn(
                async move { gateway.wait_task(&container, &exec, Some(barrier_tx)).await },
            )
        };
        let _ = barrier_rx.await;

        self.gateway
            .start_task(&self.container_name, &exec_id)
            .await
            .map_err(|e| Error::ExecFailed {
                container: self.container_name.clone(),
                reason: e.to_string(),
            })?;

        let (code, _exited_at) = waiter
            .await
            .map_err(|e| Error::ExecFailed {
                container: self.container_name.clone(),
                reason: format!("wait task aborted: {e}"),
            })??;

        if let Err(e) = self.gateway.delete_process(&self.container_name, &exec_id).await {
            warn!(task = %self.task_id, exec = %exec_id, error = %e,
                "failed to delete exec process");
        }

        Ok(ExitResult::code(code as i32))
    }

    /// Forwards terminal resize events to the daemon until the channel
    /// closes, the exec finishes, or the driver shuts down.
    fn spawn_resize_forwarder(
        &self,
        exec_id: String,
        mut resize: mpsc::Receiver<TtyResize>,
        exec_done: CancellationToken,
    ) {
        let gateway = self.gateway.clone();
        let container = self.container_name.clone();
        let root = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = exec_done.cancelled() => return,
                    _ = root.cancelled() => return,
                    event = resize.recv() => event,
                };
                let Some(event) = event else { return };
                if let Err(e) = gateway
                    .resize_pty(&container, &exec_id, event.width, event.height)
                    .await
                {
                    error!(container = %container, exec = %exec_id, error = %e,
                        "failed to resize terminal");
                    return;
                }
            }
        });
    }
}
