//! Runtime gateway: a thin, deadline-wrapped facade over the containerd
//! daemon.
//!
//! One client is shared per plugin process. Every request is placed in the
//! plugin's daemon namespace and wrapped in a per-operation deadline
//! derived from the driver root context; only wait and exec inherit their
//! caller's deadline. The gateway owns the wire details (transfer-service
//! pulls, snapshot preparation, Any envelopes) so the lifecycle engine
//! never sees protobuf.

use crate::auth::Credentials;
use crate::constants::{
    DAEMON_CALL_TIMEOUT, DEFAULT_SNAPSHOTTER, TYPE_URL_IMAGE_STORE, TYPE_URL_OCI_REGISTRY,
    TYPE_URL_PROCESS, TYPE_URL_SPEC,
};
use crate::error::{Error, Result};
use crate::image::{
    host_architecture, ImageConfigFile, ImageHandle, ImageIndex, ImageManifest,
};
use crate::metrics::{decode_metrics, CgroupMetrics};
use crate::oci;
use crate::reference::ImageReference;
use chrono::{DateTime, Utc};
use containerd_client::services::v1::snapshots::{
    MountsRequest, PrepareSnapshotRequest, RemoveSnapshotRequest,
};
use containerd_client::services::v1::{
    container, Container, CreateContainerRequest, CreateTaskRequest, DeleteContainerRequest,
    DeleteProcessRequest, DeleteTaskRequest, ExecProcessRequest, GetContainerRequest, GetImageRequest,
    GetRequest, KillRequest, MetricsRequest, ReadContentRequest, ResizePtyRequest, StartRequest,
    TransferOptions, TransferRequest, WaitRequest,
};
use containerd_client::types::transfer::{ImageStore, OciRegistry, RegistryResolver, UnpackConfiguration};
use containerd_client::types::{v1 as task_types, Platform};
use containerd_client::{with_namespace, Client};
use prost::Message;
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::Request;
use tracing::{debug, warn};

/// Daemon version and revision, surfaced in the fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonVersion {
    pub version: String,
    pub revision: String,
}

/// Daemon-side observation of a task or exec process. A stopped process
/// carries the exit status the daemon recorded for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskProbe {
    pub status: TaskStatusKind,
    pub exit_status: u32,
    pub exited_at: Option<DateTime<Utc>>,
}

/// Daemon-side process state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatusKind {
    Unknown,
    Created,
    Running,
    Stopped,
    Paused,
    Pausing,
}

impl From<task_types::Status> for TaskStatusKind {
    fn from(status: task_types::Status) -> Self {
        match status {
            task_types::Status::Unknown => TaskStatusKind::Unknown,
            task_types::Status::Created => TaskStatusKind::Created,
            task_types::Status::Running => TaskStatusKind::Running,
            task_types::Status::Stopped => TaskStatusKind::Stopped,
            task_types::Status::Paused => TaskStatusKind::Paused,
            task_types::Status::Pausing => TaskStatusKind::Pausing,
        }
    }
}

/// Shared facade over the containerd daemon.
pub struct Containerd {
    client: Client,
    channel: Channel,
    namespace: String,
    runtime: String,
    shutdown: CancellationToken,
}

impl Containerd {
    /// Connects to the daemon socket. The namespace and runtime id are
    /// fixed for the plugin's lifetime.
    pub async fn connect(
        socket: &Path,
        namespace: &str,
        runtime: &str,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let channel = containerd_client::connect(socket).await.map_err(|e| {
            Error::DaemonUnavailable {
                socket: socket.display().to_string(),
                reason: e.to_string(),
            }
        })?;

        Ok(Self {
            client: Client::from(channel.clone()),
            channel,
            namespace: namespace.to_string(),
            runtime: runtime.to_string(),
            shutdown,
        })
    }

    /// Wraps a daemon call in the given deadline and the driver root
    /// context.
    async fn with_deadline<T, F>(&self, operation: &str, deadline: Duration, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, tonic::Status>>,
    {
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(Error::ShuttingDown),
            outcome = tokio::time::timeout(deadline, fut) => match outcome {
                Err(_) => Err(Error::Timeout {
                    operation: operation.to_string(),
                    duration: deadline,
                }),
                Ok(result) => result.map_err(Error::from),
            },
        }
    }

    // =========================================================================
    // Liveness and Version
    // =========================================================================

    /// True when the daemon's health service reports Serving.
    pub async fn is_serving(&self) -> Result<bool> {
        use tonic_health::pb::health_check_response::ServingStatus;
        use tonic_health::pb::health_client::HealthClient;
        use tonic_health::pb::HealthCheckRequest;

        let mut health = HealthClient::new(self.channel.clone());
        let response = self
            .with_deadline("health check", DAEMON_CALL_TIMEOUT, async move {
                health
                    .check(HealthCheckRequest {
                        service: String::new(),
                    })
                    .await
            })
            .await?;

        Ok(response.into_inner().status == ServingStatus::Serving as i32)
    }

    /// Daemon version and revision.
    pub async fn version(&self) -> Result<DaemonVersion> {
        let mut client = self.client.version();
        let response = self
            .with_deadline("version", DAEMON_CALL_TIMEOUT, async move {
                client.version(()).await
            })
            .await?
            .into_inner();

        Ok(DaemonVersion {
            version: response.version,
            revision: response.revision,
        })
    }

    // =========================================================================
    // Images
    // =========================================================================

    /// Pulls and unpacks an image through the transfer service, then reads
    /// its config back out of the content store.
    pub async fn pull_image(
        &self,
        reference: &ImageReference,
        pull_timeout: Duration,
        credentials: Option<&Credentials>,
    ) -> Result<ImageHandle> {
        let name = reference.canonical();

        let mut headers = HashMap::new();
        if let Some(creds) = credentials {
            headers.insert("Authorization".to_string(), creds.basic_auth_header());
        }

        let source = OciRegistry {
            reference: name.clone(),
            resolver: Some(RegistryResolver {
                headers,
                ..Default::default()
            }),
        };
        let destination = ImageStore {
            name: name.clone(),
            unpacks: vec![UnpackConfiguration {
                platform: Some(Platform {
                    os: "linux".to_string(),
                    architecture: host_architecture().to_string(),
                    ..Default::default()
                }),
                snapshotter: DEFAULT_SNAPSHOTTER.to_string(),
            }],
            ..Default::default()
        };

        let request = TransferRequest {
            source: Some(prost_types::Any {
                type_url: TYPE_URL_OCI_REGISTRY.to_string(),
                value: source.encode_to_vec(),
            }),
            destination: Some(prost_types::Any {
                type_url: TYPE_URL_IMAGE_STORE.to_string(),
                value: destination.encode_to_vec(),
            }),
            options: Some(TransferOptions::default()),
        };

        debug!(image = %name, "pulling image");
        let namespace = self.namespace.clone();
        let mut transfer = self.client.transfer();
        self.with_deadline("image pull", pull_timeout, async move {
            transfer.transfer(with_namespace!(request, namespace)).await
        })
        .await
        .map_err(|e| match e {
            Error::Timeout { .. } | Error::ShuttingDown => e,
            other => Error::ImagePullFailed {
                reference: name.clone(),
                reason: other.to_string(),
            },
        })?;

        self.resolve_image(&name).await
    }

    /// Resolves a stored image to its runtime config and layer diff-ids.
    pub async fn resolve_image(&self, name: &str) -> Result<ImageHandle> {
        let namespace = self.namespace.clone();
        let mut images = self.client.images();
        let request = GetImageRequest {
            name: name.to_string(),
        };
        let image = self
            .with_deadline("image get", DAEMON_CALL_TIMEOUT, async move {
                images.get(with_namespace!(request, namespace)).await
            })
            .await?
            .into_inner()
            .image
            .ok_or_else(|| Error::ImagePullFailed {
                reference: name.to_string(),
                reason: "image record missing after pull".to_string(),
            })?;

        let target = image.target.ok_or_else(|| Error::ImagePullFailed {
            reference: name.to_string(),
            reason: "image record has no target descriptor".to_string(),
        })?;

        let manifest = self.read_manifest(name, &target.media_type, &target.digest).await?;
        let config_raw = self.read_content(&manifest.config.digest).await?;
        let config: ImageConfigFile = serde_json::from_slice(&config_raw)?;

        Ok(ImageHandle {
            name: name.to_string(),
            digest: target.digest,
            config: config.config,
            diff_ids: config.rootfs.diff_ids,
        })
    }

    /// Reads the image manifest, resolving a multi-arch index to the host
    /// platform.
    async fn read_manifest(
        &self,
        name: &str,
        media_type: &str,
        digest: &str,
    ) -> Result<ImageManifest> {
        use crate::constants::{MEDIA_TYPE_DOCKER_MANIFEST_LIST, MEDIA_TYPE_OCI_INDEX};

        let raw = self.read_content(digest).await?;
        if media_type == MEDIA_TYPE_OCI_INDEX || media_type == MEDIA_TYPE_DOCKER_MANIFEST_LIST {
            let index: ImageIndex = serde_json::from_slice(&raw)?;
            let arch = host_architecture();
            let entry = index
                .manifests
                .iter()
                .find(|m| {
                    m.platform
                        .as_ref()
                        .is_some_and(|p| p.os == "linux" && p.architecture == arch)
                })
                .ok_or_else(|| Error::ImagePullFailed {
                    reference: name.to_string(),
                    reason: format!("no manifest for linux/{arch}"),
                })?;
            let raw = self.read_content(&entry.digest).await?;
            Ok(serde_json::from_slice(&raw)?)
        } else {
            Ok(serde_json::from_slice(&raw)?)
        }
    }

    /// Reads a blob out of the content store.
    async fn read_content(&self, digest: &str) -> Result<Vec<u8>> {
        let namespace = self.namespace.clone();
        let mut content = self.client.content();
        let request = ReadContentRequest {
            digest: digest.to_string(),
            offset: 0,
            size: 0,
        };
        self.with_deadline("content read", DAEMON_CALL_TIMEOUT, async move {
            let mut stream = content
                .read(with_namespace!(request, namespace))
                .await?
                .into_inner();
            let mut data = Vec::new();
            while let Some(chunk) = stream.message().await? {
                data.extend(chunk.data);
            }
            Ok(data)
        })
        .await
    }

    // =========================================================================
    // Containers and Snapshots
    // =========================================================================

    /// Creates a container: prepares the rootfs snapshot from the image's
    /// layer chain, then writes the container record with the configured
    /// runtime and the spec document. A snapshot prepared for a container
    /// that failed to create is removed before the error returns.
    pub async fn create_container(
        &self,
        container_name: &str,
        snapshot_name: &str,
        image: &ImageHandle,
        spec: &oci::Spec,
    ) -> Result<()> {
        let namespace = self.namespace.clone();
        let mut snapshots = self.client.snapshots();
        let request = PrepareSnapshotRequest {
            snapshotter: DEFAULT_SNAPSHOTTER.to_string(),
            key: snapshot_name.to_string(),
            parent: image.chain_id(),
            ..Default::default()
        };
        self.with_deadline("snapshot prepare", DAEMON_CALL_TIMEOUT, async move {
            snapshots.prepare(with_namespace!(request, namespace)).await
        })
        .await
        .map_err(|e| Error::ContainerCreateFailed {
            id: container_name.to_string(),
            reason: format!("snapshot prepare: {e}"),
        })?;

        let spec_json = serde_json::to_vec(spec)?;
        let record = Container {
            id: container_name.to_string(),
            image: image.name.clone(),
            runtime: Some(container::Runtime {
                name: self.runtime.clone(),
                options: None,
            }),
            spec: Some(prost_types::Any {
                type_url: TYPE_URL_SPEC.to_string(),
                value: spec_json,
            }),
            snapshotter: DEFAULT_SNAPSHOTTER.to_string(),
            snapshot_key: snapshot_name.to_string(),
            ..Default::default()
        };

        let namespace = self.namespace.clone();
        let mut containers = self.client.containers();
        let request = CreateContainerRequest {
            container: Some(record),
        };
        let created = self
            .with_deadline("container create", DAEMON_CALL_TIMEOUT, async move {
                containers.create(with_namespace!(request, namespace)).await
            })
            .await;

        if let Err(e) = created {
            if let Err(cleanup) = self.remove_snapshot(snapshot_name).await {
                warn!(snapshot = snapshot_name, error = %cleanup,
                    "failed to remove snapshot after container create failure");
            }
            return Err(Error::ContainerCreateFailed {
                id: container_name.to_string(),
                reason: e.to_string(),
            });
        }
        Ok(())
    }

    /// Confirms a container record exists.
    pub async fn load_container(&self, id: &str) -> Result<()> {
        let namespace = self.namespace.clone();
        let mut containers = self.client.containers();
        let request = GetContainerRequest { id: id.to_string() };
        self.with_deadline("container load", DAEMON_CALL_TIMEOUT, async move {
            containers.get(with_namespace!(request, namespace)).await
        })
        .await?;
        Ok(())
    }

    /// Reads the container's stored spec document.
    pub async fn container_spec(&self, id: &str) -> Result<oci::Spec> {
        let namespace = self.namespace.clone();
        let mut containers = self.client.containers();
        let request = GetContainerRequest { id: id.to_string() };
        let record = self
            .with_deadline("container get", DAEMON_CALL_TIMEOUT, async move {
                containers.get(with_namespace!(request, namespace)).await
            })
            .await?
            .into_inner()
            .container
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;

        let any = record
            .spec
            .ok_or_else(|| Error::ExecFailed {
                container: id.to_string(),
                reason: "container record has no spec".to_string(),
            })?;
        Ok(serde_json::from_slice(&any.value)?)
    }

    /// Deletes a container record and its snapshot. Missing objects are
    /// tolerated so the cleanup is idempotent.
    pub async fn delete_container_with_snapshot(
        &self,
        id: &str,
        snapshot_name: &str,
    ) -> Result<()> {
        let namespace = self.namespace.clone();
        let mut containers = self.client.containers();
        let request = DeleteContainerRequest { id: id.to_string() };
        let deleted = self
            .with_deadline("container delete", DAEMON_CALL_TIMEOUT, async move {
                containers.delete(with_namespace!(request, namespace)).await
            })
            .await;
        match deleted {
            Ok(_) => {}
            Err(ref e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        match self.remove_snapshot(snapshot_name).await {
            Ok(()) => Ok(()),
            Err(ref e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn remove_snapshot(&self, key: &str) -> Result<()> {
        let namespace = self.namespace.clone();
        let mut snapshots = self.client.snapshots();
        let request = RemoveSnapshotRequest {
            snapshotter: DEFAULT_SNAPSHOTTER.to_string(),
            key: key.to_string(),
        };
        self.with_deadline("snapshot remove", DAEMON_CALL_TIMEOUT, async move {
            snapshots.remove(with_namespace!(request, namespace)).await
        })
        .await?;
        Ok(())
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    /// Creates the daemon-side task: snapshot mounts become the rootfs and
    /// the stdout/stderr FIFO paths attach directly. Stdin stays empty.
    pub async fn new_task(
        &self,
        container_name: &str,
        snapshot_name: &str,
        stdout_path: &Path,
        stderr_path: &Path,
    ) -> Result<()> {
        let namespace = self.namespace.clone();
        let mut snapshots = self.client.snapshots();
        let request = MountsRequest {
            snapshotter: DEFAULT_SNAPSHOTTER.to_string(),
            key: snapshot_name.to_string(),
        };
        let rootfs = self
            .with_deadline("snapshot mounts", DAEMON_CALL_TIMEOUT, async move {
                snapshots.mounts(with_namespace!(request, namespace)).await
            })
            .await
            .map_err(|e| Error::TaskCreateFailed {
                id: container_name.to_string(),
                reason: format!("snapshot mounts: {e}"),
            })?
            .into_inner()
            .mounts;

        let namespace = self.namespace.clone();
        let mut tasks = self.client.tasks();
        let request = CreateTaskRequest {
            container_id: container_name.to_string(),
            rootfs,
            stdin: String::new(),
            stdout: stdout_path.display().to_string(),
            stderr: stderr_path.display().to_string(),
            terminal: false,
            ..Default::default()
        };
        self.with_deadline("task create", DAEMON_CALL_TIMEOUT, async move {
            tasks.create(with_namespace!(request, namespace)).await
        })
        .await
        .map_err(|e| Error::TaskCreateFailed {
            id: container_name.to_string(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    /// Starts the task's init process, or an exec process when `exec_id`
    /// is non-empty.
    pub async fn start_task(&self, container_id: &str, exec_id: &str) -> Result<()> {
        let namespace = self.namespace.clone();
        let mut tasks = self.client.tasks();
        let request = StartRequest {
            container_id: container_id.to_string(),
            exec_id: exec_id.to_string(),
        };
        self.with_deadline("task start", DAEMON_CALL_TIMEOUT, async move {
            tasks.start(with_namespace!(request, namespace)).await
        })
        .await?;
        Ok(())
    }

    /// Blocks until the process exits. No gateway deadline: the caller's
    /// context governs.
    ///
    /// `issued` fires once the wait request has been driven onto the
    /// transport. A caller that must not start the process before the
    /// wait is registered blocks on it; the sender is dropped unfired if
    /// the call ends before dispatch.
    pub async fn wait_task(
        &self,
        container_id: &str,
        exec_id: &str,
        issued: Option<oneshot::Sender<()>>,
    ) -> Result<(u32, Option<DateTime<Utc>>)> {
        let namespace = self.namespace.clone();
        let mut tasks = self.client.tasks();
        let request = WaitRequest {
            container_id: container_id.to_string(),
            exec_id: exec_id.to_string(),
        };

        let mut call = Box::pin(tasks.wait(with_namespace!(request, namespace)));
        let mut issued = issued;
        let rpc = std::future::poll_fn(move |cx| {
            let poll = call.as_mut().poll(cx);
            // The first poll dispatches the request; the wait is
            // registered with the daemon from here on.
            if let Some(tx) = issued.take() {
                let _ = tx.send(());
            }
            poll
        });

        let response = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(Error::ShuttingDown),
            response = rpc => response?,
        }
        .into_inner();

        let exited_at = response
            .exited_at
            .and_then(|ts| DateTime::from_timestamp(ts.seconds, ts.nanos as u32));
        Ok((response.exit_status, exited_at))
    }

    /// Daemon-side process observation for the task or one of its execs.
    pub async fn task_status(&self, container_id: &str, exec_id: &str) -> Result<TaskProbe> {
        let namespace = self.namespace.clone();
        let mut tasks = self.client.tasks();
        let request = GetRequest {
            container_id: container_id.to_string(),
            exec_id: exec_id.to_string(),
        };
        let process = self
            .with_deadline("task status", DAEMON_CALL_TIMEOUT, async move {
                tasks.get(with_namespace!(request, namespace)).await
            })
            .await?
            .into_inner()
            .process
            .ok_or_else(|| Error::TaskNotFound(container_id.to_string()))?;

        let status = task_types::Status::try_from(process.status)
            .unwrap_or(task_types::Status::Unknown);
        let exited_at = process
            .exited_at
            .and_then(|ts| DateTime::from_timestamp(ts.seconds, ts.nanos as u32));
        Ok(TaskProbe {
            status: status.into(),
            exit_status: process.exit_status,
            exited_at,
        })
    }

    /// Forwards a signal to the task process.
    pub async fn kill_task(
        &self,
        container_id: &str,
        exec_id: &str,
        signal: u32,
        all: bool,
    ) -> Result<()> {
        let namespace = self.namespace.clone();
        let mut tasks = self.client.tasks();
        let request = KillRequest {
            container_id: container_id.to_string(),
            exec_id: exec_id.to_string(),
            signal,
            all,
        };
        self.with_deadline("task kill", DAEMON_CALL_TIMEOUT, async move {
            tasks.kill(with_namespace!(request, namespace)).await
        })
        .await?;
        Ok(())
    }

    /// Deletes the daemon-side task.
    pub async fn delete_task(&self, container_id: &str) -> Result<()> {
        let namespace = self.namespace.clone();
        let mut tasks = self.client.tasks();
        let request = DeleteTaskRequest {
            container_id: container_id.to_string(),
        };
        self.with_deadline("task delete", DAEMON_CALL_TIMEOUT, async move {
            tasks.delete(with_namespace!(request, namespace)).await
        })
        .await?;
        Ok(())
    }

    /// Deletes a finished exec process.
    pub async fn delete_process(&self, container_id: &str, exec_id: &str) -> Result<()> {
        let namespace = self.namespace.clone();
        let mut tasks = self.client.tasks();
        let request = DeleteProcessRequest {
            container_id: container_id.to_string(),
            exec_id: exec_id.to_string(),
        };
        self.with_deadline("process delete", DAEMON_CALL_TIMEOUT, async move {
            tasks.delete_process(with_namespace!(request, namespace)).await
        })
        .await?;
        Ok(())
    }

    /// Current metrics sample for the task, decoded by cgroup generation.
    pub async fn task_metrics(&self, container_id: &str) -> Result<CgroupMetrics> {
        let namespace = self.namespace.clone();
        let mut tasks = self.client.tasks();
        let request = MetricsRequest {
            filters: vec![format!("id=={container_id}")],
        };
        let response = self
            .with_deadline("task metrics", DAEMON_CALL_TIMEOUT, async move {
                tasks.metrics(with_namespace!(request, namespace)).await
            })
            .await?
            .into_inner();

        let payload = response
            .metrics
            .into_iter()
            .next()
            .and_then(|m| m.data)
            .ok_or_else(|| Error::MetricsDecode {
                type_url: String::new(),
                reason: "daemon returned no metrics".to_string(),
            })?;
        decode_metrics(&payload)
    }

    /// Registers an exec process in the running task. The process spec
    /// rides as a JSON document; stdio attaches via the given FIFO paths.
    pub async fn exec_process(
        &self,
        container_id: &str,
        exec_id: &str,
        process: &oci::Process,
        stdin: Option<&Path>,
        stdout: &Path,
        stderr: &Path,
        terminal: bool,
    ) -> Result<()> {
        let spec_json = serde_json::to_vec(process)?;
        let namespace = self.namespace.clone();
        let mut tasks = self.client.tasks();
        let request = ExecProcessRequest {
            container_id: container_id.to_string(),
            exec_id: exec_id.to_string(),
            stdin: stdin.map(|p| p.display().to_string()).unwrap_or_default(),
            stdout: stdout.display().to_string(),
            stderr: stderr.display().to_string(),
            terminal,
            spec: Some(prost_types::Any {
                type_url: TYPE_URL_PROCESS.to_string(),
                value: spec_json,
            }),
        };
        self.with_deadline("task exec", DAEMON_CALL_TIMEOUT, async move {
            tasks.exec(with_namespace!(request, namespace)).await
        })
        .await?;
        Ok(())
    }

    /// Resizes an exec process's terminal.
    pub async fn resize_pty(
        &self,
        container_id: &str,
        exec_id: &str,
        width: u32,
        height: u32,
    ) -> Result<()> {
        let namespace = self.namespace.clone();
        let mut tasks = self.client.tasks();
        let request = ResizePtyRequest {
            container_id: container_id.to_string(),
            exec_id: exec_id.to_string(),
            width,
            height,
        };
        self.with_deadline("pty resize", DAEMON_CALL_TIMEOUT, async move {
            tasks.resize_pty(with_namespace!(request, namespace)).await
        })
        .await?;
        Ok(())
    }
}
