//! CRI RuntimeService implementation.
//!
//! Maps CRI pod/container lifecycle onto manager containers:
//! - Pod Sandbox → infra container owning the pod's network namespace
//! - Container → manager container sharing that namespace
//!
//! Operations on one sandbox are serialized through a keyed lock; pods
//! never contend with each other. The manager is the only durable store:
//! records are written through as `user.*` config keys and the in-memory
//! index is a cache over them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tonic::{Request, Response, Status};

use podlx_core::config::ShimConfig;
use podlx_core::error::ShimError;
use podlx_core::lock::KeyedLocks;
use podlx_runtime::image::ImageService;
use podlx_runtime::manager::client::ExecStreams;
use podlx_runtime::manager::operation::exec_exit_code;
use podlx_runtime::manager::types::ContainerExecPost;
use podlx_runtime::manager::ManagerClient;
use podlx_runtime::network::{netns_path, CniPlugin};

use crate::container::{Container, ContainerState, ContainerStore};
use crate::cri_api::runtime_service_server::RuntimeService;
use crate::cri_api::*;
use crate::error::shim_error_to_status;
use crate::mapper;
use crate::sandbox::{persist_user_config, PodSandbox, SandboxPhase, SandboxStore};
use crate::streaming::{SessionKind, StreamingHandle, StreamingSession};

/// Graceful timeout handed to the manager when the shim itself decides to
/// stop a container (teardown paths).
const TEARDOWN_STOP_TIMEOUT: i64 = 10;

/// podlx implementation of the CRI RuntimeService.
pub struct PodlxRuntimeService {
    config: ShimConfig,
    manager: ManagerClient,
    images: ImageService,
    network: CniPlugin,
    sandboxes: Arc<SandboxStore>,
    containers: Arc<ContainerStore>,
    pod_locks: KeyedLocks,
    streaming: StreamingHandle,
}

impl PodlxRuntimeService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ShimConfig,
        manager: ManagerClient,
        images: ImageService,
        network: CniPlugin,
        sandboxes: Arc<SandboxStore>,
        containers: Arc<ContainerStore>,
        streaming: StreamingHandle,
    ) -> Self {
        Self {
            config,
            manager,
            images,
            network,
            sandboxes,
            containers,
            pod_locks: KeyedLocks::new(),
            streaming,
        }
    }

    fn now_ns() -> i64 {
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
    }

    /// Write a record's metadata through to the manager, logging instead
    /// of failing: the in-memory state is already correct and the next
    /// mutation writes the full record again.
    async fn persist_best_effort(&self, name: &str, user_config: &HashMap<String, String>) {
        if let Err(e) = persist_user_config(&self.manager, name, user_config).await {
            tracing::warn!(container = %name, error = %e, "Metadata write-through failed");
        }
    }

    /// Roll back a partially created sandbox: stop and delete the infra
    /// container so nothing is left behind.
    async fn rollback_sandbox(&self, sandbox: &PodSandbox) {
        if let Err(e) = self.manager.stop_container(&sandbox.id, 0, 1).await {
            tracing::warn!(sandbox = %sandbox.id, error = %e, "Rollback stop failed");
        }
        if let Err(e) = self.manager.delete_container(&sandbox.id).await {
            tracing::warn!(sandbox = %sandbox.id, error = %e, "Rollback delete failed");
        }
    }

    /// Stop, delete, and forget every container owned by a sandbox.
    async fn remove_sandbox_containers(&self, sandbox_id: &str) {
        for container in self.containers.list(Some(sandbox_id), None).await {
            if let Err(e) = self.manager.stop_container(&container.id, 0, 1).await {
                tracing::warn!(container = %container.id, error = %e, "Teardown stop failed");
            }
            if let Err(e) = self.manager.delete_container(&container.id).await {
                tracing::warn!(container = %container.id, error = %e, "Teardown delete failed");
            }
            self.containers.remove(&container.id).await;
        }
    }

    /// Refresh a container's cached state from the manager. The manager is
    /// authoritative: a container it reports stopped has exited even if
    /// the shim never saw the transition.
    async fn refresh_container(&self, container: &Container) -> Container {
        if container.state != ContainerState::Running {
            return container.clone();
        }
        match self.manager.container_state(&container.id).await {
            Ok(state) => {
                if mapper::state_from_manager(&state.status) == ContainerState::Exited {
                    self.containers
                        .mark_exited(&container.id, Self::now_ns(), container.exit_code)
                        .await;
                    if let Some(updated) = self.containers.get(&container.id).await {
                        self.persist_best_effort(&updated.id, &updated.to_user_config())
                            .await;
                        return updated;
                    }
                }
                container.clone()
            }
            Err(e) => {
                tracing::debug!(container = %container.id, error = %e, "State refresh failed");
                container.clone()
            }
        }
    }

    fn cri_container_state(state: ContainerState) -> crate::cri_api::ContainerState {
        match state {
            ContainerState::Created => crate::cri_api::ContainerState::ContainerCreated,
            ContainerState::Running => crate::cri_api::ContainerState::ContainerRunning,
            ContainerState::Exited => crate::cri_api::ContainerState::ContainerExited,
            ContainerState::Unknown => crate::cri_api::ContainerState::ContainerUnknown,
        }
    }
}

#[tonic::async_trait]
impl RuntimeService for PodlxRuntimeService {
    // ── Version ──────────────────────────────────────────────────────

    async fn version(
        &self,
        _request: Request<VersionRequest>,
    ) -> Result<Response<VersionResponse>, Status> {
        Ok(Response::new(VersionResponse {
            version: "0.1.0".to_string(),
            runtime_name: "podlx".to_string(),
            runtime_version: podlx_core::VERSION.to_string(),
            runtime_api_version: "v1alpha2".to_string(),
        }))
    }

    // ── Pod Sandbox ──────────────────────────────────────────────────

    async fn run_pod_sandbox(
        &self,
        request: Request<RunPodSandboxRequest>,
    ) -> Result<Response<RunPodSandboxResponse>, Status> {
        let req = request.into_inner();
        let config = req
            .config
            .ok_or_else(|| Status::invalid_argument("sandbox config required"))?;
        let metadata = config
            .metadata
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("sandbox metadata required"))?;

        tracing::info!(
            name = %metadata.name,
            namespace = %metadata.namespace,
            "CRI RunPodSandbox"
        );

        let sandbox_id = format!("sb{}", uuid::Uuid::new_v4().simple());
        let _guard = self.pod_locks.lock(&sandbox_id).await;

        let mut sandbox = PodSandbox {
            id: sandbox_id.clone(),
            name: metadata.name.clone(),
            namespace: metadata.namespace.clone(),
            uid: metadata.uid.clone(),
            attempt: metadata.attempt,
            phase: SandboxPhase::Ready,
            created_at: Self::now_ns(),
            labels: config.labels.clone(),
            annotations: config.annotations.clone(),
            log_directory: config.log_directory.clone(),
            runtime_handler: req.runtime_handler,
            network_namespace: String::new(),
            ips: Vec::new(),
            network_properties: HashMap::new(),
        };

        // 1. Create the infra container.
        let post = mapper::sandbox_to_manager(&sandbox, &config, &self.config.infra_image);
        self.manager
            .create_container(&post)
            .await
            .map_err(shim_error_to_status)?;

        // 2. Start it; a failed start leaves nothing behind.
        if let Err(e) = self.manager.start_container(&sandbox_id).await {
            self.rollback_sandbox(&sandbox).await;
            return Err(shim_error_to_status(e));
        }

        // 3. Resolve the root process and its network namespace.
        let pid = match self.manager.container_state(&sandbox_id).await {
            Ok(state) if state.pid > 0 => state.pid,
            Ok(_) => {
                self.rollback_sandbox(&sandbox).await;
                return Err(Status::internal("infra container has no root process"));
            }
            Err(e) => {
                self.rollback_sandbox(&sandbox).await;
                return Err(shim_error_to_status(e));
            }
        };
        sandbox.network_namespace = netns_path(pid);

        // 4. Attach the pod network inside that namespace.
        let container_network = self
            .network
            .pod_network(&sandbox_id, Vec::new())
            .container_network(&sandbox_id);
        let mut properties = HashMap::new();
        let status = match container_network.when_started(pid, &mut properties).await {
            Ok(status) => status,
            Err(e) => {
                self.rollback_sandbox(&sandbox).await;
                return Err(shim_error_to_status(e));
            }
        };
        sandbox.ips = status.ips.iter().map(|ip| ip.to_string()).collect();
        sandbox.network_properties = properties;

        // 5. Persist network status and addresses on the infra container.
        self.persist_best_effort(&sandbox_id, &sandbox.to_user_config())
            .await;

        // DNS configuration lands in the pod's /etc overlay.
        if let Some(dns) = &config.dns_config {
            let rendered = mapper::resolv_conf(dns);
            if !rendered.is_empty() {
                if let Err(e) = self
                    .manager
                    .push_file(&sandbox_id, "/etc/resolv.conf", rendered.as_bytes())
                    .await
                {
                    tracing::warn!(sandbox = %sandbox_id, error = %e, "DNS push failed");
                }
            }
        }

        self.sandboxes.add(sandbox).await;

        Ok(Response::new(RunPodSandboxResponse {
            pod_sandbox_id: sandbox_id,
        }))
    }

    async fn stop_pod_sandbox(
        &self,
        request: Request<StopPodSandboxRequest>,
    ) -> Result<Response<StopPodSandboxResponse>, Status> {
        let req = request.into_inner();
        let sandbox_id = &req.pod_sandbox_id;

        tracing::info!(sandbox = %sandbox_id, "CRI StopPodSandbox");
        let _guard = self.pod_locks.lock(sandbox_id).await;

        let sandbox = match self.sandboxes.get(sandbox_id).await {
            Some(sandbox) => sandbox,
            // Stopping what does not exist is success.
            None => return Ok(Response::new(StopPodSandboxResponse {})),
        };

        // Stop owned containers before the namespace goes away.
        let now = Self::now_ns();
        for container in self.containers.list(Some(sandbox_id), None).await {
            if container.state == ContainerState::Running {
                if let Err(e) = self
                    .manager
                    .stop_container(&container.id, TEARDOWN_STOP_TIMEOUT, self.config.stop_retries)
                    .await
                {
                    tracing::warn!(container = %container.id, error = %e, "Stop before sandbox teardown failed");
                }
                self.containers.mark_exited(&container.id, now, 137).await;
                if let Some(updated) = self.containers.get(&container.id).await {
                    self.persist_best_effort(&updated.id, &updated.to_user_config())
                        .await;
                }
            }
        }

        // Network teardown is best effort; NOT_READY is reached either way.
        if sandbox.phase == SandboxPhase::Ready {
            let container_network = self
                .network
                .pod_network(sandbox_id, Vec::new())
                .container_network(sandbox_id);
            if let Err(e) = container_network
                .when_deleted(&sandbox.network_properties)
                .await
            {
                tracing::warn!(sandbox = %sandbox_id, error = %e, "CNI detach failed");
            }
        }

        self.manager
            .stop_container(sandbox_id, TEARDOWN_STOP_TIMEOUT, self.config.stop_retries)
            .await
            .map_err(shim_error_to_status)?;

        self.sandboxes
            .update_phase(sandbox_id, SandboxPhase::NotReady)
            .await;
        if let Some(updated) = self.sandboxes.get(sandbox_id).await {
            self.persist_best_effort(sandbox_id, &updated.to_user_config())
                .await;
        }

        Ok(Response::new(StopPodSandboxResponse {}))
    }

    async fn remove_pod_sandbox(
        &self,
        request: Request<RemovePodSandboxRequest>,
    ) -> Result<Response<RemovePodSandboxResponse>, Status> {
        let req = request.into_inner();
        let sandbox_id = &req.pod_sandbox_id;

        tracing::info!(sandbox = %sandbox_id, "CRI RemovePodSandbox");
        let _guard = self.pod_locks.lock(sandbox_id).await;

        let sandbox = match self.sandboxes.get(sandbox_id).await {
            Some(sandbox) => sandbox,
            None => return Ok(Response::new(RemovePodSandboxResponse {})),
        };

        // Owned containers go first; kubelet removal is always forced.
        self.remove_sandbox_containers(sandbox_id).await;

        if sandbox.phase == SandboxPhase::Ready {
            let container_network = self
                .network
                .pod_network(sandbox_id, Vec::new())
                .container_network(sandbox_id);
            if let Err(e) = container_network
                .when_deleted(&sandbox.network_properties)
                .await
            {
                tracing::warn!(sandbox = %sandbox_id, error = %e, "CNI detach failed");
            }
            if let Err(e) = self.manager.stop_container(sandbox_id, 0, 1).await {
                tracing::warn!(sandbox = %sandbox_id, error = %e, "Infra stop failed");
            }
        }

        self.manager
            .delete_container(sandbox_id)
            .await
            .map_err(shim_error_to_status)?;
        self.sandboxes.remove(sandbox_id).await;

        Ok(Response::new(RemovePodSandboxResponse {}))
    }

    async fn pod_sandbox_status(
        &self,
        request: Request<PodSandboxStatusRequest>,
    ) -> Result<Response<PodSandboxStatusResponse>, Status> {
        let req = request.into_inner();
        let sandbox = self
            .sandboxes
            .get(&req.pod_sandbox_id)
            .await
            .ok_or_else(|| {
                Status::not_found(format!("sandbox not found: {}", req.pod_sandbox_id))
            })?;

        let state = match sandbox.phase {
            SandboxPhase::Ready => PodSandboxState::SandboxReady,
            SandboxPhase::NotReady => PodSandboxState::SandboxNotready,
        };

        let (primary_ip, additional) = match sandbox.phase {
            SandboxPhase::Ready => {
                let mut ips = sandbox.ips.iter();
                let primary = ips.next().cloned().unwrap_or_default();
                let rest = ips.map(|ip| PodIp { ip: ip.clone() }).collect();
                (primary, rest)
            }
            // A stopped sandbox has no network.
            SandboxPhase::NotReady => (String::new(), Vec::new()),
        };

        let status = crate::cri_api::PodSandboxStatus {
            id: sandbox.id.clone(),
            metadata: Some(PodSandboxMetadata {
                name: sandbox.name.clone(),
                uid: sandbox.uid.clone(),
                namespace: sandbox.namespace.clone(),
                attempt: sandbox.attempt,
            }),
            state: state.into(),
            created_at: sandbox.created_at,
            network: Some(PodSandboxNetworkStatus {
                ip: primary_ip,
                additional_ips: additional,
            }),
            linux: None,
            labels: sandbox.labels.clone(),
            annotations: sandbox.annotations.clone(),
            runtime_handler: sandbox.runtime_handler.clone(),
        };

        Ok(Response::new(PodSandboxStatusResponse {
            status: Some(status),
            info: Default::default(),
        }))
    }

    async fn list_pod_sandbox(
        &self,
        request: Request<ListPodSandboxRequest>,
    ) -> Result<Response<ListPodSandboxResponse>, Status> {
        let req = request.into_inner();

        let label_filter = req
            .filter
            .as_ref()
            .map(|f| &f.label_selector)
            .filter(|m| !m.is_empty());

        let sandboxes = self.sandboxes.list(label_filter).await;

        let items: Vec<crate::cri_api::PodSandbox> = sandboxes
            .into_iter()
            .filter(|sb| {
                if let Some(ref filter) = req.filter {
                    if !filter.id.is_empty() && sb.id != filter.id {
                        return false;
                    }
                    if let Some(ref state) = filter.state {
                        let sb_state = match sb.phase {
                            SandboxPhase::Ready => PodSandboxState::SandboxReady as i32,
                            SandboxPhase::NotReady => PodSandboxState::SandboxNotready as i32,
                        };
                        if state.state != sb_state {
                            return false;
                        }
                    }
                }
                true
            })
            .map(|sb| {
                let state = match sb.phase {
                    SandboxPhase::Ready => PodSandboxState::SandboxReady,
                    SandboxPhase::NotReady => PodSandboxState::SandboxNotready,
                };
                crate::cri_api::PodSandbox {
                    id: sb.id,
                    metadata: Some(PodSandboxMetadata {
                        name: sb.name,
                        uid: sb.uid,
                        namespace: sb.namespace,
                        attempt: sb.attempt,
                    }),
                    state: state.into(),
                    created_at: sb.created_at,
                    labels: sb.labels,
                    annotations: sb.annotations,
                    runtime_handler: sb.runtime_handler,
                }
            })
            .collect();

        Ok(Response::new(ListPodSandboxResponse { items }))
    }

    // ── Container ────────────────────────────────────────────────────

    async fn create_container(
        &self,
        request: Request<CreateContainerRequest>,
    ) -> Result<Response<CreateContainerResponse>, Status> {
        let req = request.into_inner();
        let sandbox_id = &req.pod_sandbox_id;

        let config = req
            .config
            .ok_or_else(|| Status::invalid_argument("container config required"))?;
        let metadata = config
            .metadata
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("container metadata required"))?;

        mapper::validate_container_config(&config).map_err(shim_error_to_status)?;

        // CreateContainer serializes against sandbox transitions and
        // other creates on the same pod.
        let _guard = self.pod_locks.lock(sandbox_id).await;

        let sandbox = self
            .sandboxes
            .get(sandbox_id)
            .await
            .ok_or_else(|| Status::not_found(format!("sandbox not found: {}", sandbox_id)))?;

        let image_ref = config
            .image
            .as_ref()
            .map(|i| i.image.clone())
            .unwrap_or_default();

        tracing::info!(
            sandbox = %sandbox_id,
            name = %metadata.name,
            image = %image_ref,
            "CRI CreateContainer"
        );

        // The reference must resolve now; image removal later does not
        // affect this container.
        let image = self
            .images
            .resolve(&image_ref)
            .await
            .map_err(shim_error_to_status)?;

        let container = Container {
            id: format!("c{}", uuid::Uuid::new_v4().simple()),
            sandbox_id: sandbox_id.to_string(),
            name: metadata.name.clone(),
            attempt: metadata.attempt,
            image_ref,
            image_digest: image.digest(),
            state: ContainerState::Created,
            created_at: Self::now_ns(),
            started_at: 0,
            finished_at: 0,
            exit_code: 0,
            labels: config.labels.clone(),
            annotations: config.annotations.clone(),
            log_path: config.log_path.clone(),
        };

        let post = mapper::container_to_manager(&container, &config, &sandbox, &image.fingerprint)
            .map_err(shim_error_to_status)?;
        self.manager
            .create_container(&post)
            .await
            .map_err(shim_error_to_status)?;

        let container_id = container.id.clone();
        self.containers.add(container).await;

        Ok(Response::new(CreateContainerResponse { container_id }))
    }

    async fn start_container(
        &self,
        request: Request<StartContainerRequest>,
    ) -> Result<Response<StartContainerResponse>, Status> {
        let req = request.into_inner();
        let container_id = &req.container_id;

        let container = self.containers.get(container_id).await.ok_or_else(|| {
            Status::not_found(format!("container not found: {}", container_id))
        })?;

        // Container operations serialize against sandbox transitions and
        // creates/removals on the same pod. Re-read after acquiring: the
        // container may have been removed while we waited.
        let _guard = self.pod_locks.lock(&container.sandbox_id).await;
        let container = self.containers.get(container_id).await.ok_or_else(|| {
            Status::not_found(format!("container not found: {}", container_id))
        })?;

        // A container only starts into a READY sandbox.
        let sandbox = self
            .sandboxes
            .get(&container.sandbox_id)
            .await
            .ok_or_else(|| {
                Status::not_found(format!("sandbox not found: {}", container.sandbox_id))
            })?;
        if sandbox.phase != SandboxPhase::Ready {
            return Err(Status::failed_precondition(format!(
                "sandbox {} is not ready",
                sandbox.id
            )));
        }

        tracing::info!(container = %container_id, sandbox = %sandbox.id, "CRI StartContainer");

        self.manager
            .start_container(container_id)
            .await
            .map_err(shim_error_to_status)?;

        self.containers
            .mark_started(container_id, Self::now_ns())
            .await;
        if let Some(updated) = self.containers.get(container_id).await {
            self.persist_best_effort(container_id, &updated.to_user_config())
                .await;
        }

        Ok(Response::new(StartContainerResponse {}))
    }

    async fn stop_container(
        &self,
        request: Request<StopContainerRequest>,
    ) -> Result<Response<StopContainerResponse>, Status> {
        let req = request.into_inner();
        let container_id = &req.container_id;

        tracing::info!(container = %container_id, timeout = req.timeout, "CRI StopContainer");

        // Serialize with sandbox transitions and creates/removals on the
        // owning pod. An untracked container has no pod to contend with.
        let _guard = match self.containers.get(container_id).await {
            Some(container) => Some(self.pod_locks.lock(&container.sandbox_id).await),
            None => None,
        };

        // The stop protocol is idempotent across missing and
        // already-stopped containers; the store may lag the manager.
        self.manager
            .stop_container(container_id, req.timeout, self.config.stop_retries)
            .await
            .map_err(shim_error_to_status)?;

        if self
            .containers
            .mark_exited(container_id, Self::now_ns(), 0)
            .await
        {
            if let Some(updated) = self.containers.get(container_id).await {
                self.persist_best_effort(container_id, &updated.to_user_config())
                    .await;
            }
        }

        Ok(Response::new(StopContainerResponse {}))
    }

    async fn remove_container(
        &self,
        request: Request<RemoveContainerRequest>,
    ) -> Result<Response<RemoveContainerResponse>, Status> {
        let req = request.into_inner();
        let container_id = &req.container_id;

        tracing::info!(container = %container_id, "CRI RemoveContainer");

        // Serialize with sandbox transitions and creates/removals on the
        // owning pod. An untracked container has no pod to contend with.
        let _guard = match self.containers.get(container_id).await {
            Some(container) => Some(self.pod_locks.lock(&container.sandbox_id).await),
            None => None,
        };

        if let Err(e) = self.manager.stop_container(container_id, 0, 1).await {
            tracing::warn!(container = %container_id, error = %e, "Stop before remove failed");
        }
        self.manager
            .delete_container(container_id)
            .await
            .map_err(shim_error_to_status)?;
        self.containers.remove(container_id).await;

        Ok(Response::new(RemoveContainerResponse {}))
    }

    async fn container_status(
        &self,
        request: Request<ContainerStatusRequest>,
    ) -> Result<Response<ContainerStatusResponse>, Status> {
        let req = request.into_inner();
        let container = self.containers.get(&req.container_id).await.ok_or_else(|| {
            Status::not_found(format!("container not found: {}", req.container_id))
        })?;

        let container = self.refresh_container(&container).await;

        // Mounts are reconstructed from the manager record.
        let mounts = match self.manager.get_container(&container.id).await {
            Ok((record, _)) => mapper::mounts_from_devices(&record.devices),
            Err(_) => Vec::new(),
        };

        let status = crate::cri_api::ContainerStatus {
            id: container.id.clone(),
            metadata: Some(ContainerMetadata {
                name: container.name.clone(),
                attempt: container.attempt,
            }),
            state: Self::cri_container_state(container.state).into(),
            created_at: container.created_at,
            started_at: container.started_at,
            finished_at: container.finished_at,
            exit_code: container.exit_code,
            image: Some(ImageSpec {
                image: container.image_ref.clone(),
                annotations: Default::default(),
            }),
            image_ref: container.image_digest.clone(),
            reason: match container.state {
                ContainerState::Exited if container.exit_code == 0 => "Completed".to_string(),
                ContainerState::Exited => "Error".to_string(),
                _ => String::new(),
            },
            message: String::new(),
            labels: container.labels.clone(),
            annotations: container.annotations.clone(),
            mounts,
            log_path: container.log_path.clone(),
        };

        Ok(Response::new(ContainerStatusResponse {
            status: Some(status),
            info: Default::default(),
        }))
    }

    async fn list_containers(
        &self,
        request: Request<ListContainersRequest>,
    ) -> Result<Response<ListContainersResponse>, Status> {
        let req = request.into_inner();

        let sandbox_filter = req
            .filter
            .as_ref()
            .map(|f| f.pod_sandbox_id.as_str())
            .filter(|s| !s.is_empty());
        let label_filter = req
            .filter
            .as_ref()
            .map(|f| &f.label_selector)
            .filter(|m| !m.is_empty());

        let containers = self.containers.list(sandbox_filter, label_filter).await;

        let items: Vec<crate::cri_api::Container> = containers
            .into_iter()
            .filter(|c| {
                if let Some(ref filter) = req.filter {
                    if !filter.id.is_empty() && c.id != filter.id {
                        return false;
                    }
                    if let Some(ref state) = filter.state {
                        if state.state != Self::cri_container_state(c.state) as i32 {
                            return false;
                        }
                    }
                }
                true
            })
            .map(|c| crate::cri_api::Container {
                id: c.id.clone(),
                pod_sandbox_id: c.sandbox_id,
                metadata: Some(ContainerMetadata {
                    name: c.name,
                    attempt: c.attempt,
                }),
                image: Some(ImageSpec {
                    image: c.image_ref.clone(),
                    annotations: Default::default(),
                }),
                image_ref: c.image_digest,
                state: Self::cri_container_state(c.state).into(),
                created_at: c.created_at,
                labels: c.labels,
                annotations: c.annotations,
            })
            .collect();

        Ok(Response::new(ListContainersResponse { containers: items }))
    }

    async fn update_container_resources(
        &self,
        request: Request<UpdateContainerResourcesRequest>,
    ) -> Result<Response<UpdateContainerResourcesResponse>, Status> {
        let req = request.into_inner();
        let container_id = &req.container_id;
        let linux = req
            .linux
            .ok_or_else(|| Status::invalid_argument("resource spec required"))?;

        self.containers.get(container_id).await.ok_or_else(|| {
            Status::not_found(format!("container not found: {}", container_id))
        })?;

        let mut limits = HashMap::new();
        if linux.cpu_shares > 0 {
            limits.insert("limits.cpu".to_string(), linux.cpu_shares.to_string());
        }
        if linux.memory_limit_in_bytes > 0 {
            limits.insert(
                "limits.memory".to_string(),
                linux.memory_limit_in_bytes.to_string(),
            );
        }
        if limits.is_empty() {
            return Ok(Response::new(UpdateContainerResourcesResponse {}));
        }

        // Read-modify-write under the manager's ETag, bounded retry.
        let mut result = Err(ShimError::Conflict("resource update not attempted".into()));
        for _ in 0..3 {
            let (mut record, etag) = match self.manager.get_container(container_id).await {
                Ok(pair) => pair,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            };
            record
                .config
                .extend(limits.iter().map(|(k, v)| (k.clone(), v.clone())));
            let put = podlx_runtime::manager::types::ContainerPut {
                config: record.config,
                devices: record.devices,
                profiles: record.profiles,
            };
            let etag_ref = (!etag.is_empty()).then_some(etag.as_str());
            match self.manager.update_container(container_id, &put, etag_ref).await {
                Ok(()) => {
                    result = Ok(());
                    break;
                }
                Err(ShimError::Conflict(msg)) => {
                    result = Err(ShimError::Conflict(msg));
                    continue;
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        result.map_err(shim_error_to_status)?;

        Ok(Response::new(UpdateContainerResourcesResponse {}))
    }

    async fn reopen_container_log(
        &self,
        _request: Request<ReopenContainerLogRequest>,
    ) -> Result<Response<ReopenContainerLogResponse>, Status> {
        // Logs live manager-side; there is no file handle to rotate here.
        Ok(Response::new(ReopenContainerLogResponse {}))
    }

    // ── Exec / Attach / PortForward ─────────────────────────────────

    async fn exec_sync(
        &self,
        request: Request<ExecSyncRequest>,
    ) -> Result<Response<ExecSyncResponse>, Status> {
        let req = request.into_inner();
        let container_id = &req.container_id;

        tracing::info!(container = %container_id, "CRI ExecSync");

        self.containers.get(container_id).await.ok_or_else(|| {
            Status::not_found(format!("container not found: {}", container_id))
        })?;

        let exec_req = ContainerExecPost {
            command: req.cmd,
            environment: HashMap::new(),
            interactive: false,
            wait_for_websocket: true,
            width: None,
            height: None,
        };
        let session = self
            .manager
            .exec(container_id, &exec_req)
            .await
            .map_err(shim_error_to_status)?;

        let timeout = if req.timeout > 0 {
            Duration::from_secs(req.timeout as u64)
        } else {
            self.config.operation_timeout
        };

        let (stdout, stderr) = match session.streams {
            ExecStreams::Pipes {
                stdin,
                mut stdout,
                mut stderr,
            } => {
                // Closing stdin gives the process EOF immediately.
                drop(stdin);
                let mut out = Vec::new();
                let mut err = Vec::new();
                let copy = async {
                    let _ = stdout.read_to_end(&mut out).await;
                    let _ = stderr.read_to_end(&mut err).await;
                };
                if tokio::time::timeout(timeout, copy).await.is_err() {
                    let _ = session.operation.cancel().await;
                    return Err(Status::deadline_exceeded("exec output collection timed out"));
                }
                (out, err)
            }
            ExecStreams::Interactive { .. } => {
                let _ = session.operation.cancel().await;
                return Err(Status::internal("unexpected interactive exec session"));
            }
        };

        let exit_code = match session.operation.wait(timeout).await {
            Ok(op) => exec_exit_code(&op.metadata).unwrap_or(-1),
            Err(e) => return Err(shim_error_to_status(e)),
        };

        Ok(Response::new(ExecSyncResponse {
            stdout,
            stderr,
            exit_code,
        }))
    }

    async fn exec(
        &self,
        request: Request<ExecRequest>,
    ) -> Result<Response<ExecResponse>, Status> {
        let req = request.into_inner();
        if req.cmd.is_empty() {
            return Err(Status::invalid_argument("exec command required"));
        }
        let container = self.containers.get(&req.container_id).await.ok_or_else(|| {
            Status::not_found(format!("container not found: {}", req.container_id))
        })?;

        let url = self
            .streaming
            .register(StreamingSession {
                kind: SessionKind::Exec,
                container_id: container.id,
                cmd: req.cmd,
                tty: req.tty,
                ports: vec![],
            })
            .await;

        Ok(Response::new(ExecResponse { url }))
    }

    async fn attach(
        &self,
        request: Request<AttachRequest>,
    ) -> Result<Response<AttachResponse>, Status> {
        let req = request.into_inner();
        let container = self.containers.get(&req.container_id).await.ok_or_else(|| {
            Status::not_found(format!("container not found: {}", req.container_id))
        })?;

        let url = self
            .streaming
            .register(StreamingSession {
                kind: SessionKind::Attach,
                container_id: container.id,
                cmd: vec![],
                tty: req.tty,
                ports: vec![],
            })
            .await;

        Ok(Response::new(AttachResponse { url }))
    }

    async fn port_forward(
        &self,
        request: Request<PortForwardRequest>,
    ) -> Result<Response<PortForwardResponse>, Status> {
        let req = request.into_inner();
        let sandbox = self.sandboxes.get(&req.pod_sandbox_id).await.ok_or_else(|| {
            Status::not_found(format!("sandbox not found: {}", req.pod_sandbox_id))
        })?;
        if sandbox.phase != SandboxPhase::Ready {
            return Err(Status::failed_precondition(format!(
                "sandbox {} is not ready",
                sandbox.id
            )));
        }
        if req.port.is_empty() {
            return Err(Status::invalid_argument("no ports to forward"));
        }

        let url = self
            .streaming
            .register(StreamingSession {
                kind: SessionKind::PortForward,
                container_id: sandbox.id,
                cmd: vec![],
                tty: false,
                ports: req.port,
            })
            .await;

        Ok(Response::new(PortForwardResponse { url }))
    }

    // ── Stats ────────────────────────────────────────────────────────

    async fn container_stats(
        &self,
        _request: Request<ContainerStatsRequest>,
    ) -> Result<Response<ContainerStatsResponse>, Status> {
        Err(Status::unimplemented("ContainerStats not yet implemented"))
    }

    async fn list_container_stats(
        &self,
        _request: Request<ListContainerStatsRequest>,
    ) -> Result<Response<ListContainerStatsResponse>, Status> {
        Err(Status::unimplemented(
            "ListContainerStats not yet implemented",
        ))
    }

    // ── Runtime ──────────────────────────────────────────────────────

    async fn update_runtime_config(
        &self,
        request: Request<UpdateRuntimeConfigRequest>,
    ) -> Result<Response<UpdateRuntimeConfigResponse>, Status> {
        let req = request.into_inner();
        let pod_cidr = req
            .runtime_config
            .and_then(|c| c.network_config)
            .map(|n| n.pod_cidr)
            .unwrap_or_default();

        if pod_cidr.is_empty() {
            return Ok(Response::new(UpdateRuntimeConfigResponse {}));
        }

        // The plugin cannot apply a dynamic CIDR; failing tells the caller
        // the change is not reflected.
        self.network
            .update_runtime_config(&pod_cidr)
            .map_err(shim_error_to_status)?;
        Ok(Response::new(UpdateRuntimeConfigResponse {}))
    }

    async fn status(
        &self,
        _request: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        let conditions = vec![
            RuntimeCondition {
                r#type: "RuntimeReady".to_string(),
                status: true,
                reason: String::new(),
                message: String::new(),
            },
            RuntimeCondition {
                // The CNI plugin resolved a network at startup.
                r#type: "NetworkReady".to_string(),
                status: true,
                reason: String::new(),
                message: String::new(),
            },
        ];

        Ok(Response::new(StatusResponse {
            status: Some(RuntimeStatus { conditions }),
            info: Default::default(),
        }))
    }
}
