//! Pod sandbox state management and manager-side persistence.
//!
//! A sandbox is an infra container in the manager that owns the pod's
//! network namespace and carries all pod metadata as `user.*` config keys.
//! The shim keeps no durable state of its own: on startup the store is
//! rebuilt by scanning the manager, and containers whose sandbox is gone
//! are flagged for removal.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;

use podlx_core::config::USER_KEY_PREFIX;
use podlx_core::error::{Result, ShimError};
use podlx_runtime::manager::types::ContainerPut;
use podlx_runtime::manager::ManagerClient;

use crate::container::Container;

/// Config keys the shim persists under its reserved prefix.
pub mod keys {
    pub const SCHEMA_VERSION: &str = "1";

    pub const SCHEMA: &str = "user.podlx.schema";
    pub const ROLE: &str = "user.podlx.role";
    pub const ROLE_SANDBOX: &str = "sandbox";
    pub const ROLE_CONTAINER: &str = "container";

    pub const NAME: &str = "user.podlx.name";
    pub const NAMESPACE: &str = "user.podlx.namespace";
    pub const UID: &str = "user.podlx.uid";
    pub const ATTEMPT: &str = "user.podlx.attempt";
    pub const SANDBOX: &str = "user.podlx.sandbox";
    pub const PHASE: &str = "user.podlx.phase";
    pub const STATE: &str = "user.podlx.state";
    pub const CREATED_AT: &str = "user.podlx.created-at";
    pub const STARTED_AT: &str = "user.podlx.started-at";
    pub const FINISHED_AT: &str = "user.podlx.finished-at";
    pub const EXIT_CODE: &str = "user.podlx.exit-code";
    pub const LABELS: &str = "user.podlx.labels";
    pub const ANNOTATIONS: &str = "user.podlx.annotations";
    pub const LOG_PATH: &str = "user.podlx.log-path";
    pub const LOG_DIRECTORY: &str = "user.podlx.log-directory";
    pub const RUNTIME_HANDLER: &str = "user.podlx.runtime-handler";
    pub const IMAGE_REF: &str = "user.podlx.image-ref";
    pub const IMAGE_DIGEST: &str = "user.podlx.image-digest";
    pub const NETNS: &str = "user.podlx.netns";
    pub const IPS: &str = "user.podlx.ips";
    pub const NETWORK_RESULT: &str = "user.podlx.network-result";
}

/// Sandbox lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxPhase {
    /// Infra container running, network attached.
    Ready,
    /// Stopped; containers can no longer start in it.
    NotReady,
}

impl SandboxPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxPhase::Ready => "ready",
            SandboxPhase::NotReady => "notready",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "ready" => SandboxPhase::Ready,
            _ => SandboxPhase::NotReady,
        }
    }
}

/// A pod sandbox backed by an infra container.
#[derive(Debug, Clone)]
pub struct PodSandbox {
    /// Unique sandbox identifier; also the infra container name.
    pub id: String,
    /// Pod name.
    pub name: String,
    /// Kubernetes namespace.
    pub namespace: String,
    /// Pod UID.
    pub uid: String,
    /// Sandbox attempt counter.
    pub attempt: u32,
    /// Current phase.
    pub phase: SandboxPhase,
    /// Creation timestamp in nanoseconds.
    pub created_at: i64,
    /// Pod labels.
    pub labels: HashMap<String, String>,
    /// Pod annotations.
    pub annotations: HashMap<String, String>,
    /// Log directory path.
    pub log_directory: String,
    /// Runtime handler name.
    pub runtime_handler: String,
    /// Network namespace path of the infra container process.
    pub network_namespace: String,
    /// Cached pod addresses, primary first.
    pub ips: Vec<String>,
    /// Network properties, including the raw CNI result.
    pub network_properties: HashMap<String, String>,
}

impl PodSandbox {
    /// Encode the record into the shim's reserved `user.*` keys.
    pub fn to_user_config(&self) -> HashMap<String, String> {
        let mut config = HashMap::new();
        config.insert(keys::SCHEMA.to_string(), keys::SCHEMA_VERSION.to_string());
        config.insert(keys::ROLE.to_string(), keys::ROLE_SANDBOX.to_string());
        config.insert(keys::NAME.to_string(), self.name.clone());
        config.insert(keys::NAMESPACE.to_string(), self.namespace.clone());
        config.insert(keys::UID.to_string(), self.uid.clone());
        config.insert(keys::ATTEMPT.to_string(), self.attempt.to_string());
        config.insert(keys::PHASE.to_string(), self.phase.as_str().to_string());
        config.insert(keys::CREATED_AT.to_string(), self.created_at.to_string());
        config.insert(
            keys::LABELS.to_string(),
            serde_json::to_string(&self.labels).unwrap_or_default(),
        );
        config.insert(
            keys::ANNOTATIONS.to_string(),
            serde_json::to_string(&self.annotations).unwrap_or_default(),
        );
        config.insert(keys::LOG_DIRECTORY.to_string(), self.log_directory.clone());
        config.insert(
            keys::RUNTIME_HANDLER.to_string(),
            self.runtime_handler.clone(),
        );
        config.insert(keys::NETNS.to_string(), self.network_namespace.clone());
        config.insert(
            keys::IPS.to_string(),
            serde_json::to_string(&self.ips).unwrap_or_default(),
        );
        if let Some(result) = self
            .network_properties
            .get(podlx_runtime::network::RESULT_PROPERTY)
        {
            config.insert(keys::NETWORK_RESULT.to_string(), result.clone());
        }
        config
    }

    /// Rebuild a record from persisted `user.*` keys. Returns `None` when
    /// the keys do not describe a shim sandbox of a known schema.
    pub fn from_user_config(id: &str, config: &HashMap<String, String>) -> Option<Self> {
        if config.get(keys::SCHEMA).map(String::as_str) != Some(keys::SCHEMA_VERSION) {
            return None;
        }
        if config.get(keys::ROLE).map(String::as_str) != Some(keys::ROLE_SANDBOX) {
            return None;
        }

        let mut network_properties = HashMap::new();
        if let Some(result) = config.get(keys::NETWORK_RESULT) {
            network_properties.insert(
                podlx_runtime::network::RESULT_PROPERTY.to_string(),
                result.clone(),
            );
        }

        Some(PodSandbox {
            id: id.to_string(),
            name: config.get(keys::NAME).cloned().unwrap_or_default(),
            namespace: config.get(keys::NAMESPACE).cloned().unwrap_or_default(),
            uid: config.get(keys::UID).cloned().unwrap_or_default(),
            attempt: config
                .get(keys::ATTEMPT)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            phase: config
                .get(keys::PHASE)
                .map(|s| SandboxPhase::parse(s))
                .unwrap_or(SandboxPhase::NotReady),
            created_at: config
                .get(keys::CREATED_AT)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            labels: config
                .get(keys::LABELS)
                .and_then(|v| serde_json::from_str(v).ok())
                .unwrap_or_default(),
            annotations: config
                .get(keys::ANNOTATIONS)
                .and_then(|v| serde_json::from_str(v).ok())
                .unwrap_or_default(),
            log_directory: config.get(keys::LOG_DIRECTORY).cloned().unwrap_or_default(),
            runtime_handler: config
                .get(keys::RUNTIME_HANDLER)
                .cloned()
                .unwrap_or_default(),
            network_namespace: config.get(keys::NETNS).cloned().unwrap_or_default(),
            ips: config
                .get(keys::IPS)
                .and_then(|v| serde_json::from_str(v).ok())
                .unwrap_or_default(),
            network_properties,
        })
    }
}

/// In-memory index of pod sandboxes.
pub struct SandboxStore {
    sandboxes: Arc<RwLock<HashMap<String, PodSandbox>>>,
}

impl SandboxStore {
    pub fn new() -> Self {
        Self {
            sandboxes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn add(&self, sandbox: PodSandbox) {
        let mut store = self.sandboxes.write().await;
        store.insert(sandbox.id.clone(), sandbox);
    }

    pub async fn get(&self, id: &str) -> Option<PodSandbox> {
        let store = self.sandboxes.read().await;
        store.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) -> Option<PodSandbox> {
        let mut store = self.sandboxes.write().await;
        store.remove(id)
    }

    /// List sandboxes, optionally filtered by labels.
    pub async fn list(&self, label_filter: Option<&HashMap<String, String>>) -> Vec<PodSandbox> {
        let store = self.sandboxes.read().await;
        store
            .values()
            .filter(|sb| {
                label_filter
                    .map(|filter| {
                        filter
                            .iter()
                            .all(|(k, v)| sb.labels.get(k).map_or(false, |sv| sv == v))
                    })
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    /// Update the phase of a sandbox.
    pub async fn update_phase(&self, id: &str, phase: SandboxPhase) -> bool {
        let mut store = self.sandboxes.write().await;
        if let Some(sb) = store.get_mut(id) {
            sb.phase = phase;
            true
        } else {
            false
        }
    }
}

impl Default for SandboxStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded retries for ETag-conflicted metadata writes.
const PERSIST_RETRIES: u32 = 3;

/// Write a record's `user.*` keys through to its manager container.
///
/// Reads the container to obtain the current ETag, replaces the shim's
/// keys, and retries after a re-read when a concurrent writer won.
pub async fn persist_user_config(
    client: &ManagerClient,
    container_name: &str,
    user_config: &HashMap<String, String>,
) -> Result<()> {
    let mut last_err = None;

    for _ in 0..PERSIST_RETRIES {
        let (mut container, etag) = client.get_container(container_name).await?;

        container
            .config
            .retain(|key, _| !key.starts_with(USER_KEY_PREFIX));
        container
            .config
            .extend(user_config.iter().map(|(k, v)| (k.clone(), v.clone())));

        let put = ContainerPut {
            config: container.config,
            devices: container.devices,
            profiles: container.profiles,
        };
        let etag_ref = (!etag.is_empty()).then_some(etag.as_str());

        match client.update_container(container_name, &put, etag_ref).await {
            Ok(()) => return Ok(()),
            Err(ShimError::Conflict(msg)) => {
                tracing::debug!(
                    container = %container_name,
                    "Metadata write conflicted, re-reading"
                );
                last_err = Some(ShimError::Conflict(msg));
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_err.unwrap_or_else(|| {
        ShimError::Conflict(format!(
            "metadata write to {} kept conflicting",
            container_name
        ))
    }))
}

/// State reconstituted from the manager at startup.
pub struct RecoveredState {
    pub sandboxes: Vec<PodSandbox>,
    pub containers: Vec<Container>,
    /// Containers whose owning sandbox no longer exists; the caller
    /// removes them to restore the ownership invariant.
    pub orphans: Vec<Container>,
}

/// Scan the manager and rebuild the pod index from persisted metadata.
pub async fn recover(client: &ManagerClient) -> Result<RecoveredState> {
    let manager_containers = client.list_containers().await?;

    let mut sandboxes = Vec::new();
    let mut containers = Vec::new();

    for record in &manager_containers {
        match record.config.get(keys::ROLE).map(String::as_str) {
            Some(keys::ROLE_SANDBOX) => {
                match PodSandbox::from_user_config(&record.name, &record.config) {
                    Some(sandbox) => sandboxes.push(sandbox),
                    None => tracing::warn!(
                        container = %record.name,
                        "Skipping sandbox with unknown metadata schema"
                    ),
                }
            }
            Some(keys::ROLE_CONTAINER) => {
                match Container::from_user_config(&record.name, &record.config) {
                    Some(container) => containers.push(container),
                    None => tracing::warn!(
                        container = %record.name,
                        "Skipping container with unknown metadata schema"
                    ),
                }
            }
            _ => {}
        }
    }

    let sandbox_ids: HashSet<&str> = sandboxes.iter().map(|s| s.id.as_str()).collect();
    let (owned, orphans): (Vec<_>, Vec<_>) = containers
        .into_iter()
        .partition(|c| sandbox_ids.contains(c.sandbox_id.as_str()));

    tracing::info!(
        sandboxes = sandboxes.len(),
        containers = owned.len(),
        orphans = orphans.len(),
        "Recovered pod index from manager"
    );

    Ok(RecoveredState {
        sandboxes,
        containers: owned,
        orphans,
    })
}
