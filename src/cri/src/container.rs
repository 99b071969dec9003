//! Container state management.
//!
//! Maps CRI containers onto manager containers joined to their sandbox's
//! network namespace. The in-memory store is the fast path; every record
//! also round-trips through `user.*` config keys on its manager container
//! so a restarted shim can rebuild the index.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::sandbox::keys;

/// Container lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// Container has been created but not started.
    Created,
    /// Container is running.
    Running,
    /// Container has exited.
    Exited,
    /// State could not be determined from the manager.
    Unknown,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Exited => "exited",
            ContainerState::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "created" => ContainerState::Created,
            "running" => ContainerState::Running,
            "exited" => ContainerState::Exited,
            _ => ContainerState::Unknown,
        }
    }
}

/// A CRI container backed by a manager container.
#[derive(Debug, Clone)]
pub struct Container {
    /// Unique container identifier; also the manager container name.
    pub id: String,
    /// Parent sandbox identifier.
    pub sandbox_id: String,
    /// Container name from CRI metadata.
    pub name: String,
    /// Restart attempt counter from CRI metadata.
    pub attempt: u32,
    /// Image reference as the kubelet supplied it.
    pub image_ref: String,
    /// Resolved content digest of the image at creation time.
    pub image_digest: String,
    /// Current state.
    pub state: ContainerState,
    /// Creation timestamp in nanoseconds.
    pub created_at: i64,
    /// Start timestamp in nanoseconds (0 if not started).
    pub started_at: i64,
    /// Finish timestamp in nanoseconds (0 if not finished).
    pub finished_at: i64,
    /// Exit code (0 if not exited).
    pub exit_code: i32,
    /// Container labels.
    pub labels: HashMap<String, String>,
    /// Container annotations.
    pub annotations: HashMap<String, String>,
    /// Log file path.
    pub log_path: String,
}

impl Container {
    /// Encode the record into the shim's reserved `user.*` keys.
    pub fn to_user_config(&self) -> HashMap<String, String> {
        let mut config = HashMap::new();
        config.insert(keys::SCHEMA.to_string(), keys::SCHEMA_VERSION.to_string());
        config.insert(keys::ROLE.to_string(), keys::ROLE_CONTAINER.to_string());
        config.insert(keys::NAME.to_string(), self.name.clone());
        config.insert(keys::ATTEMPT.to_string(), self.attempt.to_string());
        config.insert(keys::SANDBOX.to_string(), self.sandbox_id.clone());
        config.insert(keys::IMAGE_REF.to_string(), self.image_ref.clone());
        config.insert(keys::IMAGE_DIGEST.to_string(), self.image_digest.clone());
        config.insert(keys::STATE.to_string(), self.state.as_str().to_string());
        config.insert(keys::CREATED_AT.to_string(), self.created_at.to_string());
        config.insert(keys::STARTED_AT.to_string(), self.started_at.to_string());
        config.insert(keys::FINISHED_AT.to_string(), self.finished_at.to_string());
        config.insert(keys::EXIT_CODE.to_string(), self.exit_code.to_string());
        config.insert(
            keys::LABELS.to_string(),
            serde_json::to_string(&self.labels).unwrap_or_default(),
        );
        config.insert(
            keys::ANNOTATIONS.to_string(),
            serde_json::to_string(&self.annotations).unwrap_or_default(),
        );
        config.insert(keys::LOG_PATH.to_string(), self.log_path.clone());
        config
    }

    /// Rebuild a record from persisted `user.*` keys. Returns `None` when
    /// the keys do not describe a shim container of a known schema.
    pub fn from_user_config(id: &str, config: &HashMap<String, String>) -> Option<Self> {
        if config.get(keys::SCHEMA).map(String::as_str) != Some(keys::SCHEMA_VERSION) {
            return None;
        }
        if config.get(keys::ROLE).map(String::as_str) != Some(keys::ROLE_CONTAINER) {
            return None;
        }

        let parse_i64 = |key: &str| {
            config
                .get(key)
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0)
        };
        let parse_map = |key: &str| {
            config
                .get(key)
                .and_then(|v| serde_json::from_str(v).ok())
                .unwrap_or_default()
        };

        Some(Container {
            id: id.to_string(),
            sandbox_id: config.get(keys::SANDBOX)?.clone(),
            name: config.get(keys::NAME).cloned().unwrap_or_default(),
            attempt: config
                .get(keys::ATTEMPT)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            image_ref: config.get(keys::IMAGE_REF).cloned().unwrap_or_default(),
            image_digest: config.get(keys::IMAGE_DIGEST).cloned().unwrap_or_default(),
            state: config
                .get(keys::STATE)
                .map(|s| ContainerState::parse(s))
                .unwrap_or(ContainerState::Unknown),
            created_at: parse_i64(keys::CREATED_AT),
            started_at: parse_i64(keys::STARTED_AT),
            finished_at: parse_i64(keys::FINISHED_AT),
            exit_code: parse_i64(keys::EXIT_CODE) as i32,
            labels: parse_map(keys::LABELS),
            annotations: parse_map(keys::ANNOTATIONS),
            log_path: config.get(keys::LOG_PATH).cloned().unwrap_or_default(),
        })
    }
}

/// In-memory index of containers.
pub struct ContainerStore {
    containers: Arc<RwLock<HashMap<String, Container>>>,
}

impl ContainerStore {
    pub fn new() -> Self {
        Self {
            containers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn add(&self, container: Container) {
        let mut store = self.containers.write().await;
        store.insert(container.id.clone(), container);
    }

    pub async fn get(&self, id: &str) -> Option<Container> {
        let store = self.containers.read().await;
        store.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) -> Option<Container> {
        let mut store = self.containers.write().await;
        store.remove(id)
    }

    /// List containers, optionally filtered by sandbox ID and/or labels.
    pub async fn list(
        &self,
        sandbox_id: Option<&str>,
        label_filter: Option<&HashMap<String, String>>,
    ) -> Vec<Container> {
        let store = self.containers.read().await;
        store
            .values()
            .filter(|c| {
                if let Some(sid) = sandbox_id {
                    if c.sandbox_id != sid {
                        return false;
                    }
                }
                if let Some(filter) = label_filter {
                    if !filter.iter().all(|(k, v)| c.labels.get(k) == Some(v)) {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect()
    }

    /// Update container timestamps when started.
    pub async fn mark_started(&self, id: &str, started_at: i64) -> bool {
        let mut store = self.containers.write().await;
        if let Some(c) = store.get_mut(id) {
            c.state = ContainerState::Running;
            c.started_at = started_at;
            true
        } else {
            false
        }
    }

    /// Update container timestamps and exit code when exited.
    pub async fn mark_exited(&self, id: &str, finished_at: i64, exit_code: i32) -> bool {
        let mut store = self.containers.write().await;
        if let Some(c) = store.get_mut(id) {
            if c.state != ContainerState::Exited {
                c.state = ContainerState::Exited;
                c.finished_at = finished_at;
                c.exit_code = exit_code;
            }
            true
        } else {
            false
        }
    }

    /// Remove all containers belonging to a sandbox.
    pub async fn remove_by_sandbox(&self, sandbox_id: &str) -> Vec<Container> {
        let mut store = self.containers.write().await;
        let ids: Vec<String> = store
            .values()
            .filter(|c| c.sandbox_id == sandbox_id)
            .map(|c| c.id.clone())
            .collect();

        ids.iter().filter_map(|id| store.remove(id)).collect()
    }
}

impl Default for ContainerStore {
    fn default() -> Self {
        Self::new()
    }
}
