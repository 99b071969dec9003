//! CNI network plumbing for pod sandboxes.
//!
//! The plugin resolves one network list from the configuration directory
//! (lexicographically first file, or a named network), then hands out
//! per-pod handles whose runtime conf templates are immutable once cached;
//! a fresh conf is allocated for every CNI action. Containers join the
//! network of their pod through [`PodNetwork::container_network`].

pub mod result;
pub mod runner;

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;

use podlx_core::config::CniConfig;
use podlx_core::error::{Result, ShimError};

pub use result::VersionedResult;
pub use runner::{CniRunner, ExecRunner};

/// Interface name given to the pod's primary interface.
pub const DEFAULT_INTERFACE: &str = "eth0";

/// Property key the raw CNI result is stored under between actions.
pub const RESULT_PROPERTY: &str = "network.result";

/// A resolved CNI network: ordered plugin configurations sharing a name
/// and spec version.
#[derive(Debug, Clone)]
pub struct NetworkList {
    pub name: String,
    pub cni_version: String,
    pub plugins: Vec<Value>,
}

/// Attachment identity passed to plugins. Never mutated after caching;
/// actions derive a fresh conf with the netns filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConf {
    pub container_id: String,
    pub netns: String,
    pub ifname: String,
    pub args: Vec<(String, String)>,
}

impl RuntimeConf {
    fn with_netns(&self, netns: &str) -> Self {
        Self {
            netns: netns.to_string(),
            ..self.clone()
        }
    }

    fn with_container_id(&self, container_id: &str) -> Self {
        Self {
            container_id: container_id.to_string(),
            ..self.clone()
        }
    }
}

/// Parsed network state reported back to the CRI surface.
#[derive(Debug, Clone)]
pub struct NetworkStatus {
    /// Pod addresses, primary first.
    pub ips: Vec<IpAddr>,
    /// Interface names from the CNI result, in order.
    pub interfaces: Vec<String>,
}

/// Network namespace path for a process, in the form CNI plugins expect.
pub fn netns_path(pid: i64) -> String {
    format!("/proc/{}/ns/net", pid)
}

/// The CNI plugin: configuration snapshot plus the runner that executes
/// plugin binaries.
///
/// The resolved network list is a swappable snapshot so SIGHUP can re-read
/// the configuration directory; pod handles already created keep the
/// snapshot they were resolved against.
#[derive(Clone)]
pub struct CniPlugin {
    conf: CniConfig,
    network: Arc<std::sync::RwLock<Arc<NetworkList>>>,
    runner: Arc<dyn CniRunner>,
}

impl CniPlugin {
    /// Initialize from the configured directories: ensure they exist, scan
    /// the configuration directory, and resolve the network list.
    pub fn init(conf: CniConfig) -> Result<Self> {
        for dir in [&conf.conf_dir, &conf.netns_dir] {
            std::fs::create_dir_all(dir).map_err(|e| {
                ShimError::Config(format!("cannot prepare CNI dir {}: {}", dir.display(), e))
            })?;
        }

        let network = load_network(&conf.conf_dir, conf.network_name.as_deref())?;
        tracing::info!(
            network = %network.name,
            version = %network.cni_version,
            plugins = network.plugins.len(),
            "Resolved CNI network"
        );

        let runner = Arc::new(ExecRunner::new(conf.bin_dir.clone()));
        Ok(Self {
            conf,
            network: Arc::new(std::sync::RwLock::new(Arc::new(network))),
            runner,
        })
    }

    /// Build a plugin around an explicit runner. Used by tests and by
    /// callers embedding an alternative CNI execution strategy.
    pub fn with_runner(
        conf: CniConfig,
        network: NetworkList,
        runner: Arc<dyn CniRunner>,
    ) -> Self {
        Self {
            conf,
            network: Arc::new(std::sync::RwLock::new(Arc::new(network))),
            runner,
        }
    }

    fn snapshot(&self) -> Arc<NetworkList> {
        self.network.read().expect("network snapshot poisoned").clone()
    }

    /// Re-read the configuration directory and swap the snapshot. Wired to
    /// SIGHUP by the binary.
    pub fn reload(&self) -> Result<()> {
        let network = load_network(&self.conf.conf_dir, self.conf.network_name.as_deref())?;
        tracing::info!(network = %network.name, "Reloaded CNI network configuration");
        *self.network.write().expect("network snapshot poisoned") = Arc::new(network);
        Ok(())
    }

    pub fn network_name(&self) -> String {
        self.snapshot().name.clone()
    }

    pub fn conf(&self) -> &CniConfig {
        &self.conf
    }

    /// Resolve the pod-level network handle. The runtime-conf template
    /// carries the pod ID as container ID and an empty netns; actions fill
    /// the namespace per attachment.
    pub fn pod_network(&self, pod_id: &str, extra_args: Vec<(String, String)>) -> PodNetwork {
        PodNetwork {
            network: self.snapshot(),
            runner: self.runner.clone(),
            template: RuntimeConf {
                container_id: pod_id.to_string(),
                netns: String::new(),
                ifname: DEFAULT_INTERFACE.to_string(),
                args: extra_args,
            },
        }
    }

    /// Dynamic pod CIDR reconfiguration. The exec-based plugin trees this
    /// shim drives have no reconfiguration channel, so this fails rather
    /// than silently dropping the new CIDR.
    pub fn update_runtime_config(&self, pod_cidr: &str) -> Result<()> {
        Err(ShimError::Invalid(format!(
            "network '{}' cannot apply a dynamic pod CIDR ({})",
            self.snapshot().name, pod_cidr
        )))
    }
}

/// Pod-scoped network handle with a cached runtime-conf template.
#[derive(Clone)]
pub struct PodNetwork {
    network: Arc<NetworkList>,
    runner: Arc<dyn CniRunner>,
    template: RuntimeConf,
}

impl PodNetwork {
    /// Bind the pod network to a specific container process. Used for the
    /// sandbox container and for containers that must join the same
    /// network.
    pub fn container_network(&self, container_id: &str) -> ContainerNetwork {
        ContainerNetwork {
            network: self.network.clone(),
            runner: self.runner.clone(),
            template: self.template.with_container_id(container_id),
        }
    }

    /// Re-parse the stored result and report current addresses. Missing or
    /// address-less results are errors: a ready pod must have an IP.
    pub fn status(&self, properties: &HashMap<String, String>) -> Result<NetworkStatus> {
        let raw = properties.get(RESULT_PROPERTY).ok_or_else(|| {
            ShimError::NetworkSetup("no stored CNI result for pod".to_string())
        })?;
        let result = VersionedResult::parse(raw)?;
        Ok(NetworkStatus {
            ips: result.ips()?,
            interfaces: result.interface_names(),
        })
    }

    pub fn template(&self) -> &RuntimeConf {
        &self.template
    }
}

/// A pod network bound to one container process.
#[derive(Clone)]
pub struct ContainerNetwork {
    network: Arc<NetworkList>,
    runner: Arc<dyn CniRunner>,
    template: RuntimeConf,
}

impl ContainerNetwork {
    /// Attach the container to the network once its process exists.
    ///
    /// Fills the runtime conf with `/proc/<pid>/ns/net`, invokes ADD,
    /// stores the raw result under [`RESULT_PROPERTY`], and returns the
    /// parsed status. A result without addresses fails the attachment.
    pub async fn when_started(
        &self,
        pid: i64,
        properties: &mut HashMap<String, String>,
    ) -> Result<NetworkStatus> {
        let runtime = self.template.with_netns(&netns_path(pid));
        let raw = self.runner.add(&self.network, &runtime).await?;
        let raw_text = serde_json::to_string(&raw)?;

        let result = VersionedResult::parse(&raw_text)?;
        let ips = result.ips()?;
        let interfaces = result.interface_names();

        properties.insert(RESULT_PROPERTY.to_string(), raw_text);
        tracing::info!(
            container = %runtime.container_id,
            primary_ip = %ips[0],
            "CNI attach complete"
        );
        Ok(NetworkStatus { ips, interfaces })
    }

    /// Detach the container. Runs DEL with the cached conf (empty netns);
    /// a missing stored result is fine, detaching twice is fine.
    pub async fn when_deleted(&self, _properties: &HashMap<String, String>) -> Result<()> {
        self.runner.del(&self.network, &self.template).await
    }

    pub fn template(&self) -> &RuntimeConf {
        &self.template
    }
}

/// Resolve the network list from a configuration directory.
///
/// Files are considered in lexical order; the first valid one wins unless
/// `name` selects a specific network. Both single-plugin `.conf` files and
/// `.conflist` files are understood.
pub fn load_network(conf_dir: &Path, name: Option<&str>) -> Result<NetworkList> {
    let mut entries: Vec<_> = std::fs::read_dir(conf_dir)
        .map_err(|e| {
            ShimError::Config(format!(
                "cannot read CNI conf dir {}: {}",
                conf_dir.display(),
                e
            ))
        })?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("conf") | Some("conflist") | Some("json")
            )
        })
        .collect();
    entries.sort();

    for path in &entries {
        let network = match parse_network_file(path) {
            Ok(network) => network,
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "Skipping CNI config");
                continue;
            }
        };
        match name {
            Some(wanted) if network.name != wanted => continue,
            _ => return Ok(network),
        }
    }

    Err(ShimError::Config(match name {
        Some(wanted) => format!(
            "no CNI network named '{}' in {}",
            wanted,
            conf_dir.display()
        ),
        None => format!("no valid CNI network config in {}", conf_dir.display()),
    }))
}

fn parse_network_file(path: &Path) -> Result<NetworkList> {
    let raw = std::fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&raw)
        .map_err(|e| ShimError::Config(format!("invalid JSON: {}", e)))?;

    let name = value
        .get("name")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ShimError::Config("network config has no name".to_string()))?
        .to_string();
    let cni_version = value
        .get("cniVersion")
        .and_then(Value::as_str)
        .unwrap_or("0.4.0")
        .to_string();

    let is_conflist = path.extension().and_then(|e| e.to_str()) == Some("conflist")
        || value.get("plugins").is_some();

    let plugins = if is_conflist {
        let list = value
            .get("plugins")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                ShimError::Config("conflist has no plugins array".to_string())
            })?;
        if list.is_empty() {
            return Err(ShimError::Config("conflist has no plugins".to_string()));
        }
        list.clone()
    } else {
        if value.get("type").and_then(Value::as_str).is_none() {
            return Err(ShimError::Config(
                "network config has no plugin type".to_string(),
            ));
        }
        vec![value.clone()]
    };

    Ok(NetworkList {
        name,
        cni_version,
        plugins,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Runner recording calls and replaying canned results.
    struct FakeRunner {
        result: Value,
        adds: Mutex<Vec<RuntimeConf>>,
        dels: Mutex<Vec<RuntimeConf>>,
    }

    impl FakeRunner {
        fn returning(result: Value) -> Arc<Self> {
            Arc::new(Self {
                result,
                adds: Mutex::new(Vec::new()),
                dels: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CniRunner for FakeRunner {
        async fn add(&self, _network: &NetworkList, runtime: &RuntimeConf) -> Result<Value> {
            self.adds.lock().unwrap().push(runtime.clone());
            Ok(self.result.clone())
        }

        async fn del(&self, _network: &NetworkList, runtime: &RuntimeConf) -> Result<()> {
            self.dels.lock().unwrap().push(runtime.clone());
            Ok(())
        }
    }

    fn loopback_list() -> NetworkList {
        NetworkList {
            name: "lo".to_string(),
            cni_version: "0.4.0".to_string(),
            plugins: vec![serde_json::json!({"type": "loopback"})],
        }
    }

    fn plugin_with(runner: Arc<FakeRunner>) -> CniPlugin {
        CniPlugin::with_runner(CniConfig::default(), loopback_list(), runner)
    }

    fn good_result() -> Value {
        serde_json::json!({
            "cniVersion": "0.4.0",
            "interfaces": [{"name": "eth0", "sandbox": "/proc/6/ns/net"}],
            "ips": [{"version": "4", "interface": 0, "address": "10.22.0.64/16", "gateway": "10.22.0.1"}]
        })
    }

    #[test]
    fn test_pod_network_template() {
        let plugin = plugin_with(FakeRunner::returning(good_result()));
        let pod = plugin.pod_network("pod-1", vec![]);
        let template = pod.template();
        assert_eq!(template.container_id, "pod-1");
        assert_eq!(template.ifname, "eth0");
        assert!(template.netns.is_empty());
    }

    #[test]
    fn test_container_network_binds_container_id() {
        let plugin = plugin_with(FakeRunner::returning(good_result()));
        let pod = plugin.pod_network("pod-1", vec![]);
        let container = pod.container_network("infra-1");
        assert_eq!(container.template().container_id, "infra-1");
        assert!(container.template().netns.is_empty());
    }

    #[tokio::test]
    async fn test_when_started_fills_netns_and_stores_result() {
        let runner = FakeRunner::returning(good_result());
        let plugin = plugin_with(runner.clone());
        let container = plugin.pod_network("pod-1", vec![]).container_network("infra-1");

        let mut properties = HashMap::new();
        let status = container.when_started(6, &mut properties).await.unwrap();

        assert_eq!(status.ips[0].to_string(), "10.22.0.64");
        assert_eq!(status.interfaces, vec!["eth0"]);
        assert!(properties.contains_key(RESULT_PROPERTY));

        let adds = runner.adds.lock().unwrap();
        assert_eq!(adds.len(), 1);
        assert_eq!(adds[0].netns, "/proc/6/ns/net");
    }

    #[tokio::test]
    async fn test_when_started_without_ips_is_error() {
        let runner = FakeRunner::returning(serde_json::json!({
            "cniVersion": "0.4.0",
            "ips": []
        }));
        let plugin = plugin_with(runner);
        let container = plugin.pod_network("pod-1", vec![]).container_network("infra-1");

        let mut properties = HashMap::new();
        let err = container.when_started(6, &mut properties).await.unwrap_err();
        assert!(matches!(err, ShimError::NetworkSetup(_)));
    }

    #[tokio::test]
    async fn test_when_deleted_uses_cached_conf_with_empty_netns() {
        let runner = FakeRunner::returning(good_result());
        let plugin = plugin_with(runner.clone());
        let container = plugin.pod_network("pod-1", vec![]).container_network("infra-1");

        container.when_deleted(&HashMap::new()).await.unwrap();

        let dels = runner.dels.lock().unwrap();
        assert_eq!(dels.len(), 1);
        assert_eq!(dels[0].netns, "");
        assert_eq!(dels[0].container_id, "infra-1");
    }

    #[test]
    fn test_status_reads_stored_result() {
        let plugin = plugin_with(FakeRunner::returning(good_result()));
        let pod = plugin.pod_network("pod-1", vec![]);

        let mut properties = HashMap::new();
        properties.insert(
            RESULT_PROPERTY.to_string(),
            r#"{"cniVersion":"0.4.0","ips":[{"version":"4","interface":2,"address":"10.22.0.64/16","gateway":"10.22.0.1"}]}"#.to_string(),
        );
        let status = pod.status(&properties).unwrap();
        assert_eq!(status.ips.len(), 1);
        assert_eq!(status.ips[0].to_string(), "10.22.0.64");
    }

    #[test]
    fn test_status_without_result_is_error() {
        let plugin = plugin_with(FakeRunner::returning(good_result()));
        let pod = plugin.pod_network("pod-1", vec![]);
        assert!(pod.status(&HashMap::new()).is_err());
    }

    #[test]
    fn test_update_runtime_config_is_hard_error() {
        let plugin = plugin_with(FakeRunner::returning(good_result()));
        let err = plugin.update_runtime_config("10.100.0.0/16").unwrap_err();
        assert!(matches!(err, ShimError::Invalid(_)));
    }

    #[test]
    fn test_load_network_picks_lexicographically_first() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("99-bridge.conf"),
            r#"{"cniVersion":"0.4.0","name":"bridge0","type":"bridge"}"#,
        )
        .unwrap();
        std::fs::write(
            tmp.path().join("10-lo.conf"),
            r#"{"cniVersion":"0.4.0","name":"lo","type":"loopback"}"#,
        )
        .unwrap();

        let network = load_network(tmp.path(), None).unwrap();
        assert_eq!(network.name, "lo");
    }

    #[test]
    fn test_load_network_by_name() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("10-lo.conf"),
            r#"{"cniVersion":"0.4.0","name":"lo","type":"loopback"}"#,
        )
        .unwrap();
        std::fs::write(
            tmp.path().join("99-bridge.conf"),
            r#"{"cniVersion":"0.4.0","name":"bridge0","type":"bridge"}"#,
        )
        .unwrap();

        let network = load_network(tmp.path(), Some("bridge0")).unwrap();
        assert_eq!(network.name, "bridge0");

        assert!(load_network(tmp.path(), Some("missing")).is_err());
    }

    #[test]
    fn test_load_network_skips_invalid_files() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("00-broken.conf"), "not json").unwrap();
        std::fs::write(
            tmp.path().join("10-lo.conf"),
            r#"{"cniVersion":"0.4.0","name":"lo","type":"loopback"}"#,
        )
        .unwrap();

        let network = load_network(tmp.path(), None).unwrap();
        assert_eq!(network.name, "lo");
    }

    #[test]
    fn test_load_network_conflist() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("10-podnet.conflist"),
            r#"{"cniVersion":"0.4.0","name":"podnet","plugins":[{"type":"bridge"},{"type":"portmap"}]}"#,
        )
        .unwrap();

        let network = load_network(tmp.path(), None).unwrap();
        assert_eq!(network.name, "podnet");
        assert_eq!(network.plugins.len(), 2);
    }

    #[test]
    fn test_load_network_empty_dir_is_error() {
        let tmp = TempDir::new().unwrap();
        assert!(load_network(tmp.path(), None).is_err());
    }

    #[test]
    fn test_reload_swaps_network_snapshot() {
        let tmp = TempDir::new().unwrap();
        let conf_file = tmp.path().join("10-net.conf");
        std::fs::write(
            &conf_file,
            r#"{"cniVersion":"0.4.0","name":"first","type":"loopback"}"#,
        )
        .unwrap();

        let conf = CniConfig {
            bin_dir: tmp.path().join("bin"),
            conf_dir: tmp.path().to_path_buf(),
            netns_dir: tmp.path().join("netns"),
            network_name: None,
        };
        let plugin = CniPlugin::init(conf).unwrap();
        assert_eq!(plugin.network_name(), "first");

        std::fs::write(
            &conf_file,
            r#"{"cniVersion":"0.4.0","name":"second","type":"loopback"}"#,
        )
        .unwrap();
        plugin.reload().unwrap();
        assert_eq!(plugin.network_name(), "second");
    }

    #[test]
    fn test_netns_path_form() {
        assert_eq!(netns_path(1234), "/proc/1234/ns/net");
    }
}
