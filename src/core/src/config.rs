use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default UNIX socket of the container manager.
pub const DEFAULT_MANAGER_SOCKET: &str = "/var/lib/machined/unix.socket";

/// Default directory holding CNI plugin binaries.
pub const DEFAULT_CNI_BIN_DIR: &str = "/opt/cni/bin";

/// Default directory holding CNI network configuration files.
pub const DEFAULT_CNI_CONF_DIR: &str = "/etc/cni/net.d";

/// Default directory for named network namespaces.
pub const DEFAULT_CNI_NETNS_DIR: &str = "/var/run/netns";

/// Reserved prefix for shim-owned config keys on manager containers.
///
/// Everything durable the shim knows about a pod lives under this prefix;
/// the manager remains the only store.
pub const USER_KEY_PREFIX: &str = "user.podlx.";

/// CNI configuration paths.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CniConfig {
    /// Directory containing plugin binaries.
    pub bin_dir: PathBuf,
    /// Directory containing network configuration JSON files.
    pub conf_dir: PathBuf,
    /// Directory for network namespace bind mounts.
    pub netns_dir: PathBuf,
    /// Use the named network instead of the lexicographically first
    /// configuration file.
    #[serde(default)]
    pub network_name: Option<String>,
}

impl Default for CniConfig {
    fn default() -> Self {
        Self {
            bin_dir: PathBuf::from(DEFAULT_CNI_BIN_DIR),
            conf_dir: PathBuf::from(DEFAULT_CNI_CONF_DIR),
            netns_dir: PathBuf::from(DEFAULT_CNI_NETNS_DIR),
            network_name: None,
        }
    }
}

/// Top-level shim configuration assembled from CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShimConfig {
    /// Path to the container manager's UNIX socket.
    pub manager_socket: PathBuf,

    /// CNI paths and network selection.
    #[serde(default)]
    pub cni: CniConfig,

    /// Bind address of the exec/attach/port-forward streaming server.
    pub streaming_addr: std::net::SocketAddr,

    /// Image alias used for the pod infra container.
    pub infra_image: String,

    /// Default deadline for a single manager operation wait.
    #[serde(with = "duration_secs")]
    pub operation_timeout: Duration,

    /// Attempts for the graceful-then-forced stop protocol.
    pub stop_retries: u32,

    /// Wall-clock budget for an image pull including retries.
    #[serde(with = "duration_secs")]
    pub pull_budget: Duration,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            manager_socket: PathBuf::from(DEFAULT_MANAGER_SOCKET),
            cni: CniConfig::default(),
            streaming_addr: "127.0.0.1:10305".parse().expect("static addr"),
            infra_image: "infra".to_string(),
            operation_timeout: Duration::from_secs(30),
            stop_retries: 3,
            pull_budget: Duration::from_secs(300),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
