//! podlx CRI binary.
//!
//! Serves CRI RuntimeService and ImageService over a Unix domain socket,
//! letting kubelet schedule pods onto a machine-container manager.
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 manager
//! unreachable at startup.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use podlx_core::config::{CniConfig, ShimConfig};
use podlx_runtime::manager::ManagerClient;
use podlx_runtime::network::CniPlugin;

use podlx_cri::server::CriServer;

const EXIT_CONFIG: u8 = 1;
const EXIT_MANAGER_UNREACHABLE: u8 = 2;

/// podlx CRI runtime
#[derive(Parser, Debug)]
#[command(name = "podlx-cri", about = "CRI shim for a machine-container manager")]
struct Args {
    /// Path to the Unix domain socket for CRI communication.
    #[arg(long, default_value = "/var/run/podlx/podlx.sock")]
    socket: PathBuf,

    /// Path to the container manager's Unix socket.
    #[arg(long, default_value = podlx_core::config::DEFAULT_MANAGER_SOCKET)]
    manager_socket: PathBuf,

    /// Directory containing CNI plugin binaries.
    #[arg(long, default_value = podlx_core::config::DEFAULT_CNI_BIN_DIR)]
    cni_bin_dir: PathBuf,

    /// Directory containing CNI network configuration files.
    #[arg(long, default_value = podlx_core::config::DEFAULT_CNI_CONF_DIR)]
    cni_conf_dir: PathBuf,

    /// Directory for network namespace bind mounts.
    #[arg(long, default_value = podlx_core::config::DEFAULT_CNI_NETNS_DIR)]
    cni_netns_dir: PathBuf,

    /// Use the named CNI network instead of the first configuration file.
    #[arg(long)]
    cni_network: Option<String>,

    /// Bind address for the exec/attach/port-forward streaming server.
    #[arg(long, default_value = "127.0.0.1:10305")]
    streaming_addr: String,

    /// Image alias used for the pod infra container.
    #[arg(long, default_value = "infra")]
    infra_image: String,

    /// Attempts for the graceful-then-forced stop protocol.
    #[arg(long, default_value = "3")]
    stop_retries: u32,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .init();

    let streaming_addr = match args.streaming_addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!(addr = %args.streaming_addr, error = %e, "Invalid streaming address");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let config = ShimConfig {
        manager_socket: args.manager_socket.clone(),
        cni: CniConfig {
            bin_dir: args.cni_bin_dir,
            conf_dir: args.cni_conf_dir,
            netns_dir: args.cni_netns_dir,
            network_name: args.cni_network,
        },
        streaming_addr,
        infra_image: args.infra_image,
        stop_retries: args.stop_retries,
        ..ShimConfig::default()
    };

    tracing::info!(
        socket = %args.socket.display(),
        manager = %config.manager_socket.display(),
        network_conf = %config.cni.conf_dir.display(),
        "Starting podlx CRI runtime"
    );

    // Resolve the CNI network before touching the manager; a broken
    // network tree is a configuration error.
    let network = match CniPlugin::init(config.cni.clone()) {
        Ok(plugin) => plugin,
        Err(e) => {
            tracing::error!(error = %e, "CNI initialization failed");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    // SIGHUP re-reads the CNI configuration snapshot.
    let reload_plugin = network.clone();
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot listen for SIGHUP");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            if let Err(e) = reload_plugin.reload() {
                tracing::warn!(error = %e, "CNI configuration reload failed");
            }
        }
    });

    let manager = ManagerClient::new(&config.manager_socket, config.operation_timeout);
    if let Err(e) = manager.ping().await {
        tracing::error!(
            socket = %config.manager_socket.display(),
            error = %e,
            "Container manager unreachable"
        );
        return ExitCode::from(EXIT_MANAGER_UNREACHABLE);
    }

    let server = CriServer::new(args.socket, config, manager, network);
    match server.serve().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "CRI server failed");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}
