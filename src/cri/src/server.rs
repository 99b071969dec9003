//! gRPC server setup for CRI services.
//!
//! Listens on a Unix domain socket for CRI RuntimeService and ImageService
//! RPCs, recovers the pod index from the manager, and runs the streaming
//! server alongside.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;

use podlx_core::config::ShimConfig;
use podlx_core::error::{Result, ShimError};
use podlx_runtime::image::ImageService;
use podlx_runtime::manager::ManagerClient;
use podlx_runtime::network::CniPlugin;

use crate::container::ContainerStore;
use crate::cri_api::image_service_server::ImageServiceServer;
use crate::cri_api::runtime_service_server::RuntimeServiceServer;
use crate::image_service::PodlxImageService;
use crate::runtime_service::PodlxRuntimeService;
use crate::sandbox::{self, SandboxStore};
use crate::streaming::StreamingServer;

/// CRI gRPC server configuration.
pub struct CriServer {
    /// Path to the CRI Unix domain socket.
    socket_path: PathBuf,
    /// Shim configuration.
    config: ShimConfig,
    /// Manager client shared by all services.
    manager: ManagerClient,
    /// Resolved CNI plugin.
    network: CniPlugin,
}

impl CriServer {
    pub fn new(
        socket_path: PathBuf,
        config: ShimConfig,
        manager: ManagerClient,
        network: CniPlugin,
    ) -> Self {
        Self {
            socket_path,
            config,
            manager,
            network,
        }
    }

    /// Recover state, start the streaming server, and serve CRI RPCs.
    pub async fn serve(self) -> Result<()> {
        // Rebuild the pod index from manager-side metadata.
        let recovered = sandbox::recover(&self.manager).await?;
        let sandboxes = Arc::new(SandboxStore::new());
        let containers = Arc::new(ContainerStore::new());
        for sb in recovered.sandboxes {
            sandboxes.add(sb).await;
        }
        for c in recovered.containers {
            containers.add(c).await;
        }
        // Orphans violate the ownership invariant; reconcile them away.
        for orphan in recovered.orphans {
            tracing::warn!(container = %orphan.id, "Removing orphaned container");
            if let Err(e) = self.manager.stop_container(&orphan.id, 0, 1).await {
                tracing::warn!(container = %orphan.id, error = %e, "Orphan stop failed");
            }
            if let Err(e) = self.manager.delete_container(&orphan.id).await {
                tracing::warn!(container = %orphan.id, error = %e, "Orphan delete failed");
            }
        }

        let streaming = StreamingServer::new(self.config.streaming_addr, self.manager.clone());
        let streaming_handle = streaming.handle();
        tokio::spawn(async move {
            if let Err(e) = streaming.serve().await {
                tracing::error!(error = %e, "Streaming server exited");
            }
        });

        let images = ImageService::new(self.manager.clone(), self.config.pull_budget);
        let image_fs_path = self
            .config
            .manager_socket
            .parent()
            .unwrap_or_else(|| std::path::Path::new("/"))
            .join("images")
            .to_string_lossy()
            .to_string();

        let runtime_service = PodlxRuntimeService::new(
            self.config.clone(),
            self.manager.clone(),
            images.clone(),
            self.network.clone(),
            sandboxes,
            containers,
            streaming_handle,
        );
        let image_service = PodlxImageService::new(images, image_fs_path);

        // Remove a stale socket and make sure its directory exists.
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let uds = UnixListener::bind(&self.socket_path)?;
        let uds_stream = UnixListenerStream::new(uds);

        tracing::info!(
            socket = %self.socket_path.display(),
            "CRI server listening"
        );

        Server::builder()
            .add_service(RuntimeServiceServer::new(runtime_service))
            .add_service(ImageServiceServer::new(image_service))
            .serve_with_incoming(uds_stream)
            .await
            .map_err(|e| ShimError::Fatal(format!("gRPC server failed: {}", e)))?;

        Ok(())
    }
}
