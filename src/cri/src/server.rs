//! gRPC server setup.
//!
//! Listens on a Unix domain socket (mode 0660) and serves the v1 and
//! v1alpha2 CRI surfaces, both backed by the same mapper implementation.
//! The streaming exec server runs alongside on its own TCP endpoint.

use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{info, warn};

use crate::cni::{CniNetwork, SandboxNetwork};
use crate::compat::CriServiceV1Alpha2;
use crate::config::ShimConfig;
use crate::cri_api::image_service_server::ImageServiceServer;
use crate::cri_api::runtime_service_server::RuntimeServiceServer;
use crate::cri_api_v1alpha2::image_service_server::ImageServiceServer as ImageServiceServerV1Alpha2;
use crate::cri_api_v1alpha2::runtime_service_server::RuntimeServiceServer as RuntimeServiceServerV1Alpha2;
use crate::image::ImageMapper;
use crate::registry::RegistryTable;
use crate::runtime::RuntimeMapper;
use crate::service::CriService;
use crate::streaming::StreamingServer;

/// The CRI shim server.
pub struct ShimServer {
    config: Arc<ShimConfig>,
}

/// Remove a leftover socket from a previous run. Refuses to touch a path
/// that exists but is not a socket.
fn unlink_stale_socket(path: &std::path::Path) -> std::io::Result<()> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            std::fs::remove_file(path)?;
            info!(path = %path.display(), "unlinked stale socket");
            Ok(())
        }
        Ok(_) => Err(std::io::Error::other(format!(
            "{} exists and is not a socket",
            path.display()
        ))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

impl ShimServer {
    pub fn new(config: ShimConfig) -> Self {
        ShimServer {
            config: Arc::new(config),
        }
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        let config = self.config.clone();

        let registries = Arc::new(RegistryTable::known(&config.auth_tokens_dir)?);

        // A missing CNI setup degrades to NODE-network pods only.
        let network: Option<Arc<dyn SandboxNetwork>> = match CniNetwork::load(config.clone()) {
            Ok(cni) => Some(Arc::new(cni)),
            Err(err) => {
                warn!(error = %err, "failed to load cni configuration");
                None
            }
        };

        let streaming = StreamingServer::new(config.streaming_addr, config.clone());
        let streaming_handle = streaming.handle();
        tokio::spawn(async move {
            if let Err(err) = streaming.serve().await {
                warn!(error = %err, "streaming server exited");
            }
        });

        let runtime = Arc::new(RuntimeMapper::new(config.clone(), network));
        let images = Arc::new(ImageMapper::new(config.clone(), registries));
        let service = Arc::new(CriService::new(
            config.clone(),
            runtime,
            images,
            streaming_handle,
        ));
        let legacy = Arc::new(CriServiceV1Alpha2::new(service.clone()));

        if let Some(parent) = config.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        unlink_stale_socket(&config.socket_path)?;

        let listener = UnixListener::bind(&config.socket_path)?;
        std::fs::set_permissions(
            &config.socket_path,
            std::fs::Permissions::from_mode(0o660),
        )?;
        let incoming = UnixListenerStream::new(listener);

        info!(socket = %config.socket_path.display(), "portoshim listening");

        Server::builder()
            .add_service(RuntimeServiceServer::from_arc(service.clone()))
            .add_service(ImageServiceServer::from_arc(service))
            .add_service(RuntimeServiceServerV1Alpha2::from_arc(legacy.clone()))
            .add_service(ImageServiceServerV1Alpha2::from_arc(legacy))
            .serve_with_incoming_shutdown(incoming, shutdown_signal())
            .await?;

        info!("portoshim is shut down");
        Ok(())
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
    info!("portoshim is shutting down");
}
