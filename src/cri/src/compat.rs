//! v1alpha2 CRI surface.
//!
//! The two proto versions are wire-compatible by construction, so every
//! v1alpha2 handler re-encodes its request into the v1 type, runs the v1
//! handler, and re-encodes the response back. A decode failure means the
//! two proto files diverged, which is a protocol error.

use std::sync::Arc;

use prost::Message;
use tonic::{Request, Response, Status};

use crate::cri_api::image_service_server::ImageService as V1ImageService;
use crate::cri_api::runtime_service_server::RuntimeService as V1RuntimeService;
use crate::cri_api_v1alpha2 as v1alpha2;
use crate::service::CriService;

/// Re-encode a message into its counterpart in the other proto version.
pub fn transcode<A, B>(from: &A) -> Result<B, Status>
where
    A: Message,
    B: Message + Default,
{
    B::decode(from.encode_to_vec().as_slice())
        .map_err(|err| Status::internal(format!("cri version skew: {}", err)))
}

/// v1alpha2 services forwarding to the v1 implementation.
pub struct CriServiceV1Alpha2 {
    inner: Arc<CriService>,
}

impl CriServiceV1Alpha2 {
    pub fn new(inner: Arc<CriService>) -> Self {
        CriServiceV1Alpha2 { inner }
    }
}

macro_rules! forward_runtime {
    ($self:ident, $method:ident, $request:ident) => {{
        let req = transcode(&$request.into_inner())?;
        let resp = V1RuntimeService::$method($self.inner.as_ref(), Request::new(req)).await?;
        Ok(Response::new(transcode(&resp.into_inner())?))
    }};
}

macro_rules! forward_image {
    ($self:ident, $method:ident, $request:ident) => {{
        let req = transcode(&$request.into_inner())?;
        let resp = V1ImageService::$method($self.inner.as_ref(), Request::new(req)).await?;
        Ok(Response::new(transcode(&resp.into_inner())?))
    }};
}

#[tonic::async_trait]
impl v1alpha2::runtime_service_server::RuntimeService for CriServiceV1Alpha2 {
    async fn version(
        &self,
        request: Request<v1alpha2::VersionRequest>,
    ) -> Result<Response<v1alpha2::VersionResponse>, Status> {
        forward_runtime!(self, version, request)
    }

    async fn run_pod_sandbox(
        &self,
        request: Request<v1alpha2::RunPodSandboxRequest>,
    ) -> Result<Response<v1alpha2::RunPodSandboxResponse>, Status> {
        forward_runtime!(self, run_pod_sandbox, request)
    }

    async fn stop_pod_sandbox(
        &self,
        request: Request<v1alpha2::StopPodSandboxRequest>,
    ) -> Result<Response<v1alpha2::StopPodSandboxResponse>, Status> {
        forward_runtime!(self, stop_pod_sandbox, request)
    }

    async fn remove_pod_sandbox(
        &self,
        request: Request<v1alpha2::RemovePodSandboxRequest>,
    ) -> Result<Response<v1alpha2::RemovePodSandboxResponse>, Status> {
        forward_runtime!(self, remove_pod_sandbox, request)
    }

    async fn pod_sandbox_status(
        &self,
        request: Request<v1alpha2::PodSandboxStatusRequest>,
    ) -> Result<Response<v1alpha2::PodSandboxStatusResponse>, Status> {
        forward_runtime!(self, pod_sandbox_status, request)
    }

    async fn pod_sandbox_stats(
        &self,
        request: Request<v1alpha2::PodSandboxStatsRequest>,
    ) -> Result<Response<v1alpha2::PodSandboxStatsResponse>, Status> {
        forward_runtime!(self, pod_sandbox_stats, request)
    }

    async fn list_pod_sandbox(
        &self,
        request: Request<v1alpha2::ListPodSandboxRequest>,
    ) -> Result<Response<v1alpha2::ListPodSandboxResponse>, Status> {
        forward_runtime!(self, list_pod_sandbox, request)
    }

    async fn list_pod_sandbox_stats(
        &self,
        request: Request<v1alpha2::ListPodSandboxStatsRequest>,
    ) -> Result<Response<v1alpha2::ListPodSandboxStatsResponse>, Status> {
        forward_runtime!(self, list_pod_sandbox_stats, request)
    }

    async fn create_container(
        &self,
        request: Request<v1alpha2::CreateContainerRequest>,
    ) -> Result<Response<v1alpha2::CreateContainerResponse>, Status> {
        forward_runtime!(self, create_container, request)
    }

    async fn start_container(
        &self,
        request: Request<v1alpha2::StartContainerRequest>,
    ) -> Result<Response<v1alpha2::StartContainerResponse>, Status> {
        forward_runtime!(self, start_container, request)
    }

    async fn stop_container(
        &self,
        request: Request<v1alpha2::StopContainerRequest>,
    ) -> Result<Response<v1alpha2::StopContainerResponse>, Status> {
        forward_runtime!(self, stop_container, request)
    }

    async fn remove_container(
        &self,
        request: Request<v1alpha2::RemoveContainerRequest>,
    ) -> Result<Response<v1alpha2::RemoveContainerResponse>, Status> {
        forward_runtime!(self, remove_container, request)
    }

    async fn list_containers(
        &self,
        request: Request<v1alpha2::ListContainersRequest>,
    ) -> Result<Response<v1alpha2::ListContainersResponse>, Status> {
        forward_runtime!(self, list_containers, request)
    }

    async fn container_status(
        &self,
        request: Request<v1alpha2::ContainerStatusRequest>,
    ) -> Result<Response<v1alpha2::ContainerStatusResponse>, Status> {
        forward_runtime!(self, container_status, request)
    }

    async fn container_stats(
        &self,
        request: Request<v1alpha2::ContainerStatsRequest>,
    ) -> Result<Response<v1alpha2::ContainerStatsResponse>, Status> {
        forward_runtime!(self, container_stats, request)
    }

    async fn list_container_stats(
        &self,
        request: Request<v1alpha2::ListContainerStatsRequest>,
    ) -> Result<Response<v1alpha2::ListContainerStatsResponse>, Status> {
        forward_runtime!(self, list_container_stats, request)
    }

    async fn update_container_resources(
        &self,
        request: Request<v1alpha2::UpdateContainerResourcesRequest>,
    ) -> Result<Response<v1alpha2::UpdateContainerResourcesResponse>, Status> {
        forward_runtime!(self, update_container_resources, request)
    }

    async fn reopen_container_log(
        &self,
        request: Request<v1alpha2::ReopenContainerLogRequest>,
    ) -> Result<Response<v1alpha2::ReopenContainerLogResponse>, Status> {
        forward_runtime!(self, reopen_container_log, request)
    }

    async fn exec_sync(
        &self,
        request: Request<v1alpha2::ExecSyncRequest>,
    ) -> Result<Response<v1alpha2::ExecSyncResponse>, Status> {
        forward_runtime!(self, exec_sync, request)
    }

    async fn exec(
        &self,
        request: Request<v1alpha2::ExecRequest>,
    ) -> Result<Response<v1alpha2::ExecResponse>, Status> {
        forward_runtime!(self, exec, request)
    }

    async fn attach(
        &self,
        request: Request<v1alpha2::AttachRequest>,
    ) -> Result<Response<v1alpha2::AttachResponse>, Status> {
        forward_runtime!(self, attach, request)
    }

    async fn port_forward(
        &self,
        request: Request<v1alpha2::PortForwardRequest>,
    ) -> Result<Response<v1alpha2::PortForwardResponse>, Status> {
        forward_runtime!(self, port_forward, request)
    }

    async fn update_runtime_config(
        &self,
        request: Request<v1alpha2::UpdateRuntimeConfigRequest>,
    ) -> Result<Response<v1alpha2::UpdateRuntimeConfigResponse>, Status> {
        forward_runtime!(self, update_runtime_config, request)
    }

    async fn status(
        &self,
        request: Request<v1alpha2::StatusRequest>,
    ) -> Result<Response<v1alpha2::StatusResponse>, Status> {
        forward_runtime!(self, status, request)
    }
}

#[tonic::async_trait]
impl v1alpha2::image_service_server::ImageService for CriServiceV1Alpha2 {
    async fn list_images(
        &self,
        request: Request<v1alpha2::ListImagesRequest>,
    ) -> Result<Response<v1alpha2::ListImagesResponse>, Status> {
        forward_image!(self, list_images, request)
    }

    async fn image_status(
        &self,
        request: Request<v1alpha2::ImageStatusRequest>,
    ) -> Result<Response<v1alpha2::ImageStatusResponse>, Status> {
        forward_image!(self, image_status, request)
    }

    async fn pull_image(
        &self,
        request: Request<v1alpha2::PullImageRequest>,
    ) -> Result<Response<v1alpha2::PullImageResponse>, Status> {
        forward_image!(self, pull_image, request)
    }

    async fn remove_image(
        &self,
        request: Request<v1alpha2::RemoveImageRequest>,
    ) -> Result<Response<v1alpha2::RemoveImageResponse>, Status> {
        forward_image!(self, remove_image, request)
    }

    async fn image_fs_info(
        &self,
        request: Request<v1alpha2::ImageFsInfoRequest>,
    ) -> Result<Response<v1alpha2::ImageFsInfoResponse>, Status> {
        forward_image!(self, image_fs_info, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cri_api as v1;

    #[test]
    fn test_run_pod_sandbox_request_transcodes() {
        let mut labels = std::collections::HashMap::new();
        labels.insert("app".to_string(), "web".to_string());

        let original = v1alpha2::RunPodSandboxRequest {
            config: Some(v1alpha2::PodSandboxConfig {
                metadata: Some(v1alpha2::PodSandboxMetadata {
                    name: "foo".to_string(),
                    uid: "u-1".to_string(),
                    namespace: "default".to_string(),
                    attempt: 2,
                }),
                hostname: "foo".to_string(),
                log_directory: "/var/log/pods".to_string(),
                dns_config: Some(v1alpha2::DnsConfig {
                    servers: vec!["10.0.0.10".to_string()],
                    searches: vec!["cluster.local".to_string()],
                    options: vec!["ndots:5".to_string()],
                }),
                labels,
                annotations: Default::default(),
                linux: Some(v1alpha2::LinuxPodSandboxConfig {
                    cgroup_parent: String::new(),
                    security_context: Some(v1alpha2::LinuxSandboxSecurityContext {
                        namespace_options: Some(v1alpha2::NamespaceOption {
                            network: v1alpha2::NamespaceMode::Node.into(),
                            pid: v1alpha2::NamespaceMode::Pod.into(),
                            ipc: v1alpha2::NamespaceMode::Pod.into(),
                        }),
                    }),
                    sysctls: Default::default(),
                    resources: None,
                }),
            }),
            runtime_handler: "porto".to_string(),
        };

        let v1_req: v1::RunPodSandboxRequest = transcode(&original).unwrap();
        let config = v1_req.config.as_ref().unwrap();
        assert_eq!(config.metadata.as_ref().unwrap().name, "foo");
        assert_eq!(config.metadata.as_ref().unwrap().attempt, 2);
        assert_eq!(
            config
                .linux
                .as_ref()
                .unwrap()
                .security_context
                .as_ref()
                .unwrap()
                .namespace_options
                .as_ref()
                .unwrap()
                .network,
            v1::NamespaceMode::Node as i32
        );

        // And back, structurally identical.
        let roundtrip: v1alpha2::RunPodSandboxRequest = transcode(&v1_req).unwrap();
        assert_eq!(roundtrip, original);
    }

    #[test]
    fn test_container_status_response_transcodes() {
        let original = v1::ContainerStatusResponse {
            status: Some(v1::ContainerStatus {
                id: "foo-1a2b/bar-3c4d".to_string(),
                metadata: Some(v1::ContainerMetadata {
                    name: "bar".to_string(),
                    attempt: 1,
                }),
                state: v1::ContainerState::ContainerExited.into(),
                created_at: 1_700_000_000_000_000_000,
                started_at: 1_700_000_001_000_000_000,
                finished_at: 1_700_000_002_000_000_000,
                exit_code: 137,
                image: Some(v1::ImageSpec {
                    image: "nginx:latest".to_string(),
                    annotations: Default::default(),
                }),
                image_ref: "nginx:latest".to_string(),
                reason: String::new(),
                message: String::new(),
                labels: Default::default(),
                annotations: Default::default(),
                mounts: vec![],
                log_path: "/place/porto/foo-1a2b/bar-3c4d/stdout".to_string(),
            }),
            info: Default::default(),
        };

        let alpha: v1alpha2::ContainerStatusResponse = transcode(&original).unwrap();
        assert_eq!(alpha.status.as_ref().unwrap().exit_code, 137);
        let back: v1::ContainerStatusResponse = transcode(&alpha).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn test_exec_sync_response_transcodes() {
        let original = v1::ExecSyncResponse {
            stdout: b"out".to_vec(),
            stderr: b"err".to_vec(),
            exit_code: 1,
        };
        let alpha: v1alpha2::ExecSyncResponse = transcode(&original).unwrap();
        assert_eq!(alpha.stdout, b"out");
        assert_eq!(alpha.exit_code, 1);
    }
}
