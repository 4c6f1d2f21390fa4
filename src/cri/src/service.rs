//! CRI v1 service façade.
//!
//! Every verb runs through the same per-request scope: a dedicated backend
//! connection, a fresh request id, a method log at info with the payload at
//! debug, and the elapsed milliseconds on the way out. `PullImage` is the
//! one redacted payload: only the image name and username are logged.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use portoshim_client::PortoClient;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use crate::config::ShimConfig;
use crate::cri_api::image_service_server::ImageService;
use crate::cri_api::runtime_service_server::RuntimeService;
use crate::cri_api::*;
use crate::error::ShimError;
use crate::exec::ExecSpec;
use crate::ids::is_container;
use crate::image::ImageMapper;
use crate::runtime::RuntimeMapper;
use crate::streaming::StreamingHandle;

/// Porto-backed CRI services, v1 surface.
pub struct CriService {
    config: Arc<ShimConfig>,
    runtime: Arc<RuntimeMapper>,
    images: Arc<ImageMapper>,
    streaming: StreamingHandle,
}

/// Per-call scope created by the interceptor: one backend connection,
/// one request id, one timer.
pub struct RequestScope {
    pub client: PortoClient,
    method: &'static str,
    request_id: String,
    started: Instant,
}

impl RequestScope {
    fn log_request<T: fmt::Debug>(&self, req: &T) {
        debug!(
            method = self.method,
            request_id = %self.request_id,
            request = ?req,
            "request"
        );
    }

    /// Credentials never reach the log.
    fn log_pull_image(&self, req: &PullImageRequest) {
        let image = req
            .image
            .as_ref()
            .map(|spec| spec.image.as_str())
            .unwrap_or_default();
        let username = req
            .auth
            .as_ref()
            .map(|auth| auth.username.as_str())
            .unwrap_or_default();
        debug!(
            method = self.method,
            request_id = %self.request_id,
            image,
            username,
            "request"
        );
    }

    fn finish<T: fmt::Debug>(
        self,
        result: Result<T, ShimError>,
    ) -> Result<Response<T>, Status> {
        let elapsed_ms = self.started.elapsed().as_millis();
        match result {
            Ok(resp) => {
                debug!(
                    method = self.method,
                    request_id = %self.request_id,
                    response = ?resp,
                    "response"
                );
                info!(
                    method = self.method,
                    request_id = %self.request_id,
                    elapsed_ms,
                    "done"
                );
                Ok(Response::new(resp))
            }
            Err(err) => {
                info!(
                    method = self.method,
                    request_id = %self.request_id,
                    elapsed_ms,
                    error = %err,
                    "failed"
                );
                Err(err.into())
            }
        }
    }
}

impl CriService {
    pub fn new(
        config: Arc<ShimConfig>,
        runtime: Arc<RuntimeMapper>,
        images: Arc<ImageMapper>,
        streaming: StreamingHandle,
    ) -> Self {
        CriService {
            config,
            runtime,
            images,
            streaming,
        }
    }

    /// Interceptor entry: connect to the backend and open the scope.
    /// A failed connect aborts the call before the handler runs.
    async fn begin(&self, method: &'static str) -> Result<RequestScope, Status> {
        let request_id = format!("{:08x}", rand::random::<u32>());
        info!(method, request_id = %request_id, "call");

        let client = PortoClient::connect(&self.config.porto_socket)
            .await
            .map_err(|err| Status::unavailable(format!("connect to porto: {}", err)))?;

        Ok(RequestScope {
            client,
            method,
            request_id,
            started: Instant::now(),
        })
    }
}

#[tonic::async_trait]
impl RuntimeService for CriService {
    async fn version(
        &self,
        request: Request<VersionRequest>,
    ) -> Result<Response<VersionResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self.begin("Version").await?;
        scope.log_request(&req);
        let result = self.runtime.version(&mut scope.client, req).await;
        scope.finish(result)
    }

    async fn run_pod_sandbox(
        &self,
        request: Request<RunPodSandboxRequest>,
    ) -> Result<Response<RunPodSandboxResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self.begin("RunPodSandbox").await?;
        scope.log_request(&req);
        let result = self.runtime.run_pod_sandbox(&mut scope.client, req).await;
        scope.finish(result)
    }

    async fn stop_pod_sandbox(
        &self,
        request: Request<StopPodSandboxRequest>,
    ) -> Result<Response<StopPodSandboxResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self.begin("StopPodSandbox").await?;
        scope.log_request(&req);
        let result = self.runtime.stop_pod_sandbox(&mut scope.client, req).await;
        scope.finish(result)
    }

    async fn remove_pod_sandbox(
        &self,
        request: Request<RemovePodSandboxRequest>,
    ) -> Result<Response<RemovePodSandboxResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self.begin("RemovePodSandbox").await?;
        scope.log_request(&req);
        let result = self.runtime.remove_pod_sandbox(&mut scope.client, req).await;
        scope.finish(result)
    }

    async fn pod_sandbox_status(
        &self,
        request: Request<PodSandboxStatusRequest>,
    ) -> Result<Response<PodSandboxStatusResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self.begin("PodSandboxStatus").await?;
        scope.log_request(&req);
        let result = self.runtime.pod_sandbox_status(&mut scope.client, req).await;
        scope.finish(result)
    }

    async fn pod_sandbox_stats(
        &self,
        request: Request<PodSandboxStatsRequest>,
    ) -> Result<Response<PodSandboxStatsResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self.begin("PodSandboxStats").await?;
        scope.log_request(&req);
        let result = self.runtime.pod_sandbox_stats(&mut scope.client, req).await;
        scope.finish(result)
    }

    async fn list_pod_sandbox(
        &self,
        request: Request<ListPodSandboxRequest>,
    ) -> Result<Response<ListPodSandboxResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self.begin("ListPodSandbox").await?;
        scope.log_request(&req);
        let result = self.runtime.list_pod_sandbox(&mut scope.client, req).await;
        scope.finish(result)
    }

    async fn list_pod_sandbox_stats(
        &self,
        request: Request<ListPodSandboxStatsRequest>,
    ) -> Result<Response<ListPodSandboxStatsResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self.begin("ListPodSandboxStats").await?;
        scope.log_request(&req);
        let result = self
            .runtime
            .list_pod_sandbox_stats(&mut scope.client, req)
            .await;
        scope.finish(result)
    }

    async fn create_container(
        &self,
        request: Request<CreateContainerRequest>,
    ) -> Result<Response<CreateContainerResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self.begin("CreateContainer").await?;
        scope.log_request(&req);
        let result = self.runtime.create_container(&mut scope.client, req).await;
        scope.finish(result)
    }

    async fn start_container(
        &self,
        request: Request<StartContainerRequest>,
    ) -> Result<Response<StartContainerResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self.begin("StartContainer").await?;
        scope.log_request(&req);
        let result = self.runtime.start_container(&mut scope.client, req).await;
        scope.finish(result)
    }

    async fn stop_container(
        &self,
        request: Request<StopContainerRequest>,
    ) -> Result<Response<StopContainerResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self.begin("StopContainer").await?;
        scope.log_request(&req);
        let result = self.runtime.stop_container(&mut scope.client, req).await;
        scope.finish(result)
    }

    async fn remove_container(
        &self,
        request: Request<RemoveContainerRequest>,
    ) -> Result<Response<RemoveContainerResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self.begin("RemoveContainer").await?;
        scope.log_request(&req);
        let result = self.runtime.remove_container(&mut scope.client, req).await;
        scope.finish(result)
    }

    async fn list_containers(
        &self,
        request: Request<ListContainersRequest>,
    ) -> Result<Response<ListContainersResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self.begin("ListContainers").await?;
        scope.log_request(&req);
        let result = self.runtime.list_containers(&mut scope.client, req).await;
        scope.finish(result)
    }

    async fn container_status(
        &self,
        request: Request<ContainerStatusRequest>,
    ) -> Result<Response<ContainerStatusResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self.begin("ContainerStatus").await?;
        scope.log_request(&req);
        let result = self.runtime.container_status(&mut scope.client, req).await;
        scope.finish(result)
    }

    async fn container_stats(
        &self,
        request: Request<ContainerStatsRequest>,
    ) -> Result<Response<ContainerStatsResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self.begin("ContainerStats").await?;
        scope.log_request(&req);
        let result = self.runtime.container_stats(&mut scope.client, req).await;
        scope.finish(result)
    }

    async fn list_container_stats(
        &self,
        request: Request<ListContainerStatsRequest>,
    ) -> Result<Response<ListContainerStatsResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self.begin("ListContainerStats").await?;
        scope.log_request(&req);
        let result = self
            .runtime
            .list_container_stats(&mut scope.client, req)
            .await;
        scope.finish(result)
    }

    async fn update_container_resources(
        &self,
        request: Request<UpdateContainerResourcesRequest>,
    ) -> Result<Response<UpdateContainerResourcesResponse>, Status> {
        let req = request.into_inner();
        let scope = self.begin("UpdateContainerResources").await?;
        scope.log_request(&req);
        scope.finish(Err(ShimError::NotImplemented("UpdateContainerResources")))
    }

    async fn reopen_container_log(
        &self,
        request: Request<ReopenContainerLogRequest>,
    ) -> Result<Response<ReopenContainerLogResponse>, Status> {
        let req = request.into_inner();
        let scope = self.begin("ReopenContainerLog").await?;
        scope.log_request(&req);
        scope.finish(Ok(ReopenContainerLogResponse {}))
    }

    async fn exec_sync(
        &self,
        request: Request<ExecSyncRequest>,
    ) -> Result<Response<ExecSyncResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self.begin("ExecSync").await?;
        scope.log_request(&req);
        let result = self.runtime.exec_sync(&mut scope.client, req).await;
        scope.finish(result)
    }

    async fn exec(&self, request: Request<ExecRequest>) -> Result<Response<ExecResponse>, Status> {
        let req = request.into_inner();
        let scope = self.begin("Exec").await?;
        scope.log_request(&req);

        if !is_container(&req.container_id) {
            return scope.finish(Err(ShimError::NotAContainer(req.container_id)));
        }
        if req.cmd.is_empty() {
            return scope.finish(Err(ShimError::InvalidArgument(
                "exec command required".to_string(),
            )));
        }

        let url = self
            .streaming
            .register_exec(ExecSpec {
                container_id: req.container_id,
                cmd: req.cmd,
                tty: req.tty,
                stdin: req.stdin,
                stdout: req.stdout,
                stderr: req.stderr,
            })
            .await;
        scope.finish(Ok(ExecResponse { url }))
    }

    async fn attach(
        &self,
        request: Request<AttachRequest>,
    ) -> Result<Response<AttachResponse>, Status> {
        let req = request.into_inner();
        let scope = self.begin("Attach").await?;
        scope.log_request(&req);
        scope.finish(Err(ShimError::NotImplemented("Attach")))
    }

    async fn port_forward(
        &self,
        request: Request<PortForwardRequest>,
    ) -> Result<Response<PortForwardResponse>, Status> {
        let req = request.into_inner();
        let scope = self.begin("PortForward").await?;
        scope.log_request(&req);
        scope.finish(Err(ShimError::NotImplemented("PortForward")))
    }

    async fn update_runtime_config(
        &self,
        request: Request<UpdateRuntimeConfigRequest>,
    ) -> Result<Response<UpdateRuntimeConfigResponse>, Status> {
        let req = request.into_inner();
        let scope = self.begin("UpdateRuntimeConfig").await?;
        scope.log_request(&req);
        scope.finish(Err(ShimError::NotImplemented("UpdateRuntimeConfig")))
    }

    async fn status(
        &self,
        request: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self.begin("Status").await?;
        scope.log_request(&req);
        let result = self.runtime.status(&mut scope.client, req).await;
        scope.finish(result)
    }
}

#[tonic::async_trait]
impl ImageService for CriService {
    async fn list_images(
        &self,
        request: Request<ListImagesRequest>,
    ) -> Result<Response<ListImagesResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self.begin("ListImages").await?;
        scope.log_request(&req);
        let result = self.images.list_images(&mut scope.client, req).await;
        scope.finish(result)
    }

    async fn image_status(
        &self,
        request: Request<ImageStatusRequest>,
    ) -> Result<Response<ImageStatusResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self.begin("ImageStatus").await?;
        scope.log_request(&req);
        let result = self.images.image_status(&mut scope.client, req).await;
        scope.finish(result)
    }

    async fn pull_image(
        &self,
        request: Request<PullImageRequest>,
    ) -> Result<Response<PullImageResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self.begin("PullImage").await?;
        scope.log_pull_image(&req);
        let result = self.images.pull_image(&mut scope.client, req).await;
        scope.finish(result)
    }

    async fn remove_image(
        &self,
        request: Request<RemoveImageRequest>,
    ) -> Result<Response<RemoveImageResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self.begin("RemoveImage").await?;
        scope.log_request(&req);
        let result = self.images.remove_image(&mut scope.client, req).await;
        scope.finish(result)
    }

    async fn image_fs_info(
        &self,
        request: Request<ImageFsInfoRequest>,
    ) -> Result<Response<ImageFsInfoResponse>, Status> {
        let req = request.into_inner();
        let scope = self.begin("ImageFsInfo").await?;
        scope.log_request(&req);
        let result = self.images.image_fs_info(req).await;
        scope.finish(result)
    }
}
