//! Façade-level tests: the full interceptor path through the tonic
//! service traits, including the unimplemented surface.

mod support;

use std::sync::Arc;

use tonic::{Code, Request};

use portoshim_cri::cri_api::image_service_server::ImageService;
use portoshim_cri::cri_api::runtime_service_server::RuntimeService;
use portoshim_cri::cri_api::*;
use portoshim_cri::image::ImageMapper;
use portoshim_cri::registry::RegistryTable;
use portoshim_cri::runtime::RuntimeMapper;
use portoshim_cri::service::CriService;
use portoshim_cri::streaming::StreamingServer;

use support::{test_config, MockBackend};

fn service_for(mock: &MockBackend) -> (CriService, tempfile::TempDir) {
    let (config, dir) = test_config(mock);
    let registries = Arc::new(RegistryTable::known(&config.auth_tokens_dir).unwrap());
    let runtime = Arc::new(RuntimeMapper::new(config.clone(), None));
    let images = Arc::new(ImageMapper::new(config.clone(), registries));
    let streaming = StreamingServer::new(config.streaming_addr, config.clone());
    let handle = streaming.handle();
    (CriService::new(config, runtime, images, handle), dir)
}

#[tokio::test]
async fn test_version_through_the_facade() {
    let mock = MockBackend::start().await;
    let (service, _dir) = service_for(&mock);

    let resp = service
        .version(Request::new(VersionRequest {
            version: "0.1.0".to_string(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(resp.runtime_name, "porto");
    assert_eq!(resp.runtime_version, "5.4.1");
}

#[tokio::test]
async fn test_unimplemented_surface() {
    let mock = MockBackend::start().await;
    let (service, _dir) = service_for(&mock);

    let status = service
        .attach(Request::new(AttachRequest::default()))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unimplemented);

    let status = service
        .port_forward(Request::new(PortForwardRequest::default()))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unimplemented);

    let status = service
        .update_container_resources(Request::new(UpdateContainerResourcesRequest::default()))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unimplemented);

    let status = service
        .update_runtime_config(Request::new(UpdateRuntimeConfigRequest::default()))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unimplemented);
}

#[tokio::test]
async fn test_reopen_container_log_is_accepted() {
    let mock = MockBackend::start().await;
    let (service, _dir) = service_for(&mock);

    service
        .reopen_container_log(Request::new(ReopenContainerLogRequest {
            container_id: "p-0001/c-0001".to_string(),
        }))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_exec_returns_streaming_url() {
    let mock = MockBackend::start().await;
    let (service, _dir) = service_for(&mock);

    let resp = service
        .exec(Request::new(ExecRequest {
            container_id: "p-0001/c-0001".to_string(),
            cmd: vec!["/bin/sh".to_string()],
            tty: true,
            stdin: true,
            stdout: true,
            stderr: false,
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(resp.url.contains("/exec/"), "got {}", resp.url);

    // A sandbox-level target is rejected before any session is created.
    let status = service
        .exec(Request::new(ExecRequest {
            container_id: "p-0001".to_string(),
            cmd: vec!["/bin/sh".to_string()],
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    // So is an empty command.
    let status = service
        .exec(Request::new(ExecRequest {
            container_id: "p-0001/c-0001".to_string(),
            cmd: vec![],
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn test_image_status_not_found_through_the_facade() {
    let mock = MockBackend::start().await;
    let (service, _dir) = service_for(&mock);

    let resp = service
        .image_status(Request::new(ImageStatusRequest {
            image: Some(ImageSpec {
                image: "missing:tag".to_string(),
                annotations: Default::default(),
            }),
            verbose: false,
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(resp.image.is_none());
}

#[tokio::test]
async fn test_interceptor_aborts_when_backend_is_down() {
    let mock = MockBackend::start().await;
    let (service, _dir) = service_for(&mock);
    // Take the backend away.
    std::fs::remove_file(&mock.socket).unwrap();

    let status = service
        .version(Request::new(VersionRequest::default()))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unavailable);
}
