//! portoshim: Kubernetes CRI services backed by the porto daemon.
//!
//! Maps CRI concepts onto porto primitives:
//! - Pod Sandbox → top-level porto container
//! - Container → child porto container (`<pod>/<child>`)
//! - Image → porto docker-format image storage

pub mod cni;
pub mod command;
pub mod compat;
pub mod config;
pub mod error;
pub mod exec;
pub mod ids;
pub mod image;
pub mod labels;
pub mod netns;
pub mod registry;
pub mod runtime;
pub mod server;
pub mod service;
pub mod streaming;

/// Generated CRI v1 protobuf types.
pub mod cri_api {
    tonic::include_proto!("runtime.v1");
}

/// Generated CRI v1alpha2 protobuf types (legacy kubelets).
pub mod cri_api_v1alpha2 {
    tonic::include_proto!("runtime.v1alpha2");
}
