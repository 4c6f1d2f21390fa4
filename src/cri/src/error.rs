//! Shim error types and their gRPC status mapping.

use std::path::PathBuf;

use portoshim_client::{EError, PortoError};
use thiserror::Error;
use tonic::Status;

/// Errors surfaced by the CRI mappers.
#[derive(Error, Debug)]
pub enum ShimError {
    #[error(transparent)]
    Porto(#[from] PortoError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not implemented {0}")]
    NotImplemented(&'static str),

    #[error("{0}")]
    InvalidArgument(String),

    /// A container verb was called with a sandbox-level ID.
    #[error("{0}: specified ID belongs to a pod")]
    NotAContainer(String),

    /// A sandbox verb was called with a container-level ID.
    #[error("{0}: specified ID belongs to a container")]
    NotAPod(String),

    #[error("cni wasn't initialized")]
    CniNotReady,

    #[error("cni: {0}")]
    Cni(String),

    /// The service-account mount never became ready.
    #[error("timed out waiting for mount source {}", .path.display())]
    MountTimeout { path: PathBuf },

    #[error("netns property hasn't been set")]
    NetnsMissing,

    #[error("{0}")]
    Internal(String),
}

impl From<ShimError> for Status {
    fn from(err: ShimError) -> Status {
        match &err {
            ShimError::Porto(PortoError::Backend { code, .. }) => match code {
                EError::ContainerDoesNotExist => Status::not_found(err.to_string()),
                EError::DockerImageNotFound => Status::not_found(err.to_string()),
                EError::InvalidState => Status::failed_precondition(err.to_string()),
                EError::InvalidValue | EError::InvalidProperty => {
                    Status::invalid_argument(err.to_string())
                }
                EError::Permission => Status::permission_denied(err.to_string()),
                EError::Busy => Status::unavailable(err.to_string()),
                _ => Status::internal(err.to_string()),
            },
            ShimError::Porto(PortoError::Transport(_)) => Status::unavailable(err.to_string()),
            ShimError::Porto(_) => Status::internal(err.to_string()),
            ShimError::NotImplemented(_) => Status::unimplemented(err.to_string()),
            ShimError::InvalidArgument(_)
            | ShimError::NotAContainer(_)
            | ShimError::NotAPod(_) => Status::invalid_argument(err.to_string()),
            ShimError::CniNotReady => Status::failed_precondition(err.to_string()),
            ShimError::MountTimeout { .. } => Status::deadline_exceeded(err.to_string()),
            _ => Status::internal(err.to_string()),
        }
    }
}

/// Result type alias for mapper operations.
pub type Result<T> = std::result::Result<T, ShimError>;
