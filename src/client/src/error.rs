//! Typed error surface of the daemon client.

use thiserror::Error;

use crate::rpc::EError;

/// Errors produced by daemon calls.
#[derive(Error, Debug)]
pub enum PortoError {
    /// Socket-level failure: connect, read or write.
    #[error("porto transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The response payload could not be decoded.
    #[error("porto protocol error: {0}")]
    Protocol(#[from] prost::DecodeError),

    /// A round-trip succeeded but the daemon reported a failure.
    #[error("porto: {}: {message}", .code.as_str_name())]
    Backend { code: EError, message: String },

    /// A timeout did not fit the wire representation.
    #[error("timeout must be less than {} ms", u32::MAX)]
    TimeoutOverflow,
}

impl PortoError {
    /// Backend error code, if this is a daemon-reported failure.
    pub fn code(&self) -> Option<EError> {
        match self {
            PortoError::Backend { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_container_already_exists(&self) -> bool {
        self.code() == Some(EError::ContainerAlreadyExists)
    }

    pub fn is_docker_image_not_found(&self) -> bool {
        self.code() == Some(EError::DockerImageNotFound)
    }

    pub fn is_volume_already_exists(&self) -> bool {
        self.code() == Some(EError::VolumeAlreadyExists)
    }

    pub fn is_volume_not_linked(&self) -> bool {
        self.code() == Some(EError::VolumeNotLinked)
    }
}

/// Result type alias for daemon operations.
pub type Result<T> = std::result::Result<T, PortoError>;
