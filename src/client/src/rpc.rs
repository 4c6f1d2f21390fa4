//! Wire messages of the porto daemon RPC.
//!
//! Every request travels inside a single `TContainerRequest` envelope with
//! exactly one sub-request set; the daemon answers with a
//! `TContainerResponse` carrying an error code, an error message and the
//! sub-response matching the request. These definitions are hand-maintained
//! `prost` messages so the crate builds without a protobuf compiler.

/// Error codes returned by the daemon in `TContainerResponse.error`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum EError {
    Success = 0,
    Unknown = 1,
    InvalidMethod = 2,
    ContainerAlreadyExists = 3,
    ContainerDoesNotExist = 4,
    InvalidProperty = 5,
    InvalidData = 6,
    InvalidValue = 7,
    InvalidState = 8,
    NotSupported = 9,
    ResourceNotAvailable = 10,
    Permission = 11,
    VolumeAlreadyExists = 12,
    VolumeNotFound = 13,
    NoSpace = 14,
    Busy = 15,
    VolumeAlreadyLinked = 16,
    VolumeNotLinked = 17,
    LayerAlreadyExists = 18,
    LayerNotFound = 19,
    HelperError = 20,
    HelperFatalError = 21,
    LabelNotFound = 22,
    DockerImageNotFound = 50,
}

impl EError {
    /// Human-readable name used in error messages.
    pub fn as_str_name(self) -> &'static str {
        match self {
            EError::Success => "Success",
            EError::Unknown => "Unknown",
            EError::InvalidMethod => "InvalidMethod",
            EError::ContainerAlreadyExists => "ContainerAlreadyExists",
            EError::ContainerDoesNotExist => "ContainerDoesNotExist",
            EError::InvalidProperty => "InvalidProperty",
            EError::InvalidData => "InvalidData",
            EError::InvalidValue => "InvalidValue",
            EError::InvalidState => "InvalidState",
            EError::NotSupported => "NotSupported",
            EError::ResourceNotAvailable => "ResourceNotAvailable",
            EError::Permission => "Permission",
            EError::VolumeAlreadyExists => "VolumeAlreadyExists",
            EError::VolumeNotFound => "VolumeNotFound",
            EError::NoSpace => "NoSpace",
            EError::Busy => "Busy",
            EError::VolumeAlreadyLinked => "VolumeAlreadyLinked",
            EError::VolumeNotLinked => "VolumeNotLinked",
            EError::LayerAlreadyExists => "LayerAlreadyExists",
            EError::LayerNotFound => "LayerNotFound",
            EError::HelperError => "HelperError",
            EError::HelperFatalError => "HelperFatalError",
            EError::LabelNotFound => "LabelNotFound",
            EError::DockerImageNotFound => "DockerImageNotFound",
        }
    }
}

// ── Container sub-requests ───────────────────────────────────────────

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TContainerCreateRequest {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TContainerDestroyRequest {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TContainerListRequest {
    #[prost(string, optional, tag = "1")]
    pub mask: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TContainerGetPropertyRequest {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub property: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TContainerSetPropertyRequest {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub property: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub value: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TContainerStartRequest {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TContainerStopRequest {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(uint32, optional, tag = "2")]
    pub timeout_ms: Option<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TContainerPauseRequest {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TContainerResumeRequest {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TContainerKillRequest {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(int32, optional, tag = "2")]
    pub sig: Option<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TContainerWaitRequest {
    #[prost(string, repeated, tag = "1")]
    pub name: Vec<String>,
    #[prost(uint32, optional, tag = "2")]
    pub timeout_ms: Option<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TContainerGetRequest {
    #[prost(string, repeated, tag = "1")]
    pub name: Vec<String>,
    #[prost(string, repeated, tag = "2")]
    pub variable: Vec<String>,
    #[prost(bool, optional, tag = "3")]
    pub nonblock: Option<bool>,
}

// ── Spec updates ─────────────────────────────────────────────────────

/// Structured container spec: environment and command are conveyed as
/// vectors, never as joined strings.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TContainerSpec {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(message, optional, tag = "2")]
    pub env: Option<TContainerEnv>,
    #[prost(message, optional, tag = "3")]
    pub command_argv: Option<TContainerCommandArgv>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TContainerEnv {
    #[prost(message, repeated, tag = "1")]
    pub var: Vec<TContainerEnvVar>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TContainerEnvVar {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub value: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TContainerCommandArgv {
    #[prost(string, repeated, tag = "1")]
    pub argv: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TUpdateFromSpecRequest {
    #[prost(message, optional, tag = "1")]
    pub container: Option<TContainerSpec>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TVersionRequest {}

// ── Volume sub-requests ──────────────────────────────────────────────

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TVolumeProperty {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub value: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TVolumeCreateRequest {
    #[prost(string, optional, tag = "1")]
    pub path: Option<String>,
    #[prost(message, repeated, tag = "2")]
    pub properties: Vec<TVolumeProperty>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TVolumeTuneRequest {
    #[prost(string, optional, tag = "1")]
    pub path: Option<String>,
    #[prost(message, repeated, tag = "2")]
    pub properties: Vec<TVolumeProperty>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TVolumeLinkRequest {
    #[prost(string, optional, tag = "1")]
    pub path: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub container: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub target: Option<String>,
    #[prost(bool, optional, tag = "4")]
    pub required: Option<bool>,
    #[prost(bool, optional, tag = "5")]
    pub read_only: Option<bool>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TVolumeUnlinkRequest {
    #[prost(string, optional, tag = "1")]
    pub path: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub container: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub target: Option<String>,
    #[prost(bool, optional, tag = "4")]
    pub strict: Option<bool>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TVolumeListRequest {
    #[prost(string, optional, tag = "1")]
    pub path: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub container: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TVolumeDescription {
    #[prost(string, optional, tag = "1")]
    pub path: Option<String>,
    #[prost(message, repeated, tag = "2")]
    pub properties: Vec<TVolumeProperty>,
    #[prost(string, repeated, tag = "3")]
    pub containers: Vec<String>,
}

// ── Layer sub-requests ───────────────────────────────────────────────

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TLayerImportRequest {
    #[prost(string, optional, tag = "1")]
    pub layer: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub tarball: Option<String>,
    #[prost(bool, optional, tag = "3")]
    pub merge: Option<bool>,
    #[prost(string, optional, tag = "4")]
    pub place: Option<String>,
    #[prost(string, optional, tag = "5")]
    pub private_value: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TLayerRemoveRequest {
    #[prost(string, optional, tag = "1")]
    pub layer: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub place: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TLayerListRequest {
    #[prost(string, optional, tag = "1")]
    pub place: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub mask: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TLayerDescription {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub owner_user: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub owner_group: Option<String>,
    #[prost(uint64, optional, tag = "4")]
    pub last_usage: Option<u64>,
    #[prost(string, optional, tag = "5")]
    pub private_value: Option<String>,
}

// ── Docker image sub-requests ────────────────────────────────────────

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TDockerImageConfig {
    #[prost(string, repeated, tag = "1")]
    pub cmd: Vec<String>,
    #[prost(string, repeated, tag = "2")]
    pub env: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TDockerImage {
    #[prost(string, optional, tag = "1")]
    pub id: Option<String>,
    #[prost(string, repeated, tag = "2")]
    pub tags: Vec<String>,
    #[prost(string, repeated, tag = "3")]
    pub digests: Vec<String>,
    #[prost(uint64, optional, tag = "4")]
    pub size: Option<u64>,
    #[prost(message, optional, tag = "5")]
    pub config: Option<TDockerImageConfig>,
    #[prost(string, optional, tag = "6")]
    pub full_name: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TDockerImageStatusRequest {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub place: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TDockerImageListRequest {
    #[prost(string, optional, tag = "1")]
    pub place: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub mask: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TDockerImagePullRequest {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub place: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub auth_token: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub auth_path: Option<String>,
    #[prost(string, optional, tag = "5")]
    pub auth_service: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TDockerImageRemoveRequest {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub place: Option<String>,
}

// ── Request envelope ─────────────────────────────────────────────────

/// The request envelope. Exactly one sub-request is set per call.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TContainerRequest {
    #[prost(message, optional, tag = "1")]
    pub create: Option<TContainerCreateRequest>,
    #[prost(message, optional, tag = "2")]
    pub create_weak: Option<TContainerCreateRequest>,
    #[prost(message, optional, tag = "3")]
    pub destroy: Option<TContainerDestroyRequest>,
    #[prost(message, optional, tag = "4")]
    pub list: Option<TContainerListRequest>,
    #[prost(message, optional, tag = "5")]
    pub get_property: Option<TContainerGetPropertyRequest>,
    #[prost(message, optional, tag = "6")]
    pub set_property: Option<TContainerSetPropertyRequest>,
    #[prost(message, optional, tag = "7")]
    pub start: Option<TContainerStartRequest>,
    #[prost(message, optional, tag = "8")]
    pub stop: Option<TContainerStopRequest>,
    #[prost(message, optional, tag = "9")]
    pub pause: Option<TContainerPauseRequest>,
    #[prost(message, optional, tag = "10")]
    pub resume: Option<TContainerResumeRequest>,
    #[prost(message, optional, tag = "11")]
    pub kill: Option<TContainerKillRequest>,
    #[prost(message, optional, tag = "12")]
    pub wait: Option<TContainerWaitRequest>,
    #[prost(message, optional, tag = "13")]
    pub get: Option<TContainerGetRequest>,
    #[prost(message, optional, tag = "14")]
    pub update_from_spec: Option<TUpdateFromSpecRequest>,
    #[prost(message, optional, tag = "15")]
    pub version: Option<TVersionRequest>,

    #[prost(message, optional, tag = "20")]
    pub create_volume: Option<TVolumeCreateRequest>,
    #[prost(message, optional, tag = "21")]
    pub tune_volume: Option<TVolumeTuneRequest>,
    #[prost(message, optional, tag = "22")]
    pub link_volume: Option<TVolumeLinkRequest>,
    #[prost(message, optional, tag = "23")]
    pub unlink_volume: Option<TVolumeUnlinkRequest>,
    #[prost(message, optional, tag = "24")]
    pub list_volumes: Option<TVolumeListRequest>,

    #[prost(message, optional, tag = "30")]
    pub import_layer: Option<TLayerImportRequest>,
    #[prost(message, optional, tag = "31")]
    pub remove_layer: Option<TLayerRemoveRequest>,
    #[prost(message, optional, tag = "32")]
    pub list_layers: Option<TLayerListRequest>,

    #[prost(message, optional, tag = "40")]
    pub docker_image_status: Option<TDockerImageStatusRequest>,
    #[prost(message, optional, tag = "41")]
    pub list_docker_images: Option<TDockerImageListRequest>,
    #[prost(message, optional, tag = "42")]
    pub pull_docker_image: Option<TDockerImagePullRequest>,
    #[prost(message, optional, tag = "43")]
    pub remove_docker_image: Option<TDockerImageRemoveRequest>,
}

// ── Sub-responses ────────────────────────────────────────────────────

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TVersionResponse {
    #[prost(string, optional, tag = "1")]
    pub tag: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub revision: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TContainerListResponse {
    #[prost(string, repeated, tag = "1")]
    pub name: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TContainerGetPropertyResponse {
    #[prost(string, optional, tag = "1")]
    pub value: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TContainerGetValueResponse {
    #[prost(string, optional, tag = "1")]
    pub variable: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub value: Option<String>,
    #[prost(enumeration = "EError", optional, tag = "3")]
    pub error: Option<i32>,
    #[prost(string, optional, tag = "4")]
    pub error_msg: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TContainerGetListResponse {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(message, repeated, tag = "2")]
    pub keyval: Vec<TContainerGetValueResponse>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TContainerGetResponse {
    #[prost(message, repeated, tag = "1")]
    pub list: Vec<TContainerGetListResponse>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TContainerWaitResponse {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TVolumeListResponse {
    #[prost(message, repeated, tag = "1")]
    pub volumes: Vec<TVolumeDescription>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TLayerListResponse {
    #[prost(string, repeated, tag = "1")]
    pub layer: Vec<String>,
    #[prost(message, repeated, tag = "2")]
    pub layers: Vec<TLayerDescription>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TDockerImageStatusResponse {
    #[prost(message, optional, tag = "1")]
    pub image: Option<TDockerImage>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TDockerImageListResponse {
    #[prost(message, repeated, tag = "1")]
    pub images: Vec<TDockerImage>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TDockerImagePullResponse {
    #[prost(message, optional, tag = "1")]
    pub image: Option<TDockerImage>,
}

/// The response envelope.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TContainerResponse {
    #[prost(enumeration = "EError", optional, tag = "1")]
    pub error: Option<i32>,
    #[prost(string, optional, tag = "2")]
    pub error_msg: Option<String>,

    #[prost(message, optional, tag = "3")]
    pub list: Option<TContainerListResponse>,
    #[prost(message, optional, tag = "4")]
    pub get_property: Option<TContainerGetPropertyResponse>,
    #[prost(message, optional, tag = "5")]
    pub get: Option<TContainerGetResponse>,
    #[prost(message, optional, tag = "6")]
    pub wait: Option<TContainerWaitResponse>,
    #[prost(message, optional, tag = "7")]
    pub version: Option<TVersionResponse>,

    #[prost(message, optional, tag = "20")]
    pub volume: Option<TVolumeDescription>,
    #[prost(message, optional, tag = "21")]
    pub volume_list: Option<TVolumeListResponse>,

    #[prost(message, optional, tag = "30")]
    pub layers: Option<TLayerListResponse>,

    #[prost(message, optional, tag = "40")]
    pub docker_image_status: Option<TDockerImageStatusResponse>,
    #[prost(message, optional, tag = "41")]
    pub list_docker_images: Option<TDockerImageListResponse>,
    #[prost(message, optional, tag = "42")]
    pub pull_docker_image: Option<TDockerImagePullResponse>,
}

impl TContainerResponse {
    /// Decoded error code; unrecognized values collapse to `Unknown`.
    pub fn error_code(&self) -> EError {
        match self.error {
            None => EError::Success,
            Some(raw) => EError::try_from(raw).unwrap_or(EError::Unknown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_envelope_roundtrip() {
        let req = TContainerRequest {
            set_property: Some(TContainerSetPropertyRequest {
                name: Some("foo-1a2b".to_string()),
                property: Some("labels".to_string()),
                value: Some("LABEL.YXBw:dGVzdA;".to_string()),
            }),
            ..Default::default()
        };

        let buf = req.encode_to_vec();
        let decoded = TContainerRequest::decode(buf.as_slice()).unwrap();
        assert_eq!(decoded, req);
        assert!(decoded.create.is_none());
        assert_eq!(
            decoded.set_property.unwrap().property.as_deref(),
            Some("labels")
        );
    }

    #[test]
    fn test_error_code_default_is_success() {
        let resp = TContainerResponse::default();
        assert_eq!(resp.error_code(), EError::Success);
    }

    #[test]
    fn test_error_code_unknown_value() {
        let resp = TContainerResponse {
            error: Some(9999),
            ..Default::default()
        };
        assert_eq!(resp.error_code(), EError::Unknown);
    }

    #[test]
    fn test_error_code_known_value() {
        let resp = TContainerResponse {
            error: Some(EError::DockerImageNotFound as i32),
            error_msg: Some("no such image".to_string()),
            ..Default::default()
        };
        assert_eq!(resp.error_code(), EError::DockerImageNotFound);
    }
}
