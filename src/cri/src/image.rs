//! CRI ImageService mapping onto the backend docker-image API.

use std::sync::Arc;

use portoshim_client::rpc::TDockerImage;
use portoshim_client::PortoClient;
use tracing::debug;

use crate::config::ShimConfig;
use crate::cri_api::*;
use crate::error::{Result, ShimError};
use crate::registry::RegistryTable;

/// Porto-backed implementation of the CRI ImageService.
pub struct ImageMapper {
    config: Arc<ShimConfig>,
    registries: Arc<RegistryTable>,
}

/// Map one backend image to the CRI shape. Sizes pass through unscaled.
fn image_to_cri(img: &TDockerImage) -> Image {
    let id = img.id.clone().unwrap_or_default();
    let reference = img.full_name.clone().unwrap_or_else(|| id.clone());
    Image {
        id,
        repo_tags: img.tags.clone(),
        repo_digests: img.digests.clone(),
        size: img.size.unwrap_or(0),
        uid: None,
        username: String::new(),
        spec: Some(ImageSpec {
            image: reference,
            annotations: Default::default(),
        }),
        pinned: false,
    }
}

impl ImageMapper {
    pub fn new(config: Arc<ShimConfig>, registries: Arc<RegistryTable>) -> Self {
        ImageMapper { config, registries }
    }

    pub async fn list_images(
        &self,
        pc: &mut PortoClient,
        _req: ListImagesRequest,
    ) -> Result<ListImagesResponse> {
        let images = pc.list_docker_images("", "").await?;
        Ok(ListImagesResponse {
            images: images.iter().map(image_to_cri).collect(),
        })
    }

    pub async fn image_status(
        &self,
        pc: &mut PortoClient,
        req: ImageStatusRequest,
    ) -> Result<ImageStatusResponse> {
        let name = req.image.map(|spec| spec.image).unwrap_or_default();

        match pc.docker_image_status(&name, "").await {
            Ok(image) => Ok(ImageStatusResponse {
                image: Some(image_to_cri(&image)),
                info: Default::default(),
            }),
            // CRI treats an absent image as success with an empty response.
            Err(err) if err.is_docker_image_not_found() => Ok(ImageStatusResponse {
                image: None,
                info: Default::default(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn pull_image(
        &self,
        pc: &mut PortoClient,
        req: PullImageRequest,
    ) -> Result<PullImageResponse> {
        let name = req.image.map(|spec| spec.image).unwrap_or_default();
        if name.is_empty() {
            return Err(ShimError::InvalidArgument("image name required".to_string()));
        }

        let registry = self.registries.resolve(&name);
        let auth = req.auth.unwrap_or_default();
        // A preconfigured registry token wins over caller credentials.
        let token = if !registry.auth_token.is_empty() {
            registry.auth_token.clone()
        } else {
            auth.password
        };

        debug!(image = %name, registry = %registry.host, "pulling image");
        let image = pc
            .pull_docker_image(&name, "", &token, &registry.auth_path, &registry.auth_service)
            .await?;

        Ok(PullImageResponse {
            image_ref: image.id.unwrap_or_default(),
        })
    }

    pub async fn remove_image(
        &self,
        pc: &mut PortoClient,
        req: RemoveImageRequest,
    ) -> Result<RemoveImageResponse> {
        let name = req.image.map(|spec| spec.image).unwrap_or_default();
        pc.remove_docker_image(&name, "").await?;
        Ok(RemoveImageResponse {})
    }

    /// One statfs on the image store; no backend round-trip.
    pub async fn image_fs_info(&self, _req: ImageFsInfoRequest) -> Result<ImageFsInfoResponse> {
        let stat = nix::sys::statfs::statfs(&self.config.images_dir)
            .map_err(|err| ShimError::Io(err.into()))?;

        let used_bytes =
            (stat.blocks() as u64 - stat.blocks_free() as u64) * stat.block_size() as u64;
        let inodes_used = stat.files() as u64 - stat.files_free() as u64;

        Ok(ImageFsInfoResponse {
            image_filesystems: vec![FilesystemUsage {
                timestamp: chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0),
                fs_id: Some(FilesystemIdentifier {
                    mountpoint: self.config.images_dir.to_string_lossy().into_owned(),
                }),
                used_bytes: Some(UInt64Value { value: used_bytes }),
                inodes_used: Some(UInt64Value { value: inodes_used }),
            }],
        })
    }
}
