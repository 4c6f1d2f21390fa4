//! Async client for the daemon socket.
//!
//! One `PortoClient` owns one connection. The daemon allows at most one
//! outstanding request per connection, so every call takes `&mut self` and
//! completes the full round-trip before returning.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use prost::Message;
use tokio::net::UnixStream;
use tracing::trace;

use crate::error::{PortoError, Result};
use crate::framing::{recv_data, send_data};
use crate::rpc::*;

/// A volume as reported by the daemon.
#[derive(Debug, Clone, Default)]
pub struct VolumeDescription {
    pub path: String,
    pub properties: HashMap<String, String>,
    pub containers: Vec<String>,
}

impl From<TVolumeDescription> for VolumeDescription {
    fn from(v: TVolumeDescription) -> Self {
        VolumeDescription {
            path: v.path.unwrap_or_default(),
            properties: v
                .properties
                .into_iter()
                .map(|p| (p.name.unwrap_or_default(), p.value.unwrap_or_default()))
                .collect(),
            containers: v.containers,
        }
    }
}

/// One property value from a bulk `get`.
#[derive(Debug, Clone, Default)]
pub struct PropertyValue {
    pub value: String,
    pub error: i32,
    pub error_msg: String,
}

/// Connection to the daemon.
pub struct PortoClient {
    stream: UnixStream,
}

impl PortoClient {
    /// Dial the daemon socket. Dropping the client closes the connection,
    /// which also reaps any weak containers created through it.
    pub async fn connect(socket: impl AsRef<Path>) -> Result<Self> {
        let stream = UnixStream::connect(socket.as_ref()).await?;
        Ok(PortoClient { stream })
    }

    async fn call(&mut self, req: TContainerRequest) -> Result<TContainerResponse> {
        let buf = req.encode_to_vec();
        send_data(&mut self.stream, &buf).await?;

        let payload = recv_data(&mut self.stream).await?;
        let resp = TContainerResponse::decode(payload.as_slice())?;

        let code = resp.error_code();
        trace!(code = code.as_str_name(), "porto round-trip");
        if code != EError::Success {
            return Err(PortoError::Backend {
                code,
                message: resp.error_msg.unwrap_or_default(),
            });
        }
        Ok(resp)
    }

    fn timeout_ms(timeout: Option<Duration>) -> Result<Option<u32>> {
        match timeout {
            None => Ok(None),
            Some(t) => {
                let ms = t.as_millis();
                if ms > u128::from(u32::MAX) {
                    return Err(PortoError::TimeoutOverflow);
                }
                Ok(Some(ms as u32))
            }
        }
    }

    // ── Container API ────────────────────────────────────────────────

    pub async fn get_version(&mut self) -> Result<(String, String)> {
        let resp = self
            .call(TContainerRequest {
                version: Some(TVersionRequest {}),
                ..Default::default()
            })
            .await?;
        let version = resp.version.unwrap_or_default();
        Ok((
            version.tag.unwrap_or_default(),
            version.revision.unwrap_or_default(),
        ))
    }

    pub async fn create(&mut self, name: &str) -> Result<()> {
        self.call(TContainerRequest {
            create: Some(TContainerCreateRequest {
                name: Some(name.to_string()),
            }),
            ..Default::default()
        })
        .await?;
        Ok(())
    }

    /// Create a container that the daemon destroys automatically when this
    /// connection closes.
    pub async fn create_weak(&mut self, name: &str) -> Result<()> {
        self.call(TContainerRequest {
            create_weak: Some(TContainerCreateRequest {
                name: Some(name.to_string()),
            }),
            ..Default::default()
        })
        .await?;
        Ok(())
    }

    pub async fn destroy(&mut self, name: &str) -> Result<()> {
        self.call(TContainerRequest {
            destroy: Some(TContainerDestroyRequest {
                name: Some(name.to_string()),
            }),
            ..Default::default()
        })
        .await?;
        Ok(())
    }

    pub async fn start(&mut self, name: &str) -> Result<()> {
        self.call(TContainerRequest {
            start: Some(TContainerStartRequest {
                name: Some(name.to_string()),
            }),
            ..Default::default()
        })
        .await?;
        Ok(())
    }

    pub async fn stop(&mut self, name: &str, timeout: Option<Duration>) -> Result<()> {
        self.call(TContainerRequest {
            stop: Some(TContainerStopRequest {
                name: Some(name.to_string()),
                timeout_ms: Self::timeout_ms(timeout)?,
            }),
            ..Default::default()
        })
        .await?;
        Ok(())
    }

    pub async fn kill(&mut self, name: &str, sig: i32) -> Result<()> {
        self.call(TContainerRequest {
            kill: Some(TContainerKillRequest {
                name: Some(name.to_string()),
                sig: Some(sig),
            }),
            ..Default::default()
        })
        .await?;
        Ok(())
    }

    pub async fn pause(&mut self, name: &str) -> Result<()> {
        self.call(TContainerRequest {
            pause: Some(TContainerPauseRequest {
                name: Some(name.to_string()),
            }),
            ..Default::default()
        })
        .await?;
        Ok(())
    }

    pub async fn resume(&mut self, name: &str) -> Result<()> {
        self.call(TContainerRequest {
            resume: Some(TContainerResumeRequest {
                name: Some(name.to_string()),
            }),
            ..Default::default()
        })
        .await?;
        Ok(())
    }

    /// Block until one of `names` exits; returns its name. `None` timeout
    /// waits forever.
    pub async fn wait(&mut self, names: &[String], timeout: Option<Duration>) -> Result<String> {
        let resp = self
            .call(TContainerRequest {
                wait: Some(TContainerWaitRequest {
                    name: names.to_vec(),
                    timeout_ms: Self::timeout_ms(timeout)?,
                }),
                ..Default::default()
            })
            .await?;
        Ok(resp.wait.and_then(|w| w.name).unwrap_or_default())
    }

    /// List container names matching `mask`; an empty mask lists everything.
    pub async fn list(&mut self, mask: &str) -> Result<Vec<String>> {
        let resp = self
            .call(TContainerRequest {
                list: Some(TContainerListRequest {
                    mask: opt(mask),
                }),
                ..Default::default()
            })
            .await?;
        Ok(resp.list.map(|l| l.name).unwrap_or_default())
    }

    /// Bulk property read: container → key → value.
    pub async fn get(
        &mut self,
        names: &[String],
        variables: &[String],
    ) -> Result<HashMap<String, HashMap<String, PropertyValue>>> {
        let resp = self
            .call(TContainerRequest {
                get: Some(TContainerGetRequest {
                    name: names.to_vec(),
                    variable: variables.to_vec(),
                    nonblock: Some(false),
                }),
                ..Default::default()
            })
            .await?;

        let mut out: HashMap<String, HashMap<String, PropertyValue>> = HashMap::new();
        for item in resp.get.map(|g| g.list).unwrap_or_default() {
            let name = item.name.unwrap_or_default();
            let entry = out.entry(name).or_default();
            for kv in item.keyval {
                entry.insert(
                    kv.variable.unwrap_or_default(),
                    PropertyValue {
                        value: kv.value.unwrap_or_default(),
                        error: kv.error.unwrap_or_default(),
                        error_msg: kv.error_msg.unwrap_or_default(),
                    },
                );
            }
        }
        Ok(out)
    }

    pub async fn get_property(&mut self, name: &str, property: &str) -> Result<String> {
        let resp = self
            .call(TContainerRequest {
                get_property: Some(TContainerGetPropertyRequest {
                    name: Some(name.to_string()),
                    property: Some(property.to_string()),
                }),
                ..Default::default()
            })
            .await?;
        Ok(resp.get_property.and_then(|p| p.value).unwrap_or_default())
    }

    pub async fn set_property(&mut self, name: &str, property: &str, value: &str) -> Result<()> {
        self.call(TContainerRequest {
            set_property: Some(TContainerSetPropertyRequest {
                name: Some(name.to_string()),
                property: Some(property.to_string()),
                value: Some(value.to_string()),
            }),
            ..Default::default()
        })
        .await?;
        Ok(())
    }

    /// Apply a structured spec update (environment vector, command argv).
    pub async fn update_from_spec(&mut self, spec: TContainerSpec) -> Result<()> {
        self.call(TContainerRequest {
            update_from_spec: Some(TUpdateFromSpecRequest {
                container: Some(spec),
            }),
            ..Default::default()
        })
        .await?;
        Ok(())
    }

    // ── Volume API ───────────────────────────────────────────────────

    pub async fn create_volume(
        &mut self,
        path: &str,
        config: &HashMap<String, String>,
    ) -> Result<VolumeDescription> {
        let resp = self
            .call(TContainerRequest {
                create_volume: Some(TVolumeCreateRequest {
                    path: opt(path),
                    properties: volume_properties(config),
                }),
                ..Default::default()
            })
            .await?;
        Ok(resp.volume.map(VolumeDescription::from).unwrap_or_default())
    }

    pub async fn tune_volume(&mut self, path: &str, config: &HashMap<String, String>) -> Result<()> {
        self.call(TContainerRequest {
            tune_volume: Some(TVolumeTuneRequest {
                path: Some(path.to_string()),
                properties: volume_properties(config),
            }),
            ..Default::default()
        })
        .await?;
        Ok(())
    }

    pub async fn link_volume(
        &mut self,
        path: &str,
        container: &str,
        target: &str,
        required: bool,
        read_only: bool,
    ) -> Result<()> {
        self.call(TContainerRequest {
            link_volume: Some(TVolumeLinkRequest {
                path: Some(path.to_string()),
                container: Some(container.to_string()),
                target: opt(target),
                required: Some(required),
                read_only: Some(read_only),
            }),
            ..Default::default()
        })
        .await?;
        Ok(())
    }

    pub async fn unlink_volume(
        &mut self,
        path: &str,
        container: &str,
        target: &str,
        strict: bool,
    ) -> Result<()> {
        self.call(TContainerRequest {
            unlink_volume: Some(TVolumeUnlinkRequest {
                path: Some(path.to_string()),
                container: opt(container),
                target: opt(target),
                strict: Some(strict),
            }),
            ..Default::default()
        })
        .await?;
        Ok(())
    }

    pub async fn list_volumes(
        &mut self,
        path: &str,
        container: &str,
    ) -> Result<Vec<VolumeDescription>> {
        let resp = self
            .call(TContainerRequest {
                list_volumes: Some(TVolumeListRequest {
                    path: opt(path),
                    container: opt(container),
                }),
                ..Default::default()
            })
            .await?;
        Ok(resp
            .volume_list
            .map(|l| l.volumes.into_iter().map(VolumeDescription::from).collect())
            .unwrap_or_default())
    }

    // ── Layer API ────────────────────────────────────────────────────

    pub async fn import_layer(
        &mut self,
        layer: &str,
        tarball: &str,
        merge: bool,
        place: &str,
        private_value: &str,
    ) -> Result<()> {
        self.call(TContainerRequest {
            import_layer: Some(TLayerImportRequest {
                layer: Some(layer.to_string()),
                tarball: Some(tarball.to_string()),
                merge: Some(merge),
                place: opt(place),
                private_value: Some(private_value.to_string()),
            }),
            ..Default::default()
        })
        .await?;
        Ok(())
    }

    pub async fn remove_layer(&mut self, layer: &str, place: &str) -> Result<()> {
        self.call(TContainerRequest {
            remove_layer: Some(TLayerRemoveRequest {
                layer: Some(layer.to_string()),
                place: opt(place),
            }),
            ..Default::default()
        })
        .await?;
        Ok(())
    }

    pub async fn list_layers(&mut self, place: &str, mask: &str) -> Result<Vec<TLayerDescription>> {
        let resp = self
            .call(TContainerRequest {
                list_layers: Some(TLayerListRequest {
                    place: opt(place),
                    mask: opt(mask),
                }),
                ..Default::default()
            })
            .await?;
        Ok(resp.layers.map(|l| l.layers).unwrap_or_default())
    }

    // ── Docker image API ─────────────────────────────────────────────

    pub async fn docker_image_status(&mut self, name: &str, place: &str) -> Result<TDockerImage> {
        let resp = self
            .call(TContainerRequest {
                docker_image_status: Some(TDockerImageStatusRequest {
                    name: Some(name.to_string()),
                    place: opt(place),
                }),
                ..Default::default()
            })
            .await?;
        Ok(resp
            .docker_image_status
            .and_then(|s| s.image)
            .unwrap_or_default())
    }

    pub async fn list_docker_images(&mut self, place: &str, mask: &str) -> Result<Vec<TDockerImage>> {
        let resp = self
            .call(TContainerRequest {
                list_docker_images: Some(TDockerImageListRequest {
                    place: opt(place),
                    mask: opt(mask),
                }),
                ..Default::default()
            })
            .await?;
        Ok(resp.list_docker_images.map(|l| l.images).unwrap_or_default())
    }

    pub async fn pull_docker_image(
        &mut self,
        name: &str,
        place: &str,
        auth_token: &str,
        auth_path: &str,
        auth_service: &str,
    ) -> Result<TDockerImage> {
        let resp = self
            .call(TContainerRequest {
                pull_docker_image: Some(TDockerImagePullRequest {
                    name: Some(name.to_string()),
                    place: opt(place),
                    auth_token: opt(auth_token),
                    auth_path: opt(auth_path),
                    auth_service: opt(auth_service),
                }),
                ..Default::default()
            })
            .await?;
        Ok(resp
            .pull_docker_image
            .and_then(|p| p.image)
            .unwrap_or_default())
    }

    pub async fn remove_docker_image(&mut self, name: &str, place: &str) -> Result<()> {
        self.call(TContainerRequest {
            remove_docker_image: Some(TDockerImageRemoveRequest {
                name: Some(name.to_string()),
                place: opt(place),
            }),
            ..Default::default()
        })
        .await?;
        Ok(())
    }
}

fn opt(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn volume_properties(config: &HashMap<String, String>) -> Vec<TVolumeProperty> {
    config
        .iter()
        .map(|(k, v)| TVolumeProperty {
            name: Some(k.clone()),
            value: Some(v.clone()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_ms_encoding() {
        assert_eq!(PortoClient::timeout_ms(None).unwrap(), None);
        assert_eq!(
            PortoClient::timeout_ms(Some(Duration::from_secs(5))).unwrap(),
            Some(5000)
        );
        assert!(matches!(
            PortoClient::timeout_ms(Some(Duration::from_millis(u64::from(u32::MAX) + 1))),
            Err(PortoError::TimeoutOverflow)
        ));
    }

    #[test]
    fn test_opt_drops_empty() {
        assert_eq!(opt(""), None);
        assert_eq!(opt("x"), Some("x".to_string()));
    }

    #[test]
    fn test_volume_description_from_wire() {
        let wire = TVolumeDescription {
            path: Some("/place/volumes/a".to_string()),
            properties: vec![TVolumeProperty {
                name: Some("backend".to_string()),
                value: Some("overlay".to_string()),
            }],
            containers: vec!["a".to_string()],
        };
        let desc = VolumeDescription::from(wire);
        assert_eq!(desc.path, "/place/volumes/a");
        assert_eq!(desc.properties.get("backend").unwrap(), "overlay");
        assert_eq!(desc.containers, vec!["a"]);
    }
}
