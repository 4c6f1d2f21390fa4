//! In-process mock of the porto daemon for integration tests.
//!
//! Speaks the real framed protocol over a Unix socket in a temp directory,
//! records every call it serves, and keeps a tiny container/image model so
//! the mappers can be exercised end to end without a real daemon.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use portoshim_client::framing::{recv_data, send_data};
use portoshim_client::rpc::*;
use portoshim_client::PortoClient;
use prost::Message;
use tempfile::TempDir;
use tokio::net::UnixListener;

/// One mock container record.
#[derive(Debug, Clone, Default)]
pub struct MockContainer {
    pub state: String,
    pub properties: HashMap<String, String>,
    pub command_argv: Vec<String>,
    pub weak: bool,
}

/// Mock daemon state, shared with the test body.
#[derive(Debug, Default)]
pub struct MockState {
    /// Human-readable log of every served call, in order.
    pub calls: Vec<String>,
    pub containers: HashMap<String, MockContainer>,
    pub images: HashMap<String, TDockerImage>,
    /// Bind/overlay volumes registered through `CreateVolume`.
    pub volumes: Vec<(String, HashMap<String, String>)>,
    /// Calls forced to fail: call kind → error code.
    pub fail: HashMap<&'static str, EError>,
    /// Properties stamped onto every newly created container.
    pub default_properties: HashMap<String, String>,
}

impl MockState {
    fn check_fail(&self, kind: &'static str) -> Option<EError> {
        self.fail.get(kind).copied()
    }
}

/// Handle to the running mock backend.
pub struct MockBackend {
    pub state: Arc<Mutex<MockState>>,
    pub socket: PathBuf,
    _dir: TempDir,
}

fn error_response(code: EError, msg: &str) -> TContainerResponse {
    TContainerResponse {
        error: Some(code as i32),
        error_msg: Some(msg.to_string()),
        ..Default::default()
    }
}

fn ok_response() -> TContainerResponse {
    TContainerResponse {
        error: Some(EError::Success as i32),
        ..Default::default()
    }
}

fn lookup_indexed_label(raw: &str, key: &str) -> Option<String> {
    raw.split(';').find_map(|pair| {
        let (k, v) = pair.split_once(':')?;
        if k.trim() == key {
            Some(v.trim().to_string())
        } else {
            None
        }
    })
}

/// Merge semantics of the backend `labels` property: existing keys are
/// replaced, new ones appended.
fn merge_labels(existing: &str, update: &str) -> String {
    let mut entries: Vec<(String, String)> = existing
        .split(';')
        .filter_map(|p| p.split_once(':'))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    for (k, v) in update.split(';').filter_map(|p| p.split_once(':')) {
        if let Some(entry) = entries.iter_mut().find(|(ek, _)| ek == k) {
            entry.1 = v.to_string();
        } else {
            entries.push((k.to_string(), v.to_string()));
        }
    }
    let mut out = String::new();
    for (k, v) in entries {
        out.push_str(&k);
        out.push(':');
        out.push_str(&v);
        out.push(';');
    }
    out
}

fn handle_request(state: &Mutex<MockState>, req: TContainerRequest) -> TContainerResponse {
    let mut st = state.lock().expect("mock state poisoned");

    if let Some(create) = &req.create {
        let name = create.name.clone().unwrap_or_default();
        st.calls.push(format!("Create({})", name));
        if let Some(code) = st.check_fail("Create") {
            return error_response(code, "forced failure");
        }
        if st.containers.contains_key(&name) {
            return error_response(EError::ContainerAlreadyExists, &name);
        }
        let container = MockContainer {
            state: "stopped".to_string(),
            properties: st.default_properties.clone(),
            ..Default::default()
        };
        st.containers.insert(name, container);
        return ok_response();
    }

    if let Some(create) = &req.create_weak {
        let name = create.name.clone().unwrap_or_default();
        st.calls.push(format!("CreateWeak({})", name));
        if let Some(code) = st.check_fail("CreateWeak") {
            return error_response(code, "forced failure");
        }
        let container = MockContainer {
            state: "stopped".to_string(),
            properties: st.default_properties.clone(),
            weak: true,
            ..Default::default()
        };
        st.containers.insert(name, container);
        return ok_response();
    }

    if let Some(destroy) = &req.destroy {
        let name = destroy.name.clone().unwrap_or_default();
        st.calls.push(format!("Destroy({})", name));
        if st.containers.remove(&name).is_none() {
            return error_response(EError::ContainerDoesNotExist, &name);
        }
        let prefix = format!("{}/", name);
        st.containers.retain(|id, _| !id.starts_with(&prefix));
        return ok_response();
    }

    if let Some(start) = &req.start {
        let name = start.name.clone().unwrap_or_default();
        st.calls.push(format!("Start({})", name));
        if let Some(code) = st.check_fail("Start") {
            return error_response(code, "forced failure");
        }
        match st.containers.get_mut(&name) {
            Some(container) => {
                container.state = "running".to_string();
                ok_response()
            }
            None => error_response(EError::ContainerDoesNotExist, &name),
        }
    } else if let Some(stop) = &req.stop {
        let name = stop.name.clone().unwrap_or_default();
        st.calls.push("Stop".to_string());
        match st.containers.get_mut(&name) {
            Some(container) => {
                container.state = "stopped".to_string();
                ok_response()
            }
            None => error_response(EError::ContainerDoesNotExist, &name),
        }
    } else if let Some(kill) = &req.kill {
        let name = kill.name.clone().unwrap_or_default();
        st.calls
            .push(format!("Kill({})", kill.sig.unwrap_or_default()));
        match st.containers.get_mut(&name) {
            Some(container) => {
                container.state = "dead".to_string();
                ok_response()
            }
            None => error_response(EError::ContainerDoesNotExist, &name),
        }
    } else if let Some(wait) = &req.wait {
        st.calls.push("Wait".to_string());
        let name = wait.name.first().cloned().unwrap_or_default();
        if let Some(container) = st.containers.get_mut(&name) {
            container.state = "dead".to_string();
        }
        TContainerResponse {
            error: Some(EError::Success as i32),
            wait: Some(TContainerWaitResponse { name: Some(name) }),
            ..Default::default()
        }
    } else if let Some(get_prop) = &req.get_property {
        let name = get_prop.name.clone().unwrap_or_default();
        let property = get_prop.property.clone().unwrap_or_default();
        st.calls.push(format!("GetProperty({})", property));

        let Some(container) = st.containers.get(&name) else {
            return error_response(EError::ContainerDoesNotExist, &name);
        };

        let value = if property == "state" {
            Some(container.state.clone())
        } else if let Some(key) = property
            .strip_prefix("labels[")
            .and_then(|rest| rest.strip_suffix(']'))
        {
            let raw = container.properties.get("labels").cloned().unwrap_or_default();
            match lookup_indexed_label(&raw, key) {
                Some(value) => Some(value),
                None => return error_response(EError::LabelNotFound, key),
            }
        } else {
            container.properties.get(&property).cloned()
        };

        // Built-in daemon defaults for properties no test has set.
        let value = value.or_else(|| match property.as_str() {
            "net" => Some("inherited".to_string()),
            "labels" | "env" => Some(String::new()),
            _ => None,
        });

        match value {
            Some(value) => TContainerResponse {
                error: Some(EError::Success as i32),
                get_property: Some(TContainerGetPropertyResponse { value: Some(value) }),
                ..Default::default()
            },
            None => error_response(EError::InvalidProperty, &property),
        }
    } else if let Some(set_prop) = &req.set_property {
        let name = set_prop.name.clone().unwrap_or_default();
        let property = set_prop.property.clone().unwrap_or_default();
        let value = set_prop.value.clone().unwrap_or_default();
        st.calls.push(format!("SetProperty({})", property));
        if let Some(code) = st.check_fail("SetProperty") {
            return error_response(code, "forced failure");
        }

        match st.containers.get_mut(&name) {
            Some(container) => {
                if property == "labels" {
                    let existing =
                        container.properties.get("labels").cloned().unwrap_or_default();
                    container
                        .properties
                        .insert("labels".to_string(), merge_labels(&existing, &value));
                } else {
                    container.properties.insert(property, value);
                }
                ok_response()
            }
            None => error_response(EError::ContainerDoesNotExist, &name),
        }
    } else if let Some(update) = &req.update_from_spec {
        let spec = update.container.clone().unwrap_or_default();
        let name = spec.name.clone().unwrap_or_default();

        let kind = if spec.env.is_some() { "env" } else { "command" };
        st.calls.push(format!("UpdateFromSpec({})", kind));

        let Some(container) = st.containers.get_mut(&name) else {
            return error_response(EError::ContainerDoesNotExist, &name);
        };
        if let Some(env) = &spec.env {
            let joined: Vec<String> = env
                .var
                .iter()
                .map(|v| {
                    format!(
                        "{}={}",
                        v.name.clone().unwrap_or_default(),
                        v.value.clone().unwrap_or_default()
                    )
                })
                .collect();
            container
                .properties
                .insert("env".to_string(), joined.join(";"));
        }
        if let Some(argv) = &spec.command_argv {
            container.command_argv = argv.argv.clone();
        }
        ok_response()
    } else if let Some(list) = &req.list {
        st.calls.push("List".to_string());
        let mask = list.mask.clone().unwrap_or_default();
        let mut names: Vec<String> = st
            .containers
            .keys()
            .filter(|id| match mask.as_str() {
                "" => true,
                "*" => !id.contains('/'),
                mask => {
                    if let Some(pod) = mask.strip_suffix("/***") {
                        id.starts_with(&format!("{}/", pod))
                    } else {
                        id.as_str() == mask
                    }
                }
            })
            .cloned()
            .collect();
        names.sort();
        TContainerResponse {
            error: Some(EError::Success as i32),
            list: Some(TContainerListResponse { name: names }),
            ..Default::default()
        }
    } else if let Some(create_volume) = &req.create_volume {
        st.calls.push("CreateVolume".to_string());
        if let Some(code) = st.check_fail("CreateVolume") {
            return error_response(code, "forced failure");
        }
        let props: HashMap<String, String> = create_volume
            .properties
            .iter()
            .map(|p| {
                (
                    p.name.clone().unwrap_or_default(),
                    p.value.clone().unwrap_or_default(),
                )
            })
            .collect();
        let path = create_volume
            .path
            .clone()
            .filter(|p| !p.is_empty())
            .or_else(|| props.get("storage").cloned())
            .unwrap_or_default();

        if st.volumes.iter().any(|(vp, _)| *vp == path) {
            return error_response(EError::VolumeAlreadyExists, &path);
        }
        st.volumes.push((path.clone(), props.clone()));

        TContainerResponse {
            error: Some(EError::Success as i32),
            volume: Some(TVolumeDescription {
                path: Some(path),
                properties: create_volume.properties.clone(),
                containers: props.get("containers").cloned().into_iter().collect(),
            }),
            ..Default::default()
        }
    } else if let Some(link) = &req.link_volume {
        st.calls.push(format!(
            "LinkVolume({})",
            link.target.clone().unwrap_or_default()
        ));
        if let Some(code) = st.check_fail("LinkVolume") {
            return error_response(code, "forced failure");
        }
        ok_response()
    } else if let Some(_unlink) = &req.unlink_volume {
        st.calls.push("UnlinkVolume".to_string());
        if let Some(code) = st.check_fail("UnlinkVolume") {
            return error_response(code, "forced failure");
        }
        ok_response()
    } else if let Some(list_volumes) = &req.list_volumes {
        st.calls.push("ListVolumes".to_string());
        let path = list_volumes.path.clone().unwrap_or_default();
        let volumes: Vec<TVolumeDescription> = st
            .volumes
            .iter()
            .filter(|(vp, _)| path.is_empty() || *vp == path)
            .map(|(vp, props)| TVolumeDescription {
                path: Some(vp.clone()),
                properties: props
                    .iter()
                    .map(|(k, v)| TVolumeProperty {
                        name: Some(k.clone()),
                        value: Some(v.clone()),
                    })
                    .collect(),
                containers: vec![],
            })
            .collect();
        TContainerResponse {
            error: Some(EError::Success as i32),
            volume_list: Some(TVolumeListResponse { volumes }),
            ..Default::default()
        }
    } else if let Some(status) = &req.docker_image_status {
        let name = status.name.clone().unwrap_or_default();
        st.calls.push("DockerImageStatus".to_string());
        match st.images.get(&name) {
            Some(image) => TContainerResponse {
                error: Some(EError::Success as i32),
                docker_image_status: Some(TDockerImageStatusResponse {
                    image: Some(image.clone()),
                }),
                ..Default::default()
            },
            None => error_response(EError::DockerImageNotFound, &name),
        }
    } else if let Some(_list_images) = &req.list_docker_images {
        st.calls.push("ListDockerImages".to_string());
        let mut images: Vec<TDockerImage> = st.images.values().cloned().collect();
        images.sort_by_key(|i| i.id.clone());
        TContainerResponse {
            error: Some(EError::Success as i32),
            list_docker_images: Some(TDockerImageListResponse { images }),
            ..Default::default()
        }
    } else if let Some(pull) = &req.pull_docker_image {
        let name = pull.name.clone().unwrap_or_default();
        st.calls.push(format!(
            "PullDockerImage({},token={},path={},service={})",
            name,
            pull.auth_token.clone().unwrap_or_default(),
            pull.auth_path.clone().unwrap_or_default(),
            pull.auth_service.clone().unwrap_or_default(),
        ));
        let image = TDockerImage {
            id: Some(format!("sha256:{}", name.replace(['/', ':'], "-"))),
            tags: vec![name.clone()],
            digests: vec![],
            size: Some(4),
            config: Some(TDockerImageConfig {
                cmd: vec!["/pause".to_string()],
                env: vec!["PATH=/usr/bin:/bin".to_string()],
            }),
            full_name: Some(name.clone()),
        };
        st.images.insert(name, image.clone());
        TContainerResponse {
            error: Some(EError::Success as i32),
            pull_docker_image: Some(TDockerImagePullResponse { image: Some(image) }),
            ..Default::default()
        }
    } else if let Some(remove) = &req.remove_docker_image {
        let name = remove.name.clone().unwrap_or_default();
        st.calls.push("RemoveDockerImage".to_string());
        if st.images.remove(&name).is_none() {
            return error_response(EError::DockerImageNotFound, &name);
        }
        ok_response()
    } else if req.version.is_some() {
        st.calls.push("GetVersion".to_string());
        if let Some(code) = st.check_fail("GetVersion") {
            return error_response(code, "forced failure");
        }
        TContainerResponse {
            error: Some(EError::Success as i32),
            version: Some(TVersionResponse {
                tag: Some("5.4.1".to_string()),
                revision: Some("f00dfeed".to_string()),
            }),
            ..Default::default()
        }
    } else {
        error_response(EError::InvalidMethod, "unhandled request")
    }
}

impl MockBackend {
    /// Start the mock on a fresh socket and return a handle to it.
    pub async fn start() -> MockBackend {
        let dir = TempDir::new().expect("mock tempdir");
        let socket = dir.path().join("portod.socket");
        let listener = UnixListener::bind(&socket).expect("bind mock socket");
        let state = Arc::new(Mutex::new(MockState::default()));

        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let conn_state = accept_state.clone();
                tokio::spawn(async move {
                    loop {
                        let payload = match recv_data(&mut stream).await {
                            Ok(payload) => payload,
                            Err(_) => break,
                        };
                        let Ok(req) = TContainerRequest::decode(payload.as_slice()) else {
                            break;
                        };
                        let resp = handle_request(&conn_state, req);
                        if send_data(&mut stream, &resp.encode_to_vec()).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        MockBackend {
            state,
            socket,
            _dir: dir,
        }
    }

    pub async fn connect(&self) -> PortoClient {
        PortoClient::connect(&self.socket)
            .await
            .expect("connect to mock backend")
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().expect("mock state poisoned").calls.clone()
    }

    /// Preset an image in the mock store.
    pub fn add_image(&self, name: &str, image: TDockerImage) {
        self.state
            .lock()
            .expect("mock state poisoned")
            .images
            .insert(name.to_string(), image);
    }

    /// Preset a container with properties.
    pub fn add_container(&self, id: &str, state: &str, properties: &[(&str, &str)]) {
        let container = MockContainer {
            state: state.to_string(),
            properties: properties
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        };
        self.state
            .lock()
            .expect("mock state poisoned")
            .containers
            .insert(id.to_string(), container);
    }

    pub fn fail(&self, kind: &'static str, code: EError) {
        self.state
            .lock()
            .expect("mock state poisoned")
            .fail
            .insert(kind, code);
    }
}

/// Assert that calls starting with each `expected` entry appear in order
/// (not necessarily contiguously) within `calls`.
pub fn assert_call_order(calls: &[String], expected: &[&str]) {
    let mut cursor = calls.iter();
    for want in expected {
        assert!(
            cursor.any(|call| call.starts_with(want)),
            "call {:?} missing or out of order; recorded calls: {:?}",
            want,
            calls
        );
    }
}

/// Build a shim config pointing every path at a fresh temp directory.
/// The returned guard keeps the directories alive.
pub fn test_config(mock: &MockBackend) -> (std::sync::Arc<portoshim_cri::config::ShimConfig>, TempDir) {
    let dir = TempDir::new().expect("config tempdir");
    let volumes_dir = dir.path().join("volumes");
    let images_dir = dir.path().join("images");
    let auth_tokens_dir = dir.path().join("auth_tokens");
    std::fs::create_dir_all(&volumes_dir).unwrap();
    std::fs::create_dir_all(&images_dir).unwrap();
    std::fs::create_dir_all(&auth_tokens_dir).unwrap();

    let config = portoshim_cri::config::ShimConfig {
        socket_path: dir.path().join("portoshim.sock"),
        porto_socket: mock.socket.clone(),
        volumes_dir,
        images_dir,
        netns_dir: dir.path().join("netns"),
        cni_conf_dir: dir.path().join("cni/net.d"),
        cni_bin_dir: dir.path().join("cni/bin"),
        auth_tokens_dir,
        ..Default::default()
    };
    (std::sync::Arc::new(config), dir)
}

/// Network provider that records attach/detach calls and hands out fixed
/// addresses, standing in for the CNI chain.
#[derive(Default)]
pub struct FakeNetwork {
    pub attached: Mutex<Vec<String>>,
    pub detached: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl portoshim_cri::cni::SandboxNetwork for FakeNetwork {
    async fn attach(
        &self,
        id: &str,
        _annotations: &HashMap<String, String>,
    ) -> Result<portoshim_cri::cni::NetworkAttachment, portoshim_cri::error::ShimError> {
        self.attached.lock().unwrap().push(id.to_string());
        Ok(portoshim_cri::cni::NetworkAttachment {
            netns_name: id.to_string(),
            addresses: vec![
                "veth0 10.88.0.5".to_string(),
                "veth0 fd00::5".to_string(),
            ],
        })
    }

    async fn detach(
        &self,
        id: &str,
        _netns_name: &str,
    ) -> Result<(), portoshim_cri::error::ShimError> {
        self.detached.lock().unwrap().push(id.to_string());
        Ok(())
    }
}

/// A pause image the sandbox bring-up can resolve.
pub fn pause_image() -> TDockerImage {
    TDockerImage {
        id: Some("sha256:pause".to_string()),
        tags: vec!["k8s.gcr.io/pause:3.7".to_string()],
        digests: vec!["k8s.gcr.io/pause@sha256:deadbeef".to_string()],
        size: Some(4),
        config: Some(TDockerImageConfig {
            cmd: vec!["/pause".to_string()],
            env: vec!["PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string()],
        }),
        full_name: Some("k8s.gcr.io/pause:3.7".to_string()),
    }
}
