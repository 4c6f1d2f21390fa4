//! Runtime configuration and the production filesystem layout.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Runtime name reported in `Version` responses.
pub const RUNTIME_NAME: &str = "porto";

/// CRI API version string.
pub const API_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Image booted as the sandbox root process.
pub const PAUSE_IMAGE: &str = "k8s.gcr.io/pause:3.7";

/// Interface prefix handed to CNI; loopback + default attachment.
pub const IF_PREFIX: &str = "veth";

/// Default (first non-loopback) interface inside a pod.
pub const DEFAULT_IF_NAME: &str = "veth0";

/// Annotation domain for node-level resource knobs (`<domain>/net-tx`).
pub const RESOURCE_DOMAIN: &str = "yandex.net";

/// Everything the shim needs to know about its environment. Defaults match
/// the production layout; tests point the paths at temp directories.
#[derive(Debug, Clone)]
pub struct ShimConfig {
    /// CRI listener socket.
    pub socket_path: PathBuf,
    /// Backend daemon socket.
    pub porto_socket: PathBuf,
    /// One overlay root per sandbox and container lives under here.
    pub volumes_dir: PathBuf,
    /// Docker-format image store, statfs target for `ImageFsInfo`.
    pub images_dir: PathBuf,
    /// Network namespace handles.
    pub netns_dir: PathBuf,
    /// CNI plugin configuration.
    pub cni_conf_dir: PathBuf,
    /// CNI plugin binaries.
    pub cni_bin_dir: PathBuf,
    /// Per-registry auth token files, read once at boot.
    pub auth_tokens_dir: PathBuf,
    /// Log-line framer binary exposed inside every container.
    pub logshim_path: PathBuf,
    /// Address of the exec streaming endpoint.
    pub streaming_addr: SocketAddr,
    /// Image used for pod sandboxes.
    pub pause_image: String,
}

impl Default for ShimConfig {
    fn default() -> Self {
        ShimConfig {
            socket_path: "/run/portoshim.sock".into(),
            porto_socket: "/run/portod.socket".into(),
            volumes_dir: "/place/portoshim_volumes".into(),
            images_dir: "/place/porto_docker".into(),
            netns_dir: "/var/run/netns".into(),
            cni_conf_dir: "/etc/cni/net.d".into(),
            cni_bin_dir: "/opt/cni/bin".into(),
            auth_tokens_dir: "/var/run/portoshim/auth_tokens".into(),
            logshim_path: "/usr/sbin/logshim".into(),
            streaming_addr: "127.0.0.1:10350".parse().expect("static addr"),
            pause_image: PAUSE_IMAGE.to_string(),
        }
    }
}

impl ShimConfig {
    /// Host-side overlay root of a sandbox or container.
    pub fn root_path(&self, id: &str) -> PathBuf {
        self.volumes_dir.join(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_path_nests_container_under_pod() {
        let config = ShimConfig::default();
        assert_eq!(
            config.root_path("foo-1a2b/bar-3c4d"),
            PathBuf::from("/place/portoshim_volumes/foo-1a2b/bar-3c4d")
        );
    }
}
