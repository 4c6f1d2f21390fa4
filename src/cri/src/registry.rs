//! Known image registries and their authentication material.
//!
//! The table is built once at boot: entries with a token file on disk get
//! the token materialized (a missing file means an empty token), and the
//! result is immutable for the life of the process.

use std::collections::HashMap;
use std::io;
use std::path::Path;

/// Registry used when an image name carries no hostname.
pub const DEFAULT_DOCKER_REGISTRY: &str = "registry-1.docker.io";

/// One known registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryEntry {
    pub host: String,
    pub auth_token: String,
    pub auth_path: String,
    pub auth_service: String,
}

/// Immutable table of known registries keyed by host.
#[derive(Debug, Default)]
pub struct RegistryTable {
    entries: HashMap<String, RegistryEntry>,
}

impl RegistryTable {
    /// Build the known-registry set, reading auth tokens from
    /// `<auth_tokens_dir>/<host>` where configured.
    pub fn known(auth_tokens_dir: &Path) -> io::Result<Self> {
        let mut entries = HashMap::new();

        entries.insert(
            DEFAULT_DOCKER_REGISTRY.to_string(),
            RegistryEntry {
                host: DEFAULT_DOCKER_REGISTRY.to_string(),
                ..Default::default()
            },
        );
        entries.insert(
            "registry.yandex.net".to_string(),
            RegistryEntry {
                host: "registry.yandex.net".to_string(),
                auth_token: read_token(&auth_tokens_dir.join("registry.yandex.net"))?,
                ..Default::default()
            },
        );
        entries.insert(
            "quay.io".to_string(),
            RegistryEntry {
                host: "quay.io".to_string(),
                auth_path: "https://quay.io/v2/auth".to_string(),
                ..Default::default()
            },
        );

        Ok(RegistryTable { entries })
    }

    /// Resolve the registry for an image name by its exact host prefix.
    /// No hostname means the default docker registry; an unknown host
    /// yields an empty entry (no credentials forwarded).
    pub fn resolve(&self, image_name: &str) -> RegistryEntry {
        let host = match image_name.split_once('/') {
            Some((host, _)) => host,
            None => DEFAULT_DOCKER_REGISTRY,
        };
        self.entries.get(host).cloned().unwrap_or_default()
    }
}

fn read_token(path: &Path) -> io::Result<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(content.trim().to_string()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(err),
    }
}
