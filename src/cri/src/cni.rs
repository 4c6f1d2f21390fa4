//! Pod network attachment through CNI plugins.
//!
//! The plugin chain is loaded from the first configuration file in the CNI
//! conf directory and executed with the standard CNI environment contract:
//! `CNI_COMMAND=ADD|DEL`, the namespace handle in `CNI_NETNS`, the network
//! config on stdin and the result JSON on stdout.
//!
//! [`SandboxNetwork`] is the seam the runtime mapper talks to; production
//! uses [`CniNetwork`], tests substitute their own implementation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::{ShimConfig, DEFAULT_IF_NAME};
use crate::error::{Result, ShimError};
use crate::netns;

/// Result of attaching a sandbox to the network.
#[derive(Debug, Clone)]
pub struct NetworkAttachment {
    /// Basename of the netns handle under the netns directory.
    pub netns_name: String,
    /// `<interface> <address>` entries of the default interface.
    pub addresses: Vec<String>,
}

/// Network provider seam used by the runtime mapper.
#[async_trait]
pub trait SandboxNetwork: Send + Sync {
    /// Create a namespace for the sandbox and attach it to the network.
    async fn attach(
        &self,
        id: &str,
        annotations: &HashMap<String, String>,
    ) -> Result<NetworkAttachment>;

    /// Detach the sandbox and remove its namespace.
    async fn detach(&self, id: &str, netns_name: &str) -> Result<()>;
}

/// One loaded CNI plugin chain.
#[derive(Debug, Clone)]
struct CniConf {
    name: String,
    cni_version: String,
    plugins: Vec<Value>,
}

/// CNI-backed production network provider.
pub struct CniNetwork {
    config: Arc<ShimConfig>,
    conf: CniConf,
}

#[derive(Debug, Deserialize)]
struct ConfList {
    name: String,
    #[serde(rename = "cniVersion", default)]
    cni_version: String,
    plugins: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct CniInterface {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CniIp {
    address: String,
    #[serde(default)]
    interface: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct CniResult {
    #[serde(default)]
    interfaces: Vec<CniInterface>,
    #[serde(default)]
    ips: Vec<CniIp>,
}

impl CniNetwork {
    /// Load the plugin chain from the conf directory. Returns an error when
    /// no usable configuration exists; the caller degrades to NODE-network
    /// pods in that case.
    pub fn load(config: Arc<ShimConfig>) -> Result<Self> {
        let conf = Self::load_conf(&config.cni_conf_dir)?;
        debug!(network = %conf.name, plugins = conf.plugins.len(), "loaded cni configuration");
        Ok(CniNetwork { config, conf })
    }

    fn load_conf(conf_dir: &Path) -> Result<CniConf> {
        let mut names: Vec<PathBuf> = std::fs::read_dir(conf_dir)
            .map_err(|e| ShimError::Cni(format!("read {}: {}", conf_dir.display(), e)))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("conf") | Some("conflist") | Some("json")
                )
            })
            .collect();
        names.sort();

        let path = names
            .into_iter()
            .next()
            .ok_or_else(|| ShimError::Cni(format!("no network config in {}", conf_dir.display())))?;
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| ShimError::Cni(format!("read {}: {}", path.display(), e)))?;

        if path.extension().and_then(|e| e.to_str()) == Some("conflist") {
            let list: ConfList = serde_json::from_str(&raw)
                .map_err(|e| ShimError::Cni(format!("parse {}: {}", path.display(), e)))?;
            return Ok(CniConf {
                name: list.name,
                cni_version: list.cni_version,
                plugins: list.plugins,
            });
        }

        let single: Value = serde_json::from_str(&raw)
            .map_err(|e| ShimError::Cni(format!("parse {}: {}", path.display(), e)))?;
        Ok(CniConf {
            name: single
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("default")
                .to_string(),
            cni_version: single
                .get("cniVersion")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            plugins: vec![single],
        })
    }

    async fn invoke_plugin(
        &self,
        plugin: &Value,
        command: &str,
        id: &str,
        netns_path: &Path,
        args: &str,
        prev_result: Option<&Value>,
    ) -> Result<Value> {
        let plugin_type = plugin
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ShimError::Cni("plugin without type".to_string()))?;
        let binary = self.config.cni_bin_dir.join(plugin_type);

        let mut stdin_conf = plugin.clone();
        if let Some(obj) = stdin_conf.as_object_mut() {
            obj.insert("cniVersion".to_string(), json!(self.conf.cni_version));
            obj.insert("name".to_string(), json!(self.conf.name));
            if let Some(prev) = prev_result {
                obj.insert("prevResult".to_string(), prev.clone());
            }
        }

        let mut child = Command::new(&binary)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", id)
            .env("CNI_NETNS", netns_path)
            .env("CNI_IFNAME", DEFAULT_IF_NAME)
            .env("CNI_PATH", &self.config.cni_bin_dir)
            .env("CNI_ARGS", args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ShimError::Cni(format!("spawn {}: {}", binary.display(), e)))?;

        let payload = serde_json::to_vec(&stdin_conf)
            .map_err(|e| ShimError::Cni(format!("encode config: {}", e)))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .map_err(|e| ShimError::Cni(format!("write config: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ShimError::Cni(format!("wait {}: {}", binary.display(), e)))?;
        if !output.status.success() {
            return Err(ShimError::Cni(format!(
                "{} {} failed: {}",
                plugin_type,
                command,
                String::from_utf8_lossy(&output.stdout)
            )));
        }

        if output.stdout.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|e| ShimError::Cni(format!("parse {} result: {}", plugin_type, e)))
    }
}

/// Render the CNI_ARGS bag: `IgnoreUnknown=1` plus the project id
/// annotation when the pod carries one.
pub fn cni_args(annotations: &HashMap<String, String>) -> String {
    let mut args = String::from("IgnoreUnknown=1");
    if let Some(prj) = annotations.get("PrjID") {
        args.push_str(";PrjID=");
        args.push_str(prj);
    }
    args
}

/// Pick the default-interface addresses out of a CNI result, stripping the
/// prefix length.
fn default_interface_addresses(result: &CniResult) -> Vec<String> {
    let mut addrs = Vec::new();
    for ip in &result.ips {
        let on_default = match ip.interface {
            Some(index) => result
                .interfaces
                .get(index)
                .map(|i| i.name == DEFAULT_IF_NAME)
                .unwrap_or(false),
            None => true,
        };
        if !on_default {
            continue;
        }
        let bare = ip.address.split('/').next().unwrap_or(&ip.address);
        addrs.push(format!("{} {}", DEFAULT_IF_NAME, bare));
    }
    addrs
}

#[async_trait]
impl SandboxNetwork for CniNetwork {
    async fn attach(
        &self,
        id: &str,
        annotations: &HashMap<String, String>,
    ) -> Result<NetworkAttachment> {
        let netns_dir = self.config.netns_dir.clone();
        let name = id.to_string();
        let netns_path = tokio::task::spawn_blocking(move || netns::create(&netns_dir, &name))
            .await
            .map_err(|e| ShimError::Internal(e.to_string()))??;

        let args = cni_args(annotations);
        let mut prev: Option<Value> = None;
        for plugin in &self.conf.plugins {
            match self
                .invoke_plugin(plugin, "ADD", id, &netns_path, &args, prev.as_ref())
                .await
            {
                Ok(result) => prev = Some(result),
                Err(err) => {
                    // Leave teardown of half-attached chains to DEL on
                    // sandbox removal; the namespace itself goes away now.
                    let _ = netns::remove(&self.config.netns_dir, id);
                    return Err(err);
                }
            }
        }

        let result: CniResult = prev
            .as_ref()
            .map(|v| serde_json::from_value(v.clone()).unwrap_or_default())
            .unwrap_or_default();

        Ok(NetworkAttachment {
            netns_name: id.to_string(),
            addresses: default_interface_addresses(&result),
        })
    }

    async fn detach(&self, id: &str, netns_name: &str) -> Result<()> {
        let netns_path = netns::handle_path(&self.config.netns_dir, netns_name);
        let args = cni_args(&HashMap::new());
        for plugin in self.conf.plugins.iter().rev() {
            if let Err(err) = self
                .invoke_plugin(plugin, "DEL", id, &netns_path, &args, None)
                .await
            {
                warn!(pod = id, error = %err, "cni DEL failed");
            }
        }

        let netns_dir = self.config.netns_dir.clone();
        let name = netns_name.to_string();
        tokio::task::spawn_blocking(move || netns::remove(&netns_dir, &name))
            .await
            .map_err(|e| ShimError::Internal(e.to_string()))??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_conflist() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("10-net.conflist"),
            r#"{"name":"podnet","cniVersion":"0.4.0","plugins":[{"type":"bridge"},{"type":"portmap"}]}"#,
        )
        .unwrap();

        let conf = CniNetwork::load_conf(dir.path()).unwrap();
        assert_eq!(conf.name, "podnet");
        assert_eq!(conf.plugins.len(), 2);
    }

    #[test]
    fn test_load_single_conf() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("10-net.conf"),
            r#"{"name":"solo","cniVersion":"0.4.0","type":"bridge"}"#,
        )
        .unwrap();

        let conf = CniNetwork::load_conf(dir.path()).unwrap();
        assert_eq!(conf.name, "solo");
        assert_eq!(conf.plugins.len(), 1);
    }

    #[test]
    fn test_load_empty_dir_fails() {
        let dir = TempDir::new().unwrap();
        assert!(CniNetwork::load_conf(dir.path()).is_err());
    }

    #[test]
    fn test_first_config_by_name_wins() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("20-b.conf"),
            r#"{"name":"second","type":"bridge"}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("10-a.conf"),
            r#"{"name":"first","type":"bridge"}"#,
        )
        .unwrap();

        let conf = CniNetwork::load_conf(dir.path()).unwrap();
        assert_eq!(conf.name, "first");
    }

    #[test]
    fn test_cni_args() {
        let mut annotations = HashMap::new();
        assert_eq!(cni_args(&annotations), "IgnoreUnknown=1");
        annotations.insert("PrjID".to_string(), "1234".to_string());
        assert_eq!(cni_args(&annotations), "IgnoreUnknown=1;PrjID=1234");
    }

    #[test]
    fn test_default_interface_addresses() {
        let result: CniResult = serde_json::from_str(
            r#"{
                "interfaces": [{"name": "lo"}, {"name": "veth0"}],
                "ips": [
                    {"address": "127.0.0.1/8", "interface": 0},
                    {"address": "10.1.2.3/24", "interface": 1},
                    {"address": "fe80::1/64", "interface": 1}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(
            default_interface_addresses(&result),
            vec!["veth0 10.1.2.3", "veth0 fe80::1"]
        );
    }

    #[test]
    fn test_addresses_without_interface_index_kept() {
        let result: CniResult =
            serde_json::from_str(r#"{"ips": [{"address": "192.168.0.7/24"}]}"#).unwrap();
        assert_eq!(default_interface_addresses(&result), vec!["veth0 192.168.0.7"]);
    }
}
