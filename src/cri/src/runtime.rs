//! CRI RuntimeService mapping onto backend containers.
//!
//! A pod sandbox is a top-level backend container, a CRI container is a
//! child (`<pod>/<child>`). All state lives in the backend; the mapper
//! reconstructs every CRI view from container properties.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use portoshim_client::rpc::{TContainerCommandArgv, TContainerEnv, TContainerEnvVar, TContainerSpec, TDockerImage};
use portoshim_client::PortoClient;
use tracing::{debug, warn};

use crate::cni::SandboxNetwork;
use crate::command;
use crate::config::{ShimConfig, DEFAULT_IF_NAME, RESOURCE_DOMAIN, RUNTIME_NAME};
use crate::cri_api::*;
use crate::error::{Result, ShimError};
use crate::ids::{create_id, is_container, split_pod_container};
use crate::labels::{self, ANNOTATION_PREFIX, LABEL_PREFIX};

/// SIGTERM, the stop signal for both containers and sandboxes.
const STOP_SIGNAL: i32 = 15;

/// Host paths never bind-mounted into containers.
const EXCLUDED_MOUNT_SOURCES: &[&str] = &["/dev", "/sys"];

/// Container path of the kubelet service-account mount that needs the
/// ca.crt readiness wait.
const SERVICE_ACCOUNT_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Map a backend container state onto the CRI container state.
pub fn container_state_of(state: &str) -> ContainerState {
    match state {
        "stopped" => ContainerState::ContainerCreated,
        "paused" | "starting" | "running" | "stopping" | "respawning" | "meta" => {
            ContainerState::ContainerRunning
        }
        "dead" => ContainerState::ContainerExited,
        _ => ContainerState::ContainerUnknown,
    }
}

/// Map a backend container state onto the CRI sandbox state.
pub fn pod_state_of(state: &str) -> PodSandboxState {
    match state {
        "running" => PodSandboxState::SandboxReady,
        _ => PodSandboxState::SandboxNotready,
    }
}

/// Extract the namespace name out of a `net` property (`netns <name>`).
pub fn parse_net_prop(prop: &str) -> Option<&str> {
    let mut fields = prop.split_whitespace();
    match (fields.next(), fields.next()) {
        (Some("netns"), Some(name)) => Some(name),
        _ => None,
    }
}

/// Porto-backed implementation of the CRI RuntimeService.
pub struct RuntimeMapper {
    config: Arc<ShimConfig>,
    network: Option<Arc<dyn SandboxNetwork>>,
}

impl RuntimeMapper {
    pub fn new(config: Arc<ShimConfig>, network: Option<Arc<dyn SandboxNetwork>>) -> Self {
        RuntimeMapper { config, network }
    }

    // ── Property access ──────────────────────────────────────────────

    async fn get_string_property(&self, pc: &mut PortoClient, id: &str, property: &str) -> String {
        pc.get_property(id, property).await.unwrap_or_default()
    }

    async fn get_uint_property(&self, pc: &mut PortoClient, id: &str, property: &str) -> u64 {
        let raw = match pc.get_property(id, property).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(container = id, property, error = %err, "property read failed");
                return 0;
            }
        };
        if raw.is_empty() {
            return 0;
        }
        match raw.parse::<u64>() {
            Ok(value) => value,
            Err(err) => {
                warn!(container = id, property, error = %err, "property parse failed");
                0
            }
        }
    }

    async fn get_int_property(&self, pc: &mut PortoClient, id: &str, property: &str) -> i64 {
        let raw = match pc.get_property(id, property).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(container = id, property, error = %err, "property read failed");
                return 0;
            }
        };
        if raw.is_empty() {
            return 0;
        }
        match raw.parse::<i64>() {
            Ok(value) => value,
            Err(err) => {
                warn!(container = id, property, error = %err, "property parse failed");
                0
            }
        }
    }

    /// Backend times are unix seconds; CRI wants nanoseconds.
    async fn get_time_property(&self, pc: &mut PortoClient, id: &str, property: &str) -> i64 {
        self.get_uint_property(pc, id, property).await as i64 * 1_000_000_000
    }

    async fn get_container_state(&self, pc: &mut PortoClient, id: &str) -> ContainerState {
        match pc.get_property(id, "state").await {
            Ok(state) => container_state_of(&state),
            Err(_) => ContainerState::ContainerUnknown,
        }
    }

    async fn get_pod_state(&self, pc: &mut PortoClient, id: &str) -> PodSandboxState {
        match pc.get_property(id, "state").await {
            Ok(state) => pod_state_of(&state),
            Err(_) => PodSandboxState::SandboxNotready,
        }
    }

    // ── Labels ───────────────────────────────────────────────────────

    async fn set_labels(
        &self,
        pc: &mut PortoClient,
        id: &str,
        map: &HashMap<String, String>,
        prefix: &str,
    ) -> Result<()> {
        if map.is_empty() {
            return Ok(());
        }
        pc.set_property(id, "labels", &labels::render(map, prefix))
            .await?;
        Ok(())
    }

    async fn get_labels(
        &self,
        pc: &mut PortoClient,
        id: &str,
        prefix: &str,
    ) -> HashMap<String, String> {
        match pc.get_property(id, "labels").await {
            Ok(raw) => labels::parse(&raw, prefix),
            Err(err) => {
                warn!(container = id, error = %err, "labels read failed");
                HashMap::new()
            }
        }
    }

    /// Read one label through the backend's indexed-property syntax,
    /// avoiding a full parse of the labels string.
    async fn get_value_for_kube_label(
        &self,
        pc: &mut PortoClient,
        id: &str,
        label: &str,
        prefix: &str,
    ) -> String {
        let raw = self
            .get_string_property(pc, id, &labels::indexed_property(label, prefix))
            .await;
        labels::convert_label(&raw, false, "")
    }

    // ── Derived views ────────────────────────────────────────────────

    async fn pod_metadata(&self, pc: &mut PortoClient, id: &str) -> PodSandboxMetadata {
        let labels = self.get_labels(pc, id, LABEL_PREFIX).await;
        let attempt = labels
            .get("attempt")
            .and_then(|a| a.parse::<u32>().ok())
            .unwrap_or(0);
        PodSandboxMetadata {
            name: labels.get("io.kubernetes.pod.name").cloned().unwrap_or_default(),
            uid: labels.get("io.kubernetes.pod.uid").cloned().unwrap_or_default(),
            namespace: labels
                .get("io.kubernetes.pod.namespace")
                .cloned()
                .unwrap_or_default(),
            attempt,
        }
    }

    async fn container_metadata(&self, pc: &mut PortoClient, id: &str) -> ContainerMetadata {
        let labels = self.get_labels(pc, id, LABEL_PREFIX).await;
        let attempt = labels
            .get("attempt")
            .and_then(|a| a.parse::<u32>().ok())
            .unwrap_or(0);
        ContainerMetadata {
            name: labels
                .get("io.kubernetes.container.name")
                .cloned()
                .unwrap_or_default(),
            attempt,
        }
    }

    async fn container_image(&self, pc: &mut PortoClient, id: &str) -> String {
        if !is_container(id) {
            return String::new();
        }
        let root = self.config.root_path(id);
        match pc.list_volumes(&root.to_string_lossy(), id).await {
            Ok(volumes) => volumes
                .first()
                .and_then(|v| v.properties.get("image").cloned())
                .unwrap_or_default(),
            Err(err) => {
                warn!(container = id, error = %err, "volume lookup failed");
                String::new()
            }
        }
    }

    async fn pod_network_status(&self, pc: &mut PortoClient, id: &str) -> PodSandboxNetworkStatus {
        let addresses = match pc.get_property(id, "ip").await {
            Ok(addresses) => addresses,
            Err(err) => {
                warn!(pod = id, error = %err, "ip property read failed");
                return PodSandboxNetworkStatus::default();
            }
        };

        let mut ips = Vec::new();
        for address in addresses.split(';').filter(|a| !a.is_empty()) {
            let mut fields = address.split_whitespace();
            let (_iface, ip) = (fields.next(), fields.next());
            if let Some(ip) = ip {
                if ip != "auto" {
                    ips.push(ip.to_string());
                }
            }
        }

        let mut status = PodSandboxNetworkStatus::default();
        if let Some(first) = ips.first() {
            status.ip = first.clone();
        }
        status.additional_ips = ips
            .into_iter()
            .skip(1)
            .map(|ip| PodIp { ip })
            .collect();
        status
    }

    async fn stats_for_container(&self, pc: &mut PortoClient, id: &str) -> ContainerStats {
        let cpu = self.get_uint_property(pc, id, "cpu_usage").await;
        let timestamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0);

        ContainerStats {
            attributes: Some(ContainerAttributes {
                id: id.to_string(),
                metadata: Some(self.container_metadata(pc, id).await),
                labels: self.get_labels(pc, id, LABEL_PREFIX).await,
                annotations: self.get_labels(pc, id, ANNOTATION_PREFIX).await,
            }),
            cpu: Some(CpuUsage {
                timestamp,
                usage_core_nano_seconds: Some(UInt64Value { value: cpu }),
                usage_nano_cores: Some(UInt64Value {
                    value: cpu / 1_000_000_000,
                }),
            }),
            memory: Some(MemoryUsage {
                timestamp,
                working_set_bytes: Some(UInt64Value { value: 0 }),
                available_bytes: Some(UInt64Value { value: 0 }),
                usage_bytes: Some(UInt64Value {
                    value: self.get_uint_property(pc, id, "memory_usage").await,
                }),
                rss_bytes: Some(UInt64Value { value: 0 }),
                page_faults: Some(UInt64Value {
                    value: self.get_uint_property(pc, id, "minor_faults").await,
                }),
                major_page_faults: Some(UInt64Value {
                    value: self.get_uint_property(pc, id, "major_faults").await,
                }),
            }),
            writable_layer: Some(FilesystemUsage {
                timestamp,
                fs_id: Some(FilesystemIdentifier {
                    mountpoint: self.config.root_path(id).to_string_lossy().into_owned(),
                }),
                used_bytes: Some(UInt64Value { value: 0 }),
                inodes_used: Some(UInt64Value { value: 0 }),
            }),
        }
    }

    async fn pod_stats(&self, pc: &mut PortoClient, id: &str) -> Result<PodSandboxStats> {
        let cpu = self.get_uint_property(pc, id, "cpu_usage").await;
        let timestamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0);

        let children = pc.list(&format!("{}/***", id)).await?;
        let mut container_stats = Vec::with_capacity(children.len());
        for child in &children {
            container_stats.push(self.stats_for_container(pc, child).await);
        }

        Ok(PodSandboxStats {
            attributes: Some(PodSandboxAttributes {
                id: id.to_string(),
                metadata: Some(self.pod_metadata(pc, id).await),
                labels: self.get_labels(pc, id, LABEL_PREFIX).await,
                annotations: self.get_labels(pc, id, ANNOTATION_PREFIX).await,
            }),
            linux: Some(LinuxPodSandboxStats {
                cpu: Some(CpuUsage {
                    timestamp,
                    usage_core_nano_seconds: Some(UInt64Value { value: cpu }),
                    usage_nano_cores: Some(UInt64Value {
                        value: cpu / 1_000_000_000,
                    }),
                }),
                memory: Some(MemoryUsage {
                    timestamp,
                    working_set_bytes: Some(UInt64Value { value: 0 }),
                    available_bytes: Some(UInt64Value { value: 0 }),
                    usage_bytes: Some(UInt64Value {
                        value: self.get_uint_property(pc, id, "memory_usage").await,
                    }),
                    rss_bytes: Some(UInt64Value { value: 0 }),
                    page_faults: Some(UInt64Value {
                        value: self.get_uint_property(pc, id, "minor_faults").await,
                    }),
                    major_page_faults: Some(UInt64Value {
                        value: self.get_uint_property(pc, id, "major_faults").await,
                    }),
                }),
                network: Some(NetworkUsage {
                    timestamp,
                    default_interface: Some(NetworkInterfaceUsage {
                        name: DEFAULT_IF_NAME.to_string(),
                        rx_bytes: Some(UInt64Value {
                            value: self.get_uint_property(pc, id, "net_rx_bytes").await,
                        }),
                        rx_errors: Some(UInt64Value { value: 0 }),
                        tx_bytes: Some(UInt64Value {
                            value: self.get_uint_property(pc, id, "net_bytes").await,
                        }),
                        tx_errors: Some(UInt64Value { value: 0 }),
                    }),
                }),
                process: Some(ProcessUsage {
                    timestamp,
                    process_count: Some(UInt64Value {
                        value: self.get_uint_property(pc, id, "process_count").await,
                    }),
                }),
                containers: container_stats,
            }),
        })
    }

    fn matches_labels(
        target: &HashMap<String, String>,
        actual: &HashMap<String, String>,
    ) -> bool {
        target
            .iter()
            .all(|(k, v)| actual.get(k).map(|av| av == v).unwrap_or(false))
    }

    // ── Prepare steps ────────────────────────────────────────────────

    async fn prepare_resources(
        &self,
        pc: &mut PortoClient,
        id: &str,
        res: &LinuxContainerResources,
    ) -> Result<()> {
        let cores = res.cpu_quota as f64 / 100_000.0;
        pc.set_property(id, "cpu_limit", &format!("{:.6}c", cores))
            .await?;
        pc.set_property(id, "cpu_guarantee", &format!("{:.6}c", cores))
            .await?;
        pc.set_property(id, "memory_limit", &res.memory_limit_in_bytes.to_string())
            .await?;
        pc.set_property(
            id,
            "memory_guarantee",
            &res.memory_limit_in_bytes.to_string(),
        )
        .await?;
        Ok(())
    }

    /// Resolve an image in the backend store. Sandboxes pull a missing
    /// pause image; container images must be pre-pulled.
    async fn prepare_image(
        &self,
        pc: &mut PortoClient,
        name: &str,
        pull_if_missing: bool,
    ) -> Result<TDockerImage> {
        match pc.docker_image_status(name, "").await {
            Ok(image) => Ok(image),
            Err(err) if pull_if_missing && err.is_docker_image_not_found() => {
                debug!(image = name, "image absent, pulling");
                Ok(pc.pull_docker_image(name, "", "", "", "").await?)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Set the container environment: image env first, then the requested
    /// vars. Returns the merged `KEY=VALUE` list for command resolution.
    async fn prepare_env(
        &self,
        pc: &mut PortoClient,
        id: &str,
        image_env: &[String],
        envs: &[KeyValue],
    ) -> Result<Vec<String>> {
        let mut merged: Vec<String> = image_env.to_vec();
        merged.extend(envs.iter().map(|kv| format!("{}={}", kv.key, kv.value)));

        let vars = merged
            .iter()
            .map(|entry| {
                let (name, value) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
                TContainerEnvVar {
                    name: Some(name.to_string()),
                    value: Some(value.to_string()),
                }
            })
            .collect();

        pc.update_from_spec(TContainerSpec {
            name: Some(id.to_string()),
            env: Some(TContainerEnv { var: vars }),
            command_argv: None,
        })
        .await?;
        Ok(merged)
    }

    /// Resolve and persist the container command; must run after the root
    /// volume exists because resolution walks the chroot at `root`.
    #[allow(clippy::too_many_arguments)]
    async fn prepare_command(
        &self,
        pc: &mut PortoClient,
        id: &str,
        cfg_cmd: &[String],
        cfg_args: &[String],
        image_cmd: &[String],
        env: &[String],
        root: &Path,
        bypass_logshim: bool,
    ) -> Result<()> {
        let argv = command::resolve(cfg_cmd, cfg_args, image_cmd, env, root);
        let argv = command::wrap_logshim(argv, &self.config.logshim_path, bypass_logshim);

        pc.update_from_spec(TContainerSpec {
            name: Some(id.to_string()),
            env: None,
            command_argv: Some(TContainerCommandArgv { argv }),
        })
        .await?;
        Ok(())
    }

    /// Create the overlay root volume and chroot the container into it.
    /// `root_prop` overrides the `root` property for containers, whose
    /// chroot path is sandbox-relative.
    async fn prepare_root(
        &self,
        pc: &mut PortoClient,
        id: &str,
        root_prop: Option<&str>,
        image: &str,
    ) -> Result<()> {
        let abs = self.config.root_path(id);
        if let Err(err) = std::fs::create_dir(&abs) {
            if err.kind() == std::io::ErrorKind::AlreadyExists {
                warn!(path = %abs.display(), "root directory already exists");
            } else {
                return Err(err.into());
            }
        }

        let abs_str = abs.to_string_lossy().into_owned();
        let mut props = HashMap::new();
        props.insert("containers".to_string(), id.to_string());
        props.insert("image".to_string(), image.to_string());
        props.insert("backend".to_string(), "overlay".to_string());

        if let Err(err) = pc.create_volume(&abs_str, &props).await {
            let _ = std::fs::remove_dir_all(&abs);
            return Err(err.into());
        }
        if let Err(err) = pc
            .set_property(id, "root", root_prop.unwrap_or(&abs_str))
            .await
        {
            let _ = std::fs::remove_dir_all(&abs);
            return Err(err.into());
        }
        Ok(())
    }

    /// Wait for the kubelet to drop ca.crt into the service-account mount
    /// source. Bounded back-off, 5 s total.
    async fn wait_service_account(&self, host_path: &Path) -> Result<()> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let mut delay = Duration::from_millis(50);
        loop {
            if host_path.join("ca.crt").exists() {
                return Ok(());
            }
            if tokio::time::Instant::now() + delay > deadline {
                return Err(ShimError::MountTimeout {
                    path: host_path.to_path_buf(),
                });
            }
            warn!(path = %host_path.display(), "waiting for service account mount");
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }

    async fn prepare_mounts(
        &self,
        pc: &mut PortoClient,
        id: &str,
        mounts: &[Mount],
    ) -> Result<()> {
        // The log framer must be callable inside every container.
        let logshim = Mount {
            container_path: self.config.logshim_path.to_string_lossy().into_owned(),
            host_path: self.config.logshim_path.to_string_lossy().into_owned(),
            readonly: true,
        };

        for mount in std::iter::once(&logshim).chain(mounts.iter()) {
            let host = clean_path(&mount.host_path);
            let target = clean_path(&mount.container_path);

            if target == "/dev/termination-log" {
                continue;
            }
            if EXCLUDED_MOUNT_SOURCES.contains(&host.as_str()) {
                continue;
            }
            if target == SERVICE_ACCOUNT_PATH {
                self.wait_service_account(Path::new(&host)).await?;
            }

            let mut props = HashMap::new();
            props.insert("backend".to_string(), "bind".to_string());
            props.insert("storage".to_string(), host.clone());

            let volume = match pc.create_volume("", &props).await {
                Ok(desc) if !desc.path.is_empty() => desc.path,
                Ok(_) => host.clone(),
                Err(err) if err.is_volume_already_exists() => host.clone(),
                Err(err) => return Err(err.into()),
            };

            pc.link_volume(&volume, id, &target, false, mount.readonly)
                .await?;

            // Detach the implicit link on the root container.
            match pc.unlink_volume(&volume, "/", "", false).await {
                Ok(()) => {}
                Err(err) if err.is_volume_not_linked() => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    async fn prepare_resolv_conf(
        &self,
        pc: &mut PortoClient,
        id: &str,
        dns: &DnsConfig,
    ) -> Result<()> {
        let mut entries: Vec<String> = dns
            .servers
            .iter()
            .map(|server| format!("nameserver {}", server))
            .collect();
        entries.push(format!("search {}", dns.searches.join(" ")));
        entries.push(format!("options {}", dns.options.join(" ")));

        pc.set_property(id, "resolv_conf", &entries.join(";")).await?;
        Ok(())
    }

    /// Attach the sandbox to the pod network and push the resulting
    /// settings into the backend container.
    async fn prepare_network(
        &self,
        pc: &mut PortoClient,
        id: &str,
        config: &PodSandboxConfig,
    ) -> Result<()> {
        let ns_mode = config
            .linux
            .as_ref()
            .and_then(|l| l.security_context.as_ref())
            .and_then(|sc| sc.namespace_options.as_ref())
            .map(|opts| opts.network)
            .unwrap_or(NamespaceMode::Pod as i32);
        if ns_mode == NamespaceMode::Node as i32 {
            return Ok(());
        }

        let network = self.network.as_ref().ok_or(ShimError::CniNotReady)?;
        let attachment = network.attach(id, &config.annotations).await?;

        pc.set_property(id, "hostname", &config.hostname).await?;
        pc.set_property(id, "net", &format!("netns {}", attachment.netns_name))
            .await?;
        pc.set_property(id, "ip", &attachment.addresses.join(";"))
            .await?;

        let sysctls: Vec<String> = config
            .linux
            .as_ref()
            .map(|l| {
                let mut pairs: Vec<(&String, &String)> = l.sysctls.iter().collect();
                pairs.sort_by_key(|(k, _)| k.as_str());
                pairs
                    .into_iter()
                    .map(|(k, v)| format!("{}:{}", k, v))
                    .collect()
            })
            .unwrap_or_default();
        pc.set_property(id, "sysctl", &sysctls.join(";")).await?;

        // Optional per-pod bandwidth caps.
        if let Some(tx) = config.annotations.get(&format!("{}/net-tx", RESOURCE_DOMAIN)) {
            pc.set_property(id, "net_limit", &format!("veth: {}", tx))
                .await?;
        }
        if let Some(rx) = config.annotations.get(&format!("{}/net-rx", RESOURCE_DOMAIN)) {
            pc.set_property(id, "net_rx_limit", &format!("veth: {}", rx))
                .await?;
        }

        Ok(())
    }

    // ── RuntimeService verbs ─────────────────────────────────────────

    pub async fn version(
        &self,
        pc: &mut PortoClient,
        req: VersionRequest,
    ) -> Result<VersionResponse> {
        let (tag, _revision) = pc.get_version().await?;
        Ok(VersionResponse {
            version: req.version,
            runtime_name: RUNTIME_NAME.to_string(),
            runtime_version: tag.clone(),
            runtime_api_version: tag,
        })
    }

    pub async fn run_pod_sandbox(
        &self,
        pc: &mut PortoClient,
        req: RunPodSandboxRequest,
    ) -> Result<RunPodSandboxResponse> {
        let config = req
            .config
            .ok_or_else(|| ShimError::InvalidArgument("sandbox config required".to_string()))?;
        let metadata = config
            .metadata
            .clone()
            .ok_or_else(|| ShimError::InvalidArgument("sandbox metadata required".to_string()))?;

        let id = create_id(&metadata.name);
        pc.create(&id).await?;

        if let Err(err) = self.bring_up_sandbox(pc, &id, &config, &metadata).await {
            let _ = pc.destroy(&id).await;
            let _ = std::fs::remove_dir_all(self.config.root_path(&id));
            return Err(err);
        }

        Ok(RunPodSandboxResponse { pod_sandbox_id: id })
    }

    /// Steps 2–9 of the sandbox bring-up. Any error rolls the whole
    /// sandbox back in `run_pod_sandbox`.
    async fn bring_up_sandbox(
        &self,
        pc: &mut PortoClient,
        id: &str,
        config: &PodSandboxConfig,
        metadata: &PodSandboxMetadata,
    ) -> Result<()> {
        let image = self
            .prepare_image(pc, &self.config.pause_image, true)
            .await?;

        if let Some(res) = config.linux.as_ref().and_then(|l| l.resources.as_ref()) {
            self.prepare_resources(pc, id, res).await?;
        }

        let mut pod_labels = config.labels.clone();
        pod_labels
            .entry("io.kubernetes.pod.namespace".to_string())
            .or_insert_with(|| metadata.namespace.clone());
        pod_labels.insert("attempt".to_string(), metadata.attempt.to_string());
        self.set_labels(pc, id, &pod_labels, LABEL_PREFIX).await?;
        self.set_labels(pc, id, &config.annotations, ANNOTATION_PREFIX)
            .await?;

        let pause_image = self.config.pause_image.clone();
        self.prepare_root(pc, id, None, &pause_image).await?;

        let image_config = image.config.clone().unwrap_or_default();
        let env = self.prepare_env(pc, id, &image_config.env, &[]).await?;
        self.prepare_command(
            pc,
            id,
            &[],
            &[],
            &image_config.cmd,
            &env,
            &self.config.root_path(id),
            false,
        )
        .await?;

        self.prepare_network(pc, id, config).await?;

        pc.start(id).await?;
        Ok(())
    }

    pub async fn stop_pod_sandbox(
        &self,
        pc: &mut PortoClient,
        req: StopPodSandboxRequest,
    ) -> Result<StopPodSandboxResponse> {
        let id = req.pod_sandbox_id;
        if is_container(&id) {
            return Err(ShimError::NotAPod(id));
        }

        if self.get_string_property(pc, &id, "state").await == "running" {
            pc.kill(&id, STOP_SIGNAL).await?;
        }
        Ok(StopPodSandboxResponse {})
    }

    pub async fn remove_pod_sandbox(
        &self,
        pc: &mut PortoClient,
        req: RemovePodSandboxRequest,
    ) -> Result<RemovePodSandboxResponse> {
        let id = req.pod_sandbox_id;
        if is_container(&id) {
            return Err(ShimError::NotAPod(id));
        }

        // Read the netns before the container record disappears.
        let net_prop = pc.get_property(&id, "net").await?;

        pc.destroy(&id).await?;
        std::fs::remove_dir_all(self.config.root_path(&id)).or_else(ignore_not_found)?;

        // A sandbox that never had a namespace has nothing to tear down.
        if let Some(netns_name) = parse_net_prop(&net_prop) {
            let network = self.network.as_ref().ok_or(ShimError::CniNotReady)?;
            network.detach(&id, netns_name).await?;
        }
        Ok(RemovePodSandboxResponse {})
    }

    pub async fn pod_sandbox_status(
        &self,
        pc: &mut PortoClient,
        req: PodSandboxStatusRequest,
    ) -> Result<PodSandboxStatusResponse> {
        let id = req.pod_sandbox_id;
        if is_container(&id) {
            return Err(ShimError::NotAPod(id));
        }

        let net_prop = pc.get_property(&id, "net").await?;
        let ns_mode = if parse_net_prop(&net_prop).is_some() {
            NamespaceMode::Pod
        } else {
            NamespaceMode::Node
        };

        let status = PodSandboxStatus {
            id: id.clone(),
            metadata: Some(self.pod_metadata(pc, &id).await),
            state: self.get_pod_state(pc, &id).await.into(),
            created_at: self.get_time_property(pc, &id, "creation_time[raw]").await,
            network: Some(self.pod_network_status(pc, &id).await),
            linux: Some(LinuxPodSandboxStatus {
                namespaces: Some(Namespace {
                    options: Some(NamespaceOption {
                        network: ns_mode.into(),
                        pid: NamespaceMode::Pod.into(),
                        ipc: NamespaceMode::Pod.into(),
                    }),
                }),
            }),
            labels: self.get_labels(pc, &id, LABEL_PREFIX).await,
            annotations: self.get_labels(pc, &id, ANNOTATION_PREFIX).await,
            runtime_handler: String::new(),
        };

        Ok(PodSandboxStatusResponse {
            status: Some(status),
            info: Default::default(),
        })
    }

    pub async fn pod_sandbox_stats(
        &self,
        pc: &mut PortoClient,
        req: PodSandboxStatsRequest,
    ) -> Result<PodSandboxStatsResponse> {
        let id = req.pod_sandbox_id;
        if is_container(&id) {
            return Err(ShimError::NotAPod(id));
        }
        Ok(PodSandboxStatsResponse {
            stats: Some(self.pod_stats(pc, &id).await?),
        })
    }

    pub async fn list_pod_sandbox(
        &self,
        pc: &mut PortoClient,
        req: ListPodSandboxRequest,
    ) -> Result<ListPodSandboxResponse> {
        let filter = req.filter.unwrap_or_default();
        let mask = if filter.id.is_empty() { "*" } else { &filter.id };

        let mut items = Vec::new();
        for id in pc.list(mask).await? {
            if is_container(&id) {
                continue;
            }
            let namespace = self
                .get_value_for_kube_label(pc, &id, "io.kubernetes.pod.namespace", LABEL_PREFIX)
                .await;
            if namespace.is_empty() {
                continue;
            }

            let state = self.get_pod_state(pc, &id).await;
            if let Some(target) = &filter.state {
                if target.state != state as i32 {
                    continue;
                }
            }

            let labels = self.get_labels(pc, &id, LABEL_PREFIX).await;
            if !Self::matches_labels(&filter.label_selector, &labels) {
                continue;
            }

            items.push(PodSandbox {
                id: id.clone(),
                metadata: Some(self.pod_metadata(pc, &id).await),
                state: state.into(),
                created_at: self.get_time_property(pc, &id, "creation_time[raw]").await,
                labels,
                annotations: self.get_labels(pc, &id, ANNOTATION_PREFIX).await,
                runtime_handler: String::new(),
            });
        }

        Ok(ListPodSandboxResponse { items })
    }

    pub async fn list_pod_sandbox_stats(
        &self,
        pc: &mut PortoClient,
        req: ListPodSandboxStatsRequest,
    ) -> Result<ListPodSandboxStatsResponse> {
        let filter = req.filter.unwrap_or_default();
        let mask = if filter.id.is_empty() { "*" } else { &filter.id };

        let mut stats = Vec::new();
        for id in pc.list(mask).await? {
            if is_container(&id) {
                continue;
            }
            let namespace = self
                .get_value_for_kube_label(pc, &id, "io.kubernetes.pod.namespace", LABEL_PREFIX)
                .await;
            if namespace.is_empty() {
                continue;
            }
            let labels = self.get_labels(pc, &id, LABEL_PREFIX).await;
            if !Self::matches_labels(&filter.label_selector, &labels) {
                continue;
            }
            stats.push(self.pod_stats(pc, &id).await?);
        }

        Ok(ListPodSandboxStatsResponse { stats })
    }

    pub async fn create_container(
        &self,
        pc: &mut PortoClient,
        req: CreateContainerRequest,
    ) -> Result<CreateContainerResponse> {
        let pod_id = req.pod_sandbox_id;
        if is_container(&pod_id) {
            return Err(ShimError::InvalidArgument(format!(
                "{}: sandbox ID required",
                pod_id
            )));
        }
        let config = req
            .config
            .ok_or_else(|| ShimError::InvalidArgument("container config required".to_string()))?;
        let metadata = config
            .metadata
            .clone()
            .ok_or_else(|| ShimError::InvalidArgument("container metadata required".to_string()))?;

        let child_id = create_id(&metadata.name);
        let id = format!("{}/{}", pod_id, child_id);
        pc.create(&id).await?;

        if let Err(err) = self
            .bring_up_container(pc, &id, &child_id, &config, req.sandbox_config.as_ref())
            .await
        {
            let _ = pc.destroy(&id).await;
            let _ = std::fs::remove_dir_all(self.config.root_path(&id));
            return Err(err);
        }

        Ok(CreateContainerResponse { container_id: id })
    }

    async fn bring_up_container(
        &self,
        pc: &mut PortoClient,
        id: &str,
        child_id: &str,
        config: &ContainerConfig,
        sandbox_config: Option<&PodSandboxConfig>,
    ) -> Result<()> {
        let image_name = config
            .image
            .as_ref()
            .map(|spec| spec.image.clone())
            .unwrap_or_default();
        // Container images must be pre-pulled through the image service.
        let image = self.prepare_image(pc, &image_name, false).await?;

        let metadata = config.metadata.clone().unwrap_or_default();
        let mut ctr_labels = config.labels.clone();
        ctr_labels.insert("attempt".to_string(), metadata.attempt.to_string());
        ctr_labels.insert(
            "io.kubernetes.container.logpath".to_string(),
            format!("/place/porto/{}/stdout", id),
        );
        self.set_labels(pc, id, &ctr_labels, LABEL_PREFIX).await?;
        self.set_labels(pc, id, &config.annotations, ANNOTATION_PREFIX)
            .await?;

        if let Some(dns) = sandbox_config.and_then(|sc| sc.dns_config.as_ref()) {
            self.prepare_resolv_conf(pc, id, dns).await?;
        }

        self.prepare_root(pc, id, Some(&format!("/{}", child_id)), &image_name)
            .await?;

        self.prepare_mounts(pc, id, &config.mounts).await?;

        let image_config = image.config.clone().unwrap_or_default();
        let env = self
            .prepare_env(pc, id, &image_config.env, &config.envs)
            .await?;
        self.prepare_command(
            pc,
            id,
            &config.command,
            &config.args,
            &image_config.cmd,
            &env,
            &self.config.root_path(id),
            false,
        )
        .await?;

        Ok(())
    }

    pub async fn start_container(
        &self,
        pc: &mut PortoClient,
        req: StartContainerRequest,
    ) -> Result<StartContainerResponse> {
        let id = req.container_id;
        if !is_container(&id) {
            return Err(ShimError::NotAContainer(id));
        }
        pc.start(&id).await?;
        Ok(StartContainerResponse {})
    }

    pub async fn stop_container(
        &self,
        pc: &mut PortoClient,
        req: StopContainerRequest,
    ) -> Result<StopContainerResponse> {
        let id = req.container_id;
        if !is_container(&id) {
            return Err(ShimError::NotAContainer(id));
        }

        if self.get_string_property(pc, &id, "state").await == "running" {
            pc.kill(&id, STOP_SIGNAL).await?;
            // Best-effort wait bounded by the CRI-supplied grace period.
            if req.timeout > 0 {
                let timeout = Duration::from_secs(req.timeout as u64);
                if let Err(err) = pc.wait(&[id.clone()], Some(timeout)).await {
                    warn!(container = %id, error = %err, "wait after stop failed");
                }
            }
        }
        Ok(StopContainerResponse {})
    }

    pub async fn remove_container(
        &self,
        pc: &mut PortoClient,
        req: RemoveContainerRequest,
    ) -> Result<RemoveContainerResponse> {
        let id = req.container_id;
        if !is_container(&id) {
            return Err(ShimError::NotAContainer(id));
        }

        pc.destroy(&id).await?;
        std::fs::remove_dir_all(self.config.root_path(&id)).or_else(ignore_not_found)?;
        Ok(RemoveContainerResponse {})
    }

    pub async fn list_containers(
        &self,
        pc: &mut PortoClient,
        req: ListContainersRequest,
    ) -> Result<ListContainersResponse> {
        let filter = req.filter.unwrap_or_default();
        let mask = if !filter.id.is_empty() {
            filter.id.clone()
        } else if !filter.pod_sandbox_id.is_empty() {
            format!("{}/***", filter.pod_sandbox_id)
        } else {
            String::new()
        };

        let mut containers = Vec::new();
        for id in pc.list(&mask).await? {
            if !is_container(&id) {
                continue;
            }
            let namespace = self
                .get_value_for_kube_label(pc, &id, "io.kubernetes.pod.namespace", LABEL_PREFIX)
                .await;
            if namespace.is_empty() {
                continue;
            }

            let (pod_id, _) = split_pod_container(&id);
            let pod_id = pod_id.to_string();

            let state = self.get_container_state(pc, &id).await;
            if let Some(target) = &filter.state {
                if target.state != state as i32 {
                    continue;
                }
            }

            let labels = self.get_labels(pc, &id, LABEL_PREFIX).await;
            if !Self::matches_labels(&filter.label_selector, &labels) {
                continue;
            }

            let image = self.container_image(pc, &id).await;
            containers.push(Container {
                id: id.clone(),
                pod_sandbox_id: pod_id,
                metadata: Some(self.container_metadata(pc, &id).await),
                image: Some(ImageSpec {
                    image: image.clone(),
                    annotations: Default::default(),
                }),
                image_ref: image,
                state: state.into(),
                created_at: self.get_time_property(pc, &id, "creation_time[raw]").await,
                labels,
                annotations: self.get_labels(pc, &id, ANNOTATION_PREFIX).await,
            });
        }

        Ok(ListContainersResponse { containers })
    }

    pub async fn container_status(
        &self,
        pc: &mut PortoClient,
        req: ContainerStatusRequest,
    ) -> Result<ContainerStatusResponse> {
        let id = req.container_id;
        if !is_container(&id) {
            return Err(ShimError::NotAContainer(id));
        }

        let image = self.container_image(pc, &id).await;
        let status = ContainerStatus {
            id: id.clone(),
            metadata: Some(self.container_metadata(pc, &id).await),
            state: self.get_container_state(pc, &id).await.into(),
            created_at: self.get_time_property(pc, &id, "creation_time[raw]").await,
            started_at: self.get_time_property(pc, &id, "start_time[raw]").await,
            finished_at: self.get_time_property(pc, &id, "death_time[raw]").await,
            exit_code: self.get_int_property(pc, &id, "exit_code").await as i32,
            image: Some(ImageSpec {
                image: image.clone(),
                annotations: Default::default(),
            }),
            image_ref: image,
            reason: String::new(),
            message: String::new(),
            labels: self.get_labels(pc, &id, LABEL_PREFIX).await,
            annotations: self.get_labels(pc, &id, ANNOTATION_PREFIX).await,
            mounts: vec![],
            log_path: self
                .get_value_for_kube_label(pc, &id, "io.kubernetes.container.logpath", LABEL_PREFIX)
                .await,
        };

        Ok(ContainerStatusResponse {
            status: Some(status),
            info: Default::default(),
        })
    }

    pub async fn container_stats(
        &self,
        pc: &mut PortoClient,
        req: ContainerStatsRequest,
    ) -> Result<ContainerStatsResponse> {
        let id = req.container_id;
        if !is_container(&id) {
            return Err(ShimError::NotAContainer(id));
        }
        Ok(ContainerStatsResponse {
            stats: Some(self.stats_for_container(pc, &id).await),
        })
    }

    pub async fn list_container_stats(
        &self,
        pc: &mut PortoClient,
        req: ListContainerStatsRequest,
    ) -> Result<ListContainerStatsResponse> {
        let filter = req.filter.unwrap_or_default();
        let mask = if !filter.id.is_empty() {
            filter.id.clone()
        } else if !filter.pod_sandbox_id.is_empty() {
            format!("{}/***", filter.pod_sandbox_id)
        } else {
            String::new()
        };

        let mut stats = Vec::new();
        for id in pc.list(&mask).await? {
            if !is_container(&id) {
                continue;
            }
            let namespace = self
                .get_value_for_kube_label(pc, &id, "io.kubernetes.pod.namespace", LABEL_PREFIX)
                .await;
            if namespace.is_empty() {
                continue;
            }
            let labels = self.get_labels(pc, &id, LABEL_PREFIX).await;
            if !Self::matches_labels(&filter.label_selector, &labels) {
                continue;
            }
            stats.push(self.stats_for_container(pc, &id).await);
        }

        Ok(ListContainerStatsResponse { stats })
    }

    /// Synchronous exec through an ephemeral child container of the
    /// target. The child is destroyed unconditionally on the way out.
    pub async fn exec_sync(
        &self,
        pc: &mut PortoClient,
        req: ExecSyncRequest,
    ) -> Result<ExecSyncResponse> {
        let target = req.container_id.clone();
        if !is_container(&target) {
            return Err(ShimError::NotAContainer(target));
        }

        let id = format!("{}/{}", target, create_id("exec-sync"));
        pc.create(&id).await?;

        let result = self.exec_sync_steps(pc, &id, &target, &req).await;
        let _ = pc.destroy(&id).await;
        result
    }

    async fn exec_sync_steps(
        &self,
        pc: &mut PortoClient,
        id: &str,
        target: &str,
        req: &ExecSyncRequest,
    ) -> Result<ExecSyncResponse> {
        // The exec child sees exactly the parent's environment.
        let env_prop = pc.get_property(target, "env").await?;
        pc.set_property(id, "env", &env_prop).await?;

        let env: Vec<String> = env_prop
            .split(';')
            .filter(|e| !e.is_empty())
            .map(str::to_string)
            .collect();
        // The exec child shares the target's chroot; resolve against it.
        self.prepare_command(
            pc,
            id,
            &req.cmd,
            &[],
            &[],
            &env,
            &self.config.root_path(target),
            true,
        )
        .await?;

        pc.start(id).await?;

        let timeout = if req.timeout > 0 {
            Some(Duration::from_secs(req.timeout as u64))
        } else {
            None
        };
        pc.wait(&[id.to_string()], timeout).await?;

        let exit_code = self.get_int_property(pc, id, "exit_code").await as i32;
        let stdout = self.get_string_property(pc, id, "stdout").await;
        let stderr = self.get_string_property(pc, id, "stderr").await;

        Ok(ExecSyncResponse {
            stdout: stdout.into_bytes(),
            stderr: stderr.into_bytes(),
            exit_code,
        })
    }

    /// Liveness probe against the backend.
    pub async fn status(&self, pc: &mut PortoClient, _req: StatusRequest) -> Result<StatusResponse> {
        pc.get_version().await?;

        Ok(StatusResponse {
            status: Some(RuntimeStatus {
                conditions: vec![
                    RuntimeCondition {
                        r#type: "RuntimeReady".to_string(),
                        status: true,
                        reason: String::new(),
                        message: String::new(),
                    },
                    RuntimeCondition {
                        r#type: "NetworkReady".to_string(),
                        status: true,
                        reason: String::new(),
                        message: String::new(),
                    },
                ],
            }),
            info: Default::default(),
        })
    }
}

fn clean_path(path: &str) -> String {
    let mut cleaned = String::with_capacity(path.len());
    let mut last_slash = false;
    for c in path.chars() {
        if c == '/' {
            if last_slash {
                continue;
            }
            last_slash = true;
        } else {
            last_slash = false;
        }
        cleaned.push(c);
    }
    if cleaned.len() > 1 && cleaned.ends_with('/') {
        cleaned.pop();
    }
    cleaned
}

fn ignore_not_found(err: std::io::Error) -> std::result::Result<(), ShimError> {
    if err.kind() == std::io::ErrorKind::NotFound {
        Ok(())
    } else {
        Err(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_state_total_over_vocabulary() {
        let cases = [
            ("stopped", ContainerState::ContainerCreated),
            ("paused", ContainerState::ContainerRunning),
            ("starting", ContainerState::ContainerRunning),
            ("running", ContainerState::ContainerRunning),
            ("stopping", ContainerState::ContainerRunning),
            ("respawning", ContainerState::ContainerRunning),
            ("meta", ContainerState::ContainerRunning),
            ("dead", ContainerState::ContainerExited),
            ("", ContainerState::ContainerUnknown),
            ("garbled", ContainerState::ContainerUnknown),
        ];
        for (input, expected) in cases {
            assert_eq!(container_state_of(input), expected, "state {:?}", input);
        }
    }

    #[test]
    fn test_pod_state_total_over_vocabulary() {
        for state in [
            "stopped",
            "paused",
            "starting",
            "stopping",
            "respawning",
            "meta",
            "dead",
            "",
            "garbled",
        ] {
            assert_eq!(pod_state_of(state), PodSandboxState::SandboxNotready);
        }
        assert_eq!(pod_state_of("running"), PodSandboxState::SandboxReady);
    }

    #[test]
    fn test_parse_net_prop() {
        assert_eq!(parse_net_prop("netns foo-1a2b"), Some("foo-1a2b"));
        assert_eq!(parse_net_prop("inherited"), None);
        assert_eq!(parse_net_prop(""), None);
        assert_eq!(parse_net_prop("netns"), None);
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("/var//run/"), "/var/run");
        assert_eq!(clean_path("/dev"), "/dev");
        assert_eq!(clean_path("/"), "/");
    }

    #[test]
    fn test_matches_labels() {
        let mut target = HashMap::new();
        let mut actual = HashMap::new();
        actual.insert("env".to_string(), "prod".to_string());

        assert!(RuntimeMapper::matches_labels(&target, &actual));
        target.insert("env".to_string(), "prod".to_string());
        assert!(RuntimeMapper::matches_labels(&target, &actual));
        target.insert("tier".to_string(), "web".to_string());
        assert!(!RuntimeMapper::matches_labels(&target, &actual));
    }
}
