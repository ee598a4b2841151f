use std::{
    fmt::{Debug, Display, Formatter},
    net::IpAddr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{errors::ValidationError, node::NodeRole};

pub const DEFAULT_CLUSTER_NAME: &str = "kind";
pub const DEFAULT_NODE_IMAGE: &str = "kindest/node:v1.27.3";

/// Declarative description of a cluster: its nodes, networking and any
/// tweaks to apply to the generated bootstrap documents.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub networking: Networking,
    #[serde(default, alias = "kubeadmConfigPatches")]
    pub merge_patches: Vec<String>,
    #[serde(default, alias = "kubeadmConfigPatchesJSON6902")]
    pub json_patches: Vec<PatchJson6902>,
    /// TOML merge patches for every node's `/etc/containerd/config.toml`
    #[serde(default)]
    pub containerd_config_patches: Vec<String>,
    /// RFC 6902 operation lists for the same file
    #[serde(default, rename = "containerdConfigPatchesJSON6902")]
    pub containerd_config_patches_json6902: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    pub role: NodeRole,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub extra_mounts: Vec<Mount>,
    #[serde(default)]
    pub extra_port_mappings: Vec<PortMapping>,
    #[serde(default, alias = "kubeadmConfigPatches")]
    pub merge_patches: Vec<String>,
    #[serde(default, alias = "kubeadmConfigPatchesJSON6902")]
    pub json_patches: Vec<PatchJson6902>,
}

impl NodeSpec {
    pub fn new(role: NodeRole) -> Self {
        Self {
            role,
            image: String::new(),
            extra_mounts: Vec::new(),
            extra_port_mappings: Vec::new(),
            merge_patches: Vec::new(),
            json_patches: Vec::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Networking {
    #[serde(default)]
    pub ip_family: IpFamily,
    #[serde(default)]
    pub api_server_port: u16,
    #[serde(default)]
    pub api_server_address: String,
    #[serde(default)]
    pub pod_subnet: String,
    #[serde(default)]
    pub service_subnet: String,
    #[serde(default, rename = "disableDefaultCNI")]
    pub disable_default_cni: bool,
}

impl Default for Networking {
    fn default() -> Self {
        Self {
            ip_family: IpFamily::Ipv4,
            api_server_port: 0,
            api_server_address: String::new(),
            pod_subnet: String::new(),
            service_subnet: String::new(),
            disable_default_cni: false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    #[default]
    Ipv4,
    Ipv6,
}

impl IpFamily {
    pub fn loopback(self) -> &'static str {
        match self {
            IpFamily::Ipv4 => "127.0.0.1",
            IpFamily::Ipv6 => "::1",
        }
    }

    fn matches(self, addr: &IpAddr) -> bool {
        matches!(
            (self, addr),
            (IpFamily::Ipv4, IpAddr::V4(_)) | (IpFamily::Ipv6, IpAddr::V6(_))
        )
    }
}

/// A host path made visible inside a node container.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    pub host_path: PathBuf,
    pub container_path: String,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub selinux_relabel: bool,
    #[serde(default)]
    pub propagation: MountPropagation,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MountPropagation {
    #[default]
    None,
    HostToContainer,
    Bidirectional,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub container_port: u16,
    /// 0 picks a free port on the host
    #[serde(default)]
    pub host_port: u16,
    #[serde(default)]
    pub listen_address: String,
    #[serde(default)]
    pub protocol: Protocol,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
        }
    }
}

/// An RFC 6902 patch and the documents it targets. Empty selector fields
/// match anything.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PatchJson6902 {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// the operation list, as YAML or JSON text
    pub patch: String,
}

impl ClusterSpec {
    /// Read a cluster spec from a file. `.toml` files are parsed as TOML,
    /// anything else as YAML.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| {
            format!("failed to read cluster spec at {}", path.to_string_lossy())
        })?;
        let parsed = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&text).map_err(anyhow::Error::from),
            _ => serde_yaml::from_str(&text).map_err(anyhow::Error::from),
        };
        parsed.with_context(|| format!("failed to parse cluster spec at {}", path.display()))
    }

    /// A single control-plane node with every default filled in.
    pub fn single_node() -> Self {
        Self {
            nodes: vec![NodeSpec::new(NodeRole::ControlPlane)],
            ..Default::default()
        }
        .defaulted()
    }

    /// Fill unset fields. Leaves anything the user wrote alone.
    pub fn defaulted(mut self) -> Self {
        if self.nodes.is_empty() {
            self.nodes.push(NodeSpec::new(NodeRole::ControlPlane));
        }
        for node in &mut self.nodes {
            if node.image.is_empty() {
                node.image = DEFAULT_NODE_IMAGE.to_string();
            }
        }
        let net = &mut self.networking;
        let v6 = net.ip_family == IpFamily::Ipv6;
        if net.api_server_address.is_empty() {
            net.api_server_address = net.ip_family.loopback().to_string();
        }
        if net.pod_subnet.is_empty() {
            net.pod_subnet = if v6 { "fd00:10:244::/56" } else { "10.244.0.0/16" }.to_string();
        }
        if net.service_subnet.is_empty() {
            net.service_subnet = if v6 { "fd00:10:96::/112" } else { "10.96.0.0/16" }.to_string();
        }
        self
    }

    /// Check the cluster spec for everything that would make provisioning fail later.
    /// All problems are reported at once.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut errs = Vec::new();
        let net = &self.networking;

        if self.control_plane_count() == 0 {
            errs.push("must have at least one control-plane node".to_string());
        }
        for (i, node) in self.nodes.iter().enumerate() {
            if node.role == NodeRole::ExternalLoadBalancer {
                errs.push(format!("node #{i}: role external-load-balancer is reserved"));
            }
            if node.image.is_empty() {
                errs.push(format!("node #{i}: image is empty"));
            }
            for mapping in &node.extra_port_mappings {
                if mapping.container_port == 0 {
                    errs.push(format!("node #{i}: containerPort must be non-zero"));
                }
                if !mapping.listen_address.is_empty()
                    && mapping.listen_address.parse::<IpAddr>().is_err()
                {
                    errs.push(format!(
                        "node #{i}: invalid listenAddress {:?}",
                        mapping.listen_address
                    ));
                }
            }
            for mount in &node.extra_mounts {
                if !mount.container_path.starts_with('/') {
                    errs.push(format!(
                        "node #{i}: containerPath {:?} must be absolute",
                        mount.container_path
                    ));
                }
            }
            check_json_patches(&node.json_patches, &format!("node #{i}: "), &mut errs);
        }
        check_json_patches(&self.json_patches, "", &mut errs);

        match net.api_server_address.parse::<IpAddr>() {
            Ok(addr) if !net.ip_family.matches(&addr) => errs.push(format!(
                "apiServerAddress {} does not match ipFamily {:?}",
                addr, net.ip_family
            )),
            Ok(_) => {}
            Err(_) => errs.push(format!(
                "invalid apiServerAddress {:?}",
                net.api_server_address
            )),
        }
        for (field, value) in [
            ("podSubnet", &net.pod_subnet),
            ("serviceSubnet", &net.service_subnet),
        ] {
            if let Err(e) = check_cidr(value, net.ip_family) {
                errs.push(format!("invalid {field} {value:?}: {e}"));
            }
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(ValidationError(errs))
        }
    }

    pub fn control_plane_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.role == NodeRole::ControlPlane)
            .count()
    }

    pub fn worker_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.role == NodeRole::Worker)
            .count()
    }

    /// More than one control plane means an external load balancer fronts the API.
    pub fn is_ha(&self) -> bool {
        self.control_plane_count() > 1
    }
}

fn check_json_patches(patches: &[PatchJson6902], prefix: &str, errs: &mut Vec<String>) {
    for (i, p) in patches.iter().enumerate() {
        if p.kind.is_empty() {
            errs.push(format!("{prefix}JSON patch #{i}: kind is required"));
        }
    }
}

fn check_cidr(cidr: &str, family: IpFamily) -> anyhow::Result<()> {
    let (addr, prefix) = cidr
        .split_once('/')
        .context("expected <address>/<prefix length>")?;
    let addr: IpAddr = addr.parse()?;
    let prefix: u8 = prefix.parse()?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    anyhow::ensure!(prefix <= max, "prefix length {prefix} exceeds {max}");
    anyhow::ensure!(
        family.matches(&addr),
        "address family does not match ipFamily {family:?}"
    );
    Ok(())
}

/// Cluster names:
///   must not be empty
///   contain only ascii alphanumerics, '-', '_' or '.'
///   should be at most 50 characters, longer names work but produce
///   unwieldy container and host names
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ClusterName(String);

impl ClusterName {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Default for ClusterName {
    fn default() -> Self {
        Self(DEFAULT_CLUSTER_NAME.to_string())
    }
}

impl FromStr for ClusterName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        anyhow::ensure!(!s.is_empty(), "cluster name cannot be an empty string");
        anyhow::ensure!(
            s.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')),
            "cluster name must contain only alphanumerics, '-', '_' or '.'"
        );
        if s.len() > 50 {
            warn!(name = s, "cluster name is longer than 50 characters");
        }
        Ok(Self(s.to_string()))
    }
}

impl Debug for ClusterName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for ClusterName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// keep node containers around when creation fails
    pub retain: bool,
    /// zero skips the readiness wait
    pub wait_for_ready: Duration,
}
