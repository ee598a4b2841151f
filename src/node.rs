use std::{
    collections::HashMap,
    fmt::{Debug, Display, Formatter},
    path::Path,
    str::FromStr,
    sync::Arc,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
    config::IpFamily,
    runtime::{ContainerRuntime, NodeAddresses},
};

pub const CLUSTER_LABEL: &str = "io.x-k8s.kind.cluster";
pub const ROLE_LABEL: &str = "io.x-k8s.kind.role";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    ControlPlane,
    Worker,
    ExternalLoadBalancer,
}

impl NodeRole {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeRole::ControlPlane => "control-plane",
            NodeRole::Worker => "worker",
            NodeRole::ExternalLoadBalancer => "external-load-balancer",
        }
    }
}

impl Display for NodeRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "control-plane" => Ok(NodeRole::ControlPlane),
            "worker" => Ok(NodeRole::Worker),
            "external-load-balancer" => Ok(NodeRole::ExternalLoadBalancer),
            other => anyhow::bail!("unknown node role {other:?}"),
        }
    }
}

/// Hands out `<cluster>-<role>`, then `<cluster>-<role>-2`, `-3` and so on.
#[derive(Debug)]
pub struct NodeNamer<'a> {
    cluster: &'a str,
    counts: HashMap<NodeRole, usize>,
}

impl<'a> NodeNamer<'a> {
    pub fn new(cluster: &'a str) -> Self {
        Self {
            cluster,
            counts: HashMap::new(),
        }
    }

    pub fn next(&mut self, role: NodeRole) -> String {
        let count = self.counts.entry(role).or_insert(0);
        *count += 1;
        if *count == 1 {
            format!("{}-{}", self.cluster, role)
        } else {
            format!("{}-{}-{}", self.cluster, role, count)
        }
    }
}

/// A running node container and the engine it runs on.
#[derive(Clone)]
pub struct Node {
    name: String,
    role: NodeRole,
    runtime: Arc<dyn ContainerRuntime>,
}

impl Debug for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Node({}, {})", self.name, self.role)
    }
}

impl Node {
    pub fn new(name: impl Into<String>, role: NodeRole, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            name: name.into(),
            role,
            runtime,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub async fn exec(&self, argv: &[&str]) -> anyhow::Result<String> {
        self.run(argv, None).await
    }

    pub async fn exec_with_stdin(&self, argv: &[&str], stdin: Vec<u8>) -> anyhow::Result<String> {
        self.run(argv, Some(stdin)).await
    }

    async fn run(&self, argv: &[&str], stdin: Option<Vec<u8>>) -> anyhow::Result<String> {
        trace!(node = %self.name, command = %argv.join(" "));
        self.runtime
            .exec(&self.name, argv, stdin)
            .await
            .with_context(|| format!("command \"{}\" failed on node {}", argv.join(" "), self.name))
    }

    /// Write `content` to the absolute path `dest` with permission bits
    /// `mode`, creating parent directories.
    pub async fn write_file(&self, dest: &str, content: &str, mode: u32) -> anyhow::Result<()> {
        let archive = single_file_tar(dest, content.as_bytes(), mode)?;
        self.exec_with_stdin(&["tar", "-x", "-f", "-", "-C", "/"], archive)
            .await
            .with_context(|| format!("failed to write {dest} on node {}", self.name))?;
        Ok(())
    }

    pub async fn read_file(&self, path: &str) -> anyhow::Result<String> {
        self.exec(&["cat", path]).await
    }

    pub async fn copy_from_host(&self, host_path: &Path, dest: &str) -> anyhow::Result<()> {
        self.runtime
            .copy_file(host_path, &self.name, dest)
            .await
            .with_context(|| {
                format!(
                    "failed to copy {} to {}:{}",
                    host_path.display(),
                    self.name,
                    dest
                )
            })
    }

    pub async fn addresses(&self) -> anyhow::Result<NodeAddresses> {
        self.runtime.inspect_ip(&self.name).await
    }

    /// The node's container address in the given family.
    pub async fn address(&self, family: IpFamily) -> anyhow::Result<String> {
        let addrs = self.addresses().await?;
        let addr = match family {
            IpFamily::Ipv4 => addrs.ipv4,
            IpFamily::Ipv6 => addrs.ipv6,
        };
        addr.with_context(|| format!("node {} has no {:?} address", self.name, family))
    }

    /// The Kubernetes version baked into the node image.
    pub async fn kube_version(&self) -> anyhow::Result<String> {
        let out = self.read_file("/kind/version").await?;
        let version = out.trim();
        anyhow::ensure!(
            !version.is_empty(),
            "node {} reported an empty kubernetes version",
            self.name
        );
        Ok(version.to_string())
    }

    pub async fn host_port(&self, container_port: u16) -> anyhow::Result<u16> {
        self.runtime.port(&self.name, container_port).await
    }

    pub async fn signal(&self, signal: &str) -> anyhow::Result<()> {
        self.runtime.signal(&self.name, signal).await
    }
}

fn single_file_tar(dest: &str, content: &[u8], mode: u32) -> anyhow::Result<Vec<u8>> {
    let relative = dest.trim_start_matches('/');
    anyhow::ensure!(!relative.is_empty(), "refusing to write to {dest:?}");
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(mode);
    let mut archive = tar::Builder::new(Vec::new());
    archive.append_data(&mut header, relative, content)?;
    Ok(archive.into_inner()?)
}

/// Orders nodes so that `x-control-plane` sorts before `x-control-plane-2`,
/// which sorts before `x-control-plane-10`.
fn by_name(nodes: &mut [&Node]) {
    nodes.sort_by(|a, b| (a.name.len(), &a.name).cmp(&(b.name.len(), &b.name)));
}

pub fn with_role(nodes: &[Node], role: NodeRole) -> Vec<&Node> {
    let mut matching: Vec<&Node> = nodes.iter().filter(|n| n.role == role).collect();
    by_name(&mut matching);
    matching
}

/// The control plane kubeadm init runs on.
pub fn bootstrap_control_plane(nodes: &[Node]) -> anyhow::Result<&Node> {
    with_role(nodes, NodeRole::ControlPlane)
        .into_iter()
        .next()
        .context("cluster has no control-plane node")
}

pub fn secondary_control_planes(nodes: &[Node]) -> Vec<&Node> {
    with_role(nodes, NodeRole::ControlPlane)
        .into_iter()
        .skip(1)
        .collect()
}

pub fn external_load_balancer(nodes: &[Node]) -> anyhow::Result<Option<&Node>> {
    let lbs = with_role(nodes, NodeRole::ExternalLoadBalancer);
    anyhow::ensure!(
        lbs.len() <= 1,
        "cluster has {} external load balancers, expected at most one",
        lbs.len()
    );
    Ok(lbs.into_iter().next())
}

/// Every node that runs Kubernetes, i.e. everything but the load balancer.
pub fn kubernetes_nodes(nodes: &[Node]) -> Vec<&Node> {
    nodes
        .iter()
        .filter(|n| n.role != NodeRole::ExternalLoadBalancer)
        .collect()
}
