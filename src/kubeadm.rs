//! Per-node kubeadm configuration.

use std::{fmt::Display, str::FromStr};

use anyhow::Context;
use minijinja::Environment;
use serde::Serialize;
use uuid::Uuid;

use crate::{config::PatchJson6902, patch};

pub const API_SERVER_PORT: u16 = 6443;
/// where every node expects its kubeadm configuration
pub const CONFIG_PATH: &str = "/kind/kubeadm.conf";

const CONTROL_PLANE_TEMPLATE: &str = include_str!("../templates/kubeadm-control-plane.yaml");
const WORKER_TEMPLATE: &str = include_str!("../templates/kubeadm-worker.yaml");

/// Template inputs for one node's bootstrap documents.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ConfigData {
    pub cluster_name: String,
    pub kubernetes_version: String,
    /// host:port every node uses to reach the API server
    pub control_plane_endpoint: String,
    pub api_bind_port: u16,
    pub api_server_address: String,
    pub token: String,
    pub pod_subnet: String,
    pub service_subnet: String,
    pub ipv6: bool,
    pub control_plane: bool,
    pub node_address: String,
    pub node_name: String,
}

/// Render the unpatched document stream for a node.
pub fn render(data: &ConfigData) -> anyhow::Result<String> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.set_keep_trailing_newline(true);
    env.add_template("control-plane", CONTROL_PLANE_TEMPLATE)?;
    env.add_template("worker", WORKER_TEMPLATE)?;
    let name = if data.control_plane {
        "control-plane"
    } else {
        "worker"
    };
    let rendered = env
        .get_template(name)?
        .render(data)
        .with_context(|| format!("failed to render {name} kubeadm config"))?;
    Ok(rendered)
}

/// Patches applied together in one pass over a node's documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatchSet<'a> {
    pub merge: &'a [String],
    pub json: &'a [PatchJson6902],
}

/// Render, patch, then strip the `metadata: {name: config}` stanza the
/// templates carry only so that patches can match on it.
///
/// Each set is a separate pass over the output of the one before, so a
/// later set wins over every patch of an earlier one.
pub fn generate(data: &ConfigData, sets: &[PatchSet<'_>]) -> anyhow::Result<String> {
    let mut documents = render(data)?;
    for (round, set) in sets.iter().enumerate() {
        documents = patch::apply(&documents, set.merge, set.json)
            .with_context(|| format!("failed to patch kubeadm config (pass {})", round + 1))?;
    }
    Ok(remove_metadata_marker(&documents))
}

/// Drop `metadata:` blocks whose only content is `name: config`.
pub fn remove_metadata_marker(documents: &str) -> String {
    let lines: Vec<&str> = documents.split_inclusive('\n').collect();
    let mut out = String::with_capacity(documents.len());
    let mut i = 0;
    while i < lines.len() {
        let is_marker = lines[i].trim_end() == "metadata:"
            && lines.get(i + 1).map(|l| l.trim_end()) == Some("  name: config")
            && lines
                .get(i + 2)
                .map_or(true, |l| !l.starts_with(' ') && !l.starts_with('\t'));
        if is_marker {
            i += 2;
        } else {
            out.push_str(lines[i]);
            i += 1;
        }
    }
    out
}

/// A fresh bootstrap token, `[a-z0-9]{6}.[a-z0-9]{16}`.
pub fn generate_token() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{}.{}", &hex[..6], &hex[6..22])
}

/// The major.minor.patch part of a Kubernetes version such as `v1.27.3`
/// or `v1.28.0-alpha.1+abc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KubeVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl KubeVersion {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// kubeadm before 1.23 trips over the node container's preflight checks
    pub fn needs_preflight_skip(self) -> bool {
        self < Self::new(1, 23, 0)
    }

    /// the label kubeadm marks control plane nodes with
    pub fn control_plane_label(self) -> &'static str {
        if self < Self::new(1, 20, 0) {
            "node-role.kubernetes.io/master"
        } else {
            "node-role.kubernetes.io/control-plane"
        }
    }

    /// the taint single-node clusters remove so workloads can schedule
    pub fn control_plane_taint(self) -> &'static str {
        if self < Self::new(1, 24, 0) {
            "node-role.kubernetes.io/master-"
        } else {
            "node-role.kubernetes.io/control-plane-"
        }
    }
}

impl FromStr for KubeVersion {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let trimmed = s.trim().trim_start_matches('v');
        let core = trimmed
            .split(|c: char| c == '-' || c == '+')
            .next()
            .unwrap_or_default();
        let mut parts = core.split('.').map(str::parse::<u64>);
        let mut next = |what: &str| -> anyhow::Result<u64> {
            parts
                .next()
                .with_context(|| format!("version {s:?} is missing its {what} number"))?
                .with_context(|| format!("version {s:?} has a bad {what} number"))
        };
        let version = Self::new(next("major")?, next("minor")?, next("patch")?);
        Ok(version)
    }
}

impl Display for KubeVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// `address:port`, bracketing IPv6 addresses.
pub fn join_host_port(address: &str, port: u16) -> String {
    if address.contains(':') {
        format!("[{address}]:{port}")
    } else {
        format!("{address}:{port}")
    }
}
