//! The client configuration handed back once a cluster is up.

use std::collections::BTreeMap;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{
    actions::ADMIN_KUBECONFIG,
    config::{ClusterName, ClusterSpec},
    kubeadm::{join_host_port, API_SERVER_PORT},
    node::{bootstrap_control_plane, external_load_balancer, Node},
};

type Extra = BTreeMap<String, serde_yaml::Value>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    #[serde(rename = "apiVersion", default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub clusters: Vec<NamedCluster>,
    #[serde(default)]
    pub contexts: Vec<NamedContext>,
    #[serde(default)]
    pub users: Vec<NamedUser>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_context: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: ClusterEntry,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClusterEntry {
    pub server: String,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NamedContext {
    pub name: String,
    pub context: ContextEntry,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ContextEntry {
    pub cluster: String,
    pub user: String,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NamedUser {
    pub name: String,
    /// credentials, passed through untouched
    pub user: Extra,
}

impl Kubeconfig {
    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(text).context("failed to parse kubeconfig")
    }

    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Rename the single cluster, context and user of a kubeadm admin config
    /// to `kind-<cluster>` and point it at `server`.
    pub fn for_cluster(mut self, cluster: &ClusterName, server: &str) -> anyhow::Result<Self> {
        anyhow::ensure!(
            self.clusters.len() == 1 && self.contexts.len() == 1 && self.users.len() == 1,
            "expected exactly one cluster, context and user, found {}, {} and {}",
            self.clusters.len(),
            self.contexts.len(),
            self.users.len()
        );
        let name = format!("kind-{cluster}");
        self.clusters[0].name = name.clone();
        self.clusters[0].cluster.server = server.to_string();
        self.users[0].name = name.clone();
        let context = &mut self.contexts[0];
        context.name = name.clone();
        context.context.cluster = name.clone();
        context.context.user = name.clone();
        self.current_context = Some(name);
        Ok(self)
    }
}

/// Read the admin kubeconfig off the bootstrap control plane and rewrite it
/// for use from the host.
pub async fn materialize(
    nodes: &[Node],
    cluster: &ClusterName,
    spec: &ClusterSpec,
) -> anyhow::Result<String> {
    let bootstrap = bootstrap_control_plane(nodes)?;
    let exposed = external_load_balancer(nodes)?.unwrap_or(bootstrap);
    let host_port = exposed
        .host_port(API_SERVER_PORT)
        .await
        .with_context(|| format!("failed to find the API server port of {}", exposed.name()))?;
    let server = format!(
        "https://{}",
        join_host_port(&spec.networking.api_server_address, host_port)
    );
    let admin = bootstrap.read_file(ADMIN_KUBECONFIG).await?;
    Kubeconfig::from_yaml(&admin)?
        .for_cluster(cluster, &server)?
        .to_yaml()
}
