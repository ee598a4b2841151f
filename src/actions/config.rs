use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use futures::FutureExt;
use tracing::debug;

use super::{Action, ActionContext};
use crate::{
    concurrent::{run_all_first_error, Task},
    config::{IpFamily, NodeSpec},
    kubeadm::{self, ConfigData, PatchSet, API_SERVER_PORT, CONFIG_PATH},
    node::{bootstrap_control_plane, kubernetes_nodes, NodeNamer, NodeRole},
    patch,
};

pub const CONTAINERD_CONFIG_PATH: &str = "/etc/containerd/config.toml";

/// Patches containerd when the cluster spec asks for it, then generates
/// and writes every node's kubeadm config, one node per task.
pub struct WriteKubeadmConfig;

#[async_trait]
impl Action for WriteKubeadmConfig {
    fn description(&self) -> &'static str {
        "Writing configuration"
    }

    async fn execute(&self, ctx: &mut ActionContext) -> anyhow::Result<()> {
        let spec = &ctx.spec;
        if !spec.containerd_config_patches.is_empty()
            || !spec.containerd_config_patches_json6902.is_empty()
        {
            run_all_first_error(containerd_tasks(ctx)).await?;
        }
        run_all_first_error(config_tasks(ctx)?).await?;

        let version = bootstrap_control_plane(ctx.nodes())?.kube_version().await?;
        ctx.set_kubernetes_version(version)
    }
}

/// Patch and reload containerd on every Kubernetes node.
fn containerd_tasks(ctx: &ActionContext) -> Vec<Task> {
    kubernetes_nodes(ctx.nodes())
        .into_iter()
        .map(|node| {
            let node = node.clone();
            let merges = ctx.spec.containerd_config_patches.clone();
            let json = ctx.spec.containerd_config_patches_json6902.clone();
            async move {
                let current = node.read_file(CONTAINERD_CONFIG_PATH).await?;
                let patched = patch::apply_toml(&current, &merges, &json).with_context(|| {
                    format!("failed to patch containerd config on node {}", node.name())
                })?;
                node.write_file(CONTAINERD_CONFIG_PATH, &patched, 0o644)
                    .await?;
                // restart only on a fully booted node
                node.exec(&[
                    "bash",
                    "-c",
                    "! systemctl is-system-running || systemctl restart containerd",
                ])
                .await?;
                debug!(node = node.name(), "patched containerd config");
                Ok(())
            }
            .boxed()
        })
        .collect()
}

fn config_tasks(ctx: &ActionContext) -> anyhow::Result<Vec<Task>> {
    let net = &ctx.spec.networking;
    let family = net.ip_family;
    let template = ConfigData {
        cluster_name: ctx.cluster.to_string(),
        kubernetes_version: String::new(),
        control_plane_endpoint: ctx.control_plane_endpoint()?.to_string(),
        api_bind_port: API_SERVER_PORT,
        api_server_address: net.api_server_address.clone(),
        token: ctx.token().to_string(),
        pod_subnet: net.pod_subnet.clone(),
        service_subnet: net.service_subnet.clone(),
        ipv6: family == IpFamily::Ipv6,
        control_plane: false,
        node_address: String::new(),
        node_name: String::new(),
    };

    // provisioning names nodes in spec order, so the same walk finds
    // each node's entry again
    let mut namer = NodeNamer::new(ctx.cluster.as_str());
    let entries: HashMap<String, &NodeSpec> = ctx
        .spec
        .nodes
        .iter()
        .map(|n| (namer.next(n.role), n))
        .collect();

    let mut tasks: Vec<Task> = Vec::new();
    for node in kubernetes_nodes(ctx.nodes()) {
        let control_plane = node.role() == NodeRole::ControlPlane;
        let cluster_patches = (ctx.spec.merge_patches.clone(), ctx.spec.json_patches.clone());
        // only worker entries carry their own patches, applied after the
        // cluster's
        let node_patches = match entries.get(node.name()) {
            Some(entry) if !control_plane => {
                (entry.merge_patches.clone(), entry.json_patches.clone())
            }
            _ => Default::default(),
        };
        let mut data = ConfigData {
            control_plane,
            node_name: node.name().to_string(),
            ..template.clone()
        };
        let node = node.clone();
        tasks.push(
            async move {
                data.kubernetes_version = node.kube_version().await?;
                data.node_address = node.address(family).await?;
                let sets = [
                    PatchSet {
                        merge: &cluster_patches.0,
                        json: &cluster_patches.1,
                    },
                    PatchSet {
                        merge: &node_patches.0,
                        json: &node_patches.1,
                    },
                ];
                let config = kubeadm::generate(&data, &sets)
                    .with_context(|| {
                        format!("failed to generate kubeadm config for node {}", node.name())
                    })?;
                debug!(node = node.name(), %config, "using kubeadm config");
                node.write_file(CONFIG_PATH, &config, 0o644).await
            }
            .boxed(),
        );
    }
    Ok(tasks)
}
