use async_trait::async_trait;
use futures::FutureExt;
use tracing::debug;

use super::{Action, ActionContext};
use crate::{
    concurrent::{run_all_first_error, Task},
    kubeadm::{KubeVersion, CONFIG_PATH},
    node::{bootstrap_control_plane, secondary_control_planes, with_role, Node, NodeRole},
};

/// Cluster-wide key material every control plane must share, relative to
/// `/etc/kubernetes/pki`.
pub const SHARED_CERTS: &[&str] = &[
    "ca.crt",
    "ca.key",
    "front-proxy-ca.crt",
    "front-proxy-ca.key",
    "sa.pub",
    "sa.key",
    "etcd/ca.crt",
    "etcd/ca.key",
];

/// Joins secondary control planes one at a time, then all workers at once.
pub struct KubeadmJoin;

#[async_trait]
impl Action for KubeadmJoin {
    fn description(&self) -> &'static str {
        "Joining nodes"
    }

    async fn execute(&self, ctx: &mut ActionContext) -> anyhow::Result<()> {
        let version: KubeVersion = ctx.kubernetes_version()?.parse()?;
        let nodes = ctx.nodes();
        let bootstrap = bootstrap_control_plane(nodes)?;

        // etcd membership changes must not overlap
        for node in secondary_control_planes(nodes) {
            copy_shared_certs(bootstrap, node).await?;
            join(node, version).await?;
        }

        let tasks: Vec<Task> = with_role(nodes, NodeRole::Worker)
            .into_iter()
            .map(|node| {
                let node = node.clone();
                async move { join(&node, version).await }.boxed()
            })
            .collect();
        run_all_first_error(tasks).await
    }
}

async fn copy_shared_certs(from: &Node, to: &Node) -> anyhow::Result<()> {
    for file in SHARED_CERTS {
        let path = format!("/etc/kubernetes/pki/{file}");
        let content = from.read_file(&path).await?;
        to.write_file(&path, &content, cert_mode(file)).await?;
    }
    debug!(from = from.name(), to = to.name(), "copied shared certificates");
    Ok(())
}

/// Private keys are readable by root alone.
fn cert_mode(file: &str) -> u32 {
    if file.ends_with(".key") {
        0o600
    } else {
        0o644
    }
}

async fn join(node: &Node, version: KubeVersion) -> anyhow::Result<()> {
    let config = format!("--config={CONFIG_PATH}");
    let mut args = vec!["kubeadm", "join", config.as_str(), "--v=6"];
    if version.needs_preflight_skip() {
        args.push("--skip-phases=preflight");
    }
    let out = node.exec(&args).await?;
    debug!(node = node.name(), "kubeadm join output:\n{}", out);
    Ok(())
}
