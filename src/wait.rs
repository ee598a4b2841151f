//! Polling a control plane until its nodes report Ready.

use std::time::Duration;

use k8s_openapi::api::core::v1::Node as KubeNode;
use serde::Deserialize;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

use crate::{
    actions::ADMIN_KUBECONFIG, errors::ReadinessTimeout, kubeadm::KubeVersion, node::Node,
};

pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Deserialize)]
struct NodeList {
    #[serde(default)]
    items: Vec<KubeNode>,
}

/// Wait until every control-plane node the API server knows about is Ready,
/// polling through `node`. `version` decides which label marks control
/// plane nodes.
///
/// A zero `timeout` returns immediately. Otherwise the check runs at least
/// once; failing checks count as "not ready yet". No check outlives the
/// deadline.
pub async fn wait_for_ready(
    node: &Node,
    version: KubeVersion,
    timeout: Duration,
) -> anyhow::Result<()> {
    wait_for_ready_every(node, version, timeout, POLL_INTERVAL).await
}

pub async fn wait_for_ready_every(
    node: &Node,
    version: KubeVersion,
    timeout: Duration,
    interval: Duration,
) -> anyhow::Result<()> {
    if timeout.is_zero() {
        return Ok(());
    }
    let selector = format!("--selector={}", version.control_plane_label());
    let deadline = Instant::now() + timeout;
    loop {
        let check = control_plane_ready(node, &selector);
        match tokio::time::timeout_at(deadline, check).await {
            Ok(Ok(true)) => return Ok(()),
            Ok(Ok(false)) => trace!(node = node.name(), "control plane not ready yet"),
            Ok(Err(e)) => debug!(node = node.name(), "readiness check failed: {:#}", e),
            Err(_) => debug!(node = node.name(), "readiness check ran into the deadline"),
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(ReadinessTimeout(timeout).into());
        }
        sleep(interval.min(deadline - now)).await;
    }
}

async fn control_plane_ready(node: &Node, selector: &str) -> anyhow::Result<bool> {
    let kubeconfig = format!("--kubeconfig={ADMIN_KUBECONFIG}");
    let out = node
        .exec(&[
            "kubectl",
            kubeconfig.as_str(),
            "get",
            "nodes",
            selector,
            "-o=json",
        ])
        .await?;
    let list: NodeList = serde_json::from_str(&out)?;
    Ok(all_ready(&list.items))
}

/// True when there is at least one node and every node's Ready condition is
/// True.
fn all_ready(nodes: &[KubeNode]) -> bool {
    !nodes.is_empty()
        && nodes.iter().all(|n| {
            n.status
                .as_ref()
                .and_then(|s| s.conditions.as_ref())
                .map_or(false, |conditions| {
                    conditions
                        .iter()
                        .any(|c| c.type_ == "Ready" && c.status == "True")
                })
        })
}
