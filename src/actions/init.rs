use async_trait::async_trait;
use tracing::debug;

use super::{Action, ActionContext, ADMIN_KUBECONFIG};
use crate::{
    kubeadm::{KubeVersion, CONFIG_PATH},
    node::{bootstrap_control_plane, kubernetes_nodes},
};

/// Runs `kubeadm init` on the bootstrap control plane.
pub struct KubeadmInit;

#[async_trait]
impl Action for KubeadmInit {
    fn description(&self) -> &'static str {
        "Starting the control plane"
    }

    async fn execute(&self, ctx: &mut ActionContext) -> anyhow::Result<()> {
        let node = bootstrap_control_plane(ctx.nodes())?;
        let config = format!("--config={CONFIG_PATH}");
        let out = node
            .exec(&[
                "kubeadm",
                "init",
                "--skip-phases=preflight",
                config.as_str(),
                "--skip-token-print",
                "--v=6",
            ])
            .await?;
        debug!(node = node.name(), "kubeadm init output:\n{}", out);

        // a lone control plane also runs workloads
        if kubernetes_nodes(ctx.nodes()).len() == 1 {
            let version: KubeVersion = ctx.kubernetes_version()?.parse()?;
            let kubeconfig = format!("--kubeconfig={ADMIN_KUBECONFIG}");
            node.exec(&[
                "kubectl",
                kubeconfig.as_str(),
                "taint",
                "nodes",
                "--all",
                version.control_plane_taint(),
            ])
            .await?;
        }
        Ok(())
    }
}
