use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::info;

use super::{Action, ActionContext};
use crate::{kubeadm::KubeVersion, node::bootstrap_control_plane, wait::wait_for_ready};

pub struct WaitForReady {
    timeout: Duration,
}

impl WaitForReady {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Action for WaitForReady {
    fn description(&self) -> &'static str {
        "Waiting for the control plane to be ready"
    }

    async fn execute(&self, ctx: &mut ActionContext) -> anyhow::Result<()> {
        if self.timeout.is_zero() {
            return Ok(());
        }
        let version: KubeVersion = ctx.kubernetes_version()?.parse()?;
        let node = bootstrap_control_plane(ctx.nodes())?;
        let started = Instant::now();
        wait_for_ready(node, version, self.timeout).await?;
        info!(elapsed = ?started.elapsed(), "control plane is ready");
        Ok(())
    }
}
