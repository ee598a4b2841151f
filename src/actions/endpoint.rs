use async_trait::async_trait;
use tracing::debug;

use super::{Action, ActionContext};
use crate::{
    kubeadm::{join_host_port, API_SERVER_PORT},
    node::{bootstrap_control_plane, external_load_balancer},
};

/// Records where nodes should reach the API server: the load balancer when
/// there is one, otherwise the only control plane.
pub struct ResolveEndpoint;

#[async_trait]
impl Action for ResolveEndpoint {
    fn description(&self) -> &'static str {
        "Resolving the control plane endpoint"
    }

    async fn execute(&self, ctx: &mut ActionContext) -> anyhow::Result<()> {
        let family = ctx.spec.networking.ip_family;
        let target = match external_load_balancer(ctx.nodes())? {
            Some(lb) => lb,
            None => bootstrap_control_plane(ctx.nodes())?,
        };
        let address = target.address(family).await?;
        let endpoint = join_host_port(&address, API_SERVER_PORT);
        debug!(%endpoint, via = target.name(), "resolved control plane endpoint");
        ctx.set_control_plane_endpoint(endpoint)
    }
}
