use anyhow::Context;
use async_trait::async_trait;
use minijinja::Environment;
use serde::Serialize;
use tracing::debug;

use super::{Action, ActionContext};
use crate::{
    config::IpFamily,
    kubeadm::{join_host_port, API_SERVER_PORT},
    node::{external_load_balancer, with_role, NodeRole},
};

pub const HAPROXY_CONFIG_PATH: &str = "/usr/local/etc/haproxy/haproxy.cfg";

const HAPROXY_TEMPLATE: &str = include_str!("../../templates/haproxy.cfg");

#[derive(Serialize, Debug)]
pub struct HaproxyData {
    pub frontend_port: u16,
    pub ipv6: bool,
    pub resolve_prefer: &'static str,
    pub backends: Vec<Backend>,
}

#[derive(Serialize, Debug)]
pub struct Backend {
    pub name: String,
    pub address: String,
}

pub fn render_haproxy(data: &HaproxyData) -> anyhow::Result<String> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.set_keep_trailing_newline(true);
    env.add_template("haproxy", HAPROXY_TEMPLATE)?;
    let rendered = env
        .get_template("haproxy")?
        .render(data)
        .context("failed to render haproxy config")?;
    Ok(rendered)
}

/// Points the load balancer at every control plane and has it reload.
pub struct ConfigureLoadBalancer;

#[async_trait]
impl Action for ConfigureLoadBalancer {
    fn description(&self) -> &'static str {
        "Configuring the external load balancer"
    }

    async fn execute(&self, ctx: &mut ActionContext) -> anyhow::Result<()> {
        let Some(lb) = external_load_balancer(ctx.nodes())? else {
            return Ok(());
        };
        let family = ctx.spec.networking.ip_family;

        let mut backends = Vec::new();
        for cp in with_role(ctx.nodes(), NodeRole::ControlPlane) {
            let address = cp.address(family).await?;
            backends.push(Backend {
                name: cp.name().to_string(),
                address: join_host_port(&address, API_SERVER_PORT),
            });
        }
        let config = render_haproxy(&HaproxyData {
            frontend_port: API_SERVER_PORT,
            ipv6: family == IpFamily::Ipv6,
            resolve_prefer: match family {
                IpFamily::Ipv4 => "ipv4",
                IpFamily::Ipv6 => "ipv6",
            },
            backends,
        })?;
        debug!(node = lb.name(), %config, "writing load balancer config");

        lb.write_file(HAPROXY_CONFIG_PATH, &config, 0o644).await?;
        lb.signal("SIGHUP")
            .await
            .with_context(|| format!("failed to reload load balancer {}", lb.name()))
    }
}
