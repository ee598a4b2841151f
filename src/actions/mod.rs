//! The ordered steps that turn freshly created node containers into a
//! working cluster.

use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{error, info};

use crate::{
    config::{ClusterName, ClusterSpec, CreateOptions},
    node::Node,
};

pub mod cni;
pub mod config;
pub mod endpoint;
pub mod init;
pub mod join;
pub mod loadbalancer;
pub mod storage;
pub mod wait;

pub const ADMIN_KUBECONFIG: &str = "/etc/kubernetes/admin.conf";

/// One step of cluster creation.
#[async_trait]
pub trait Action: Send + Sync {
    /// shown to the user while the step runs
    fn description(&self) -> &'static str;

    async fn execute(&self, ctx: &mut ActionContext) -> anyhow::Result<()>;
}

/// Progress lines for the person waiting on cluster creation.
#[derive(Debug, Default)]
pub struct Status {
    current: Option<(String, Instant)>,
}

impl Status {
    pub fn start(&mut self, message: impl Into<String>) {
        let message = message.into();
        info!(" • {}", message);
        self.current = Some((message, Instant::now()));
    }

    pub fn end(&mut self, success: bool) {
        if let Some((message, started)) = self.current.take() {
            let elapsed = started.elapsed();
            if success {
                info!(?elapsed, " ✓ {}", message);
            } else {
                error!(?elapsed, " ✗ {}", message);
            }
        }
    }
}

/// State shared by every action of one cluster creation. Values discovered
/// along the way can be recorded exactly once.
#[derive(Debug)]
pub struct ActionContext {
    pub cluster: ClusterName,
    pub spec: ClusterSpec,
    pub status: Status,
    nodes: Vec<Node>,
    token: String,
    control_plane_endpoint: Option<String>,
    kubernetes_version: Option<String>,
}

impl ActionContext {
    pub fn new(cluster: ClusterName, spec: ClusterSpec, nodes: Vec<Node>) -> Self {
        Self {
            cluster,
            spec,
            status: Status::default(),
            nodes,
            token: crate::kubeadm::generate_token(),
            control_plane_endpoint: None,
            kubernetes_version: None,
        }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// bootstrap token shared by every node's kubeadm config
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn control_plane_endpoint(&self) -> anyhow::Result<&str> {
        self.control_plane_endpoint
            .as_deref()
            .context("control plane endpoint has not been resolved yet")
    }

    pub fn set_control_plane_endpoint(&mut self, endpoint: String) -> anyhow::Result<()> {
        set_once(&mut self.control_plane_endpoint, endpoint, "control plane endpoint")
    }

    pub fn kubernetes_version(&self) -> anyhow::Result<&str> {
        self.kubernetes_version
            .as_deref()
            .context("kubernetes version has not been discovered yet")
    }

    pub fn set_kubernetes_version(&mut self, version: String) -> anyhow::Result<()> {
        set_once(&mut self.kubernetes_version, version, "kubernetes version")
    }
}

fn set_once(slot: &mut Option<String>, value: String, what: &str) -> anyhow::Result<()> {
    if let Some(existing) = slot {
        anyhow::bail!("{what} is already set to {existing:?}");
    }
    *slot = Some(value);
    Ok(())
}

/// The steps of cluster creation, in order.
pub fn pipeline(spec: &ClusterSpec, opts: &CreateOptions) -> Vec<Box<dyn Action>> {
    let mut actions: Vec<Box<dyn Action>> = vec![
        Box::new(endpoint::ResolveEndpoint),
        Box::new(loadbalancer::ConfigureLoadBalancer),
        Box::new(config::WriteKubeadmConfig),
        Box::new(init::KubeadmInit),
    ];
    if !spec.networking.disable_default_cni {
        actions.push(Box::new(cni::InstallCni));
    }
    actions.push(Box::new(storage::InstallStorage));
    actions.push(Box::new(join::KubeadmJoin));
    actions.push(Box::new(wait::WaitForReady::new(opts.wait_for_ready)));
    actions
}

/// Run `actions` in order, stopping at the first failure.
pub async fn run(actions: &[Box<dyn Action>], ctx: &mut ActionContext) -> anyhow::Result<()> {
    for action in actions {
        ctx.status.start(action.description());
        let result = action.execute(ctx).await;
        ctx.status.end(result.is_ok());
        result.with_context(|| format!("{} failed", action.description()))?;
    }
    Ok(())
}
