//! Cluster lifecycle: create with rollback, list, delete, export access.

use std::{
    collections::{BTreeSet, HashMap},
    path::Path,
    sync::Arc,
};

use anyhow::Context;
use tracing::{error, info, warn};

use crate::{
    actions::{self, ActionContext},
    config::{ClusterName, ClusterSpec, CreateOptions},
    kubeconfig,
    load::{load_image_archive, load_images},
    node::{kubernetes_nodes, Node, NodeRole, CLUSTER_LABEL, ROLE_LABEL},
    provision::Provisioner,
    runtime::ContainerRuntime,
};

pub struct Provider {
    runtime: Arc<dyn ContainerRuntime>,
    host_env: Option<HashMap<String, String>>,
}

impl Provider {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            host_env: None,
        }
    }

    /// Use `host_env` instead of the process environment when looking for
    /// proxy settings.
    pub fn with_host_env(mut self, host_env: HashMap<String, String>) -> Self {
        self.host_env = Some(host_env);
        self
    }

    /// Create a cluster and return its kubeconfig.
    ///
    /// The cluster spec is defaulted and validated before anything is created. Once
    /// containers exist, any failure deletes every container of the cluster
    /// unless `opts.retain` is set.
    pub async fn create_cluster(
        &self,
        name: &ClusterName,
        spec: ClusterSpec,
        opts: &CreateOptions,
    ) -> anyhow::Result<String> {
        let spec = spec.defaulted();
        spec.validate()?;
        anyhow::ensure!(
            self.list_nodes(name).await?.is_empty(),
            "node(s) already exist for a cluster with the name {name:?}"
        );
        info!(cluster = %name, "creating cluster");

        let mut provisioner = Provisioner::new(self.runtime.clone());
        if let Some(env) = &self.host_env {
            provisioner = provisioner.with_host_env(env.clone());
        }
        let nodes = match provisioner.provision(name, &spec).await {
            Ok(nodes) => nodes,
            Err(e) => {
                self.rollback(name, opts).await;
                return Err(e);
            }
        };

        let actions = actions::pipeline(&spec, opts);
        let mut ctx = ActionContext::new(name.clone(), spec, nodes);
        let result = async {
            actions::run(&actions, &mut ctx).await?;
            kubeconfig::materialize(ctx.nodes(), &ctx.cluster, &ctx.spec).await
        }
        .await;

        match result {
            Ok(kubeconfig) => {
                info!(cluster = %name, "cluster is up");
                Ok(kubeconfig)
            }
            Err(e) => {
                self.rollback(name, opts).await;
                Err(e)
            }
        }
    }

    /// Delete what a failed create left behind. Deletion problems are logged
    /// and swallowed so the triggering error is what the caller sees.
    async fn rollback(&self, name: &ClusterName, opts: &CreateOptions) {
        if opts.retain {
            warn!(cluster = %name, "cluster creation failed, keeping nodes for debugging");
            return;
        }
        if let Err(e) = self.delete_cluster(name).await {
            error!(cluster = %name, "failed to roll back: {:#}", e);
        }
    }

    /// Every node container labelled with the cluster's name.
    pub async fn list_nodes(&self, name: &ClusterName) -> anyhow::Result<Vec<Node>> {
        let ids = self
            .runtime
            .list_by_label(CLUSTER_LABEL, name.as_str())
            .await
            .with_context(|| format!("failed to list nodes of cluster {name}"))?;
        let mut nodes = Vec::with_capacity(ids.len());
        for id in ids {
            let role: NodeRole = self
                .runtime
                .label(&id, ROLE_LABEL)
                .await?
                .parse()
                .with_context(|| format!("node {id} has a bad role label"))?;
            nodes.push(Node::new(id, role, self.runtime.clone()));
        }
        Ok(nodes)
    }

    /// Remove every node of the cluster. Deleting a cluster that does not
    /// exist succeeds.
    pub async fn delete_cluster(&self, name: &ClusterName) -> anyhow::Result<()> {
        let ids = self
            .runtime
            .list_by_label(CLUSTER_LABEL, name.as_str())
            .await
            .with_context(|| format!("failed to list nodes of cluster {name}"))?;
        if ids.is_empty() {
            return Ok(());
        }
        info!(cluster = %name, nodes = ids.len(), "deleting nodes");
        self.runtime
            .delete(&ids)
            .await
            .with_context(|| format!("failed to delete nodes of cluster {name}"))
    }

    /// The kubeconfig of an existing cluster.
    pub async fn kubeconfig(&self, name: &ClusterName, spec: &ClusterSpec) -> anyhow::Result<String> {
        let nodes = self.list_nodes(name).await?;
        anyhow::ensure!(!nodes.is_empty(), "no nodes found for cluster {name:?}");
        kubeconfig::materialize(&nodes, name, spec).await
    }

    /// Load a `docker save` archive into every Kubernetes node of a cluster.
    pub async fn load_image_archive(&self, name: &ClusterName, archive: &Path) -> anyhow::Result<()> {
        let nodes = self.list_nodes(name).await?;
        let targets = kubernetes_nodes(&nodes);
        anyhow::ensure!(!targets.is_empty(), "no nodes found for cluster {name:?}");
        load_image_archive(&targets, archive).await
    }

    /// Copy images from the host engine into a cluster's Kubernetes nodes,
    /// or only into `only_nodes` when that is non-empty.
    pub async fn load_docker_images(
        &self,
        name: &ClusterName,
        images: &[String],
        only_nodes: &[String],
    ) -> anyhow::Result<()> {
        anyhow::ensure!(!images.is_empty(), "no images to load");
        let nodes = self.list_nodes(name).await?;
        let mut targets = kubernetes_nodes(&nodes);
        anyhow::ensure!(!targets.is_empty(), "no nodes found for cluster {name:?}");
        if !only_nodes.is_empty() {
            if let Some(unknown) = only_nodes
                .iter()
                .find(|wanted| !targets.iter().any(|n| n.name() == wanted.as_str()))
            {
                anyhow::bail!("unknown node: {unknown:?}");
            }
            targets.retain(|n| only_nodes.iter().any(|wanted| wanted == n.name()));
        }
        load_images(&*self.runtime, &targets, images).await
    }

    /// Names of every cluster with at least one node, sorted.
    pub async fn list_clusters(&self) -> anyhow::Result<Vec<String>> {
        let names: BTreeSet<String> = self
            .runtime
            .label_values(CLUSTER_LABEL)
            .await
            .context("failed to list clusters")?
            .into_iter()
            .collect();
        Ok(names.into_iter().collect())
    }
}
