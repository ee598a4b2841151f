//! Turns a cluster spec into running node containers.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    path::PathBuf,
    sync::Arc,
};

use anyhow::Context;
use futures::FutureExt;
use tracing::{info, warn};

use crate::{
    concurrent::{run_all_collect_errors, run_all_first_error, Task},
    config::{ClusterName, ClusterSpec, IpFamily, Mount},
    kubeadm::API_SERVER_PORT,
    node::{Node, NodeNamer, NodeRole, CLUSTER_LABEL, ROLE_LABEL},
    runtime::{ContainerRuntime, ContainerSpec, PortBinding},
};

pub mod ports;
pub mod proxy;

pub const LOAD_BALANCER_IMAGE: &str = "kindest/haproxy:v20230606-42a2262b";

pub struct Provisioner {
    runtime: Arc<dyn ContainerRuntime>,
    host_env: HashMap<String, String>,
}

impl Provisioner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            host_env: std::env::vars().collect(),
        }
    }

    /// Replace the host environment proxy settings are read from.
    pub fn with_host_env(mut self, host_env: HashMap<String, String>) -> Self {
        self.host_env = host_env;
        self
    }

    /// Create every node container for `spec`, in spec order, followed by the
    /// external load balancer when there is more than one control plane.
    ///
    /// All creations are attempted even if some fail. Containers that did get
    /// created are left for the caller to clean up.
    pub async fn provision(
        &self,
        cluster: &ClusterName,
        spec: &ClusterSpec,
    ) -> anyhow::Result<Vec<Node>> {
        let env = self.node_env(spec).await?;
        let planned = plan(cluster, spec, &env)?;
        self.pull_images(&planned).await;

        let tasks: Vec<Task> = planned
            .iter()
            .map(|(_, container)| {
                let runtime = self.runtime.clone();
                let container = container.clone();
                async move {
                    runtime.create_container(&container).await?;
                    info!(node = %container.name, "created node container");
                    Ok(())
                }
                .boxed()
            })
            .collect();
        run_all_first_error(tasks)
            .await
            .context("failed to create node containers")?;

        Ok(planned
            .into_iter()
            .map(|(role, container)| Node::new(container.name, role, self.runtime.clone()))
            .collect())
    }

    async fn node_env(&self, spec: &ClusterSpec) -> anyhow::Result<BTreeMap<String, String>> {
        let mut env = proxy::proxy_env(|k| self.host_env.get(k).cloned());
        if env.is_empty() {
            return Ok(env);
        }
        let mut extra = self
            .runtime
            .bridge_subnets()
            .await
            .context("failed to read bridge network subnets")?;
        extra.push(spec.networking.service_subnet.clone());
        extra.push(spec.networking.pod_subnet.clone());
        proxy::extend_no_proxy(&mut env, &extra);
        Ok(env)
    }

    /// Pull whatever images are missing. Failures are only warnings since the
    /// engine will try again on create.
    async fn pull_images(&self, planned: &[(NodeRole, ContainerSpec)]) {
        let images: BTreeSet<String> = planned.iter().map(|(_, c)| c.image.clone()).collect();
        let tasks: Vec<Task> = images
            .into_iter()
            .map(|image| {
                let runtime = self.runtime.clone();
                async move {
                    if runtime.image_present(&image).await? {
                        return Ok(());
                    }
                    info!(%image, "pulling image");
                    runtime
                        .pull_image(&image)
                        .await
                        .with_context(|| format!("failed to pull {image}"))
                }
                .boxed()
            })
            .collect();
        if let Err(e) = run_all_collect_errors(tasks).await {
            warn!("{:#}", e);
        }
    }
}

/// Container specs for every node, load balancer last. Host ports left as 0
/// are resolved to free ports here.
pub fn plan(
    cluster: &ClusterName,
    spec: &ClusterSpec,
    env: &BTreeMap<String, String>,
) -> anyhow::Result<Vec<(NodeRole, ContainerSpec)>> {
    let net = &spec.networking;
    let mut namer = NodeNamer::new(cluster.as_str());

    // with a load balancer in front, control planes only need to be
    // reachable from the host for debugging
    let (api_listen, api_port) = if spec.is_ha() {
        (net.ip_family.loopback(), 0)
    } else {
        (net.api_server_address.as_str(), net.api_server_port)
    };

    let mut extra_args: Vec<String> = vec![
        "--tmpfs=/tmp".into(),
        "--tmpfs=/run".into(),
        "--volume=/var".into(),
        "--volume=/lib/modules:/lib/modules:ro".into(),
        "--restart=on-failure:1".into(),
    ];
    if net.ip_family == IpFamily::Ipv6 {
        extra_args.push("--sysctl=net.ipv6.conf.all.disable_ipv6=0".into());
        extra_args.push("--sysctl=net.ipv6.conf.all.forwarding=1".into());
    }

    let mut planned = Vec::with_capacity(spec.nodes.len() + 1);
    for node in &spec.nodes {
        let name = namer.next(node.role);
        let mut bindings = Vec::with_capacity(node.extra_port_mappings.len() + 1);
        for mapping in &node.extra_port_mappings {
            let listen = if !mapping.listen_address.is_empty() {
                mapping.listen_address.as_str()
            } else if net.ip_family == IpFamily::Ipv6 {
                "::"
            } else {
                "0.0.0.0"
            };
            bindings.push(PortBinding {
                listen_address: listen.to_string(),
                host_port: ports::port_or_free(mapping.host_port, listen)?,
                container_port: mapping.container_port,
                protocol: mapping.protocol,
            });
        }
        if node.role == NodeRole::ControlPlane {
            bindings.push(PortBinding {
                listen_address: api_listen.to_string(),
                host_port: ports::port_or_free(api_port, api_listen)?,
                container_port: API_SERVER_PORT,
                protocol: Default::default(),
            });
        }
        let mounts = node
            .extra_mounts
            .iter()
            .map(absolute_mount)
            .collect::<anyhow::Result<Vec<_>>>()?;
        planned.push((
            node.role,
            ContainerSpec {
                labels: labels(cluster, node.role),
                image: node.image.clone(),
                mounts,
                ports: bindings,
                env: env.clone(),
                privileged: true,
                extra_args: extra_args.clone(),
                name,
            },
        ));
    }

    if spec.is_ha() {
        let role = NodeRole::ExternalLoadBalancer;
        let listen = net.api_server_address.as_str();
        planned.push((
            role,
            ContainerSpec {
                name: namer.next(role),
                image: LOAD_BALANCER_IMAGE.to_string(),
                labels: labels(cluster, role),
                mounts: vec![],
                ports: vec![PortBinding {
                    listen_address: listen.to_string(),
                    host_port: ports::port_or_free(net.api_server_port, listen)?,
                    container_port: API_SERVER_PORT,
                    protocol: Default::default(),
                }],
                env: env.clone(),
                privileged: false,
                extra_args: vec!["--restart=on-failure:1".into()],
            },
        ));
    }
    Ok(planned)
}

fn labels(cluster: &ClusterName, role: NodeRole) -> BTreeMap<String, String> {
    BTreeMap::from([
        (CLUSTER_LABEL.to_string(), cluster.to_string()),
        (ROLE_LABEL.to_string(), role.to_string()),
    ])
}

fn absolute_mount(mount: &Mount) -> anyhow::Result<Mount> {
    let mut mount = mount.clone();
    if mount.host_path.is_relative() {
        let cwd: PathBuf = std::env::current_dir().context("failed to resolve mount path")?;
        mount.host_path = cwd.join(&mount.host_path);
    }
    Ok(mount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{NodeSpec, PortMapping, Protocol},
        runtime::fake::FakeRuntime,
    };

    fn spec(control_planes: usize, workers: usize) -> ClusterSpec {
        let mut nodes = vec![NodeSpec::new(NodeRole::ControlPlane); control_planes];
        nodes.extend(vec![NodeSpec::new(NodeRole::Worker); workers]);
        ClusterSpec {
            nodes,
            ..Default::default()
        }
        .defaulted()
    }

    fn provisioner(rt: &Arc<FakeRuntime>) -> Provisioner {
        Provisioner::new(rt.clone()).with_host_env(HashMap::new())
    }

    fn api_binding(c: &ContainerSpec) -> &PortBinding {
        c.ports
            .iter()
            .find(|p| p.container_port == API_SERVER_PORT)
            .unwrap()
    }

    #[tokio::test]
    async fn single_control_plane_gets_no_load_balancer() {
        let rt = Arc::new(FakeRuntime::default());
        let nodes = provisioner(&rt)
            .provision(&ClusterName::default(), &spec(1, 2))
            .await
            .unwrap();
        let names: Vec<&str> = nodes.iter().map(|n| n.name()).collect();
        assert_eq!(names, ["kind-control-plane", "kind-worker", "kind-worker-2"]);

        let cp = rt.container("kind-control-plane").unwrap();
        let api = api_binding(&cp.spec);
        assert_eq!(api.listen_address, "127.0.0.1");
        assert_ne!(api.host_port, 0);
        assert!(cp.spec.privileged);
        assert_eq!(cp.spec.labels[ROLE_LABEL], "control-plane");
        assert_eq!(cp.spec.labels[CLUSTER_LABEL], "kind");
        assert!(rt.container("kind-worker").unwrap().spec.ports.is_empty());
    }

    #[tokio::test]
    async fn several_control_planes_sit_behind_a_load_balancer() {
        let rt = Arc::new(FakeRuntime::default());
        let mut spec = spec(3, 1);
        spec.networking.api_server_port = 0;
        let nodes = provisioner(&rt)
            .provision(&"ha".parse().unwrap(), &spec)
            .await
            .unwrap();
        assert_eq!(nodes.len(), 5);
        let lb = nodes.last().unwrap();
        assert_eq!(lb.name(), "ha-external-load-balancer");
        assert_eq!(lb.role(), NodeRole::ExternalLoadBalancer);

        for cp in ["ha-control-plane", "ha-control-plane-2", "ha-control-plane-3"] {
            let c = rt.container(cp).unwrap();
            assert_eq!(api_binding(&c.spec).listen_address, "127.0.0.1");
        }
        let lb = rt.container("ha-external-load-balancer").unwrap();
        assert_eq!(lb.spec.image, LOAD_BALANCER_IMAGE);
        assert!(!lb.spec.privileged);
        let api = api_binding(&lb.spec);
        assert_eq!(api.listen_address, spec.networking.api_server_address);
        assert_ne!(api.host_port, 0);
    }

    #[test]
    fn ipv6_nodes_get_sysctls() {
        let mut spec = spec(1, 0);
        spec.networking.ip_family = IpFamily::Ipv6;
        spec.networking.api_server_address = "::1".into();
        spec.networking.api_server_port = 6443;
        let planned = plan(&ClusterName::default(), &spec, &BTreeMap::new()).unwrap();
        let (_, cp) = &planned[0];
        assert!(cp
            .extra_args
            .contains(&"--sysctl=net.ipv6.conf.all.disable_ipv6=0".to_string()));
        assert!(cp
            .extra_args
            .contains(&"--sysctl=net.ipv6.conf.all.forwarding=1".to_string()));
        assert_eq!(api_binding(cp).listen_address, "::1");
        assert_eq!(api_binding(cp).host_port, 6443);
    }

    #[test]
    fn extra_port_mappings_are_kept() {
        let mut spec = spec(1, 0);
        spec.nodes[0].extra_port_mappings.push(PortMapping {
            container_port: 53,
            host_port: 5353,
            listen_address: String::new(),
            protocol: Protocol::Udp,
        });
        let planned = plan(&ClusterName::default(), &spec, &BTreeMap::new()).unwrap();
        let dns = &planned[0].1.ports[0];
        assert_eq!(dns.listen_address, "0.0.0.0");
        assert_eq!(dns.host_port, 5353);
        assert_eq!(dns.protocol, Protocol::Udp);
    }

    #[tokio::test]
    async fn proxy_settings_reach_every_node() {
        let rt = Arc::new(FakeRuntime::default());
        let env = HashMap::from([("https_proxy".to_string(), "http://proxy:3128".to_string())]);
        provisioner(&rt)
            .with_host_env(env)
            .provision(&ClusterName::default(), &spec(1, 1))
            .await
            .unwrap();
        let worker = rt.container("kind-worker").unwrap();
        assert_eq!(worker.spec.env["HTTPS_PROXY"], "http://proxy:3128");
        assert_eq!(
            worker.spec.env["NO_PROXY"],
            "172.17.0.0/16,10.96.0.0/16,10.244.0.0/16"
        );
    }

    #[tokio::test]
    async fn one_failed_create_fails_provisioning_but_others_still_run() {
        let rt = Arc::new(FakeRuntime::default());
        rt.fail_create("kind-worker");
        let err = provisioner(&rt)
            .provision(&ClusterName::default(), &spec(1, 2))
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("kind-worker"));
        assert!(rt.container("kind-control-plane").is_some());
        assert!(rt.container("kind-worker-2").is_some());
    }

    #[tokio::test]
    async fn pull_failures_are_not_fatal() {
        let rt = Arc::new(FakeRuntime::default());
        rt.fail_pull(crate::config::DEFAULT_NODE_IMAGE);
        provisioner(&rt)
            .provision(&ClusterName::default(), &spec(1, 0))
            .await
            .unwrap();
        assert_eq!(rt.pulls(), [crate::config::DEFAULT_NODE_IMAGE]);

        let rt = Arc::new(FakeRuntime::default());
        rt.preload_image(crate::config::DEFAULT_NODE_IMAGE);
        provisioner(&rt)
            .provision(&ClusterName::default(), &spec(1, 0))
            .await
            .unwrap();
        assert!(rt.pulls().is_empty());
    }
}
