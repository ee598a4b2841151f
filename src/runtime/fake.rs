//! An in-memory engine for tests. Nodes get a tiny pretend filesystem and
//! answer the handful of commands cluster bootstrap runs.

use std::{
    collections::{BTreeMap, BTreeSet},
    io::Read,
    path::Path,
    sync::Mutex,
};

use async_trait::async_trait;

use super::{ContainerRuntime, ContainerSpec, NodeAddresses};

pub const FAKE_VERSION: &str = "v1.27.3";

pub const ADMIN_CONF: &str = r#"apiVersion: v1
kind: Config
clusters:
- cluster:
    certificate-authority-data: Q0EK
    server: https://172.18.0.2:6443
  name: kubernetes
contexts:
- context:
    cluster: kubernetes
    user: kubernetes-admin
  name: kubernetes-admin@kubernetes
current-context: kubernetes-admin@kubernetes
preferences: {}
users:
- name: kubernetes-admin
  user:
    client-certificate-data: Q0VSVAo=
    client-key-data: S0VZCg==
"#;

pub const CONTAINERD_CONFIG: &str = r#"version = 2

[plugins."io.containerd.grpc.v1.cri"]
sandbox_image = "registry.k8s.io/pause:3.7"
"#;

const CNI_MANIFEST: &str = "# would you kindly template this file\n\
kind: ConfigMap\n\
data:\n  subnet: {{ .PodSubnet }}\n";

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub spec: ContainerSpec,
    pub ipv4: String,
    pub ipv6: String,
    pub files: BTreeMap<String, String>,
    /// permission bits of files written through `tar -x`
    pub modes: BTreeMap<String, u32>,
    /// images imported into the node's containerd
    pub images: BTreeSet<String>,
    pub signals: Vec<String>,
}

#[derive(Debug, Default)]
struct State {
    containers: BTreeMap<String, FakeContainer>,
    created: usize,
    execs: Vec<(String, Vec<String>)>,
    stdin: Vec<(String, Vec<u8>)>,
    images: BTreeSet<String>,
    pulls: Vec<String>,
    fail_create: BTreeSet<String>,
    fail_exec: Vec<(String, String)>,
    hang_exec: Vec<(String, String)>,
    saves: Vec<Vec<String>>,
    fail_pull: BTreeSet<String>,
    fail_delete: bool,
    not_ready: bool,
    version: Option<String>,
}

#[derive(Debug, Default)]
pub struct FakeRuntime {
    state: Mutex<State>,
}

impl FakeRuntime {
    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Insert a container as though it had been created from a bare spec.
    pub fn add_node(&self, name: &str) {
        let spec = ContainerSpec {
            name: name.into(),
            image: "fake".into(),
            labels: BTreeMap::new(),
            mounts: vec![],
            ports: vec![],
            env: BTreeMap::new(),
            privileged: true,
            extra_args: vec![],
        };
        self.insert(&spec);
    }

    fn insert(&self, spec: &ContainerSpec) {
        let mut state = self.state();
        state.created += 1;
        let n = state.created + 1;
        let version = state
            .version
            .clone()
            .unwrap_or_else(|| FAKE_VERSION.to_string());
        let files = BTreeMap::from([
            ("/kind/version".to_string(), format!("{version}\n")),
            (
                "/kind/manifests/default-cni.yaml".to_string(),
                CNI_MANIFEST.to_string(),
            ),
            (
                "/etc/containerd/config.toml".to_string(),
                CONTAINERD_CONFIG.to_string(),
            ),
        ]);
        state.containers.insert(
            spec.name.clone(),
            FakeContainer {
                spec: spec.clone(),
                ipv4: format!("172.18.0.{n}"),
                ipv6: format!("fc00:f853:ccd:e793::{n}"),
                files,
                modes: BTreeMap::new(),
                images: BTreeSet::new(),
                signals: vec![],
            },
        );
    }

    pub fn fail_create(&self, name: &str) {
        self.state().fail_create.insert(name.to_string());
    }

    /// Fail any exec on `node` whose command line contains `needle`.
    pub fn fail_exec(&self, node: &str, needle: &str) {
        self.state()
            .fail_exec
            .push((node.to_string(), needle.to_string()));
    }

    /// Never return from an exec on `node` whose command line contains
    /// `needle`.
    pub fn hang_exec(&self, node: &str, needle: &str) {
        self.state()
            .hang_exec
            .push((node.to_string(), needle.to_string()));
    }

    pub fn fail_pull(&self, image: &str) {
        self.state().fail_pull.insert(image.to_string());
    }

    pub fn fail_delete(&self) {
        self.state().fail_delete = true;
    }

    pub fn never_ready(&self) {
        self.state().not_ready = true;
    }

    pub fn set_version(&self, version: &str) {
        self.state().version = Some(version.to_string());
    }

    pub fn preload_image(&self, image: &str) {
        self.state().images.insert(image.to_string());
    }

    pub fn containers(&self) -> Vec<FakeContainer> {
        self.state().containers.values().cloned().collect()
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.state().containers.get(name).cloned()
    }

    pub fn mode(&self, node: &str, path: &str) -> Option<u32> {
        self.state()
            .containers
            .get(node)
            .and_then(|c| c.modes.get(path).copied())
    }

    /// The image lists of every archive saved so far.
    pub fn saves(&self) -> Vec<Vec<String>> {
        self.state().saves.clone()
    }

    pub fn file(&self, node: &str, path: &str) -> Option<String> {
        self.state()
            .containers
            .get(node)
            .and_then(|c| c.files.get(path).cloned())
    }

    /// Every command run so far, as `(node, "argv joined by spaces")`.
    pub fn execs(&self) -> Vec<(String, String)> {
        self.state()
            .execs
            .iter()
            .map(|(n, argv)| (n.clone(), argv.join(" ")))
            .collect()
    }

    pub fn stdin_for(&self, node: &str) -> Vec<String> {
        self.state()
            .stdin
            .iter()
            .filter(|(n, _)| n == node)
            .map(|(_, bytes)| String::from_utf8_lossy(bytes).into_owned())
            .collect()
    }

    pub fn pulls(&self) -> Vec<String> {
        self.state().pulls.clone()
    }
}

/// The id the fake reports for an image, on the host and in nodes alike.
pub fn fake_image_id(image: &str) -> String {
    format!("sha256:{image}")
}

fn node_list(ready: bool) -> String {
    let status = if ready { "True" } else { "False" };
    serde_json::json!({
        "apiVersion": "v1",
        "kind": "List",
        "items": [{
            "apiVersion": "v1",
            "kind": "Node",
            "metadata": { "name": "fake" },
            "status": { "conditions": [
                { "type": "MemoryPressure", "status": "False" },
                { "type": "Ready", "status": status },
            ]},
        }],
    })
    .to_string()
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> anyhow::Result<String> {
        {
            let state = self.state();
            anyhow::ensure!(
                !state.fail_create.contains(&spec.name),
                "simulated create failure for {}",
                spec.name
            );
            anyhow::ensure!(
                !state.containers.contains_key(&spec.name),
                "container {} already exists",
                spec.name
            );
        }
        self.insert(spec);
        Ok(spec.name.clone())
    }

    async fn exec(
        &self,
        id: &str,
        argv: &[&str],
        stdin: Option<Vec<u8>>,
    ) -> anyhow::Result<String> {
        let line = argv.join(" ");
        let hangs = self
            .state()
            .hang_exec
            .iter()
            .any(|(n, needle)| n == id && line.contains(needle.as_str()));
        if hangs {
            std::future::pending::<()>().await;
        }
        let mut state = self.state();
        state
            .execs
            .push((id.to_string(), argv.iter().map(|s| s.to_string()).collect()));
        if let Some(bytes) = &stdin {
            state.stdin.push((id.to_string(), bytes.clone()));
        }
        if let Some((_, needle)) = state
            .fail_exec
            .iter()
            .find(|(n, needle)| n == id && line.contains(needle.as_str()))
        {
            anyhow::bail!("simulated failure running {needle:?} on {id}");
        }
        let not_ready = state.not_ready;
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("no such container: {id}"))?;

        match argv {
            ["cat", path] => container
                .files
                .get(*path)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("cat: {path}: No such file or directory")),
            ["tar", "-x", ..] => {
                let bytes = stdin.unwrap_or_default();
                let mut archive = tar::Archive::new(bytes.as_slice());
                for entry in archive.entries()? {
                    let mut entry = entry?;
                    let path = format!("/{}", entry.path()?.display());
                    let mode = entry.header().mode()?;
                    let mut content = String::new();
                    entry.read_to_string(&mut content)?;
                    container.modes.insert(path.clone(), mode);
                    container.files.insert(path, content);
                }
                Ok(String::new())
            }
            ["kubeadm", "init", ..] => {
                container
                    .files
                    .insert("/etc/kubernetes/admin.conf".into(), ADMIN_CONF.into());
                for pki in crate::actions::join::SHARED_CERTS {
                    container
                        .files
                        .insert(format!("/etc/kubernetes/pki/{pki}"), format!("{pki} data"));
                }
                Ok("Your Kubernetes control-plane has initialized successfully!".into())
            }
            ["kubectl", .., "get", "nodes", _, "-o=json"] => Ok(node_list(!not_ready)),
            ["ctr", .., "import", _, archive] => {
                // saved archives list their images one per line
                let content = container.files.get(*archive).cloned().unwrap_or_default();
                container
                    .images
                    .extend(content.lines().map(str::to_string));
                Ok(String::new())
            }
            ["crictl", "inspecti", .., image] => {
                anyhow::ensure!(
                    container.images.contains(*image),
                    "no such image {image:?} present"
                );
                Ok(serde_json::json!({ "status": { "id": fake_image_id(image) } }).to_string())
            }
            _ => Ok(String::new()),
        }
    }

    async fn copy_file(
        &self,
        host_path: &Path,
        id: &str,
        container_path: &str,
    ) -> anyhow::Result<()> {
        let content = std::fs::read_to_string(host_path).unwrap_or_default();
        let mut state = self.state();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("no such container: {id}"))?;
        container.files.insert(container_path.to_string(), content);
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> anyhow::Result<()> {
        let mut state = self.state();
        anyhow::ensure!(!state.fail_delete, "simulated delete failure");
        for id in ids {
            state.containers.remove(id);
        }
        Ok(())
    }

    async fn list_by_label(&self, key: &str, value: &str) -> anyhow::Result<Vec<String>> {
        Ok(self
            .state()
            .containers
            .values()
            .filter(|c| c.spec.labels.get(key).map(String::as_str) == Some(value))
            .map(|c| c.spec.name.clone())
            .collect())
    }

    async fn label(&self, id: &str, key: &str) -> anyhow::Result<String> {
        let state = self.state();
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| anyhow::anyhow!("no such container: {id}"))?;
        Ok(container.spec.labels.get(key).cloned().unwrap_or_default())
    }

    async fn label_values(&self, key: &str) -> anyhow::Result<Vec<String>> {
        Ok(self
            .state()
            .containers
            .values()
            .filter_map(|c| c.spec.labels.get(key).cloned())
            .collect())
    }

    async fn inspect_ip(&self, id: &str) -> anyhow::Result<NodeAddresses> {
        let state = self.state();
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| anyhow::anyhow!("no such container: {id}"))?;
        Ok(NodeAddresses {
            ipv4: Some(container.ipv4.clone()),
            ipv6: Some(container.ipv6.clone()),
        })
    }

    async fn port(&self, id: &str, container_port: u16) -> anyhow::Result<u16> {
        let state = self.state();
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| anyhow::anyhow!("no such container: {id}"))?;
        container
            .spec
            .ports
            .iter()
            .find(|p| p.container_port == container_port)
            .map(|p| p.host_port)
            .ok_or_else(|| anyhow::anyhow!("port {container_port} is not published on {id}"))
    }

    async fn bridge_subnets(&self) -> anyhow::Result<Vec<String>> {
        Ok(vec!["172.17.0.0/16".to_string()])
    }

    async fn image_present(&self, image: &str) -> anyhow::Result<bool> {
        Ok(self.state().images.contains(image))
    }

    async fn pull_image(&self, image: &str) -> anyhow::Result<()> {
        let mut state = self.state();
        state.pulls.push(image.to_string());
        anyhow::ensure!(
            !state.fail_pull.contains(image),
            "simulated pull failure for {image}"
        );
        state.images.insert(image.to_string());
        Ok(())
    }

    async fn image_id(&self, image: &str) -> anyhow::Result<String> {
        anyhow::ensure!(
            self.state().images.contains(image),
            "image {image:?} not present locally"
        );
        Ok(fake_image_id(image))
    }

    async fn save_images(&self, images: &[&str], dest: &Path) -> anyhow::Result<()> {
        let mut state = self.state();
        for image in images {
            anyhow::ensure!(state.images.contains(*image), "no such image: {image}");
        }
        std::fs::write(dest, images.join("\n"))?;
        state.saves.push(images.iter().map(|i| i.to_string()).collect());
        Ok(())
    }

    async fn signal(&self, id: &str, signal: &str) -> anyhow::Result<()> {
        let mut state = self.state();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("no such container: {id}"))?;
        container.signals.push(signal.to_string());
        Ok(())
    }
}
