//! The container engine a cluster's nodes live in.

use std::{collections::BTreeMap, fmt::Debug, path::Path};

use async_trait::async_trait;

use crate::config::{Mount, Protocol};

mod cli;
#[cfg(test)]
pub mod fake;

pub use cli::{CliRuntime, Engine};

/// Everything needed to start one node container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    pub ports: Vec<PortBinding>,
    pub env: BTreeMap<String, String>,
    pub privileged: bool,
    /// passed to the engine verbatim, ahead of the image
    pub extra_args: Vec<String>,
}

/// A published port. `host_port` is always concrete by the time a spec
/// reaches the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub listen_address: String,
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeAddresses {
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync + Debug {
    /// Start a container and return its id, which is its name.
    async fn create_container(&self, spec: &ContainerSpec) -> anyhow::Result<String>;

    /// Run `argv` inside a container and return its standard output.
    async fn exec(&self, id: &str, argv: &[&str], stdin: Option<Vec<u8>>)
        -> anyhow::Result<String>;

    async fn copy_file(&self, host_path: &Path, id: &str, container_path: &str)
        -> anyhow::Result<()>;

    /// Force-remove containers, along with their anonymous volumes.
    async fn delete(&self, ids: &[String]) -> anyhow::Result<()>;

    /// Containers, running or not, carrying the label `key=value`.
    async fn list_by_label(&self, key: &str, value: &str) -> anyhow::Result<Vec<String>>;

    /// The value of one label on one container.
    async fn label(&self, id: &str, key: &str) -> anyhow::Result<String>;

    /// The value of label `key` on every container that carries it, one
    /// entry per container.
    async fn label_values(&self, key: &str) -> anyhow::Result<Vec<String>>;

    async fn inspect_ip(&self, id: &str) -> anyhow::Result<NodeAddresses>;

    /// The host port a container port was published on.
    async fn port(&self, id: &str, container_port: u16) -> anyhow::Result<u16>;

    /// Subnets of the engine's default bridge network.
    async fn bridge_subnets(&self) -> anyhow::Result<Vec<String>>;

    async fn image_present(&self, image: &str) -> anyhow::Result<bool>;

    async fn pull_image(&self, image: &str) -> anyhow::Result<()>;

    /// The id of an image in the engine's local store.
    async fn image_id(&self, image: &str) -> anyhow::Result<String>;

    /// Write local images into one archive at `dest`, `docker save` style.
    async fn save_images(&self, images: &[&str], dest: &Path) -> anyhow::Result<()>;

    async fn signal(&self, id: &str, signal: &str) -> anyhow::Result<()>;
}
