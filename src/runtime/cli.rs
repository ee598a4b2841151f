use std::{path::Path, process::Stdio, str::FromStr};

use anyhow::Context;
use async_trait::async_trait;
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::debug;

use super::{ContainerRuntime, ContainerSpec, NodeAddresses};
use crate::config::MountPropagation;

/// Container engines driven through their command line clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Engine {
    #[default]
    Docker,
    Podman,
    Nerdctl,
}

impl Engine {
    pub fn binary(self) -> &'static str {
        match self {
            Engine::Docker => "docker",
            Engine::Podman => "podman",
            Engine::Nerdctl => "nerdctl",
        }
    }

    fn bridge_network(self) -> &'static str {
        match self {
            Engine::Docker | Engine::Nerdctl => "bridge",
            Engine::Podman => "podman",
        }
    }

    fn subnet_template(self) -> &'static str {
        match self {
            Engine::Docker | Engine::Nerdctl => "{{range .IPAM.Config}}{{.Subnet}} {{end}}",
            Engine::Podman => "{{range .Subnets}}{{.Subnet}} {{end}}",
        }
    }
}

impl FromStr for Engine {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "docker" => Ok(Engine::Docker),
            "podman" => Ok(Engine::Podman),
            "nerdctl" => Ok(Engine::Nerdctl),
            other => anyhow::bail!("unknown container engine {other:?}, expected docker, podman or nerdctl"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CliRuntime {
    engine: Engine,
}

impl CliRuntime {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    async fn run(&self, args: &[&str], stdin: Option<Vec<u8>>) -> anyhow::Result<String> {
        let bin = self.engine.binary();
        debug!(command = %format!("{} {}", bin, args.join(" ")), "running");
        let mut child = Command::new(bin)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to start {bin}"))?;

        if let (Some(mut pipe), Some(input)) = (child.stdin.take(), stdin) {
            pipe.write_all(&input).await?;
            // close stdin so the child sees EOF
            drop(pipe);
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            anyhow::bail!(
                "command \"{} {}\" failed with {}: {}",
                bin,
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn run_args(&self, spec: &ContainerSpec) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "--detach".into(),
            "--tty".into(),
            format!("--name={}", spec.name),
            format!("--hostname={}", spec.name),
        ];
        for (k, v) in &spec.labels {
            args.push(format!("--label={k}={v}"));
        }
        if spec.privileged {
            args.extend([
                "--privileged".into(),
                "--security-opt=seccomp=unconfined".into(),
                "--security-opt=apparmor=unconfined".into(),
            ]);
        }
        for (k, v) in &spec.env {
            args.push(format!("--env={k}={v}"));
        }
        for m in &spec.mounts {
            let mut opts = Vec::new();
            if m.readonly {
                opts.push("ro");
            }
            if m.selinux_relabel {
                opts.push("Z");
            }
            match m.propagation {
                MountPropagation::None => {}
                MountPropagation::HostToContainer => opts.push("rslave"),
                MountPropagation::Bidirectional => opts.push("rshared"),
            }
            let mut volume = format!("{}:{}", m.host_path.display(), m.container_path);
            if !opts.is_empty() {
                volume.push(':');
                volume.push_str(&opts.join(","));
            }
            args.push(format!("--volume={volume}"));
        }
        for p in &spec.ports {
            let listen = if p.listen_address.contains(':') {
                format!("[{}]", p.listen_address)
            } else {
                p.listen_address.clone()
            };
            args.push(format!(
                "--publish={}:{}:{}/{}",
                listen,
                p.host_port,
                p.container_port,
                p.protocol.as_str()
            ));
        }
        args.extend(spec.extra_args.iter().cloned());
        args.push(spec.image.clone());
        args
    }
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> anyhow::Result<String> {
        let args = self.run_args(spec);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&args, None)
            .await
            .with_context(|| format!("failed to create container {}", spec.name))?;
        Ok(spec.name.clone())
    }

    async fn exec(
        &self,
        id: &str,
        argv: &[&str],
        stdin: Option<Vec<u8>>,
    ) -> anyhow::Result<String> {
        let mut args = vec!["exec"];
        if stdin.is_some() {
            args.push("--interactive");
        }
        args.push(id);
        args.extend_from_slice(argv);
        self.run(&args, stdin).await
    }

    async fn copy_file(
        &self,
        host_path: &Path,
        id: &str,
        container_path: &str,
    ) -> anyhow::Result<()> {
        let host = host_path.to_string_lossy();
        let dest = format!("{id}:{container_path}");
        self.run(&["cp", &*host, dest.as_str()], None).await?;
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> anyhow::Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut args = vec!["rm", "--force", "--volumes"];
        args.extend(ids.iter().map(String::as_str));
        self.run(&args, None).await?;
        Ok(())
    }

    async fn list_by_label(&self, key: &str, value: &str) -> anyhow::Result<Vec<String>> {
        let filter = format!("label={key}={value}");
        let out = self
            .run(
                &["ps", "--all", "--filter", filter.as_str(), "--format", "{{.Names}}"],
                None,
            )
            .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn label(&self, id: &str, key: &str) -> anyhow::Result<String> {
        let format = format!("{{{{ index .Config.Labels \"{key}\" }}}}");
        let out = self.run(&["inspect", "--format", format.as_str(), id], None).await?;
        Ok(out.trim().to_string())
    }

    async fn label_values(&self, key: &str) -> anyhow::Result<Vec<String>> {
        let filter = format!("label={key}");
        let format = format!("{{{{ .Label \"{key}\" }}}}");
        let out = self
            .run(
                &["ps", "--all", "--filter", filter.as_str(), "--format", format.as_str()],
                None,
            )
            .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn inspect_ip(&self, id: &str) -> anyhow::Result<NodeAddresses> {
        let out = self
            .run(
                &[
                    "inspect",
                    "--format",
                    "{{range .NetworkSettings.Networks}}{{.IPAddress}},{{.GlobalIPv6Address}}{{end}}",
                    id,
                ],
                None,
            )
            .await?;
        let (v4, v6) = out
            .trim()
            .split_once(',')
            .with_context(|| format!("unexpected address output for {id}: {out:?}"))?;
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Ok(NodeAddresses {
            ipv4: non_empty(v4),
            ipv6: non_empty(v6),
        })
    }

    async fn port(&self, id: &str, container_port: u16) -> anyhow::Result<u16> {
        let target = format!("{container_port}/tcp");
        let out = self.run(&["port", id, target.as_str()], None).await?;
        // one line per binding, e.g. "127.0.0.1:41235" or "[::1]:41235"
        let line = out
            .lines()
            .next()
            .with_context(|| format!("port {container_port} is not published on {id}"))?;
        let port = line
            .rsplit(':')
            .next()
            .unwrap_or_default()
            .trim()
            .parse()
            .with_context(|| format!("unexpected port output for {id}: {line:?}"))?;
        Ok(port)
    }

    async fn bridge_subnets(&self) -> anyhow::Result<Vec<String>> {
        let out = self
            .run(
                &[
                    "network",
                    "inspect",
                    "--format",
                    self.engine.subnet_template(),
                    self.engine.bridge_network(),
                ],
                None,
            )
            .await?;
        Ok(out.split_whitespace().map(str::to_string).collect())
    }

    async fn image_present(&self, image: &str) -> anyhow::Result<bool> {
        let status = Command::new(self.engine.binary())
            .args(["image", "inspect", image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        Ok(status.success())
    }

    async fn pull_image(&self, image: &str) -> anyhow::Result<()> {
        self.run(&["pull", image], None).await?;
        Ok(())
    }

    async fn image_id(&self, image: &str) -> anyhow::Result<String> {
        let out = self
            .run(&["image", "inspect", "--format", "{{ .Id }}", image], None)
            .await
            .with_context(|| format!("image {image:?} not present locally"))?;
        Ok(out.trim().to_string())
    }

    async fn save_images(&self, images: &[&str], dest: &Path) -> anyhow::Result<()> {
        let dest = dest.to_string_lossy();
        let mut args = vec!["save", "-o", &*dest];
        args.extend_from_slice(images);
        self.run(&args, None).await?;
        Ok(())
    }

    async fn signal(&self, id: &str, signal: &str) -> anyhow::Result<()> {
        self.run(&["kill", "--signal", signal, id], None).await?;
        Ok(())
    }
}
