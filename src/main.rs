use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use kindle::{
    cluster::Provider,
    config::{ClusterName, ClusterSpec, CreateOptions},
    runtime::{CliRuntime, Engine},
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(version, about)]
struct Opts {
    /// Name of the cluster to operate on
    #[clap(short, long, env = "KINDLE_CLUSTER_NAME", default_value = "kind", global = true)]
    name: ClusterName,

    /// Container engine to run nodes with: docker, podman or nerdctl
    #[clap(long, env = "KINDLE_ENGINE", default_value = "docker", global = true)]
    engine: Engine,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a cluster and print its kubeconfig
    Create {
        /// Cluster spec, YAML or TOML. Defaults to a single control plane.
        #[clap(long)]
        config: Option<PathBuf>,

        /// Keep node containers if creation fails
        #[clap(long)]
        retain: bool,

        /// Seconds to wait for the control plane to become ready, 0 to skip
        #[clap(long, default_value_t = 0)]
        wait: u64,
    },
    /// Delete every node of a cluster
    Delete,
    /// Print the kubeconfig of a running cluster
    GetKubeconfig {
        /// Spec the cluster was created from, for its API server address
        #[clap(long)]
        config: Option<PathBuf>,
    },
    /// List the node containers of a cluster
    GetNodes,
    /// List every cluster with at least one node
    GetClusters,
    /// Import a `docker save` archive into every node
    LoadImageArchive { archive: PathBuf },
    /// Copy images from the host engine into the cluster's nodes
    LoadDockerImage {
        #[clap(required = true)]
        images: Vec<String>,

        /// Comma separated node names to load into, instead of every node
        #[clap(long, value_delimiter = ',')]
        nodes: Vec<String>,
    },
}

fn load_spec(config: Option<&PathBuf>) -> anyhow::Result<ClusterSpec> {
    match config {
        Some(path) => Ok(ClusterSpec::from_file(path)?.defaulted()),
        None => Ok(ClusterSpec::single_node()),
    }
}

async fn inner_main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    let provider = Provider::new(Arc::new(CliRuntime::new(opts.engine)));

    match opts.command {
        Command::Create {
            config,
            retain,
            wait,
        } => {
            let spec = load_spec(config.as_ref())?;
            let create = CreateOptions {
                retain,
                wait_for_ready: Duration::from_secs(wait),
            };
            let kubeconfig = provider.create_cluster(&opts.name, spec, &create).await?;
            print!("{}", kubeconfig);
        }
        Command::Delete => provider.delete_cluster(&opts.name).await?,
        Command::GetKubeconfig { config } => {
            let spec = load_spec(config.as_ref())?;
            print!("{}", provider.kubeconfig(&opts.name, &spec).await?);
        }
        Command::GetNodes => {
            for node in provider.list_nodes(&opts.name).await? {
                println!("{}\t{}", node.name(), node.role());
            }
        }
        Command::GetClusters => {
            let clusters = provider.list_clusters().await?;
            if clusters.is_empty() {
                eprintln!("No clusters found.");
            }
            for cluster in clusters {
                println!("{}", cluster);
            }
        }
        Command::LoadImageArchive { archive } => {
            provider.load_image_archive(&opts.name, &archive).await?
        }
        Command::LoadDockerImage { images, nodes } => {
            provider
                .load_docker_images(&opts.name, &images, &nodes)
                .await?
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_env("KINDLE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = inner_main().await {
        eprintln!("{:?}", e);
        std::process::exit(1);
    }
}
