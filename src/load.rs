//! Side-loading images into cluster nodes.

use std::path::Path;

use anyhow::Context;
use futures::FutureExt;
use serde::Deserialize;
use tracing::{debug, info};

use crate::{
    concurrent::{run_all_first_error, Task},
    node::Node,
    runtime::ContainerRuntime,
};

const ARCHIVE_DEST: &str = "/kind/image.tar";

/// Import an image archive (as written by `docker save`) into the
/// containerd of every given node.
pub async fn load_image_archive(nodes: &[&Node], archive: &Path) -> anyhow::Result<()> {
    anyhow::ensure!(
        archive.is_file(),
        "image archive {} does not exist",
        archive.display()
    );
    let tasks: Vec<Task> = nodes
        .iter()
        .map(|node| {
            let node = (*node).clone();
            let archive = archive.to_path_buf();
            async move {
                node.copy_from_host(&archive, ARCHIVE_DEST).await?;
                node.exec(&[
                    "ctr",
                    "--namespace=k8s.io",
                    "images",
                    "import",
                    "--all-platforms",
                    ARCHIVE_DEST,
                ])
                .await?;
                node.exec(&["rm", "-f", ARCHIVE_DEST]).await?;
                info!(node = node.name(), archive = %archive.display(), "loaded image archive");
                Ok(())
            }
            .boxed()
        })
        .collect();
    run_all_first_error(tasks).await
}

#[derive(Deserialize)]
struct ImageInspect {
    status: ImageStatus,
}

#[derive(Deserialize)]
struct ImageStatus {
    id: String,
}

/// The id containerd on `node` knows `image` by, if it has it at all.
async fn node_image_id(node: &Node, image: &str) -> Option<String> {
    let out = node.exec(&["crictl", "inspecti", image]).await.ok()?;
    let inspect: ImageInspect = serde_json::from_str(&out).ok()?;
    Some(inspect.status.id)
}

/// Copy images from the engine's local store into the nodes that lack
/// them. Nodes already holding every image at the same id are left alone.
pub async fn load_images(
    runtime: &dyn ContainerRuntime,
    nodes: &[&Node],
    images: &[String],
) -> anyhow::Result<()> {
    let mut ids = Vec::with_capacity(images.len());
    for image in images {
        let id = runtime
            .image_id(image)
            .await
            .with_context(|| format!("image {image:?} not present locally"))?;
        ids.push(id);
    }

    let mut targets = Vec::new();
    for node in nodes {
        let mut current = true;
        for (image, id) in images.iter().zip(&ids) {
            if node_image_id(node, image).await.as_deref() != Some(id.as_str()) {
                current = false;
                break;
            }
        }
        if current {
            debug!(node = node.name(), "images already present");
        } else {
            targets.push(*node);
        }
    }
    if targets.is_empty() {
        info!("every node already has the images");
        return Ok(());
    }

    let dir = tempfile::tempdir().context("failed to create a directory for the image archive")?;
    let archive = dir.path().join("image.tar");
    let refs: Vec<&str> = images.iter().map(String::as_str).collect();
    runtime
        .save_images(&refs, &archive)
        .await
        .context("failed to save images")?;
    load_image_archive(&targets, &archive).await
}
