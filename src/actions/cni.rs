use async_trait::async_trait;

use super::{Action, ActionContext, ADMIN_KUBECONFIG};
use crate::node::bootstrap_control_plane;

pub const DEFAULT_CNI_MANIFEST: &str = "/kind/manifests/default-cni.yaml";

const TEMPLATE_MARKER: &str = "would you kindly template this file";

/// Substitute the pod subnet into a node image's bundled CNI manifest, if
/// the manifest asks for it.
pub fn template_manifest(manifest: &str, pod_subnet: &str) -> String {
    if manifest.contains(TEMPLATE_MARKER) {
        manifest.replace("{{ .PodSubnet }}", pod_subnet)
    } else {
        manifest.to_string()
    }
}

/// Installs the CNI manifest shipped in the node image.
pub struct InstallCni;

#[async_trait]
impl Action for InstallCni {
    fn description(&self) -> &'static str {
        "Installing CNI"
    }

    async fn execute(&self, ctx: &mut ActionContext) -> anyhow::Result<()> {
        let node = bootstrap_control_plane(ctx.nodes())?;
        let manifest = node.read_file(DEFAULT_CNI_MANIFEST).await?;
        let manifest = template_manifest(&manifest, &ctx.spec.networking.pod_subnet);
        let kubeconfig = format!("--kubeconfig={ADMIN_KUBECONFIG}");
        node.exec_with_stdin(
            &["kubectl", "create", kubeconfig.as_str(), "-f", "-"],
            manifest.into_bytes(),
        )
        .await?;
        Ok(())
    }
}
