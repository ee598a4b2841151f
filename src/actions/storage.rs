use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::{api::storage::v1::StorageClass, apimachinery::pkg::apis::meta::v1::ObjectMeta};

use super::{Action, ActionContext, ADMIN_KUBECONFIG};
use crate::node::bootstrap_control_plane;

pub const DEFAULT_STORAGE_CLASS: &str = "standard";

/// The default StorageClass, backed by host paths on the node.
pub fn default_storage_class() -> StorageClass {
    StorageClass {
        metadata: ObjectMeta {
            name: Some(DEFAULT_STORAGE_CLASS.to_string()),
            annotations: Some(BTreeMap::from([(
                "storageclass.kubernetes.io/is-default-class".to_string(),
                "true".to_string(),
            )])),
            labels: Some(BTreeMap::from([(
                "addonmanager.kubernetes.io/mode".to_string(),
                "EnsureExists".to_string(),
            )])),
            ..Default::default()
        },
        provisioner: "kubernetes.io/host-path".to_string(),
        ..Default::default()
    }
}

pub struct InstallStorage;

#[async_trait]
impl Action for InstallStorage {
    fn description(&self) -> &'static str {
        "Installing StorageClass"
    }

    async fn execute(&self, ctx: &mut ActionContext) -> anyhow::Result<()> {
        let node = bootstrap_control_plane(ctx.nodes())?;
        let manifest = serde_yaml::to_string(&default_storage_class())?;
        let kubeconfig = format!("--kubeconfig={ADMIN_KUBECONFIG}");
        node.exec_with_stdin(
            &["kubectl", kubeconfig.as_str(), "apply", "-f", "-"],
            manifest.into_bytes(),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    #[test]
    fn storage_class_manifest() {
        let yaml = serde_yaml::to_string(&default_storage_class()).unwrap();
        let value: Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(value["apiVersion"], "storage.k8s.io/v1");
        assert_eq!(value["kind"], "StorageClass");
        assert_eq!(value["metadata"]["name"], "standard");
        assert_eq!(
            value["metadata"]["annotations"]["storageclass.kubernetes.io/is-default-class"],
            "true"
        );
        assert_eq!(value["provisioner"], "kubernetes.io/host-path");
    }
}
