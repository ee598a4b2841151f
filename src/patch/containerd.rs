//! Patching containerd's TOML configuration.

use serde_json::Value;
use tracing::debug;

use super::parse_operations;
use crate::errors::PatchError;

/// Apply TOML merge patches, then JSON patches, to containerd's config and
/// re-encode it.
///
/// A merge patch carrying a `version` only applies to a config of that
/// version; one without applies to any. A config without `version` is
/// version 1.
pub fn apply_toml(
    document: &str,
    merge_patches: &[String],
    json_patches: &[String],
) -> Result<String, PatchError> {
    let parsed: toml::Value = toml::from_str(document).map_err(PatchError::MalformedToml)?;
    let mut value = to_json(&parsed)?;
    let version = match value.get("version") {
        None => 1,
        Some(v) => v
            .as_i64()
            .ok_or_else(|| PatchError::BadTomlVersion(v.to_string()))?,
    };

    for (index, raw) in merge_patches.iter().enumerate() {
        let patch: toml::Value = toml::from_str(raw)
            .map_err(|source| PatchError::MalformedTomlPatch { index, source })?;
        let patch = to_json(&patch)?;
        if let Some(wanted) = patch.get("version") {
            if wanted.as_i64() != Some(version) {
                debug!(index, %wanted, version, "skipping merge patch for another config version");
                continue;
            }
        }
        json_patch::merge(&mut value, &patch);
    }

    for (index, raw) in json_patches.iter().enumerate() {
        let ops = parse_operations(index, raw)?;
        json_patch::patch(&mut value, &ops.0).map_err(|source| PatchError::Apply {
            index,
            kind: "containerd".to_string(),
            source,
        })?;
    }

    let patched: toml::Value =
        serde_json::from_value(value).map_err(|e| PatchError::EncodeToml(e.to_string()))?;
    toml::to_string(&patched).map_err(|e| PatchError::EncodeToml(e.to_string()))
}

fn to_json(value: &toml::Value) -> Result<Value, PatchError> {
    serde_json::to_value(value).map_err(|e| PatchError::EncodeToml(e.to_string()))
}
