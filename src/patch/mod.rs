//! Patching multi-document YAML streams.
//!
//! Merge patches are partial documents merged with RFC 7396 semantics into
//! every document of the same kind. JSON patches are RFC 6902 operation lists
//! applied to documents picked out by group, version, kind, name and
//! namespace.

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::{config::PatchJson6902, errors::PatchError};

mod containerd;
mod matchinfo;

pub use containerd::apply_toml;
pub use matchinfo::MatchInfo;

struct Resource {
    info: MatchInfo,
    value: Value,
}

struct MergePatch {
    info: MatchInfo,
    value: Value,
}

/// Apply `merge_patches` then `json_patches` to every document in
/// `documents`, preserving document order.
///
/// With no patches the input comes back untouched. A patch that matches no
/// document is not an error; a patch that fails to apply is.
pub fn apply(
    documents: &str,
    merge_patches: &[String],
    json_patches: &[PatchJson6902],
) -> Result<String, PatchError> {
    if merge_patches.is_empty() && json_patches.is_empty() {
        return Ok(documents.to_string());
    }

    let mut resources = parse_resources(documents)?;
    let merges = parse_merge_patches(merge_patches)?;
    let ops = parse_json_patches(json_patches)?;

    for resource in &mut resources {
        for patch in merges.iter().filter(|p| resource.info.merge_target(&p.info)) {
            json_patch::merge(&mut resource.value, &patch.value);
        }
        for (index, (target, patch)) in json_patches.iter().zip(&ops).enumerate() {
            if !resource.info.json_target(target) {
                continue;
            }
            json_patch::patch(&mut resource.value, &patch.0).map_err(|source| {
                PatchError::Apply {
                    index,
                    kind: resource.info.kind.clone(),
                    source,
                }
            })?;
        }
    }

    let encoded = resources
        .iter()
        .map(|r| serde_yaml::to_string(&r.value))
        .collect::<Result<Vec<_>, _>>()
        .map_err(PatchError::Encode)?;
    Ok(encoded.join("---\n"))
}

fn parse_resources(documents: &str) -> Result<Vec<Resource>, PatchError> {
    let mut resources = Vec::new();
    for (index, doc) in serde_yaml::Deserializer::from_str(documents).enumerate() {
        let value = Value::deserialize(doc)
            .map_err(|source| PatchError::MalformedDocument { index, source })?;
        // blank documents, e.g. from a trailing `---`
        if value.is_null() {
            continue;
        }
        resources.push(Resource {
            info: MatchInfo::of(&value),
            value,
        });
    }
    Ok(resources)
}

fn parse_merge_patches(patches: &[String]) -> Result<Vec<MergePatch>, PatchError> {
    patches
        .iter()
        .enumerate()
        .map(|(index, raw)| {
            let value: Value = serde_yaml::from_str(raw).map_err(|e| {
                PatchError::MalformedMergePatch {
                    index,
                    reason: e.to_string(),
                }
            })?;
            if !value.is_object() {
                return Err(PatchError::MalformedMergePatch {
                    index,
                    reason: "expected a mapping".to_string(),
                });
            }
            let info = MatchInfo::of(&value);
            debug!(index, kind = %info.kind, "parsed merge patch");
            Ok(MergePatch { info, value })
        })
        .collect()
}

fn parse_json_patches(patches: &[PatchJson6902]) -> Result<Vec<json_patch::Patch>, PatchError> {
    patches
        .iter()
        .enumerate()
        .map(|(index, p)| parse_operations(index, &p.patch))
        .collect()
}

/// One RFC 6902 operation list, spelled as JSON or YAML.
fn parse_operations(index: usize, raw: &str) -> Result<json_patch::Patch, PatchError> {
    let malformed = |reason: String| PatchError::MalformedJsonPatch { index, reason };
    // YAML is a superset of JSON, so one parser covers both spellings
    let value: Value = serde_yaml::from_str(raw).map_err(|e| malformed(e.to_string()))?;
    serde_json::from_value(value).map_err(|e| malformed(e.to_string()))
}
