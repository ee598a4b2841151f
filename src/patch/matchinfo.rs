use serde_json::Value;

use crate::config::PatchJson6902;

/// The identifying fields of a Kubernetes-style document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchInfo {
    pub kind: String,
    pub api_version: String,
    pub name: String,
    pub namespace: String,
}

impl MatchInfo {
    pub fn of(value: &Value) -> Self {
        let field = |v: Option<&Value>| v.and_then(Value::as_str).unwrap_or_default().to_string();
        let metadata = value.get("metadata");
        Self {
            kind: field(value.get("kind")),
            api_version: field(value.get("apiVersion")),
            name: field(metadata.and_then(|m| m.get("name"))),
            namespace: field(metadata.and_then(|m| m.get("namespace"))),
        }
    }

    /// `apps/v1` is group `apps`, version `v1`. A bare `v1` has no group.
    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", self.api_version.as_str()),
        }
    }

    /// Whether a merge patch carrying `patch` identity applies to this
    /// document. Kinds must be equal; apiVersion only counts when the patch
    /// sets one.
    pub fn merge_target(&self, patch: &MatchInfo) -> bool {
        self.kind == patch.kind
            && (patch.api_version.is_empty() || self.api_version == patch.api_version)
    }

    /// Whether a JSON patch applies to this document. Kinds must be equal;
    /// every other selector field only counts when set.
    pub fn json_target(&self, patch: &PatchJson6902) -> bool {
        let (group, version) = self.group_version();
        let optional = |want: &str, have: &str| want.is_empty() || want == have;
        self.kind == patch.kind
            && optional(patch.group.as_str(), group)
            && optional(patch.version.as_str(), version)
            && optional(patch.name.as_deref().unwrap_or_default(), self.name.as_str())
            && optional(
                patch.namespace.as_deref().unwrap_or_default(),
                self.namespace.as_str(),
            )
    }
}
