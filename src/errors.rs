use std::time::Duration;

use thiserror::Error;

/// Every failure from a group of tasks, in the order the tasks were given.
#[derive(Debug, Error)]
#[error("{} task(s) failed: [{}]", .0.len(), render(.0))]
pub struct AggregateError(Vec<anyhow::Error>);

impl AggregateError {
    pub fn new(errors: Vec<anyhow::Error>) -> Self {
        Self(errors)
    }

    pub fn errors(&self) -> &[anyhow::Error] {
        &self.0
    }

    pub fn into_errors(self) -> Vec<anyhow::Error> {
        self.0
    }
}

fn render(errors: &[anyhow::Error]) -> String {
    errors
        .iter()
        .map(|e| format!("{:#}", e))
        .collect::<Vec<_>>()
        .join(", ")
}

/// The cluster spec was rejected before any container was touched.
#[derive(Debug, Error)]
#[error("invalid cluster spec: {}", .0.join("; "))]
pub struct ValidationError(pub Vec<String>);

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("failed to parse config document #{index}")]
    MalformedDocument {
        index: usize,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("merge patch #{index} is not a YAML mapping: {reason}")]
    MalformedMergePatch { index: usize, reason: String },
    #[error("JSON patch #{index} could not be parsed: {reason}")]
    MalformedJsonPatch { index: usize, reason: String },
    #[error("JSON patch #{index} failed against {kind} document")]
    Apply {
        index: usize,
        kind: String,
        #[source]
        source: json_patch::PatchError,
    },
    #[error("failed to encode patched config document")]
    Encode(#[source] serde_yaml::Error),
    #[error("failed to parse TOML config")]
    MalformedToml(#[source] toml::de::Error),
    #[error("TOML config has a non-integer version: {0}")]
    BadTomlVersion(String),
    #[error("TOML merge patch #{index} could not be parsed")]
    MalformedTomlPatch {
        index: usize,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to encode patched TOML config: {0}")]
    EncodeToml(String),
}

/// The control plane did not report ready within the allotted time.
#[derive(Debug, Error)]
#[error("control plane was not ready after {0:?}")]
pub struct ReadinessTimeout(pub Duration);
