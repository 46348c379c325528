//! SF-018: Error kinds for graph building, planning, output resolution,
//! provider calls and state persistence.
//!
//! Planning-time errors ([`GraphError`], [`PlanError`]) abort the whole run
//! before anything is mutated. Apply-time errors ([`ApplyError`]) are recorded
//! per resource and never abort unrelated branches.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while building or finalizing the resource graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("duplicate resource name '{name}'")]
    DuplicateName { name: String },

    #[error("resource '{resource}' declares parent '{parent}' which has not been declared")]
    InvalidParent { resource: String, parent: String },

    #[error("resource '{resource}' depends on unknown resource '{dependency}'")]
    UnknownDependency { resource: String, dependency: String },

    #[error("resource '{resource}' names provider '{provider}', which is not a declared providers:<package> resource")]
    InvalidProvider { resource: String, provider: String },

    #[error("dependency cycle detected: {}", cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },
}

/// Errors that prevent a plan from being produced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("resource '{resource}' references '{dependency}', which is being deleted in this plan")]
    DeletedDependency { resource: String, dependency: String },

    #[error("cannot diff resource '{resource}': {source}")]
    Provider {
        resource: String,
        #[source]
        source: ProviderError,
    },
}

/// Errors from resolving deferred output values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OutputError {
    /// The producing resource has not completed yet. Seeing this from the
    /// executor means the scheduler broke its ordering invariant.
    #[error("output of '{resource}' is not yet available")]
    NotYetAvailable { resource: String },

    #[error("resource '{resource}' did not produce output '{key}'")]
    MissingOutput { resource: String, key: String },

    #[error("resource '{resource}' failed; its outputs will never resolve")]
    ProducerFailed { resource: String },

    #[error("output transformation failed: {message}")]
    Transform { message: String },
}

/// Errors surfaced by provider implementations and the provider registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("no provider registered for resource type '{resource_type}'")]
    UnknownType { resource_type: String },

    #[error("unknown manifest transform '{name}'")]
    UnknownTransform { name: String },

    #[error("{operation} failed: {message}")]
    Operation { operation: String, message: String },

    #[error("missing required input '{key}'")]
    MissingInput { key: String },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },
}

impl ProviderError {
    /// Create an operation failure with the given message.
    pub fn operation(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Operation {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// Snapshot persistence errors.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid state file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml_ng::Error,
    },

    #[error("cannot serialize state: {0}")]
    Serialize(#[from] serde_yaml_ng::Error),

    #[error("state store unavailable: {0}")]
    Unavailable(String),
}

/// Stack file parsing errors.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error("{} validation error(s):\n  - {}", .0.len(), .0.join("\n  - "))]
    Invalid(Vec<String>),

    #[error("template error in '{location}': {message}")]
    Template { location: String, message: String },

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Per-resource failure recorded during apply.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Output(#[from] OutputError),

    #[error("dependency '{dependency}' failed")]
    DependencyFailed { dependency: String },

    #[error("applied but state was not persisted: {0}")]
    State(#[from] StateError),
}

/// Top-level error for a whole engine run (preview, up, destroy).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sf018_cycle_message_lists_path() {
        let err = GraphError::CycleDetected {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle detected: a -> b -> a");
    }

    #[test]
    fn test_sf018_invalid_lists_every_error() {
        let err = ParseError::Invalid(vec!["one".into(), "two".into()]);
        let msg = err.to_string();
        assert!(msg.starts_with("2 validation error(s)"));
        assert!(msg.contains("- one"));
        assert!(msg.contains("- two"));
    }

    #[test]
    fn test_sf018_apply_error_wraps_provider() {
        let err: ApplyError = ProviderError::operation("create", "quota exceeded").into();
        assert_eq!(err.to_string(), "create failed: quota exceeded");
    }
}
