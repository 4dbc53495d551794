//! Error taxonomy for resolution and convergence
//!
//! Validation errors (`Config`, `Dependency`, `Probe`) abort a run before any
//! resource is touched. Every other variant is tied to one resource and one
//! lifecycle step and is fatal for that resource and its dependents.

use crate::poll::PollTimeout;
use crate::types::LifecycleStep;
use catalog::ResourceId;
use thiserror::Error;

/// Collaborator errors are carried boxed so the chain survives
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised while resolving or converging resources
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed, ambiguous or missing declaration
    #[error(transparent)]
    Config(#[from] catalog::Error),

    /// The dependency graph contains a cycle
    #[error("dependency cycle: {}", format_cycle(.cycle))]
    Dependency { cycle: Vec<ResourceId> },

    /// Existence probe issued during resolution failed
    #[error("resource {id}: existence probe failed: {source}")]
    Probe {
        id: ResourceId,
        #[source]
        source: BoxError,
    },

    #[error("resource {id}: create failed: {source}")]
    Creation {
        id: ResourceId,
        #[source]
        source: BoxError,
    },

    #[error("resource {id}: configure failed: {source}")]
    Configuration {
        id: ResourceId,
        #[source]
        source: BoxError,
    },

    #[error("resource {id}: start failed: {source}")]
    Start {
        id: ResourceId,
        #[source]
        source: BoxError,
    },

    #[error("resource {id}: feature `{feature}` failed: {source}")]
    Feature {
        id: ResourceId,
        feature: String,
        #[source]
        source: BoxError,
    },

    #[error("resource {id}: application bootstrap failed: {source}")]
    Application {
        id: ResourceId,
        #[source]
        source: BoxError,
    },

    #[error("resource {id}: health check timed out: {cause}")]
    HealthCheckTimeout {
        id: ResourceId,
        #[source]
        cause: PollTimeout,
    },
}

impl Error {
    /// Process exit code for this error class
    pub fn code(&self) -> i32 {
        match self {
            Self::Config(_) => 2,
            Self::Dependency { .. } => 3,
            Self::Probe { .. } => 4,
            Self::Creation { .. } => 10,
            Self::Configuration { .. } => 11,
            Self::Start { .. } => 12,
            Self::Feature { .. } => 13,
            Self::Application { .. } => 14,
            Self::HealthCheckTimeout { .. } => 15,
        }
    }

    /// Short taxonomy name, as shown to operators
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "ConfigError",
            Self::Dependency { .. } => "DependencyError",
            Self::Probe { .. } => "ProbeError",
            Self::Creation { .. } => "CreationError",
            Self::Configuration { .. } => "ConfigurationError",
            Self::Start { .. } => "StartError",
            Self::Feature { .. } => "FeatureError",
            Self::Application { .. } => "ApplicationError",
            Self::HealthCheckTimeout { .. } => "HealthCheckTimeout",
        }
    }

    pub fn resource_id(&self) -> Option<ResourceId> {
        match self {
            Self::Config(e) => e.resource_id(),
            Self::Dependency { cycle } => cycle.first().copied(),
            Self::Probe { id, .. }
            | Self::Creation { id, .. }
            | Self::Configuration { id, .. }
            | Self::Start { id, .. }
            | Self::Feature { id, .. }
            | Self::Application { id, .. }
            | Self::HealthCheckTimeout { id, .. } => Some(*id),
        }
    }

    /// Lifecycle step the error happened in, for per-resource errors
    pub fn step(&self) -> Option<LifecycleStep> {
        match self {
            Self::Creation { .. } => Some(LifecycleStep::Create),
            Self::Configuration { .. } => Some(LifecycleStep::Configure),
            Self::Start { .. } => Some(LifecycleStep::Start),
            Self::Feature { .. } => Some(LifecycleStep::Features),
            Self::Application { .. } => Some(LifecycleStep::Application),
            Self::HealthCheckTimeout { .. } => Some(LifecycleStep::HealthCheck),
            _ => None,
        }
    }

    /// Whether the run was rejected before any mutation
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Dependency { .. } | Self::Probe { .. }
        )
    }

    pub(crate) fn creation(id: ResourceId, source: anyhow::Error) -> Self {
        Self::Creation {
            id,
            source: source.into(),
        }
    }

    pub(crate) fn configuration(id: ResourceId, source: anyhow::Error) -> Self {
        Self::Configuration {
            id,
            source: source.into(),
        }
    }

    pub(crate) fn start(id: ResourceId, source: anyhow::Error) -> Self {
        Self::Start {
            id,
            source: source.into(),
        }
    }

    pub(crate) fn feature(id: ResourceId, feature: &str, source: anyhow::Error) -> Self {
        Self::Feature {
            id,
            feature: feature.to_string(),
            source: source.into(),
        }
    }

    pub(crate) fn application(id: ResourceId, source: anyhow::Error) -> Self {
        Self::Application {
            id,
            source: source.into(),
        }
    }
}

fn format_cycle(cycle: &[ResourceId]) -> String {
    cycle
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Result type for convergence operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_display() {
        let err = Error::Dependency {
            cycle: vec![1, 2, 3, 1],
        };
        assert_eq!(err.to_string(), "dependency cycle: 1 -> 2 -> 3 -> 1");
        assert_eq!(err.code(), 3);
        assert!(err.is_validation());
    }

    #[test]
    fn test_step_errors_keep_source_chain() {
        let source = anyhow::anyhow!("pct exited 255").context("clone 900 -> 103");
        let err = Error::creation(103, source);
        assert_eq!(err.step(), Some(LifecycleStep::Create));
        assert_eq!(err.resource_id(), Some(103));
        assert_eq!(err.kind(), "CreationError");

        let inner = std::error::Error::source(&err).expect("source");
        assert_eq!(inner.to_string(), "clone 900 -> 103");
        assert!(!err.is_validation());
    }
}
