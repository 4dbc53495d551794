//! Collaborator contracts consumed by the engine
//!
//! The engine never talks to the hypervisor directly. These traits are
//! implemented by the binary (Proxmox CLI backends) and by in-memory fakes
//! in tests. Every call takes a timeout; a timed-out call is an error.

use crate::error::Error;
use crate::types::{ConvergeReport, ExecOutput, LifecycleStep, StepOutcome};
use anyhow::Result;
use catalog::{Catalog, FeatureSpec, ResourceDefinition, ResourceId};
use std::path::Path;
use std::time::Duration;

/// Hypervisor control plane
///
/// Query methods (`exists`, `is_*`, `has_*`, `exec`) must not mutate
/// anything. Mutating methods are expected to be safe to call again if a
/// previous run was interrupted halfway.
pub trait ControlPlane: Send + Sync {
    fn exists(&self, id: ResourceId, timeout: Duration) -> Result<bool>;

    /// Create the resource using its declared creation method
    fn create(&self, definition: &ResourceDefinition, timeout: Duration) -> Result<()>;

    /// Whether network, compute, mounts and firewall match the declaration
    fn is_configured(&self, definition: &ResourceDefinition, timeout: Duration) -> Result<bool>;

    fn configure(&self, definition: &ResourceDefinition, timeout: Duration) -> Result<()>;

    fn is_running(&self, id: ResourceId, timeout: Duration) -> Result<bool>;

    fn start(&self, id: ResourceId, timeout: Duration) -> Result<()>;

    fn stop(&self, id: ResourceId, timeout: Duration) -> Result<()>;

    /// Set a single raw hypervisor option (e.g. a device passthrough entry)
    fn set_option(&self, id: ResourceId, key: &str, value: &str, timeout: Duration) -> Result<()>;

    /// Run a shell command inside the resource
    fn exec(&self, id: ResourceId, command: &str, timeout: Duration) -> Result<ExecOutput>;

    /// Copy a host script into the resource and run it
    fn run_script(&self, id: ResourceId, script: &Path, timeout: Duration) -> Result<ExecOutput>;

    /// Whether a completion marker exists inside the resource
    fn has_marker(&self, id: ResourceId, marker: &str, timeout: Duration) -> Result<bool>;

    fn set_marker(&self, id: ResourceId, marker: &str, timeout: Duration) -> Result<()>;

    fn has_snapshot(&self, id: ResourceId, label: &str, timeout: Duration) -> Result<bool>;

    fn snapshot(&self, id: ResourceId, label: &str, timeout: Duration) -> Result<()>;

    /// Stop then start
    fn restart(&self, id: ResourceId, timeout: Duration) -> Result<()> {
        if self.is_running(id, timeout)? {
            self.stop(id, timeout)?;
        }
        self.start(id, timeout)
    }
}

/// Observable side effect a feature needs after a restart
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Readiness {
    /// Command run inside the resource; exit 0 means the effect is visible
    pub command: String,
    pub attempts: u32,
    pub interval: Duration,
}

/// What applying a feature requires from the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeatureEffect {
    /// Feature is in place, nothing else to do
    Applied,
    /// Hardware-facing configuration was written; the resource must be
    /// restarted and the effect observed before the feature counts as applied
    RestartRequired { readiness: Readiness },
}

/// Feature runner
pub trait FeatureRunner: Send + Sync {
    /// Whether a handler exists for this feature name
    fn knows(&self, name: &str) -> bool;

    /// Whether the feature is present on this exact resource
    fn has_feature(&self, id: ResourceId, feature: &FeatureSpec, timeout: Duration)
    -> Result<bool>;

    fn apply_feature(
        &self,
        id: ResourceId,
        feature: &FeatureSpec,
        timeout: Duration,
    ) -> Result<FeatureEffect>;

    /// Whether the feature is present on `id` or anything it was cloned from.
    ///
    /// Walks the `CloneFrom` chain nearest first and returns the id that
    /// has it.
    fn has_feature_inherited(
        &self,
        catalog: &Catalog,
        id: ResourceId,
        feature: &FeatureSpec,
        timeout: Duration,
    ) -> Result<Option<ResourceId>> {
        for candidate in std::iter::once(id).chain(catalog.clone_chain(id)) {
            if self.has_feature(candidate, feature, timeout)? {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }
}

/// Progress notifications during a run
///
/// Called from worker threads when running independent subgraphs in
/// parallel, hence `Sync` and `&self`.
pub trait ConvergeObserver: Send + Sync {
    /// Called once with the resolved order
    fn on_plan(&self, _order: &[ResourceId]) {}

    fn on_resource_start(&self, _definition: &ResourceDefinition) {}

    fn on_step_complete(&self, _id: ResourceId, _step: LifecycleStep, _outcome: &StepOutcome) {}

    fn on_resource_complete(&self, _id: ResourceId, _result: std::result::Result<&ConvergeReport, &Error>) {
    }
}

/// No-op observer
pub struct NoProgress;

impl ConvergeObserver for NoProgress {}
