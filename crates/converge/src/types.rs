//! Core types for resource convergence

use catalog::ResourceId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Observed lifecycle position of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceState {
    Undefined,
    Created,
    Configured,
    Running,
    FeaturesApplied,
    ApplicationReady,
    Healthy,
    Snapshotted,
    Failed,
}

impl ResourceState {
    /// Healthy or beyond
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Healthy | Self::Snapshotted)
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Undefined => "undefined",
            Self::Created => "created",
            Self::Configured => "configured",
            Self::Running => "running",
            Self::FeaturesApplied => "features-applied",
            Self::ApplicationReady => "application-ready",
            Self::Healthy => "healthy",
            Self::Snapshotted => "snapshotted",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One transition of the lifecycle, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LifecycleStep {
    Create,
    Configure,
    Start,
    Features,
    Application,
    HealthCheck,
    Snapshot,
}

impl LifecycleStep {
    pub const ALL: [LifecycleStep; 7] = [
        Self::Create,
        Self::Configure,
        Self::Start,
        Self::Features,
        Self::Application,
        Self::HealthCheck,
        Self::Snapshot,
    ];

    /// State reached when this step's postcondition holds
    pub fn target_state(&self) -> ResourceState {
        match self {
            Self::Create => ResourceState::Created,
            Self::Configure => ResourceState::Configured,
            Self::Start => ResourceState::Running,
            Self::Features => ResourceState::FeaturesApplied,
            Self::Application => ResourceState::ApplicationReady,
            Self::HealthCheck => ResourceState::Healthy,
            Self::Snapshot => ResourceState::Snapshotted,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Configure => "configure",
            Self::Start => "start",
            Self::Features => "features",
            Self::Application => "application",
            Self::HealthCheck => "health-check",
            Self::Snapshot => "snapshot",
        }
    }
}

impl fmt::Display for LifecycleStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of running one lifecycle step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepOutcome {
    /// Postcondition already held, nothing was done
    AlreadySatisfied,
    /// Action was taken
    Applied { detail: Option<String> },
    /// Nothing declared for this step
    NotApplicable,
    /// Step failed without failing the resource
    Warning { message: String },
}

impl StepOutcome {
    pub fn applied() -> Self {
        Self::Applied { detail: None }
    }

    pub fn is_change(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// What converging one resource did
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergeReport {
    pub id: ResourceId,
    pub state: ResourceState,
    pub steps: Vec<(LifecycleStep, StepOutcome)>,
}

impl ConvergeReport {
    pub fn new(id: ResourceId) -> Self {
        Self {
            id,
            state: ResourceState::Undefined,
            steps: Vec::new(),
        }
    }

    /// Number of steps that took an action
    pub fn changes(&self) -> usize {
        self.steps.iter().filter(|(_, o)| o.is_change()).count()
    }

    pub fn warnings(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().filter_map(|(_, o)| match o {
            StepOutcome::Warning { message } => Some(message.as_str()),
            _ => None,
        })
    }
}

/// Output of a command executed inside a resource
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last few lines of stderr (or stdout when stderr is empty), for error messages
    pub fn tail(&self, lines: usize) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let collected: Vec<&str> = source.trim().lines().collect();
        let start = collected.len().saturating_sub(lines);
        collected[start..].join("\n")
    }
}

/// Per-call timeouts for collaborator operations
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Hypervisor calls: probes, create, configure, start, snapshot
    pub control: Duration,
    /// A single feature handler invocation
    pub feature: Duration,
    /// Application bootstrap scripts
    pub script: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            control: Duration::from_secs(300),
            feature: Duration::from_secs(1800),
            script: Duration::from_secs(3600),
        }
    }
}

/// Options for an engine run
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub timeouts: Timeouts,
    /// Snapshot label taken on resources used as template sources
    pub snapshot_label: String,
    /// Upper bound on any single health or readiness wait
    pub health_deadline: Option<Duration>,
    /// Parallel jobs across independent subgraphs; 1 is strictly sequential
    pub jobs: usize,
    /// Base directory for relative application script paths
    pub script_dir: PathBuf,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            snapshot_label: "phoenix-template".to_string(),
            health_deadline: None,
            jobs: 1,
            script_dir: PathBuf::new(),
        }
    }
}
