//! In-memory control plane and feature runner for tests
//!
//! Both fakes share one [`World`] and record every call, flagging the ones
//! that mutate state.

use crate::context::{ControlPlane, FeatureEffect, FeatureRunner, Readiness};
use crate::types::ExecOutput;
use anyhow::{Result, bail};
use catalog::{FeatureSpec, ResourceDefinition, ResourceId};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub const HEALTH_COMMAND: &str = "healthcheck";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: &'static str,
    pub id: ResourceId,
    pub detail: String,
    pub mutating: bool,
}

#[derive(Debug, Default)]
pub struct World {
    pub existing: BTreeSet<ResourceId>,
    pub configured: BTreeSet<ResourceId>,
    pub running: BTreeSet<ResourceId>,
    pub markers: BTreeSet<(ResourceId, String)>,
    pub snapshots: BTreeSet<(ResourceId, String)>,
    /// Features observable on a resource
    pub features: BTreeSet<(ResourceId, String)>,
    /// Hardware configuration written but not yet active (needs a restart)
    pub pending_hardware: BTreeSet<(ResourceId, String)>,
    /// Hardware features that never become observable
    pub broken_hardware: BTreeSet<String>,
    pub unhealthy: BTreeSet<ResourceId>,
    /// Injected failures: (operation, id)
    pub failing: BTreeSet<(&'static str, ResourceId)>,
    pub script_exit: BTreeMap<ResourceId, i32>,
    pub calls: Vec<Call>,
}

pub type SharedWorld = Arc<Mutex<World>>;

impl World {
    pub fn shared() -> SharedWorld {
        Arc::new(Mutex::new(World::default()))
    }

    pub fn mutating_calls(&self) -> Vec<Call> {
        self.calls.iter().filter(|c| c.mutating).cloned().collect()
    }

    pub fn ops_for(&self, id: ResourceId) -> Vec<&'static str> {
        self.calls
            .iter()
            .filter(|c| c.id == id && c.mutating)
            .map(|c| c.op)
            .collect()
    }

    /// Ids in the order they were first created
    pub fn created_order(&self) -> Vec<ResourceId> {
        self.calls
            .iter()
            .filter(|c| c.op == "create")
            .map(|c| c.id)
            .collect()
    }

    /// Mark a resource as fully converged already
    pub fn healthy(&mut self, id: ResourceId) {
        self.existing.insert(id);
        self.configured.insert(id);
        self.running.insert(id);
    }
}

fn lock(world: &SharedWorld) -> MutexGuard<'_, World> {
    match world.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn record(
    world: &mut World,
    op: &'static str,
    id: ResourceId,
    detail: &str,
    mutating: bool,
) -> Result<()> {
    world.calls.push(Call {
        op,
        id,
        detail: detail.to_string(),
        mutating,
    });
    if world.failing.contains(&(op, id)) {
        bail!("injected {op} failure on {id}");
    }
    Ok(())
}

pub struct MockControlPlane {
    world: SharedWorld,
}

impl MockControlPlane {
    pub fn new(world: SharedWorld) -> Self {
        Self { world }
    }
}

impl ControlPlane for MockControlPlane {
    fn exists(&self, id: ResourceId, _timeout: Duration) -> Result<bool> {
        let mut w = lock(&self.world);
        record(&mut w, "exists", id, "", false)?;
        Ok(w.existing.contains(&id))
    }

    fn create(&self, definition: &ResourceDefinition, _timeout: Duration) -> Result<()> {
        let mut w = lock(&self.world);
        let detail = definition.creation_method.to_string();
        record(&mut w, "create", definition.id, &detail, true)?;
        if let Some(source) = definition.creation_method.source_id()
            && !w.existing.contains(&source)
        {
            bail!("source {source} does not exist");
        }
        w.existing.insert(definition.id);
        Ok(())
    }

    fn is_configured(&self, definition: &ResourceDefinition, _timeout: Duration) -> Result<bool> {
        let mut w = lock(&self.world);
        record(&mut w, "is_configured", definition.id, "", false)?;
        Ok(w.configured.contains(&definition.id))
    }

    fn configure(&self, definition: &ResourceDefinition, _timeout: Duration) -> Result<()> {
        let mut w = lock(&self.world);
        record(&mut w, "configure", definition.id, "", true)?;
        w.configured.insert(definition.id);
        Ok(())
    }

    fn is_running(&self, id: ResourceId, _timeout: Duration) -> Result<bool> {
        let mut w = lock(&self.world);
        record(&mut w, "is_running", id, "", false)?;
        Ok(w.running.contains(&id))
    }

    fn start(&self, id: ResourceId, _timeout: Duration) -> Result<()> {
        let mut w = lock(&self.world);
        record(&mut w, "start", id, "", true)?;
        w.running.insert(id);

        let activated: Vec<(ResourceId, String)> = w
            .pending_hardware
            .iter()
            .filter(|(pending_id, name)| *pending_id == id && !w.broken_hardware.contains(name))
            .cloned()
            .collect();
        for entry in activated {
            w.pending_hardware.remove(&entry);
            w.features.insert(entry);
        }
        Ok(())
    }

    fn stop(&self, id: ResourceId, _timeout: Duration) -> Result<()> {
        let mut w = lock(&self.world);
        record(&mut w, "stop", id, "", true)?;
        w.running.remove(&id);
        Ok(())
    }

    fn set_option(&self, id: ResourceId, key: &str, value: &str, _timeout: Duration) -> Result<()> {
        let mut w = lock(&self.world);
        record(&mut w, "set_option", id, &format!("{key}={value}"), true)
    }

    fn exec(&self, id: ResourceId, command: &str, _timeout: Duration) -> Result<ExecOutput> {
        let mut w = lock(&self.world);
        record(&mut w, "exec", id, command, false)?;

        let ok = if command == HEALTH_COMMAND {
            !w.unhealthy.contains(&id)
        } else if let Some(feature) = command.strip_prefix("probe ") {
            w.features.contains(&(id, feature.to_string()))
        } else {
            true
        };

        Ok(ExecOutput {
            stdout: String::new(),
            stderr: if ok { String::new() } else { "not ready".into() },
            exit_code: if ok { 0 } else { 1 },
        })
    }

    fn run_script(&self, id: ResourceId, script: &Path, _timeout: Duration) -> Result<ExecOutput> {
        let mut w = lock(&self.world);
        record(&mut w, "run_script", id, &script.display().to_string(), true)?;
        let exit_code = w.script_exit.get(&id).copied().unwrap_or(0);
        Ok(ExecOutput {
            stdout: "bootstrap output".into(),
            stderr: if exit_code == 0 {
                String::new()
            } else {
                "vllm: model not found".into()
            },
            exit_code,
        })
    }

    fn has_marker(&self, id: ResourceId, marker: &str, _timeout: Duration) -> Result<bool> {
        let mut w = lock(&self.world);
        record(&mut w, "has_marker", id, marker, false)?;
        Ok(w.markers.contains(&(id, marker.to_string())))
    }

    fn set_marker(&self, id: ResourceId, marker: &str, _timeout: Duration) -> Result<()> {
        let mut w = lock(&self.world);
        record(&mut w, "set_marker", id, marker, true)?;
        w.markers.insert((id, marker.to_string()));
        Ok(())
    }

    fn has_snapshot(&self, id: ResourceId, label: &str, _timeout: Duration) -> Result<bool> {
        let mut w = lock(&self.world);
        record(&mut w, "has_snapshot", id, label, false)?;
        Ok(w.snapshots.contains(&(id, label.to_string())))
    }

    fn snapshot(&self, id: ResourceId, label: &str, _timeout: Duration) -> Result<()> {
        let mut w = lock(&self.world);
        record(&mut w, "snapshot", id, label, true)?;
        w.snapshots.insert((id, label.to_string()));
        Ok(())
    }
}

pub struct MockFeatures {
    world: SharedWorld,
    hardware: BTreeSet<String>,
}

impl MockFeatures {
    pub fn new(world: SharedWorld) -> Self {
        Self {
            world,
            hardware: BTreeSet::new(),
        }
    }

    /// Treat `name` as a hardware feature that needs a restart to show up
    pub fn with_hardware(mut self, name: &str) -> Self {
        self.hardware.insert(name.to_string());
        self
    }
}

impl FeatureRunner for MockFeatures {
    fn knows(&self, _name: &str) -> bool {
        true
    }

    fn has_feature(&self, id: ResourceId, feature: &FeatureSpec, _timeout: Duration) -> Result<bool> {
        let mut w = lock(&self.world);
        record(&mut w, "has_feature", id, &feature.name, false)?;
        Ok(w.features.contains(&(id, feature.name.clone())))
    }

    fn apply_feature(
        &self,
        id: ResourceId,
        feature: &FeatureSpec,
        _timeout: Duration,
    ) -> Result<FeatureEffect> {
        let mut w = lock(&self.world);
        record(&mut w, "apply_feature", id, &feature.name, true)?;

        if self.hardware.contains(&feature.name) {
            w.pending_hardware.insert((id, feature.name.clone()));
            return Ok(FeatureEffect::RestartRequired {
                readiness: Readiness {
                    command: format!("probe {}", feature.name),
                    attempts: 3,
                    interval: Duration::from_millis(1),
                },
            });
        }

        w.features.insert((id, feature.name.clone()));
        Ok(FeatureEffect::Applied)
    }
}
