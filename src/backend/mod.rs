//! Proxmox and step-ca backends behind the engine and certkit traits

pub mod features;
pub mod proxmox;
pub mod step_ca;

use anyhow::{Result, bail};
use catalog::{Catalog, ResourceId};
use converge::{ControlPlane, FeatureRegistry};
use std::sync::Arc;
use std::time::Duration;

use crate::settings::Settings;

pub use proxmox::Proxmox;
pub use step_ca::StepCa;

/// Everything an engine run needs, wired from settings
pub struct Backend {
    pub control: Arc<dyn ControlPlane>,
    pub features: FeatureRegistry,
}

impl Backend {
    pub fn new(settings: &Settings, catalog: Arc<Catalog>) -> Self {
        let control: Arc<dyn ControlPlane> = Arc::new(Proxmox::new(
            catalog,
            settings.proxmox.clone(),
            &settings.snapshot.label,
        ));
        let features = features::registry(settings, Arc::clone(&control));
        Self { control, features }
    }
}

/// Runs post-renewal commands inside the owning resource
pub struct ResourceHooks {
    control: Arc<dyn ControlPlane>,
}

impl ResourceHooks {
    pub fn new(control: Arc<dyn ControlPlane>) -> Self {
        Self { control }
    }
}

impl certkit::HookRunner for ResourceHooks {
    fn run_hook(&self, id: ResourceId, command: &str, timeout: Duration) -> Result<()> {
        log::info!("{id}: running `{command}`");
        let output = self.control.exec(id, command, timeout)?;
        if !output.success() {
            bail!(
                "`{command}` exited with status {}: {}",
                output.exit_code,
                output.tail(5)
            );
        }
        Ok(())
    }
}
