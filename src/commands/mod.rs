//! Subcommand implementations
//!
//! Each command returns the process exit code on a completed run; errors
//! that abort a run before it starts are mapped to codes in `main`.

pub mod create;
pub mod plan;
pub mod renew;
pub mod status;
pub mod validate;

use anyhow::{Context as _, Result};
use catalog::Catalog;
use std::path::PathBuf;
use std::sync::Arc;

use crate::Context;
use crate::runner;
use crate::ui;

/// Load the resource document and certificate manifest named in settings
pub fn load_catalog(ctx: &Context) -> Result<Arc<Catalog>> {
    let resources = ctx.settings.resources_path();
    let certificates = existing_manifest(ctx.settings.certificates_path());

    log::debug!("loading resources from {}", resources.display());
    let catalog = Catalog::load(&resources, certificates.as_deref())
        .with_context(|| format!("Could not load {}", resources.display()))?;
    Ok(Arc::new(catalog))
}

/// A configured manifest that is missing means no certificates are managed
fn existing_manifest(path: Option<PathBuf>) -> Option<PathBuf> {
    path.filter(|path| {
        let found = path.exists();
        if !found {
            log::warn!("certificate manifest {} not found, no certificates managed", path.display());
        }
        found
    })
}

/// `pct` and `qm` need root and a Proxmox host; say so before the first call fails
pub fn preflight(ctx: &Context) {
    // SAFETY: geteuid has no preconditions and cannot fail
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        ui::warn("Not running as root; Proxmox commands will likely fail");
    }
    if !runner::command_exists(&ctx.settings.proxmox.pct) {
        ui::warn(&format!("`{}` not found in PATH", ctx.settings.proxmox.pct));
    }
}

fn confirm_proceed() -> Result<bool> {
    use dialoguer::Confirm;

    let confirmed = Confirm::new()
        .with_prompt("Continue?")
        .default(true)
        .interact()?;

    Ok(confirmed)
}
