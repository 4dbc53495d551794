//! `phoenix renew-certs` - renew due certificates and reload their consumers

use anyhow::Result;
use certkit::{RenewalOutcome, RenewalResult};
use chrono::Utc;
use std::sync::Arc;

use crate::Context;
use crate::backend::{Backend, ResourceHooks, StepCa};
use crate::paths;
use crate::ui;

pub fn run(ctx: &Context, dry_run: bool) -> Result<i32> {
    let catalog = super::load_catalog(ctx)?;
    if catalog.certificates().is_empty() {
        ui::info("No certificates declared");
        return Ok(0);
    }

    let backend = Backend::new(&ctx.settings, Arc::clone(&catalog));
    let ca = StepCa::new(ctx.settings.ca.clone(), paths::state_dir().join("ca"));
    let hooks = ResourceHooks::new(Arc::clone(&backend.control));

    if dry_run {
        ui::warn("Dry run - no certificates will be issued");
    }

    let results = certkit::renew_locked(
        &ctx.settings.lock_path(),
        catalog.certificates(),
        Utc::now(),
        &ca,
        &hooks,
        &ctx.settings.renew_options(dry_run),
    )?;

    ui::header("Certificates");
    for result in &results {
        print_result(result);
    }
    Ok(certkit::exit_code(&results))
}

fn print_result(result: &RenewalResult) {
    let who = format!("{} ({})", result.common_name, result.resource_id);
    match &result.outcome {
        RenewalOutcome::NotDue { expires_at } => {
            ui::dim(&format!("{who}: valid until {}", expires_at.format("%Y-%m-%d %H:%M UTC")));
        }
        RenewalOutcome::Due { expires_at: Some(at) } => {
            ui::info(&format!("{who}: due, expires {}", at.format("%Y-%m-%d %H:%M UTC")));
        }
        RenewalOutcome::Due { expires_at: None } => ui::info(&format!("{who}: due, not installed")),
        RenewalOutcome::Renewed { .. } => ui::success(&format!("{who}: renewed")),
        RenewalOutcome::HookFailed { error } => {
            ui::warn(&format!("{who}: renewed, but reload failed: {error}"));
        }
        RenewalOutcome::Failed { error } => ui::error(&format!("{who}: {error}")),
    }
}
