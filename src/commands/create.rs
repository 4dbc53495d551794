//! `phoenix create` - converge resources and everything they need

use anyhow::Result;
use catalog::{Catalog, ResourceId};
use converge::{Engine, ResourceOutcome, RunSummary};
use std::sync::Arc;

use crate::Context;
use crate::backend::Backend;
use crate::progress::ConvergeProgress;
use crate::ui;

pub fn run(ctx: &Context, targets: &[ResourceId], yes: bool, jobs: Option<usize>) -> Result<i32> {
    super::preflight(ctx);
    let catalog = super::load_catalog(ctx)?;
    let backend = Backend::new(&ctx.settings, Arc::clone(&catalog));
    let progress = ConvergeProgress::new(ctx.quiet);

    let engine = Engine::new(
        &catalog,
        backend.control.as_ref(),
        &backend.features,
        ctx.settings.engine_options(jobs),
    )
    .with_observer(&progress);

    engine.validate()?;
    let order = engine.resolve(targets)?;

    if order.is_empty() {
        ui::success("Nothing to do");
        return Ok(0);
    }

    if !ctx.quiet {
        super::plan::print_order(&catalog, &order);
    }

    if !yes && !super::confirm_proceed()? {
        ui::warn("Aborted");
        return Ok(0);
    }

    let summary = engine.execute(order);
    print_summary(&catalog, &summary);
    Ok(summary.exit_code())
}

fn print_summary(catalog: &Catalog, summary: &RunSummary) {
    ui::header("Summary");

    for (id, outcome) in &summary.outcomes {
        let name = catalog.get(*id).map_or("", |d| d.name.as_str());
        match outcome {
            ResourceOutcome::Converged(report) => {
                for warning in report.warnings() {
                    ui::warn(&format!("{id} {name}: {warning}"));
                }
            }
            ResourceOutcome::Failed(e) => {
                let step = e.step().map_or_else(String::new, |s| format!(" [{s}]"));
                ui::error(&format!("{}{step}: {e}", e.kind()));
            }
            ResourceOutcome::NotAttempted { blocked_by } => {
                ui::dim(&format!("{id} {name}: not attempted, blocked by {blocked_by}"));
            }
        }
    }

    ui::kv("Converged", &summary.converged().to_string());
    ui::kv("Changes", &summary.changes().to_string());
    if summary.failed() > 0 {
        ui::kv("Failed", &summary.failed().to_string());
    }
    if summary.not_attempted() > 0 {
        ui::kv("Not attempted", &summary.not_attempted().to_string());
    }

    if summary.is_success() {
        ui::success("All resources converged");
    }
}
