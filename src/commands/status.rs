//! `phoenix status` - observed lifecycle position of declared resources

use anyhow::Result;
use catalog::ResourceId;
use colored::Colorize;
use converge::{Engine, ResourceState};
use rayon::prelude::*;
use std::sync::Arc;

use crate::Context;
use crate::backend::Backend;
use crate::progress;
use crate::ui;

pub fn run(ctx: &Context, targets: &[ResourceId]) -> Result<i32> {
    let catalog = super::load_catalog(ctx)?;
    let backend = Backend::new(&ctx.settings, Arc::clone(&catalog));
    let engine = Engine::new(
        &catalog,
        backend.control.as_ref(),
        &backend.features,
        ctx.settings.engine_options(None),
    );

    let ids: Vec<ResourceId> = if targets.is_empty() {
        catalog.ids().collect()
    } else {
        for id in targets {
            catalog.require(*id)?;
        }
        targets.to_vec()
    };

    let pb = (!ctx.quiet).then(|| progress::spinner("Probing resources..."));
    let observed: Vec<(ResourceId, converge::Result<ResourceState>)> = ids
        .par_iter()
        .map(|id| (*id, engine.observe(*id)))
        .collect();
    if let Some(pb) = pb {
        pb.finish_and_clear();
    }

    ui::header("Resources");
    let mut failures = 0;
    for (id, state) in &observed {
        let Some(definition) = catalog.get(*id) else {
            continue;
        };
        let label = match state {
            Ok(state) => ui::state(*state),
            Err(e) => {
                failures += 1;
                log::warn!("{e}");
                "unknown".red()
            }
        };
        println!(
            "  {} {:<24} {}",
            id.to_string().bold(),
            definition.name,
            label
        );
        let features: Vec<String> = catalog.effective_features(*id).into_iter().collect();
        ui::dim(&format!("    features: {}", ui::list(&features)));
        if catalog.is_template_source(*id) {
            ui::dim("    template source");
        }
    }

    let converged = observed
        .iter()
        .filter(|(_, s)| s.as_ref().is_ok_and(ResourceState::is_converged))
        .count();
    println!();
    ui::kv("Converged", &format!("{converged}/{}", observed.len()));
    if failures > 0 {
        ui::warn(&format!("{failures} resource(s) could not be probed"));
        return Ok(4);
    }
    Ok(0)
}
