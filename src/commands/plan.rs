//! `phoenix plan` - show the creation order without touching anything

use anyhow::Result;
use catalog::{Catalog, ResourceId};
use colored::Colorize;
use converge::Engine;
use std::sync::Arc;

use crate::Context;
use crate::backend::Backend;
use crate::ui;

pub fn run(ctx: &Context, targets: &[ResourceId]) -> Result<i32> {
    let catalog = super::load_catalog(ctx)?;
    let backend = Backend::new(&ctx.settings, Arc::clone(&catalog));
    let options = ctx.settings.engine_options(None);
    let timeout = options.timeouts.control;
    let engine = Engine::new(&catalog, backend.control.as_ref(), &backend.features, options);

    engine.validate()?;
    let order = engine.resolve(targets)?;

    if order.is_empty() {
        ui::success("Every target and its sources already exist");
        return Ok(0);
    }

    print_order(&catalog, &order);
    for id in &order {
        // Resolution already probed these; a failure here is only cosmetic
        if backend.control.exists(*id, timeout).unwrap_or(false) {
            ui::dim(&format!("{id} exists, will be re-checked step by step"));
        }
    }
    Ok(0)
}

/// Print a resolved order, one numbered line per resource
pub fn print_order(catalog: &Catalog, order: &[ResourceId]) {
    ui::header("Plan");
    for (i, id) in order.iter().enumerate() {
        let line = match catalog.get(*id) {
            Some(d) => format!(
                "{} {} {}",
                id.to_string().bold(),
                d.name,
                format!("({}, {})", d.kind, d.creation_method).dimmed()
            ),
            None => id.to_string(),
        };
        ui::step(i + 1, order.len(), &line);
    }
}
