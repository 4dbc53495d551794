//! `phoenix validate` - load and cross-check both documents, touch nothing

use anyhow::Result;
use converge::FeatureRunner;
use std::sync::Arc;

use crate::Context;
use crate::backend::Backend;
use crate::ui;

pub fn run(ctx: &Context) -> Result<i32> {
    let catalog = super::load_catalog(ctx)?;
    let backend = Backend::new(&ctx.settings, Arc::clone(&catalog));
    catalog
        .validate_features(|name| backend.features.knows(name))
        .map_err(converge::Error::from)?;

    ui::success(&format!(
        "{} resource(s), {} certificate(s) valid",
        catalog.len(),
        catalog.certificates().len()
    ));
    if ctx.verbose > 0 {
        let features: Vec<String> = backend.features.names().map(str::to_string).collect();
        ui::section("Catalog");
        ui::kv("Resources", &ctx.settings.resources_path().display().to_string());
        if let Some(path) = ctx.settings.certificates_path() {
            ui::kv("Certificates", &path.display().to_string());
        }
        ui::kv("Features", &ui::list(&features));
    }
    Ok(0)
}
