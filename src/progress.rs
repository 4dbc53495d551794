//! Progress indicators for phoenix CLI.
//!
//! [`ConvergeProgress`] turns engine notifications into one spinner per
//! resource. Spinners live in a `MultiProgress`, so parallel subgraphs
//! render side by side.

use catalog::ResourceId;
use colored::Colorize;
use converge::{ConvergeObserver, ConvergeReport, Error, LifecycleStep, StepOutcome};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Create a spinner with a message
pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(spinner_style());
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.cyan} {prefix:.bold} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// Finish a spinner with a success mark
pub fn finish_success(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::default_spinner());
    pb.finish_with_message(format!("{} {}", "✓".green(), msg));
}

/// Finish a spinner with an error mark
pub fn finish_error(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::default_spinner());
    pb.finish_with_message(format!("{} {}", "✗".red(), msg));
}

/// Spinner-per-resource observer for `phoenix create`
pub struct ConvergeProgress {
    multi: MultiProgress,
    bars: Mutex<HashMap<ResourceId, ProgressBar>>,
}

impl ConvergeProgress {
    pub fn new(quiet: bool) -> Self {
        let multi = if quiet {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        } else {
            MultiProgress::new()
        };
        Self {
            multi,
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn bar(&self, id: ResourceId) -> Option<ProgressBar> {
        self.bars
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }
}

impl ConvergeObserver for ConvergeProgress {
    fn on_resource_start(&self, definition: &catalog::ResourceDefinition) {
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(spinner_style());
        pb.set_prefix(format!("{} {}", definition.id, definition.name));
        pb.set_message("checking");
        pb.enable_steady_tick(Duration::from_millis(100));
        self.bars
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(definition.id, pb);
    }

    fn on_step_complete(&self, id: ResourceId, step: LifecycleStep, outcome: &StepOutcome) {
        let Some(pb) = self.bar(id) else {
            return;
        };
        match outcome {
            StepOutcome::Applied { detail: Some(detail) } => {
                pb.set_message(format!("{step}: {detail}"));
            }
            StepOutcome::Applied { detail: None } => pb.set_message(format!("{step}: done")),
            StepOutcome::Warning { message } => {
                let _ = self
                    .multi
                    .println(format!("  {} {}", "⚠".yellow(), message));
            }
            StepOutcome::AlreadySatisfied | StepOutcome::NotApplicable => {
                pb.set_message(format!("{step}: ok"));
            }
        }
    }

    fn on_resource_complete(&self, id: ResourceId, result: Result<&ConvergeReport, &Error>) {
        let Some(pb) = self.bar(id) else {
            return;
        };
        match result {
            Ok(report) if report.changes() == 0 => {
                finish_success(&pb, &format!("{} ({}, no changes)", pb.prefix(), report.state));
            }
            Ok(report) => finish_success(
                &pb,
                &format!("{} ({}, {} changes)", pb.prefix(), report.state, report.changes()),
            ),
            Err(e) => finish_error(&pb, &format!("{} {}", pb.prefix(), e.kind())),
        }
    }
}
