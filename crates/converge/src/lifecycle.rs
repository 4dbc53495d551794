//! Per-resource lifecycle state machine
//!
//! A resource is driven through
//! `Create -> Configure -> Start -> Features -> Application -> HealthCheck -> Snapshot`.
//! Every step observes its postcondition first and only acts when it does
//! not hold, so converging an already healthy resource performs no
//! mutating call. Failure in any step except `Snapshot` is fatal for the
//! resource.

use crate::context::{ControlPlane, ConvergeObserver, FeatureEffect, FeatureRunner, Readiness};
use crate::error::{Error, Result};
use crate::poll::{LogCallback, PollConfig, poll_until};
use crate::types::{ConvergeReport, EngineOptions, LifecycleStep, ResourceState, StepOutcome};
use catalog::{Catalog, FeatureSpec, ResourceDefinition, ResourceId};
use std::path::Path;

/// Marker recorded inside a resource once its application script succeeded
pub fn application_marker(script: &str) -> String {
    let stem = Path::new(script)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| script.to_string());
    format!("application-{stem}")
}

/// Drives single resources to their declared state
pub struct Lifecycle<'a> {
    catalog: &'a Catalog,
    control: &'a dyn ControlPlane,
    features: &'a dyn FeatureRunner,
    options: &'a EngineOptions,
    observer: &'a dyn ConvergeObserver,
}

impl<'a> Lifecycle<'a> {
    pub fn new(
        catalog: &'a Catalog,
        control: &'a dyn ControlPlane,
        features: &'a dyn FeatureRunner,
        options: &'a EngineOptions,
        observer: &'a dyn ConvergeObserver,
    ) -> Self {
        Self {
            catalog,
            control,
            features,
            options,
            observer,
        }
    }

    /// Run every step for `definition`, stopping at the first fatal error
    pub fn converge(&self, definition: &ResourceDefinition) -> Result<ConvergeReport> {
        let id = definition.id;
        let mut report = ConvergeReport::new(id);

        for step in LifecycleStep::ALL {
            let outcome = self.run_step(step, definition)?;
            log::debug!("resource {id}: {step} -> {outcome:?}");
            self.observer.on_step_complete(id, step, &outcome);

            let reached = match (&outcome, step) {
                (StepOutcome::Warning { .. }, _) => false,
                (StepOutcome::NotApplicable, LifecycleStep::Snapshot) => false,
                _ => true,
            };
            if reached {
                report.state = step.target_state();
            }
            report.steps.push((step, outcome));
        }

        Ok(report)
    }

    /// Walk the postconditions without acting and report the furthest
    /// state that holds. Each check runs once; the health check is a single
    /// probe rather than a poll.
    pub fn observe(&self, definition: &ResourceDefinition) -> anyhow::Result<ResourceState> {
        let id = definition.id;
        let timeout = self.options.timeouts.control;

        if !self.control.exists(id, timeout)? {
            return Ok(ResourceState::Undefined);
        }
        if !self.control.is_configured(definition, timeout)? {
            return Ok(ResourceState::Created);
        }
        if !self.control.is_running(id, timeout)? {
            return Ok(ResourceState::Configured);
        }
        for feature in &definition.features {
            if self
                .features
                .has_feature_inherited(self.catalog, id, feature, self.options.timeouts.feature)?
                .is_none()
            {
                return Ok(ResourceState::Running);
            }
        }
        if let Some(script) = &definition.application_script
            && !self
                .control
                .has_marker(id, &application_marker(script), timeout)?
        {
            return Ok(ResourceState::FeaturesApplied);
        }
        if let Some(check) = &definition.health_check
            && !self.control.exec(id, &check.command, timeout)?.success()
        {
            return Ok(ResourceState::ApplicationReady);
        }
        if self.catalog.is_template_source(id)
            && self
                .control
                .has_snapshot(id, &self.options.snapshot_label, timeout)?
        {
            return Ok(ResourceState::Snapshotted);
        }
        Ok(ResourceState::Healthy)
    }

    fn run_step(&self, step: LifecycleStep, definition: &ResourceDefinition) -> Result<StepOutcome> {
        match step {
            LifecycleStep::Create => self.create(definition),
            LifecycleStep::Configure => self.configure(definition),
            LifecycleStep::Start => self.start(definition.id),
            LifecycleStep::Features => self.apply_features(definition),
            LifecycleStep::Application => self.application(definition),
            LifecycleStep::HealthCheck => self.health_check(definition),
            LifecycleStep::Snapshot => Ok(self.snapshot(definition.id)),
        }
    }

    fn create(&self, definition: &ResourceDefinition) -> Result<StepOutcome> {
        let id = definition.id;
        let timeout = self.options.timeouts.control;

        if self
            .control
            .exists(id, timeout)
            .map_err(|e| Error::creation(id, e))?
        {
            return Ok(StepOutcome::AlreadySatisfied);
        }

        log::info!("creating resource {id} ({})", definition.creation_method);
        self.control
            .create(definition, timeout)
            .map_err(|e| Error::creation(id, e))?;

        Ok(StepOutcome::Applied {
            detail: Some(definition.creation_method.to_string()),
        })
    }

    fn configure(&self, definition: &ResourceDefinition) -> Result<StepOutcome> {
        let id = definition.id;
        let timeout = self.options.timeouts.control;

        if self
            .control
            .is_configured(definition, timeout)
            .map_err(|e| Error::configuration(id, e))?
        {
            return Ok(StepOutcome::AlreadySatisfied);
        }

        self.control
            .configure(definition, timeout)
            .map_err(|e| Error::configuration(id, e))?;
        Ok(StepOutcome::applied())
    }

    fn start(&self, id: ResourceId) -> Result<StepOutcome> {
        let timeout = self.options.timeouts.control;

        if self
            .control
            .is_running(id, timeout)
            .map_err(|e| Error::start(id, e))?
        {
            return Ok(StepOutcome::AlreadySatisfied);
        }

        self.control
            .start(id, timeout)
            .map_err(|e| Error::start(id, e))?;
        Ok(StepOutcome::applied())
    }

    fn apply_features(&self, definition: &ResourceDefinition) -> Result<StepOutcome> {
        if definition.features.is_empty() {
            return Ok(StepOutcome::NotApplicable);
        }

        let mut applied = Vec::new();
        for feature in &definition.features {
            if self.apply_feature(definition.id, feature)? {
                applied.push(feature.name.as_str());
            }
        }

        if applied.is_empty() {
            Ok(StepOutcome::AlreadySatisfied)
        } else {
            Ok(StepOutcome::Applied {
                detail: Some(applied.join(", ")),
            })
        }
    }

    /// Returns whether the feature had to be applied
    fn apply_feature(&self, id: ResourceId, feature: &FeatureSpec) -> Result<bool> {
        let timeout = self.options.timeouts.feature;
        let fail = |e: anyhow::Error| Error::feature(id, &feature.name, e);

        if let Some(owner) = self
            .features
            .has_feature_inherited(self.catalog, id, feature, timeout)
            .map_err(fail)?
        {
            if owner == id {
                log::debug!("resource {id}: feature `{}` already present", feature.name);
            } else {
                log::debug!(
                    "resource {id}: feature `{}` inherited from {owner}",
                    feature.name
                );
            }
            return Ok(false);
        }

        log::info!("resource {id}: applying feature `{}`", feature.name);
        match self
            .features
            .apply_feature(id, feature, timeout)
            .map_err(fail)?
        {
            FeatureEffect::Applied => {}
            FeatureEffect::RestartRequired { readiness } => {
                self.restart_and_wait(id, &feature.name, &readiness)
                    .map_err(fail)?;
            }
        }
        Ok(true)
    }

    /// Restart so hardware configuration takes effect, then wait until the
    /// effect is observable from inside the resource
    fn restart_and_wait(
        &self,
        id: ResourceId,
        feature: &str,
        readiness: &Readiness,
    ) -> anyhow::Result<()> {
        let timeout = self.options.timeouts.control;

        log::info!("resource {id}: restarting for feature `{feature}`");
        self.control.restart(id, timeout)?;

        let config = PollConfig::new(readiness.attempts, readiness.interval)
            .with_timeout(self.options.health_deadline);
        let what = format!("resource {id} feature `{feature}` readiness");
        let callback = LogCallback { what: &what };

        poll_until(&config, Some(&callback), || {
            Ok(self.control.exec(id, &readiness.command, timeout)?.success())
        })
        .map_err(|e| {
            anyhow::Error::new(e).context(format!(
                "`{}` did not succeed after restart",
                readiness.command
            ))
        })?;
        Ok(())
    }

    fn application(&self, definition: &ResourceDefinition) -> Result<StepOutcome> {
        let Some(script) = &definition.application_script else {
            return Ok(StepOutcome::NotApplicable);
        };
        let id = definition.id;
        let timeout = self.options.timeouts.control;
        let marker = application_marker(script);

        if self
            .control
            .has_marker(id, &marker, timeout)
            .map_err(|e| Error::application(id, e))?
        {
            return Ok(StepOutcome::AlreadySatisfied);
        }

        let path = self.options.script_dir.join(script);
        log::info!("resource {id}: running {}", path.display());
        let output = self
            .control
            .run_script(id, &path, self.options.timeouts.script)
            .map_err(|e| Error::application(id, e))?;

        if !output.success() {
            return Err(Error::application(
                id,
                anyhow::anyhow!(
                    "{} exited with status {}: {}",
                    script,
                    output.exit_code,
                    output.tail(5)
                ),
            ));
        }

        self.control
            .set_marker(id, &marker, timeout)
            .map_err(|e| Error::application(id, e))?;

        Ok(StepOutcome::Applied {
            detail: Some(script.clone()),
        })
    }

    fn health_check(&self, definition: &ResourceDefinition) -> Result<StepOutcome> {
        let Some(check) = &definition.health_check else {
            return Ok(StepOutcome::NotApplicable);
        };
        let id = definition.id;
        let timeout = self.options.timeouts.control;

        let config =
            PollConfig::new(check.retries, check.interval()).with_timeout(self.options.health_deadline);
        let what = format!("resource {id} health check");
        let callback = LogCallback { what: &what };

        let attempts = poll_until(&config, Some(&callback), || {
            Ok(self.control.exec(id, &check.command, timeout)?.success())
        })
        .map_err(|cause| Error::HealthCheckTimeout { id, cause })?;

        log::debug!("resource {id}: healthy after {attempts} attempt(s)");
        Ok(StepOutcome::AlreadySatisfied)
    }

    /// Template sources get a labelled snapshot; failing to take it is a warning
    fn snapshot(&self, id: ResourceId) -> StepOutcome {
        if !self.catalog.is_template_source(id) {
            return StepOutcome::NotApplicable;
        }
        let label = &self.options.snapshot_label;
        let timeout = self.options.timeouts.control;

        let result = self.control.has_snapshot(id, label, timeout).and_then(|present| {
            if present {
                Ok(false)
            } else {
                self.control.snapshot(id, label, timeout).map(|()| true)
            }
        });

        match result {
            Ok(false) => StepOutcome::AlreadySatisfied,
            Ok(true) => StepOutcome::Applied {
                detail: Some(label.clone()),
            },
            Err(e) => {
                let message = format!("snapshot `{label}` of {id} failed: {e:#}");
                log::warn!("{message}");
                StepOutcome::Warning { message }
            }
        }
    }
}
