//! Feature registry - maps feature names to handlers
//!
//! Feature names in the resource document select a handler from this
//! registry. Names without a handler are rejected when the catalog is
//! validated, never at apply time.

use crate::context::{ControlPlane, FeatureEffect, FeatureRunner};
use anyhow::Result;
use catalog::{FeatureSpec, ResourceId};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// A feature implementation
pub trait FeatureHandler: Send + Sync {
    /// Name the handler is registered under
    fn name(&self) -> &str;

    /// Observe whether the feature is present on this resource
    fn is_present(
        &self,
        control: &dyn ControlPlane,
        id: ResourceId,
        feature: &FeatureSpec,
        timeout: Duration,
    ) -> Result<bool>;

    /// Apply the feature
    fn apply(
        &self,
        control: &dyn ControlPlane,
        id: ResourceId,
        feature: &FeatureSpec,
        timeout: Duration,
    ) -> Result<FeatureEffect>;
}

/// Registry of handlers, acting as the engine's [`FeatureRunner`]
pub struct FeatureRegistry {
    control: Arc<dyn ControlPlane>,
    handlers: BTreeMap<String, Box<dyn FeatureHandler>>,
}

impl FeatureRegistry {
    pub fn new(control: Arc<dyn ControlPlane>) -> Self {
        Self {
            control,
            handlers: BTreeMap::new(),
        }
    }

    /// Register a handler, replacing any previous one with the same name
    pub fn register(&mut self, handler: Box<dyn FeatureHandler>) {
        let name = handler.name().to_string();
        if self.handlers.insert(name.clone(), handler).is_some() {
            log::warn!("feature handler `{name}` registered twice, keeping the last one");
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    fn handler(&self, name: &str) -> Result<&dyn FeatureHandler> {
        self.handlers
            .get(name)
            .map(|h| &**h)
            .ok_or_else(|| anyhow::anyhow!("no handler registered for feature `{name}`"))
    }
}

impl FeatureRunner for FeatureRegistry {
    fn knows(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    fn has_feature(&self, id: ResourceId, feature: &FeatureSpec, timeout: Duration) -> Result<bool> {
        self.handler(&feature.name)?
            .is_present(self.control.as_ref(), id, feature, timeout)
    }

    fn apply_feature(
        &self,
        id: ResourceId,
        feature: &FeatureSpec,
        timeout: Duration,
    ) -> Result<FeatureEffect> {
        self.handler(&feature.name)?
            .apply(self.control.as_ref(), id, feature, timeout)
    }
}
