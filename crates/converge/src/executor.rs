//! Execution engine - resolves targets and converges them in order
//!
//! By default resources are converged strictly one after another and the
//! first failure halts the rest of the queue. With `jobs > 1`, weakly
//! connected components of the resolved graph run in parallel on a rayon
//! pool; each component is still sequential and fail-fast.

use crate::context::{ControlPlane, ConvergeObserver, FeatureRunner, NoProgress};
use crate::error::{Error, Result};
use crate::lifecycle::Lifecycle;
use crate::resolver;
use crate::types::{ConvergeReport, EngineOptions, ResourceState};
use catalog::{Catalog, ResourceId};
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// What happened to one resource during a run
#[derive(Debug)]
pub enum ResourceOutcome {
    Converged(ConvergeReport),
    Failed(Error),
    /// Skipped because an earlier resource in the same queue failed
    NotAttempted { blocked_by: ResourceId },
}

impl ResourceOutcome {
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged(_))
    }
}

/// Result of a full run, in resolved order
#[derive(Debug, Default)]
pub struct RunSummary {
    pub order: Vec<ResourceId>,
    pub outcomes: Vec<(ResourceId, ResourceOutcome)>,
}

impl RunSummary {
    /// The first failure in resolved order
    pub fn first_error(&self) -> Option<&Error> {
        self.outcomes.iter().find_map(|(_, outcome)| match outcome {
            ResourceOutcome::Failed(e) => Some(e),
            _ => None,
        })
    }

    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|(_, o)| o.is_converged())
    }

    pub fn converged(&self) -> usize {
        self.count(|o| matches!(o, ResourceOutcome::Converged(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, ResourceOutcome::Failed(_)))
    }

    pub fn not_attempted(&self) -> usize {
        self.count(|o| matches!(o, ResourceOutcome::NotAttempted { .. }))
    }

    /// Total lifecycle steps that took an action
    pub fn changes(&self) -> usize {
        self.outcomes
            .iter()
            .map(|(_, o)| match o {
                ResourceOutcome::Converged(report) => report.changes(),
                _ => 0,
            })
            .sum()
    }

    /// Exit code of the first failure, 0 on success
    pub fn exit_code(&self) -> i32 {
        self.first_error().map_or(0, Error::code)
    }

    fn count(&self, predicate: impl Fn(&ResourceOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| predicate(o)).count()
    }
}

/// One mutex per resource id; a resource is never converged by two
/// workers at once
#[derive(Default)]
pub struct ResourceLocks {
    locks: Mutex<HashMap<ResourceId, Arc<Mutex<()>>>>,
}

impl ResourceLocks {
    pub fn lock_for(&self, id: ResourceId) -> Arc<Mutex<()>> {
        recover(self.locks.lock())
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// A panicking worker must not wedge the whole run
fn recover<T>(result: std::sync::LockResult<MutexGuard<'_, T>>) -> MutexGuard<'_, T> {
    match result {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Resolves and converges resources against a control plane
pub struct Engine<'a> {
    catalog: &'a Catalog,
    control: &'a dyn ControlPlane,
    features: &'a dyn FeatureRunner,
    options: EngineOptions,
    observer: &'a dyn ConvergeObserver,
    locks: ResourceLocks,
}

impl<'a> Engine<'a> {
    pub fn new(
        catalog: &'a Catalog,
        control: &'a dyn ControlPlane,
        features: &'a dyn FeatureRunner,
        options: EngineOptions,
    ) -> Self {
        Self {
            catalog,
            control,
            features,
            options,
            observer: &NoProgress,
            locks: ResourceLocks::default(),
        }
    }

    pub fn with_observer(mut self, observer: &'a dyn ConvergeObserver) -> Self {
        self.observer = observer;
        self
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Reject feature names no handler knows about
    pub fn validate(&self) -> Result<()> {
        self.catalog
            .validate_features(|name| self.features.knows(name))?;
        Ok(())
    }

    /// Resolve targets into a creation order using live existence probes
    pub fn resolve(&self, targets: &[ResourceId]) -> Result<Vec<ResourceId>> {
        let timeout = self.options.timeouts.control;
        resolver::resolve(self.catalog, targets, |id| self.control.exists(id, timeout))
    }

    /// Converge a single resource, ignoring its prerequisites
    pub fn converge(&self, id: ResourceId) -> Result<ConvergeReport> {
        let definition = self.catalog.require(id)?;

        let lock = self.locks.lock_for(id);
        let _guard = recover(lock.lock());

        self.observer.on_resource_start(definition);
        let lifecycle = Lifecycle::new(
            self.catalog,
            self.control,
            self.features,
            &self.options,
            self.observer,
        );
        let result = lifecycle.converge(definition);
        self.observer.on_resource_complete(id, result.as_ref());

        match &result {
            Ok(report) => log::info!("resource {id}: {} ({} changes)", report.state, report.changes()),
            Err(e) => log::error!("resource {id}: {e}"),
        }
        result
    }

    /// Validate, resolve and converge everything `targets` needs.
    ///
    /// Returns `Err` only when the run is rejected before any mutation
    /// (configuration, cycle or probe errors). Per-resource failures are
    /// reported in the summary.
    pub fn run(&self, targets: &[ResourceId]) -> Result<RunSummary> {
        self.validate()?;
        let order = self.resolve(targets)?;
        Ok(self.execute(order))
    }

    /// Converge an already resolved order
    pub fn execute(&self, order: Vec<ResourceId>) -> RunSummary {
        self.observer.on_plan(&order);

        let outcomes = if self.options.jobs <= 1 {
            self.run_queue(&order)
        } else {
            self.run_components(&order)
        };

        RunSummary { order, outcomes }
    }

    /// Read-only lifecycle position of one resource
    pub fn observe(&self, id: ResourceId) -> Result<ResourceState> {
        let definition = self.catalog.require(id)?;
        let lifecycle = Lifecycle::new(
            self.catalog,
            self.control,
            self.features,
            &self.options,
            self.observer,
        );
        lifecycle
            .observe(definition)
            .map_err(|source| Error::Probe {
                id,
                source: source.into(),
            })
    }

    /// Converge in order; after the first failure, nothing else is attempted
    fn run_queue(&self, queue: &[ResourceId]) -> Vec<(ResourceId, ResourceOutcome)> {
        let mut outcomes = Vec::with_capacity(queue.len());
        let mut blocked_by: Option<ResourceId> = None;

        for &id in queue {
            if let Some(failed) = blocked_by {
                outcomes.push((id, ResourceOutcome::NotAttempted { blocked_by: failed }));
                continue;
            }

            match self.converge(id) {
                Ok(report) => outcomes.push((id, ResourceOutcome::Converged(report))),
                Err(e) => {
                    blocked_by = Some(id);
                    outcomes.push((id, ResourceOutcome::Failed(e)));
                }
            }
        }

        outcomes
    }

    fn run_components(&self, order: &[ResourceId]) -> Vec<(ResourceId, ResourceOutcome)> {
        let components = components(self.catalog, order);
        if components.len() <= 1 {
            return self.run_queue(order);
        }

        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.jobs)
            .build()
        {
            Ok(pool) => pool,
            Err(e) => {
                log::warn!("failed to create thread pool ({e}), running sequentially");
                return self.run_queue(order);
            }
        };

        log::debug!(
            "running {} independent subgraphs on {} workers",
            components.len(),
            self.options.jobs
        );

        let mut outcomes: Vec<(ResourceId, ResourceOutcome)> = pool.install(|| {
            components
                .par_iter()
                .flat_map_iter(|component| self.run_queue(component))
                .collect()
        });

        let position: HashMap<ResourceId, usize> =
            order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        outcomes.sort_by_key(|(id, _)| position.get(id).copied().unwrap_or(usize::MAX));
        outcomes
    }
}

/// Split `order` into weakly connected components, keeping resolved order
/// inside each. Prerequisites outside `order` still join their dependents,
/// so two clones of the same source never run concurrently.
fn components(catalog: &Catalog, order: &[ResourceId]) -> Vec<Vec<ResourceId>> {
    let mut parent: HashMap<ResourceId, ResourceId> = HashMap::new();

    fn find(parent: &mut HashMap<ResourceId, ResourceId>, id: ResourceId) -> ResourceId {
        let mut root = id;
        while let Some(&p) = parent.get(&root) {
            if p == root {
                break;
            }
            root = p;
        }
        let mut current = id;
        while current != root {
            let next = parent.get(&current).copied().unwrap_or(root);
            parent.insert(current, root);
            current = next;
        }
        root
    }

    for &id in order {
        parent.entry(id).or_insert(id);
        let prerequisites = catalog
            .get(id)
            .map(|d| d.prerequisites())
            .unwrap_or_default();
        for prerequisite in prerequisites {
            parent.entry(prerequisite).or_insert(prerequisite);
            let a = find(&mut parent, id);
            let b = find(&mut parent, prerequisite);
            if a != b {
                parent.insert(a.max(b), a.min(b));
            }
        }
    }

    let mut groups: Vec<(ResourceId, Vec<ResourceId>)> = Vec::new();
    for &id in order {
        let root = find(&mut parent, id);
        match groups.iter_mut().find(|(r, _)| *r == root) {
            Some((_, members)) => members.push(id),
            None => groups.push((root, vec![id])),
        }
    }
    groups.into_iter().map(|(_, members)| members).collect()
}
