//! # Converge
//!
//! Dependency-aware, idempotent convergence of declared hypervisor resources.
//!
//! ## Core Concepts
//!
//! - **Resolver**: expands target ids into everything they need and orders
//!   it; clone and archive sources that already exist are left alone
//! - **Lifecycle**: drives one resource through
//!   create, configure, start, features, application, health check and
//!   snapshot, skipping every step whose postcondition already holds
//! - **Engine**: runs the resolved order, fail-fast, optionally with
//!   independent subgraphs in parallel
//! - **Poll**: bounded, deadline-aware waiting for asynchronous effects
//!
//! The engine never talks to a hypervisor directly; it drives a
//! [`ControlPlane`] and a [`FeatureRunner`] supplied by the caller.
//!
//! ## Example
//!
//! ```ignore
//! use converge::{Engine, EngineOptions};
//!
//! let catalog = catalog::Catalog::load(resources, None)?;
//! let engine = Engine::new(&catalog, &control, &features, EngineOptions::default());
//!
//! let summary = engine.run(&[1001])?;
//! if let Some(e) = summary.first_error() {
//!     eprintln!("{}: {e}", e.kind());
//!     std::process::exit(e.code());
//! }
//! ```

pub mod context;
pub mod error;
pub mod executor;
pub mod feature;
pub mod lifecycle;
pub mod poll;
pub mod resolver;
pub mod types;

#[cfg(test)]
mod testing;

pub use context::{
    ControlPlane, ConvergeObserver, FeatureEffect, FeatureRunner, NoProgress, Readiness,
};
pub use error::{Error, Result};
pub use executor::{Engine, ResourceLocks, ResourceOutcome, RunSummary};
pub use feature::{FeatureHandler, FeatureRegistry};
pub use lifecycle::{Lifecycle, application_marker};
pub use poll::{Backoff, LogCallback, NoCallback, PollCallback, PollConfig, PollTimeout, poll_until};
pub use resolver::resolve;
pub use types::{
    ConvergeReport, EngineOptions, ExecOutput, LifecycleStep, ResourceState, StepOutcome, Timeouts,
};
