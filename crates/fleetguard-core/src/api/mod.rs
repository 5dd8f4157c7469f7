//! Public API layer (Facade) for fleetguard-core.
//!
//! This module provides [`FleetGuard`], a high-level entry point that owns
//! one rule evaluator, one circuit registry, and one usage aggregator, and
//! exposes typed query/action methods over them.
//!
//! # Quick Start
//!
//! ```ignore
//! use fleetguard_core::api::FleetGuardBuilder;
//!
//! let guard = FleetGuardBuilder::new(settings).open()?;
//! guard.start();
//!
//! let explanation = guard
//!     .run_explanation("acme", &snapshot, |assessment| client.explain(assessment))
//!     .await?;
//!
//! let mut rx = guard.subscribe();
//! guard.shutdown().await;
//! ```

mod actions;
mod builder;
mod core;
pub mod events;
mod queries;
pub mod types;

pub use builder::{open_configured_store, FleetGuardBuilder};
pub use core::FleetGuard;
pub use events::GuardEvent;
pub use types::{
    Assessment, Explanation, GuardError, HealthReport, HealthState, InferenceError,
    InferenceOutcome,
};
