//! Core library for fleetguard.
//!
//! Three independent pieces, composed by callers (or by the [`api::FleetGuard`]
//! facade):
//! - [`rules`]: pure evaluation of vehicle telemetry into severity-tagged findings
//! - [`circuit`]: per-tenant and global circuit breaking in front of the inference service
//! - [`usage`]: write-behind aggregation of per-tenant daily usage counters

pub mod api;
pub mod circuit;
pub mod clock;
pub mod config;
pub mod rules;
pub mod usage;
