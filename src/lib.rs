//! fleetguard service: status API over the `fleetguard-core` facade.

pub mod web;
