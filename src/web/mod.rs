//! Read-only status API
//!
//! Exposes health, circuit, and usage status as JSON, plus a stateless
//! snapshot evaluation endpoint.

mod api;
mod server;

pub use server::{router, WebServer};
