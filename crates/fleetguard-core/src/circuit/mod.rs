//! Circuit breakers gating calls to the inference service.
//!
//! Each tenant has its own circuit and every tenant also shares one global
//! circuit. Failure reports drive the state machine; `check` reads it.

mod registry;
pub mod types;

pub use registry::CircuitBreakerRegistry;
pub use types::{
    CircuitDecision, CircuitOpenError, CircuitPhase, CircuitScope, CircuitSnapshot, CircuitState,
    CircuitStatusReport, CircuitTransition, FailureKind, PhaseLabel,
};
