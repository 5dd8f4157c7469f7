//! Guard events for push-based change notification.
//!
//! Components publish on their own channels (`CircuitTransition`,
//! `FlushOutcome`). [`FleetGuard::start`] spawns a bridge that converts
//! those into [`GuardEvent`]s for subscribers.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::circuit::{CircuitScope, CircuitTransition, FailureKind, PhaseLabel};
use crate::usage::{CounterStore, FlushOutcome};

use super::core::FleetGuard;

/// Events emitted when circuits change phase or usage is flushed.
///
/// Consumers call [`FleetGuard::subscribe()`] to receive these events
/// via a `broadcast::Receiver`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardEvent {
    /// A circuit started rejecting calls
    CircuitOpened {
        scope: CircuitScope,
        failures: u32,
        failure_kind: Option<FailureKind>,
    },

    /// An open circuit's timeout elapsed and a probe was admitted
    CircuitHalfOpen { scope: CircuitScope },

    /// A circuit recovered
    CircuitClosed { scope: CircuitScope },

    /// A usage batch reached the counter store
    UsageFlushed { batch_id: String, rows: usize },

    /// A usage batch failed and was re-queued
    UsageFlushFailed {
        batch_id: String,
        rows: usize,
        error: String,
    },
}

impl From<CircuitTransition> for GuardEvent {
    fn from(t: CircuitTransition) -> Self {
        match t.to {
            PhaseLabel::Open => GuardEvent::CircuitOpened {
                scope: t.scope,
                failures: t.failures,
                failure_kind: t.failure_kind,
            },
            PhaseLabel::HalfOpen => GuardEvent::CircuitHalfOpen { scope: t.scope },
            PhaseLabel::Closed => GuardEvent::CircuitClosed { scope: t.scope },
        }
    }
}

impl GuardEvent {
    /// Convert a flush outcome (empty flushes produce no event)
    pub fn from_flush(outcome: FlushOutcome) -> Option<Self> {
        match outcome {
            FlushOutcome::Empty => None,
            FlushOutcome::Flushed { batch_id, rows, .. } => {
                Some(GuardEvent::UsageFlushed { batch_id, rows })
            }
            FlushOutcome::Failed {
                batch_id,
                rows,
                error,
            } => Some(GuardEvent::UsageFlushFailed {
                batch_id,
                rows,
                error,
            }),
        }
    }
}

impl<S: CounterStore + 'static> FleetGuard<S> {
    /// Subscribe to guard events.
    ///
    /// Returns a broadcast receiver that will receive [`GuardEvent`]s once
    /// [`start`](FleetGuard::start) has run. If the receiver falls behind,
    /// older events are dropped (lagged).
    pub fn subscribe(&self) -> broadcast::Receiver<GuardEvent> {
        self.event_sender().subscribe()
    }

    /// Forward component events to guard subscribers until a source closes
    /// or shutdown is signalled
    pub(crate) fn spawn_event_bridge(&self) -> JoinHandle<()> {
        let tx = self.event_sender();
        let mut circuits = self.circuit_events();
        let mut flushes = self.flush_events();
        let mut shutdown = self.shutdown_signal().subscribe();

        tokio::spawn(async move {
            loop {
                // Drain queued events before honouring shutdown
                let event = tokio::select! {
                    biased;
                    t = circuits.recv() => match t {
                        Ok(t) => Some(GuardEvent::from(t)),
                        Err(RecvError::Lagged(n)) => {
                            debug!("Event bridge lagged by {} circuit transitions", n);
                            None
                        }
                        Err(RecvError::Closed) => break,
                    },
                    o = flushes.recv() => match o {
                        Ok(o) => GuardEvent::from_flush(o),
                        Err(RecvError::Lagged(n)) => {
                            debug!("Event bridge lagged by {} flush outcomes", n);
                            None
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => break,
                };
                if let Some(event) = event {
                    // Ignored if no subscribers are listening
                    let _ = tx.send(event);
                }
            }
            debug!("Event bridge stopped");
        })
    }
}
