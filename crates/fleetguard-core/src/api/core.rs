//! FleetGuard: the facade owning one of each component.
//!
//! The rule evaluator, circuit registry, and usage aggregator never call
//! each other; this type wires them together for callers that want the
//! composed flow.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::circuit::{CircuitBreakerRegistry, CircuitTransition};
use crate::clock::SharedClock;
use crate::config::Settings;
use crate::rules::RuleEvaluator;
use crate::usage::{CounterBackend, CounterStore, FlushOutcome, UsageAggregator};

use super::events::GuardEvent;

/// Default broadcast channel capacity
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Background tasks spawned by `start`
#[derive(Default)]
pub(crate) struct Tasks {
    pub(crate) handles: Vec<JoinHandle<()>>,
    pub(crate) started: bool,
}

/// The facade over rule evaluation, circuit breaking, and usage aggregation.
///
/// Constructed via [`FleetGuardBuilder`](super::builder::FleetGuardBuilder).
pub struct FleetGuard<S: CounterStore + 'static = CounterBackend> {
    settings: Arc<Settings>,
    clock: SharedClock,
    evaluator: RuleEvaluator,
    circuits: Arc<CircuitBreakerRegistry>,
    usage: Arc<UsageAggregator<S>>,
    event_tx: broadcast::Sender<GuardEvent>,
    circuit_tx: broadcast::Sender<CircuitTransition>,
    flush_tx: broadcast::Sender<FlushOutcome>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Tasks>,
}

impl<S: CounterStore + 'static> FleetGuard<S> {
    /// Create a new instance (prefer `FleetGuardBuilder`)
    pub(crate) fn new(settings: Arc<Settings>, clock: SharedClock, store: Arc<S>) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (circuit_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (flush_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);

        let evaluator = RuleEvaluator::new(settings.rules.clone());
        let circuits = CircuitBreakerRegistry::new(settings.circuit.clone(), clock.clone())
            .with_events(circuit_tx.clone());
        let usage = UsageAggregator::new(settings.usage.clone(), clock.clone(), store)
            .with_events(flush_tx.clone());

        Self {
            settings,
            clock,
            evaluator,
            circuits: Arc::new(circuits),
            usage: Arc::new(usage),
            event_tx,
            circuit_tx,
            flush_tx,
            shutdown_tx,
            tasks: Mutex::new(Tasks::default()),
        }
    }

    /// Access application settings (read-only)
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The clock shared by every component
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    // =========================================================
    // Component accessors
    // =========================================================

    pub fn evaluator(&self) -> &RuleEvaluator {
        &self.evaluator
    }

    pub fn circuits(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.circuits
    }

    pub fn usage(&self) -> &Arc<UsageAggregator<S>> {
        &self.usage
    }

    // =========================================================
    // Internal accessors for lifecycle/event impls
    // =========================================================

    pub(crate) fn event_sender(&self) -> broadcast::Sender<GuardEvent> {
        self.event_tx.clone()
    }

    pub(crate) fn circuit_events(&self) -> broadcast::Receiver<CircuitTransition> {
        self.circuit_tx.subscribe()
    }

    pub(crate) fn flush_events(&self) -> broadcast::Receiver<FlushOutcome> {
        self.flush_tx.subscribe()
    }

    pub(crate) fn shutdown_signal(&self) -> &watch::Sender<bool> {
        &self.shutdown_tx
    }

    pub(crate) fn tasks(&self) -> &Mutex<Tasks> {
        &self.tasks
    }
}
