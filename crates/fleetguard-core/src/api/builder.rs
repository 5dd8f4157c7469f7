//! Builder for constructing a [`FleetGuard`] instance.
//!
//! ```ignore
//! let guard = FleetGuardBuilder::new(settings)
//!     .with_clock(clock)
//!     .with_store(MemoryCounterStore::new())
//!     .build();
//! ```

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::clock::{SharedClock, SystemClock};
use crate::config::{Settings, StoreBackend};
use crate::usage::{CounterBackend, CounterStore, MemoryCounterStore, SqliteCounterStore};

use super::core::FleetGuard;

/// Builder for constructing a [`FleetGuard`] facade instance
pub struct FleetGuardBuilder<S = CounterBackend> {
    settings: Arc<Settings>,
    clock: Option<SharedClock>,
    store: Arc<S>,
    /// Set once a caller supplies the store explicitly
    custom_store: bool,
}

impl FleetGuardBuilder<CounterBackend> {
    /// Create a new builder with the given settings
    pub fn new(settings: Settings) -> Self {
        Self::from_shared_settings(Arc::new(settings))
    }

    /// Create a new builder from already-shared settings
    pub fn from_shared_settings(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            clock: None,
            store: Arc::new(CounterBackend::Memory(MemoryCounterStore::new())),
            custom_store: false,
        }
    }

    /// Build with the store selected by `settings.store`.
    ///
    /// Opens (and creates if needed) the SQLite database unless the memory
    /// backend is configured or a store was supplied explicitly.
    pub fn open(self) -> Result<FleetGuard<CounterBackend>> {
        let store = if self.custom_store {
            self.store
        } else {
            Arc::new(open_configured_store(&self.settings)?)
        };
        let clock = self.clock.unwrap_or_else(SystemClock::shared);
        Ok(FleetGuard::new(self.settings, clock, store))
    }
}

impl<S: CounterStore + 'static> FleetGuardBuilder<S> {
    /// Use a specific clock (defaults to the system clock)
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use a specific counter store instead of the configured backend
    pub fn with_store<T: CounterStore + 'static>(self, store: T) -> FleetGuardBuilder<T> {
        self.with_shared_store(Arc::new(store))
    }

    /// Use an already-shared counter store (e.g. to inspect it in tests)
    pub fn with_shared_store<T: CounterStore + 'static>(
        self,
        store: Arc<T>,
    ) -> FleetGuardBuilder<T> {
        FleetGuardBuilder {
            settings: self.settings,
            clock: self.clock,
            store,
            custom_store: true,
        }
    }

    /// Build the `FleetGuard` instance
    ///
    /// Without an explicit store, usage is kept in memory only.
    pub fn build(self) -> FleetGuard<S> {
        let clock = self.clock.unwrap_or_else(SystemClock::shared);
        FleetGuard::new(self.settings, clock, self.store)
    }
}

/// Open the counter store named by the settings
pub fn open_configured_store(settings: &Settings) -> Result<CounterBackend> {
    match settings.store.backend {
        StoreBackend::Memory => {
            info!("Using in-memory usage counters");
            Ok(CounterBackend::Memory(MemoryCounterStore::new()))
        }
        StoreBackend::Sqlite => {
            let path = settings.store.sqlite_path();
            let store = SqliteCounterStore::open(&path)?;
            info!(path = %path.display(), "Opened usage database");
            Ok(CounterBackend::Sqlite(store))
        }
    }
}
