mod availability;
mod conflict;
mod error;
mod ledger;
mod mutations;
mod queries;

pub use availability::{count_free, free_resources};
pub use error::{EngineError, Lookup};

use std::sync::Arc;

use crate::notify::NotifyHub;
use crate::store::{Catalog, Directory, MemoryStore, Store};

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Reject updates whose new span overlaps another booking on the
    /// target resource. Off by default: updates are applied without an
    /// overlap check.
    pub recheck_overlap_on_update: bool,
}

/// Booking conflict engine.
///
/// Drives the interval tables and the ledger through one store
/// transaction per mutation. Reads the catalog and user directory but
/// never writes them.
pub struct Engine {
    store: Arc<dyn Store>,
    catalog: Arc<dyn Catalog>,
    directory: Arc<dyn Directory>,
    notify: Arc<NotifyHub>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        catalog: Arc<dyn Catalog>,
        directory: Arc<dyn Directory>,
        notify: Arc<NotifyHub>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            catalog,
            directory,
            notify,
            config,
        }
    }

    /// Engine backed entirely by one [`MemoryStore`].
    pub fn with_memory_store(store: Arc<MemoryStore>, notify: Arc<NotifyHub>, config: EngineConfig) -> Self {
        Self::new(store.clone(), store.clone(), store, notify, config)
    }

    /// Hub the engine publishes booking events to after each commit.
    pub fn notify(&self) -> &Arc<NotifyHub> {
        &self.notify
    }
}
