//! Durable small-record store.
//!
//! A set of named tables, each persisted to its own file under the data
//! directory and owned by exactly one component. The [`Store`] hands out
//! typed table handles at startup; the [`StoreCoordinator`] then drives
//! backups, compaction, and corruption recovery for all of them.

mod backup;
mod table;

pub use backup::{ManagedTable, RecoveryRecord, StoreCoordinator};
pub use table::{CorruptionSignal, Table};

use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::mpsc;

use crate::config::StoreConfig;
use crate::events::EventBus;
use crate::Result;

/// Factory for table handles plus the shared corruption channel.
pub struct Store {
    config: StoreConfig,
    corruption_tx: mpsc::UnboundedSender<CorruptionSignal>,
    corruption_rx: Option<mpsc::UnboundedReceiver<CorruptionSignal>>,
    managed: Vec<Arc<dyn ManagedTable>>,
}

impl Store {
    pub fn open(config: StoreConfig) -> Self {
        let (corruption_tx, corruption_rx) = mpsc::unbounded_channel();
        Self {
            config,
            corruption_tx,
            corruption_rx: Some(corruption_rx),
            managed: Vec::new(),
        }
    }

    /// Opens (or creates) the named table and registers it for maintenance.
    pub fn table<V>(&mut self, name: &str) -> Result<Arc<Table<V>>>
    where
        V: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let eventual = self.config.sync_interval_ms > 0;
        let table = Arc::new(Table::open(
            name,
            &self.config.data_dir,
            eventual,
            self.corruption_tx.clone(),
        )?);
        self.managed.push(table.clone() as Arc<dyn ManagedTable>);
        Ok(table)
    }

    /// Consumes the registration state and returns the maintenance
    /// coordinator. Call after every table has been opened.
    pub fn into_coordinator(mut self, bus: EventBus) -> StoreCoordinator {
        let rx = self
            .corruption_rx
            .take()
            .expect("into_coordinator called twice");
        StoreCoordinator::new(self.managed, self.config, bus, rx)
    }
}
