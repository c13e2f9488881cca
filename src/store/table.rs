//! Typed crash-safe key-value table backed by redb.
//!
//! One table = one redb database file under the data directory. Values are
//! serialized with serde_json; keys are strings. All access is serialized
//! through an async mutex, so the table behaves as a serial actor: one
//! operation at a time, callers suspend until their operation completes.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use redb::{
    Database, Durability, ReadableTable, ReadableTableMetadata, TableDefinition, TableError,
};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, warn};

use crate::{HubError, Result};

/// Every table file holds a single record tree under this definition.
const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("records");

/// Emitted by a table when a hot-path operation hits a storage error.
/// The store coordinator consumes these and drives recovery.
#[derive(Debug, Clone)]
pub struct CorruptionSignal {
    pub table: String,
    pub reason: String,
}

/// A typed table handle. `V` is the record type stored under string keys.
pub struct Table<V> {
    name: String,
    path: PathBuf,
    db: Mutex<Option<Database>>,
    /// Commits are durable immediately when false; otherwise commits are
    /// eventual and the coordinator issues periodic sync barriers.
    eventual_durability: bool,
    corruption_tx: mpsc::UnboundedSender<CorruptionSignal>,
    _marker: PhantomData<V>,
}

impl<V> Table<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn open(
        name: &str,
        data_dir: &Path,
        eventual_durability: bool,
        corruption_tx: mpsc::UnboundedSender<CorruptionSignal>,
    ) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(format!("{name}.redb"));
        let db = Database::create(&path).map_err(|e| HubError::Store {
            table: name.to_string(),
            message: format!("failed to open {}: {e}", path.display()),
        })?;
        Ok(Self {
            name: name.to_string(),
            path,
            db: Mutex::new(Some(db)),
            eventual_durability,
            corruption_tx,
            _marker: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_path(&self) -> &Path {
        &self.path
    }

    fn signal_corruption(&self, reason: String) {
        error!(table = %self.name, %reason, "table corruption detected");
        let _ = self.corruption_tx.send(CorruptionSignal {
            table: self.name.clone(),
            reason,
        });
    }

    fn write_err(&self, context: &str, e: impl std::fmt::Display) -> HubError {
        self.signal_corruption(format!("{context}: {e}"));
        HubError::TableCorrupted(self.name.clone())
    }

    /// Inserts or replaces a record. Write errors surface as
    /// [`HubError::TableCorrupted`] after signalling the coordinator.
    pub async fn insert(&self, key: &str, value: &V) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        let guard = self.db.lock().await;
        let db = guard
            .as_ref()
            .ok_or_else(|| HubError::TableCorrupted(self.name.clone()))?;

        let mut txn = db
            .begin_write()
            .map_err(|e| self.write_err("begin_write", e))?;
        if self.eventual_durability {
            txn.set_durability(Durability::Eventual);
        }
        {
            let mut table = txn
                .open_table(RECORDS)
                .map_err(|e| self.write_err("open_table", e))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(|e| self.write_err("insert", e))?;
        }
        txn.commit().map_err(|e| self.write_err("commit", e))?;
        Ok(())
    }

    /// Reads a record. Read errors degrade to `None` so callers keep
    /// working while the coordinator recovers the table.
    pub async fn lookup(&self, key: &str) -> Option<V> {
        let guard = self.db.lock().await;
        let db = guard.as_ref()?;

        let txn = match db.begin_read() {
            Ok(txn) => txn,
            Err(e) => {
                self.signal_corruption(format!("begin_read: {e}"));
                return None;
            }
        };
        let table = match txn.open_table(RECORDS) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return None,
            Err(e) => {
                self.signal_corruption(format!("open_table: {e}"));
                return None;
            }
        };
        match table.get(key) {
            Ok(Some(bytes)) => match serde_json::from_slice(bytes.value()) {
                Ok(value) => Some(value),
                Err(e) => {
                    self.signal_corruption(format!("decode {key}: {e}"));
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                self.signal_corruption(format!("get {key}: {e}"));
                None
            }
        }
    }

    /// Removes a record. Returns whether the key existed.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let guard = self.db.lock().await;
        let db = guard
            .as_ref()
            .ok_or_else(|| HubError::TableCorrupted(self.name.clone()))?;

        let mut txn = db
            .begin_write()
            .map_err(|e| self.write_err("begin_write", e))?;
        if self.eventual_durability {
            txn.set_durability(Durability::Eventual);
        }
        let existed = {
            let mut table = txn
                .open_table(RECORDS)
                .map_err(|e| self.write_err("open_table", e))?;
            let removed = table
                .remove(key)
                .map_err(|e| self.write_err("remove", e))?
                .is_some();
            removed
        };
        txn.commit().map_err(|e| self.write_err("commit", e))?;
        Ok(existed)
    }

    /// Full scan, filtered by the caller. Read errors degrade to an empty
    /// list after signalling the coordinator.
    pub async fn scan(&self) -> Vec<(String, V)> {
        self.scan_prefix("").await
    }

    /// Scan restricted to keys starting with `prefix`.
    pub async fn scan_prefix(&self, prefix: &str) -> Vec<(String, V)> {
        let guard = self.db.lock().await;
        let Some(db) = guard.as_ref() else {
            return Vec::new();
        };

        let txn = match db.begin_read() {
            Ok(txn) => txn,
            Err(e) => {
                self.signal_corruption(format!("begin_read: {e}"));
                return Vec::new();
            }
        };
        let table = match txn.open_table(RECORDS) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Vec::new(),
            Err(e) => {
                self.signal_corruption(format!("open_table: {e}"));
                return Vec::new();
            }
        };
        let iter = match table.iter() {
            Ok(iter) => iter,
            Err(e) => {
                self.signal_corruption(format!("iter: {e}"));
                return Vec::new();
            }
        };

        let mut records = Vec::new();
        for item in iter {
            match item {
                Ok((key, value)) => {
                    let key = key.value().to_string();
                    if !key.starts_with(prefix) {
                        continue;
                    }
                    match serde_json::from_slice(value.value()) {
                        Ok(decoded) => records.push((key, decoded)),
                        Err(e) => {
                            warn!(table = %self.name, %key, "skipping undecodable record: {e}");
                        }
                    }
                }
                Err(e) => {
                    self.signal_corruption(format!("scan: {e}"));
                    return Vec::new();
                }
            }
        }
        records
    }

    /// Number of stored records.
    pub async fn count(&self) -> Result<usize> {
        let guard = self.db.lock().await;
        let db = guard
            .as_ref()
            .ok_or_else(|| HubError::TableCorrupted(self.name.clone()))?;
        let txn = db.begin_read().map_err(|e| HubError::Store {
            table: self.name.clone(),
            message: format!("begin_read: {e}"),
        })?;
        match txn.open_table(RECORDS) {
            Ok(table) => table.len().map(|n| n as usize).map_err(|e| HubError::Store {
                table: self.name.clone(),
                message: format!("len: {e}"),
            }),
            Err(TableError::TableDoesNotExist(_)) => Ok(0),
            Err(e) => Err(HubError::Store {
                table: self.name.clone(),
                message: format!("open_table: {e}"),
            }),
        }
    }

    /// Durability barrier: everything committed so far is on disk when this
    /// returns.
    pub async fn sync(&self) -> Result<()> {
        let guard = self.db.lock().await;
        let db = guard
            .as_ref()
            .ok_or_else(|| HubError::TableCorrupted(self.name.clone()))?;
        let mut txn = db
            .begin_write()
            .map_err(|e| self.write_err("begin_write", e))?;
        txn.set_durability(Durability::Immediate);
        txn.commit().map_err(|e| self.write_err("sync commit", e))?;
        Ok(())
    }

    /// Fragmentation ratio in `[0, 1]`; the coordinator skips compaction
    /// below the configured threshold.
    pub async fn fragmentation(&self) -> f64 {
        let guard = self.db.lock().await;
        let Some(db) = guard.as_ref() else {
            return 0.0;
        };
        let Ok(txn) = db.begin_write() else {
            return 0.0;
        };
        let ratio = match txn.stats() {
            Ok(stats) => {
                let live = stats.stored_bytes() + stats.metadata_bytes();
                let fragmented = stats.fragmented_bytes();
                if live + fragmented == 0 {
                    0.0
                } else {
                    fragmented as f64 / (live + fragmented) as f64
                }
            }
            Err(_) => 0.0,
        };
        let _ = txn.abort();
        ratio
    }

    /// Rewrites the file contiguously. Returns whether anything changed.
    pub async fn compact(&self) -> Result<bool> {
        let mut guard = self.db.lock().await;
        let db = guard
            .as_mut()
            .ok_or_else(|| HubError::TableCorrupted(self.name.clone()))?;
        db.compact().map_err(|e| HubError::Store {
            table: self.name.clone(),
            message: format!("compact: {e}"),
        })
    }

    /// Closes the table; subsequent operations fail until [`reopen`].
    ///
    /// [`reopen`]: Table::reopen
    pub async fn close(&self) {
        let mut guard = self.db.lock().await;
        *guard = None;
    }

    /// Reopens the table file, running redb's repair pass if the file was
    /// left unclean.
    pub async fn reopen(&self) -> Result<()> {
        let mut guard = self.db.lock().await;
        let db = Database::create(&self.path).map_err(|e| HubError::Store {
            table: self.name.clone(),
            message: format!("reopen: {e}"),
        })?;
        *guard = Some(db);
        Ok(())
    }

    /// Copies the table file to `dest` while holding the table lock, after
    /// a durability barrier, so the copy is a consistent snapshot.
    pub async fn backup_to(&self, dest: &Path) -> Result<u64> {
        let guard = self.db.lock().await;
        let db = guard
            .as_ref()
            .ok_or_else(|| HubError::TableCorrupted(self.name.clone()))?;
        let mut txn = db.begin_write().map_err(|e| HubError::Store {
            table: self.name.clone(),
            message: format!("begin_write: {e}"),
        })?;
        txn.set_durability(Durability::Immediate);
        txn.commit().map_err(|e| HubError::Store {
            table: self.name.clone(),
            message: format!("sync commit: {e}"),
        })?;

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = std::fs::copy(&self.path, dest)?;
        Ok(bytes)
    }

    /// Replaces the table file from a backup. The table must be closed.
    pub async fn restore_from(&self, src: &Path) -> Result<()> {
        let guard = self.db.lock().await;
        if guard.is_some() {
            return Err(HubError::Store {
                table: self.name.clone(),
                message: "restore requires a closed table".to_string(),
            });
        }
        std::fs::copy(src, &self.path)?;
        Ok(())
    }

    /// Discards the table file entirely and reopens empty (degraded mode).
    pub async fn reset_empty(&self) -> Result<()> {
        let mut guard = self.db.lock().await;
        *guard = None;
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        let db = Database::create(&self.path).map_err(|e| HubError::Store {
            table: self.name.clone(),
            message: format!("reset: {e}"),
        })?;
        *guard = Some(db);
        Ok(())
    }

    /// Recovery verification: record count plus a full decode traversal.
    pub async fn verify(&self) -> Result<usize> {
        let expected = self.count().await?;
        let scanned = self.scan().await.len();
        if scanned < expected {
            return Err(HubError::Store {
                table: self.name.clone(),
                message: format!("verify: {scanned} of {expected} records decodable"),
            });
        }
        Ok(scanned)
    }
}
