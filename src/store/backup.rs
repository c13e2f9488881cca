//! Store maintenance coordinator.
//!
//! One background task drives, for every registered table: periodic
//! durability barriers, serial timestamped backups with retention pruning,
//! fragmentation-gated compaction, and the corruption-recovery sequence.
//! All maintenance is serial per table; no two tables are ever backed up or
//! recovered concurrently.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::config::StoreConfig;
use crate::events::{EventBus, HubEvent};
use crate::models::now_ms;
use crate::store::table::CorruptionSignal;
use crate::Result;

/// Maintenance surface every table exposes to the coordinator, independent
/// of the record type it stores.
#[async_trait]
pub trait ManagedTable: Send + Sync {
    fn table_name(&self) -> &str;
    async fn sync(&self) -> Result<()>;
    async fn backup_to(&self, dest: &Path) -> Result<u64>;
    async fn fragmentation(&self) -> f64;
    async fn compact(&self) -> Result<bool>;
    async fn close(&self);
    async fn reopen(&self) -> Result<()>;
    async fn restore_from(&self, src: &Path) -> Result<()>;
    async fn reset_empty(&self) -> Result<()>;
    async fn verify(&self) -> Result<usize>;
}

#[async_trait]
impl<V> ManagedTable for super::table::Table<V>
where
    V: serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
{
    fn table_name(&self) -> &str {
        self.name()
    }
    async fn sync(&self) -> Result<()> {
        self.sync().await
    }
    async fn backup_to(&self, dest: &Path) -> Result<u64> {
        self.backup_to(dest).await
    }
    async fn fragmentation(&self) -> f64 {
        self.fragmentation().await
    }
    async fn compact(&self) -> Result<bool> {
        self.compact().await
    }
    async fn close(&self) {
        self.close().await
    }
    async fn reopen(&self) -> Result<()> {
        self.reopen().await
    }
    async fn restore_from(&self, src: &Path) -> Result<()> {
        self.restore_from(src).await
    }
    async fn reset_empty(&self) -> Result<()> {
        self.reset_empty().await
    }
    async fn verify(&self) -> Result<usize> {
        self.verify().await
    }
}

/// Outcome of one recovery attempt, recorded for the healing history.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RecoveryRecord {
    pub table: String,
    pub reason: String,
    pub restored_from_backup: bool,
    pub records_after: usize,
    pub degraded: bool,
    pub timestamp: i64,
}

pub struct StoreCoordinator {
    tables: Vec<Arc<dyn ManagedTable>>,
    config: StoreConfig,
    bus: EventBus,
    corruption_rx: Mutex<mpsc::UnboundedReceiver<CorruptionSignal>>,
    recoveries: Mutex<Vec<RecoveryRecord>>,
}

impl StoreCoordinator {
    pub fn new(
        tables: Vec<Arc<dyn ManagedTable>>,
        config: StoreConfig,
        bus: EventBus,
        corruption_rx: mpsc::UnboundedReceiver<CorruptionSignal>,
    ) -> Self {
        Self {
            tables,
            config,
            bus,
            corruption_rx: Mutex::new(corruption_rx),
            recoveries: Mutex::new(Vec::new()),
        }
    }

    /// Maintenance loop; runs until the process exits.
    pub async fn run(self: Arc<Self>) {
        info!(
            tables = self.tables.len(),
            backup_interval_ms = self.config.backup_interval_ms,
            compaction_interval_ms = self.config.compaction_interval_ms,
            "store coordinator started"
        );

        let mut backup_tick =
            tokio::time::interval(std::time::Duration::from_millis(self.config.backup_interval_ms));
        let mut compaction_tick = tokio::time::interval(std::time::Duration::from_millis(
            self.config.compaction_interval_ms,
        ));
        let mut sync_tick = tokio::time::interval(std::time::Duration::from_millis(
            self.config.sync_interval_ms.max(1_000),
        ));
        // The immediate first tick of each interval would back up / compact
        // on startup; skip it.
        backup_tick.tick().await;
        compaction_tick.tick().await;
        sync_tick.tick().await;

        loop {
            let signal = {
                let mut rx = self.corruption_rx.lock().await;
                tokio::select! {
                    signal = rx.recv() => signal,
                    _ = backup_tick.tick() => {
                        drop(rx);
                        self.run_backups().await;
                        continue;
                    }
                    _ = compaction_tick.tick() => {
                        drop(rx);
                        self.run_compactions().await;
                        continue;
                    }
                    _ = sync_tick.tick() => {
                        drop(rx);
                        self.run_sync_barrier().await;
                        continue;
                    }
                }
            };

            match signal {
                Some(signal) => self.recover_table(signal).await,
                None => {
                    warn!("corruption channel closed; store coordinator exiting");
                    return;
                }
            }
        }
    }

    /// Periodic durability barrier across all tables.
    async fn run_sync_barrier(&self) {
        for table in &self.tables {
            if let Err(e) = table.sync().await {
                warn!(table = table.table_name(), "sync barrier failed: {e}");
            }
        }
    }

    /// Backs up every table, serially. A failed backup is logged and
    /// retried on the next tick.
    pub async fn run_backups(&self) {
        for table in &self.tables {
            let name = table.table_name().to_string();
            match self.backup_one(table.as_ref()).await {
                Ok(path) => info!(table = %name, path = %path.display(), "backup complete"),
                Err(e) => warn!(table = %name, "backup failed, will retry next tick: {e}"),
            }
            self.prune_backups(&name);
        }
    }

    async fn backup_one(&self, table: &dyn ManagedTable) -> Result<PathBuf> {
        let dest = self
            .config
            .backup_dir
            .join(format!("{}.{}.redb.bak", table.table_name(), now_ms()));
        table.backup_to(&dest).await?;
        Ok(dest)
    }

    /// Keeps the newest `backup_retention` backups per table.
    fn prune_backups(&self, table: &str) {
        let mut backups = self.list_backups(table);
        while backups.len() > self.config.backup_retention {
            // list_backups returns newest first
            if let Some(oldest) = backups.pop() {
                if let Err(e) = std::fs::remove_file(&oldest) {
                    warn!(path = %oldest.display(), "failed to prune backup: {e}");
                }
            }
        }
    }

    /// Backup files for `table`, newest first.
    fn list_backups(&self, table: &str) -> Vec<PathBuf> {
        let prefix = format!("{table}.");
        let mut backups: Vec<PathBuf> = std::fs::read_dir(&self.config.backup_dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| {
                        p.file_name()
                            .and_then(|n| n.to_str())
                            .map(|n| n.starts_with(&prefix) && n.ends_with(".redb.bak"))
                            .unwrap_or(false)
                    })
                    .collect()
            })
            .unwrap_or_default();
        backups.sort();
        backups.reverse();
        backups
    }

    /// Compacts each table whose fragmentation estimate clears the
    /// threshold. A failed compaction is retried once, then deferred to the
    /// next cycle.
    pub async fn run_compactions(&self) {
        for table in &self.tables {
            let frag = table.fragmentation().await;
            if frag < self.config.compaction_threshold {
                continue;
            }
            let name = table.table_name().to_string();
            match table.compact().await {
                Ok(changed) => info!(table = %name, frag, changed, "compaction complete"),
                Err(first) => {
                    warn!(table = %name, "compaction failed, retrying once: {first}");
                    if let Err(second) = table.compact().await {
                        warn!(table = %name, "compaction retry failed, deferring: {second}");
                    }
                }
            }
        }
    }

    /// Recovery sequence for one corrupted table: close, restore the newest
    /// backup, reopen, verify. Falls back to an empty table plus a critical
    /// health signal if no backup restores cleanly. Serial per table.
    async fn recover_table(&self, signal: CorruptionSignal) {
        let Some(table) = self
            .tables
            .iter()
            .find(|t| t.table_name() == signal.table)
            .cloned()
        else {
            warn!(table = %signal.table, "corruption signal for unknown table");
            return;
        };

        error!(table = %signal.table, reason = %signal.reason, "starting table recovery");
        self.bus.publish(HubEvent::CorruptionDetected {
            table: signal.table.clone(),
            reason: signal.reason.clone(),
        });

        table.close().await;

        let mut restored = false;
        for backup in self.list_backups(&signal.table) {
            if table.restore_from(&backup).await.is_err() {
                continue;
            }
            if table.reopen().await.is_err() {
                table.close().await;
                continue;
            }
            match table.verify().await {
                Ok(count) => {
                    info!(
                        table = %signal.table,
                        backup = %backup.display(),
                        records = count,
                        "recovered from backup"
                    );
                    self.record_recovery(&signal, true, count, false).await;
                    restored = true;
                    break;
                }
                Err(e) => {
                    warn!(backup = %backup.display(), "backup failed verification: {e}");
                    table.close().await;
                }
            }
        }

        if !restored {
            // Degraded mode: no valid backup, run empty.
            if let Err(e) = table.reset_empty().await {
                error!(table = %signal.table, "failed to reset table empty: {e}");
            }
            error!(table = %signal.table, "no valid backup, running degraded with empty table");
            self.record_recovery(&signal, false, 0, true).await;
            self.bus.publish(HubEvent::TableDegraded {
                table: signal.table.clone(),
            });
            self.bus.publish(HubEvent::HealthCritical {
                reason: format!("table {} unrecoverable, degraded mode", signal.table),
            });
        }
    }

    async fn record_recovery(
        &self,
        signal: &CorruptionSignal,
        restored: bool,
        records: usize,
        degraded: bool,
    ) {
        let mut recoveries = self.recoveries.lock().await;
        recoveries.push(RecoveryRecord {
            table: signal.table.clone(),
            reason: signal.reason.clone(),
            restored_from_backup: restored,
            records_after: records,
            degraded,
            timestamp: now_ms(),
        });
    }

    pub async fn recovery_history(&self) -> Vec<RecoveryRecord> {
        self.recoveries.lock().await.clone()
    }

    /// Exposed for tests and the healing state: run one recovery pass now.
    pub async fn recover_now(&self, table: &str, reason: &str) {
        self.recover_table(CorruptionSignal {
            table: table.to_string(),
            reason: reason.to_string(),
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::table::Table;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Record {
        n: u32,
    }

    struct Fixture {
        coordinator: Arc<StoreCoordinator>,
        table: Arc<Table<Record>>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_testing(dir.path()).store;
        let (tx, rx) = mpsc::unbounded_channel();
        let table: Arc<Table<Record>> =
            Arc::new(Table::open("tasks", &config.data_dir, false, tx).unwrap());
        let coordinator = Arc::new(StoreCoordinator::new(
            vec![table.clone() as Arc<dyn ManagedTable>],
            config,
            EventBus::new(),
            rx,
        ));
        Fixture {
            coordinator,
            table,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn backup_then_recovery_restores_records() {
        let f = fixture();
        for i in 0..10 {
            f.table
                .insert(&format!("t{i}"), &Record { n: i })
                .await
                .unwrap();
        }

        f.coordinator.run_backups().await;

        // Clobber live state, then recover from the backup.
        f.table.reset_empty().await.unwrap();
        assert_eq!(f.table.count().await.unwrap(), 0);

        f.coordinator.recover_now("tasks", "test corruption").await;

        assert_eq!(f.table.count().await.unwrap(), 10);
        assert_eq!(f.table.lookup("t3").await, Some(Record { n: 3 }));

        // Table accepts new writes after recovery.
        f.table.insert("t10", &Record { n: 10 }).await.unwrap();
        assert_eq!(f.table.count().await.unwrap(), 11);

        let history = f.coordinator.recovery_history().await;
        assert_eq!(history.len(), 1);
        assert!(history[0].restored_from_backup);
        assert!(!history[0].degraded);
    }

    #[tokio::test]
    async fn recovery_without_backup_goes_degraded() {
        let f = fixture();
        f.table.insert("t0", &Record { n: 0 }).await.unwrap();

        f.coordinator.recover_now("tasks", "no backups exist").await;

        let history = f.coordinator.recovery_history().await;
        assert_eq!(history.len(), 1);
        assert!(history[0].degraded);
        assert_eq!(f.table.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn retention_prunes_old_backups() {
        let f = fixture();
        f.table.insert("k", &Record { n: 1 }).await.unwrap();

        for _ in 0..5 {
            f.coordinator.run_backups().await;
            // Distinct timestamps for distinct backup names.
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let backups = f.coordinator.list_backups("tasks");
        assert!(backups.len() <= 3, "expected retention of 3, got {}", backups.len());
    }
}
