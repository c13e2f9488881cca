//! Hub health aggregation.
//!
//! Collects degradation signals from the rest of the hub (corrupted tables,
//! queue pressure, unresponsive agents, budget exhaustion) into one overall
//! level plus concrete remediation actions. The hub FSM's healing state
//! executes the actions and records the outcome in the healing history.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::constants::FSM_HISTORY_LIMIT;
use crate::models::now_ms;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RemediationAction {
    /// Re-verify a table that recovered in degraded (empty) mode.
    VerifyTable { table: String },
    /// Drop advisory unresponsive flags so flagged agents are trusted again.
    ClearUnresponsiveFlags,
    /// Ask the store coordinator for an immediate backup pass.
    BackupNow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub level: HealthLevel,
    pub reasons: Vec<String>,
    pub actions: Vec<RemediationAction>,
    pub generated_at: i64,
}

/// One completed healing cycle, kept for `GET /healing-history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingRecord {
    pub reason: String,
    pub actions_taken: Vec<RemediationAction>,
    pub succeeded: bool,
    pub started_at: i64,
    pub finished_at: i64,
}

/// Inputs the aggregator folds into a report; the hub snapshots these from
/// the owning components.
#[derive(Debug, Clone, Default)]
pub struct HealthInputs {
    pub queued_tasks: usize,
    pub max_queue_size: usize,
    pub connected_agents: usize,
    pub unresponsive_agents: usize,
    pub budget_exhausted_states: Vec<String>,
}

#[derive(Default)]
pub struct HealthAggregator {
    degraded_tables: Mutex<HashSet<String>>,
    critical_reasons: Mutex<Vec<String>>,
    healing_history: Mutex<Vec<HealingRecord>>,
}

impl HealthAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table is running empty after an unrecoverable corruption.
    pub async fn mark_degraded(&self, table: &str) {
        let mut tables = self.degraded_tables.lock().await;
        tables.insert(table.to_string());
    }

    pub async fn clear_degraded(&self, table: &str) {
        let mut tables = self.degraded_tables.lock().await;
        tables.remove(table);
    }

    pub async fn raise_critical(&self, reason: &str) {
        let mut reasons = self.critical_reasons.lock().await;
        reasons.push(reason.to_string());
    }

    pub async fn clear_critical(&self) {
        let mut reasons = self.critical_reasons.lock().await;
        reasons.clear();
    }

    pub async fn assess(&self, inputs: &HealthInputs) -> HealthReport {
        let mut reasons = Vec::new();
        let mut actions = Vec::new();
        let mut level = HealthLevel::Healthy;

        {
            let tables = self.degraded_tables.lock().await;
            for table in tables.iter() {
                level = HealthLevel::Critical;
                reasons.push(format!("table {table} running degraded"));
                actions.push(RemediationAction::VerifyTable {
                    table: table.clone(),
                });
            }
        }
        {
            let critical = self.critical_reasons.lock().await;
            for reason in critical.iter() {
                level = HealthLevel::Critical;
                reasons.push(reason.clone());
            }
            if !critical.is_empty() {
                actions.push(RemediationAction::BackupNow);
            }
        }

        if level == HealthLevel::Healthy {
            if inputs.max_queue_size > 0
                && inputs.queued_tasks * 10 >= inputs.max_queue_size * 8
            {
                level = HealthLevel::Degraded;
                reasons.push(format!(
                    "queue at {}/{} capacity",
                    inputs.queued_tasks, inputs.max_queue_size
                ));
            }
            if inputs.unresponsive_agents > 0 {
                level = HealthLevel::Degraded;
                reasons.push(format!(
                    "{} unresponsive agents connected",
                    inputs.unresponsive_agents
                ));
                actions.push(RemediationAction::ClearUnresponsiveFlags);
            }
            if !inputs.budget_exhausted_states.is_empty() {
                level = HealthLevel::Degraded;
                reasons.push(format!(
                    "budget exhausted for {:?}",
                    inputs.budget_exhausted_states
                ));
            }
        }

        HealthReport {
            level,
            reasons,
            actions,
            generated_at: now_ms(),
        }
    }

    pub async fn record_healing(&self, record: HealingRecord) {
        let mut history = self.healing_history.lock().await;
        history.push(record);
        let overflow = history.len().saturating_sub(FSM_HISTORY_LIMIT);
        if overflow > 0 {
            history.drain(..overflow);
        }
    }

    pub async fn healing_history(&self) -> Vec<HealingRecord> {
        self.healing_history.lock().await.clone()
    }
}
