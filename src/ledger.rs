//! Cost ledger for external LLM invocations.
//!
//! Thread-safe rolling counters keyed by hub state. Every recorded call
//! carries token counts and a cost estimate; budget checks evict entries
//! that have left the configured window before comparing totals against the
//! per-state limits. The hub FSM consults this before entering any state
//! that may invoke the LLM.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::BudgetConfig;
use crate::models::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetVerdict {
    Ok,
    Exhausted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UsageEntry {
    timestamp: i64,
    input_tokens: u64,
    output_tokens: u64,
    cost_estimate: f64,
}

/// Aggregate over one bucket of time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageTotals {
    pub invocations: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_estimate: f64,
}

impl UsageTotals {
    fn add(&mut self, entry: &UsageEntry) {
        self.invocations += 1;
        self.input_tokens += entry.input_tokens;
        self.output_tokens += entry.output_tokens;
        self.cost_estimate += entry.cost_estimate;
    }
}

/// Hour / day / session rollup per state, plus the session grand total.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub per_state_hour: HashMap<String, UsageTotals>,
    pub per_state_day: HashMap<String, UsageTotals>,
    pub session: UsageTotals,
}

pub struct CostLedger {
    config: BudgetConfig,
    /// Raw entries per state; evicted past the day bucket.
    entries: Mutex<HashMap<String, Vec<UsageEntry>>>,
    session: Mutex<UsageTotals>,
}

const HOUR_MS: i64 = 3_600_000;
const DAY_MS: i64 = 86_400_000;

impl CostLedger {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
            session: Mutex::new(UsageTotals::default()),
        }
    }

    /// Records one external invocation made while the hub was in `state`.
    pub async fn record(
        &self,
        state: &str,
        input_tokens: u64,
        output_tokens: u64,
        cost_estimate: f64,
    ) {
        let entry = UsageEntry {
            timestamp: now_ms(),
            input_tokens,
            output_tokens,
            cost_estimate,
        };
        {
            let mut session = self.session.lock().await;
            session.add(&entry);
        }
        let mut entries = self.entries.lock().await;
        entries.entry(state.to_string()).or_default().push(entry);
        debug!(%state, input_tokens, output_tokens, cost_estimate, "llm invocation recorded");
    }

    /// Budget verdict for `state`. Eviction of expired entries happens on
    /// every check, so the window rolls without a separate timer.
    pub async fn check_budget(&self, state: &str) -> BudgetVerdict {
        let Some(budget) = self.config.per_state.get(state) else {
            // No budget configured means unconstrained.
            return BudgetVerdict::Ok;
        };

        let now = now_ms();
        let mut entries = self.entries.lock().await;
        let state_entries = entries.entry(state.to_string()).or_default();
        state_entries.retain(|e| now - e.timestamp < DAY_MS);

        let window_start = now - budget.window_ms;
        let mut totals = UsageTotals::default();
        for entry in state_entries.iter().filter(|e| e.timestamp >= window_start) {
            totals.add(entry);
        }

        if let Some(max_calls) = budget.max_invocations_per_window {
            if totals.invocations >= max_calls {
                warn!(%state, invocations = totals.invocations, "invocation budget exhausted");
                return BudgetVerdict::Exhausted;
            }
        }
        if let Some(max_cost) = budget.max_cost_per_window {
            if totals.cost_estimate >= max_cost {
                warn!(%state, cost = totals.cost_estimate, "cost budget exhausted");
                return BudgetVerdict::Exhausted;
            }
        }
        BudgetVerdict::Ok
    }

    pub async fn snapshot(&self) -> LedgerSnapshot {
        let now = now_ms();
        let entries = self.entries.lock().await;
        let mut snapshot = LedgerSnapshot {
            session: self.session.lock().await.clone(),
            ..Default::default()
        };

        for (state, state_entries) in entries.iter() {
            let mut hour = UsageTotals::default();
            let mut day = UsageTotals::default();
            for entry in state_entries {
                if now - entry.timestamp < HOUR_MS {
                    hour.add(entry);
                }
                if now - entry.timestamp < DAY_MS {
                    day.add(entry);
                }
            }
            snapshot.per_state_hour.insert(state.clone(), hour);
            snapshot.per_state_day.insert(state.clone(), day);
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StateBudget;

    fn ledger(max_calls: u64, max_cost: f64) -> CostLedger {
        CostLedger::new(BudgetConfig {
            per_state: HashMap::from([(
                "executing".to_string(),
                StateBudget {
                    max_invocations_per_window: Some(max_calls),
                    max_cost_per_window: Some(max_cost),
                    window_ms: 3_600_000,
                },
            )]),
        })
    }

    #[tokio::test]
    async fn budget_exhausts_on_invocation_count() {
        let ledger = ledger(2, 100.0);

        assert_eq!(ledger.check_budget("executing").await, BudgetVerdict::Ok);
        ledger.record("executing", 100, 50, 0.01).await;
        ledger.record("executing", 100, 50, 0.01).await;
        assert_eq!(
            ledger.check_budget("executing").await,
            BudgetVerdict::Exhausted
        );
    }

    #[tokio::test]
    async fn budget_exhausts_on_cost() {
        let ledger = ledger(100, 1.0);

        ledger.record("executing", 1000, 1000, 0.9).await;
        assert_eq!(ledger.check_budget("executing").await, BudgetVerdict::Ok);
        ledger.record("executing", 1000, 1000, 0.2).await;
        assert_eq!(
            ledger.check_budget("executing").await,
            BudgetVerdict::Exhausted
        );
    }

    #[tokio::test]
    async fn unconfigured_state_is_unconstrained() {
        let ledger = ledger(1, 1.0);
        for _ in 0..10 {
            ledger.record("resting", 10, 10, 10.0).await;
        }
        assert_eq!(ledger.check_budget("resting").await, BudgetVerdict::Ok);
    }

    #[tokio::test]
    async fn snapshot_rolls_up_buckets() {
        let ledger = ledger(100, 100.0);
        ledger.record("executing", 100, 200, 0.5).await;
        ledger.record("executing", 100, 200, 0.5).await;

        let snapshot = ledger.snapshot().await;
        let hour = snapshot.per_state_hour.get("executing").unwrap();
        assert_eq!(hour.invocations, 2);
        assert_eq!(hour.input_tokens, 200);
        assert_eq!(hour.output_tokens, 400);
        assert_eq!(snapshot.session.invocations, 2);
    }
}
