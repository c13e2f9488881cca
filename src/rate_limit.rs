//! Per-identity request admission.
//!
//! Each configured tier is a keyed token bucket; identities that keep
//! violating a tier earn escalating connect cooldowns (30 s, 60 s, 5 min).
//! The cooldown gates `admit_connect`, so an abusive client is pushed back
//! at the cheapest point: before a session even forms.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use governor::{
    clock::DefaultClock, state::keyed::DefaultKeyedStateStore, Quota, RateLimiter,
};
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::RateLimitConfig;
use crate::constants::COOLDOWN_STEPS_MS;
use crate::{HubError, Result};

type KeyedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

#[derive(Debug, Clone, Default)]
struct ViolationState {
    count: u64,
    escalation: usize,
    cooldown_until: Option<Instant>,
}

pub struct RateGate {
    tiers: HashMap<String, Arc<KeyedLimiter>>,
    violations: Mutex<HashMap<String, ViolationState>>,
}

impl RateGate {
    pub fn new(config: &RateLimitConfig) -> Self {
        let mut tiers = HashMap::new();
        for (name, tier) in &config.tiers {
            let per_minute = NonZeroU32::new(tier.per_minute.max(1)).unwrap();
            let burst = NonZeroU32::new(tier.burst.max(1)).unwrap();
            let quota = Quota::per_minute(per_minute).allow_burst(burst);
            tiers.insert(name.clone(), Arc::new(RateLimiter::keyed(quota)));
        }
        Self {
            tiers,
            violations: Mutex::new(HashMap::new()),
        }
    }

    /// Admits or rejects one request from `identity` against `tier`.
    /// An unknown tier admits everything (fail open for internal callers).
    pub async fn check(&self, identity: &str, tier: &str) -> Result<()> {
        let Some(limiter) = self.tiers.get(tier) else {
            return Ok(());
        };

        if limiter.check_key(&identity.to_string()).is_ok() {
            return Ok(());
        }

        let retry_after_ms = self.record_violation(identity).await;
        warn!(%identity, %tier, "rate limit violation");
        Err(HubError::RateLimited { retry_after_ms })
    }

    /// Connect admission: rejected while a cooldown earned by earlier
    /// violations is still running.
    pub async fn admit_connect(&self, identity: &str) -> Result<()> {
        let violations = self.violations.lock().await;
        if let Some(state) = violations.get(identity) {
            if let Some(until) = state.cooldown_until {
                let now = Instant::now();
                if until > now {
                    return Err(HubError::RateLimited {
                        retry_after_ms: (until - now).as_millis() as u64,
                    });
                }
            }
        }
        Ok(())
    }

    async fn record_violation(&self, identity: &str) -> u64 {
        let mut violations = self.violations.lock().await;
        let state = violations.entry(identity.to_string()).or_default();
        state.count += 1;

        let now = Instant::now();
        let in_cooldown = state.cooldown_until.map(|t| t > now).unwrap_or(false);
        if !in_cooldown {
            let step_ms = COOLDOWN_STEPS_MS[state.escalation.min(COOLDOWN_STEPS_MS.len() - 1)];
            state.cooldown_until = Some(now + Duration::from_millis(step_ms));
            state.escalation = (state.escalation + 1).min(COOLDOWN_STEPS_MS.len() - 1);
            step_ms
        } else {
            state
                .cooldown_until
                .map(|t| (t - now).as_millis() as u64)
                .unwrap_or(0)
        }
    }

    /// Violation count for one identity, for operator inspection.
    pub async fn violation_count(&self, identity: &str) -> u64 {
        let violations = self.violations.lock().await;
        violations.get(identity).map(|s| s.count).unwrap_or(0)
    }
}
