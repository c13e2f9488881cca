//! Circuit breaker protecting the LLM transport.
//!
//! Consecutive failures inside the failure window open the circuit;
//! requests are rejected until the timeout elapses, then a half-open probe
//! decides whether to close again.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long an open circuit rejects before probing.
    pub timeout: Duration,
    /// Successful probes needed to close from half-open.
    pub success_threshold: u32,
    /// Failures outside this window do not accumulate.
    pub failure_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
            success_threshold: 2,
            failure_window: Duration::from_secs(300),
        }
    }
}

struct Inner {
    state: CircuitState,
    last_failure: Option<Instant>,
    last_change: Instant,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: RwLock<Inner>,
    failures: AtomicU32,
    successes: AtomicU32,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner {
                state: CircuitState::Closed,
                last_failure: None,
                last_change: Instant::now(),
            }),
            failures: AtomicU32::new(0),
            successes: AtomicU32::new(0),
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state
    }

    /// Whether a request may go out right now.
    pub async fn allow(&self) -> bool {
        let state = self.inner.read().await.state;
        match state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = self.inner.read().await.last_change.elapsed();
                if elapsed >= self.config.timeout {
                    let mut inner = self.inner.write().await;
                    if inner.state == CircuitState::Open {
                        inner.state = CircuitState::HalfOpen;
                        inner.last_change = Instant::now();
                        self.successes.store(0, Ordering::Relaxed);
                        info!("llm circuit half-open, probing");
                    }
                    true
                } else {
                    false
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let state = self.inner.read().await.state;
        match state {
            CircuitState::Closed => {
                self.failures.store(0, Ordering::Relaxed);
            }
            CircuitState::HalfOpen => {
                let count = self.successes.fetch_add(1, Ordering::Relaxed) + 1;
                if count >= self.config.success_threshold {
                    let mut inner = self.inner.write().await;
                    inner.state = CircuitState::Closed;
                    inner.last_change = Instant::now();
                    self.failures.store(0, Ordering::Relaxed);
                    info!("llm circuit closed, transport recovered");
                }
            }
            CircuitState::Open => {}
        }
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.write().await;
        let now = Instant::now();

        match inner.state {
            CircuitState::Closed => {
                let within_window = inner
                    .last_failure
                    .map(|t| now.duration_since(t) <= self.config.failure_window)
                    .unwrap_or(false);
                let count = if within_window {
                    self.failures.fetch_add(1, Ordering::Relaxed) + 1
                } else {
                    self.failures.store(1, Ordering::Relaxed);
                    1
                };
                inner.last_failure = Some(now);
                debug!(count, "llm failure recorded");

                if count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.last_change = now;
                    warn!("llm circuit opened after {count} consecutive failures");
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.last_change = now;
                inner.last_failure = Some(now);
                warn!("llm probe failed, circuit re-opened");
            }
            CircuitState::Open => {
                inner.last_failure = Some(now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold,
            timeout: Duration::from_millis(timeout_ms),
            success_threshold: 1,
            failure_window: Duration::from_secs(60),
        })
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let breaker = breaker(3, 60_000);
        assert!(breaker.allow().await);

        for _ in 0..3 {
            breaker.record_failure().await;
        }
        assert_eq!(breaker.state().await, CircuitState::Open);
        assert!(!breaker.allow().await);
    }

    #[tokio::test]
    async fn probes_after_timeout_and_closes_on_success() {
        let breaker = breaker(1, 20);
        breaker.record_failure().await;
        assert!(!breaker.allow().await);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(breaker.allow().await);
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn failed_probe_reopens() {
        let breaker = breaker(1, 20);
        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(breaker.allow().await);

        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn success_resets_closed_failure_count() {
        let breaker = breaker(2, 60_000);
        breaker.record_failure().await;
        breaker.record_success().await;
        breaker.record_failure().await;
        // Only one failure since the last success; still closed.
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }
}
