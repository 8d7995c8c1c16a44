//! Three-state circuit breaker with persisted transitions.
//!
//! Closed counts consecutive failures; crossing the threshold opens the
//! breaker, and calls then fail fast with [`BreakerError::Open`] without
//! touching the dependency. After the cool-down one trial call is let
//! through (half-open): success closes the breaker, failure re-opens it.
//!
//! Every state change is written to a [`BoxBreakerStore`]. Persistence
//! failures are logged, never surfaced: callers only ever see their own
//! operation's error or `Open`.
//!
//! Before short-circuiting, an open breaker re-reads its stored state once,
//! so a reset written by another process (`rflow breaker reset`) closes it
//! here too.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reportflow_types::breaker::{BreakerPhase, BreakerSnapshot};
use reportflow_types::config::BreakerSettings;
use reportflow_types::event::EngineEvent;

use crate::clock::SharedClock;
use crate::event::EventBus;
use crate::repository::breaker::BoxBreakerStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cool_down: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(300),
        }
    }
}

impl From<&BreakerSettings> for BreakerConfig {
    fn from(settings: &BreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold.max(1),
            cool_down: settings.cool_down(),
        }
    }
}

/// Error from a breaker-guarded call.
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// Short-circuited; the operation was not attempted.
    #[error("circuit '{name}' is open until {retry_at}")]
    Open {
        name: String,
        retry_at: DateTime<Utc>,
    },

    /// The wrapped operation's own error.
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Inner(e) => Some(e),
            BreakerError::Open { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CircuitState {
    Closed { consecutive_failures: u32 },
    Open { opened_at: DateTime<Utc>, consecutive_failures: u32 },
    /// `trial_started` is set while the single trial call is in flight.
    HalfOpen { trial_started: Option<DateTime<Utc>> },
}

#[derive(Debug)]
struct BreakerInner {
    circuit: CircuitState,
    last_failure_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// Circuit breaker for one named dependency.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    store: Arc<BoxBreakerStore>,
    clock: SharedClock,
    events: EventBus,
}

impl CircuitBreaker {
    /// Build a breaker, reloading any persisted state for `name`.
    ///
    /// A store that cannot be read is logged and the breaker starts closed.
    pub async fn restore(
        name: impl Into<String>,
        config: BreakerConfig,
        store: Arc<BoxBreakerStore>,
        clock: SharedClock,
        events: EventBus,
    ) -> Self {
        let name = name.into();
        let inner = match store.load(&name).await {
            Ok(Some(snapshot)) => {
                tracing::debug!(breaker = %name, phase = %snapshot.phase, "restored breaker state");
                BreakerInner::from_snapshot(&snapshot)
            }
            Ok(None) => BreakerInner::closed(),
            Err(e) => {
                tracing::warn!(breaker = %name, error = %e, "failed to load breaker state, starting closed");
                BreakerInner::closed()
            }
        };

        Self {
            name,
            config,
            inner: Mutex::new(inner),
            store,
            clock,
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `op` through the breaker; every error counts as a failure.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.call_classified(op, |_| true).await
    }

    /// Run `op` through the breaker; only errors for which `is_failure`
    /// returns true count toward opening it. Other errors mean the
    /// dependency answered, and are recorded like a success.
    pub async fn call_classified<T, E, F, Fut, P>(
        &self,
        op: F,
        is_failure: P,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        if let Err(retry_at) = self.admit().await {
            if !self.adopt_external_reset().await {
                return Err(BreakerError::Open {
                    name: self.name.clone(),
                    retry_at,
                });
            }
        }

        match op().await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(err) => {
                if is_failure(&err) {
                    self.record_failure(&err.to_string()).await;
                } else {
                    self.record_success().await;
                }
                Err(BreakerError::Inner(err))
            }
        }
    }

    /// Phase as last recorded; open becomes half-open on the next admitted call.
    pub fn phase(&self) -> BreakerPhase {
        let inner = self.lock();
        match inner.circuit {
            CircuitState::Closed { .. } => BreakerPhase::Closed,
            CircuitState::Open { .. } => BreakerPhase::Open,
            CircuitState::HalfOpen { .. } => BreakerPhase::HalfOpen,
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = self.clock.now();
        self.lock().to_snapshot(&self.name, now)
    }

    /// Force the breaker closed.
    pub async fn reset(&self) {
        let snapshot = {
            let mut inner = self.lock();
            inner.circuit = CircuitState::Closed {
                consecutive_failures: 0,
            };
            inner.last_error = None;
            inner.to_snapshot(&self.name, self.clock.now())
        };
        tracing::info!(breaker = %self.name, "breaker reset");
        self.persist(snapshot).await;
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Decide whether a call may proceed. `Err(retry_at)` when short-circuited.
    async fn admit(&self) -> Result<(), DateTime<Utc>> {
        let now = self.clock.now();
        let cool_down = chrono::Duration::from_std(self.config.cool_down)
            .unwrap_or_else(|_| chrono::Duration::MAX);

        let transitioned = {
            let mut inner = self.lock();
            match inner.circuit {
                CircuitState::Closed { .. } => return Ok(()),
                CircuitState::Open { opened_at, .. } => {
                    let retry_at = opened_at
                        .checked_add_signed(cool_down)
                        .unwrap_or(DateTime::<Utc>::MAX_UTC);
                    if now < retry_at {
                        return Err(retry_at);
                    }
                    inner.circuit = CircuitState::HalfOpen {
                        trial_started: Some(now),
                    };
                    inner.to_snapshot(&self.name, now)
                }
                CircuitState::HalfOpen { trial_started } => {
                    // A trial that never reported back (dropped future) is
                    // abandoned after one cool-down.
                    if let Some(started) = trial_started {
                        let trial_deadline = started
                            .checked_add_signed(cool_down)
                            .unwrap_or(DateTime::<Utc>::MAX_UTC);
                        if now < trial_deadline {
                            return Err(trial_deadline);
                        }
                    }
                    inner.circuit = CircuitState::HalfOpen {
                        trial_started: Some(now),
                    };
                    return Ok(());
                }
            }
        };

        tracing::info!(breaker = %self.name, "cool-down elapsed, breaker half-open");
        self.persist(transitioned).await;
        Ok(())
    }

    /// Close the breaker if the store holds a `closed` snapshot written after
    /// this breaker last opened (or started its trial). Returns whether it did.
    async fn adopt_external_reset(&self) -> bool {
        let stored = match self.store.load(&self.name).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!(breaker = %self.name, error = %e, "failed to reload breaker state");
                return false;
            }
        };
        if stored.phase != BreakerPhase::Closed {
            return false;
        }

        let mut inner = self.lock();
        let since = match inner.circuit {
            CircuitState::Closed { .. } => return true,
            CircuitState::Open { opened_at, .. } => opened_at,
            CircuitState::HalfOpen {
                trial_started: Some(started),
            } => started,
            CircuitState::HalfOpen {
                trial_started: None,
            } => return false,
        };
        if stored.updated_at <= since {
            return false;
        }
        inner.circuit = CircuitState::Closed {
            consecutive_failures: stored.consecutive_failures,
        };
        inner.last_error = stored.last_error;
        tracing::info!(breaker = %self.name, "breaker was reset externally, closed");
        true
    }

    async fn record_success(&self) {
        let snapshot = {
            let mut inner = self.lock();
            let changed = match inner.circuit {
                CircuitState::Closed {
                    consecutive_failures,
                } => consecutive_failures > 0,
                CircuitState::HalfOpen { .. } | CircuitState::Open { .. } => {
                    tracing::info!(breaker = %self.name, "trial call succeeded, breaker closed");
                    true
                }
            };
            if !changed {
                return;
            }
            inner.circuit = CircuitState::Closed {
                consecutive_failures: 0,
            };
            inner.to_snapshot(&self.name, self.clock.now())
        };
        self.persist(snapshot).await;
    }

    async fn record_failure(&self, error: &str) {
        let now = self.clock.now();
        let (snapshot, opened) = {
            let mut inner = self.lock();
            inner.last_failure_at = Some(now);
            inner.last_error = Some(error.to_string());

            let opened = match inner.circuit {
                CircuitState::Closed {
                    consecutive_failures,
                } => {
                    let count = consecutive_failures + 1;
                    if count >= self.config.failure_threshold {
                        inner.circuit = CircuitState::Open {
                            opened_at: now,
                            consecutive_failures: count,
                        };
                        true
                    } else {
                        inner.circuit = CircuitState::Closed {
                            consecutive_failures: count,
                        };
                        false
                    }
                }
                CircuitState::HalfOpen { .. } => {
                    inner.circuit = CircuitState::Open {
                        opened_at: now,
                        consecutive_failures: self.config.failure_threshold,
                    };
                    true
                }
                // A call admitted before another caller opened the breaker.
                CircuitState::Open { .. } => false,
            };
            (inner.to_snapshot(&self.name, now), opened)
        };

        if opened {
            tracing::warn!(breaker = %self.name, error, "breaker opened");
            self.events.publish(EngineEvent::BreakerOpened {
                name: self.name.clone(),
            });
        }
        self.persist(snapshot).await;
    }

    async fn persist(&self, snapshot: BreakerSnapshot) {
        if let Err(e) = self.store.save(&snapshot).await {
            tracing::warn!(breaker = %self.name, error = %e, "failed to persist breaker state");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl BreakerInner {
    fn closed() -> Self {
        Self {
            circuit: CircuitState::Closed {
                consecutive_failures: 0,
            },
            last_failure_at: None,
            last_error: None,
        }
    }

    fn from_snapshot(snapshot: &BreakerSnapshot) -> Self {
        let circuit = match (snapshot.phase, snapshot.opened_at) {
            (BreakerPhase::Open, Some(opened_at)) => CircuitState::Open {
                opened_at,
                consecutive_failures: snapshot.consecutive_failures,
            },
            // A trial interrupted by the restart is re-admitted.
            (BreakerPhase::HalfOpen, _) => CircuitState::HalfOpen {
                trial_started: None,
            },
            _ => CircuitState::Closed {
                consecutive_failures: snapshot.consecutive_failures,
            },
        };
        Self {
            circuit,
            last_failure_at: snapshot.last_failure_at,
            last_error: snapshot.last_error.clone(),
        }
    }

    fn to_snapshot(&self, name: &str, now: DateTime<Utc>) -> BreakerSnapshot {
        let (phase, consecutive_failures, opened_at) = match self.circuit {
            CircuitState::Closed {
                consecutive_failures,
            } => (BreakerPhase::Closed, consecutive_failures, None),
            CircuitState::Open {
                opened_at,
                consecutive_failures,
            } => (BreakerPhase::Open, consecutive_failures, Some(opened_at)),
            CircuitState::HalfOpen { .. } => (BreakerPhase::HalfOpen, 0, None),
        };
        BreakerSnapshot {
            name: name.to_string(),
            phase,
            consecutive_failures,
            opened_at,
            last_failure_at: self.last_failure_at,
            last_error: self.last_error.clone(),
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Named breakers sharing one store, created on first use.
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: BreakerConfig,
    store: Arc<BoxBreakerStore>,
    clock: SharedClock,
    events: EventBus,
}

impl BreakerRegistry {
    pub fn new(
        config: BreakerConfig,
        store: BoxBreakerStore,
        clock: SharedClock,
        events: EventBus,
    ) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
            store: Arc::new(store),
            clock,
            events,
        }
    }

    /// The breaker for `name`, restoring persisted state on first access.
    pub async fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return existing.clone();
        }

        let breaker = Arc::new(
            CircuitBreaker::restore(
                name,
                self.config.clone(),
                self.store.clone(),
                self.clock.clone(),
                self.events.clone(),
            )
            .await,
        );
        // Two callers may race on first access; the first insert wins.
        self.breakers
            .entry(name.to_string())
            .or_insert(breaker)
            .clone()
    }

    /// Persisted snapshots for every breaker the store knows about.
    pub async fn snapshots(
        &self,
    ) -> Result<Vec<BreakerSnapshot>, reportflow_types::error::RepositoryError> {
        self.store.list().await
    }
}
