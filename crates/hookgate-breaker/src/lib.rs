#![warn(missing_docs)]

//! Circuit breaker for plugin hook callbacks.
//!
//! Stops a hook that reliably fails for a given plugin from being retried on
//! every request. State is tracked per `plugin:hook` key (or `core:hook` for
//! host callbacks) so one broken hook in a plugin leaves that plugin's
//! healthy hooks alone.
//!
//! Records live in a [`SharedCounterStore`] so every worker process shares
//! them. Every transition is written with compare-and-swap; a lost race is
//! re-evaluated against the winner's record instead of overwriting it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hookgate_audit::{AuditEvent, AuditEventKind, AuditSink, NoopAuditSink};
use hookgate_config::CircuitBreakerOverrides;
use hookgate_sandbox::{SharedCounterStore, StoreError};
use serde::{Deserialize, Serialize};

const KEY_PREFIX: &str = "circuit:";
const MAX_CAS_ATTEMPTS: usize = 8;

/// Configuration for a circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Failures in the closed state before the circuit opens.
    pub failure_threshold: u32,
    /// Successes in the half-open state before the circuit closes.
    pub success_threshold: u32,
    /// How long an open circuit refuses calls before admitting a trial.
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

impl From<&CircuitBreakerOverrides> for CircuitBreakerConfig {
    fn from(overrides: &CircuitBreakerOverrides) -> Self {
        let defaults = Self::default();
        Self {
            failure_threshold: overrides
                .failure_threshold
                .unwrap_or(defaults.failure_threshold),
            success_threshold: overrides
                .success_threshold
                .unwrap_or(defaults.success_threshold),
            recovery_timeout: overrides
                .recovery_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.recovery_timeout),
        }
    }
}

/// Circuit state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally; failures are counted.
    #[default]
    Closed,
    /// Calls are refused until the recovery timeout elapses.
    Open,
    /// Trial calls are admitted; successes are counted.
    HalfOpen,
}

impl CircuitState {
    /// Lowercase name used in logs and audit payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The persisted state of one circuit.
///
/// `failure_count` is only meaningful while closed, `success_count` only
/// while half-open, and `opened_at` is set exactly while open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitRecord {
    /// Current state.
    pub state: CircuitState,
    /// Failures counted while closed.
    #[serde(default)]
    pub failure_count: u32,
    /// Successes counted while half-open.
    #[serde(default)]
    pub success_count: u32,
    /// When the current open episode began.
    #[serde(default)]
    pub opened_at: Option<DateTime<Utc>>,
}

impl CircuitRecord {
    fn open(now: DateTime<Utc>) -> Self {
        Self {
            state: CircuitState::Open,
            failure_count: 0,
            success_count: 0,
            opened_at: Some(now),
        }
    }
}

/// Observability snapshot of one circuit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitMetrics {
    /// The circuit key.
    pub key: String,
    /// Current state.
    pub state: CircuitState,
    /// Failures counted while closed.
    pub failure_count: u32,
    /// Successes counted while half-open.
    pub success_count: u32,
    /// Configured failure threshold.
    pub failure_threshold: u32,
    /// Configured success threshold.
    pub success_threshold: u32,
    /// Configured recovery timeout in seconds.
    pub recovery_timeout_secs: u64,
    /// Start of the current open episode.
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Transition {
    from: CircuitState,
    to: CircuitState,
}

/// Build the circuit key for a hook and its owning plugin.
///
/// `hook_key("init", None)` is `"core:init"`; `hook_key("init", Some("p"))`
/// is `"p:init"`.
pub fn hook_key(hook: &str, plugin: Option<&str>) -> String {
    format!("{}:{}", plugin.unwrap_or("core"), hook)
}

/// Store key holding the record for circuit `key`.
pub fn store_key(key: &str) -> String {
    format!("{KEY_PREFIX}{key}")
}

/// A store-backed circuit breaker shared by all worker processes.
pub struct CircuitBreaker {
    store: Arc<dyn SharedCounterStore>,
    config: CircuitBreakerConfig,
    audit: Arc<dyn AuditSink>,
}

impl CircuitBreaker {
    /// Create a breaker over `store`.
    pub fn new(store: Arc<dyn SharedCounterStore>, config: CircuitBreakerConfig) -> Self {
        Self {
            store,
            config,
            audit: Arc::new(NoopAuditSink),
        }
    }

    /// Emit state transitions to `sink`.
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    /// The active configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether calls for `key` must be refused.
    ///
    /// Once the recovery timeout has elapsed an open circuit moves to
    /// half-open and this returns false, admitting the caller as a trial.
    /// Store failures are logged and treated as closed.
    pub async fn is_open(&self, key: &str) -> bool {
        let now = Utc::now();
        let timeout = chrono::Duration::from_std(self.config.recovery_timeout).ok();
        let result = self
            .update(key, |record| {
                if record.state != CircuitState::Open {
                    return None;
                }
                let elapsed = match (record.opened_at, timeout) {
                    (Some(at), Some(timeout)) => at
                        .checked_add_signed(timeout)
                        .is_some_and(|deadline| now >= deadline),
                    // A record without a start time can never recover on its own
                    (None, _) => true,
                    (Some(_), None) => false,
                };
                if !elapsed {
                    return None;
                }
                *record = CircuitRecord {
                    state: CircuitState::HalfOpen,
                    ..CircuitRecord::default()
                };
                Some(Transition {
                    from: CircuitState::Open,
                    to: CircuitState::HalfOpen,
                })
            })
            .await;

        match result {
            Ok((record, transition)) => {
                if let Some(transition) = transition {
                    self.announce(key, transition).await;
                }
                if record.state == CircuitState::Open {
                    tracing::debug!(key, "circuit open, refusing call");
                    true
                } else {
                    false
                }
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "circuit check skipped: store unavailable");
                false
            }
        }
    }

    /// Record a successful call.
    pub async fn record_success(&self, key: &str) {
        let threshold = self.config.success_threshold;
        let result = self
            .update(key, |record| match record.state {
                CircuitState::Closed => {
                    record.failure_count = 0;
                    None
                }
                CircuitState::HalfOpen => {
                    record.success_count += 1;
                    if record.success_count >= threshold {
                        *record = CircuitRecord::default();
                        Some(Transition {
                            from: CircuitState::HalfOpen,
                            to: CircuitState::Closed,
                        })
                    } else {
                        None
                    }
                }
                CircuitState::Open => None,
            })
            .await;
        self.finish(key, result).await;
    }

    /// Record a failed call.
    pub async fn record_failure(&self, key: &str, reason: &str) {
        let threshold = self.config.failure_threshold;
        let now = Utc::now();
        let result = self
            .update(key, |record| match record.state {
                CircuitState::Closed => {
                    record.failure_count += 1;
                    if record.failure_count >= threshold {
                        *record = CircuitRecord::open(now);
                        Some(Transition {
                            from: CircuitState::Closed,
                            to: CircuitState::Open,
                        })
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    *record = CircuitRecord::open(now);
                    Some(Transition {
                        from: CircuitState::HalfOpen,
                        to: CircuitState::Open,
                    })
                }
                CircuitState::Open => None,
            })
            .await;
        if let Ok((record, _)) = &result {
            tracing::debug!(
                key,
                reason,
                state = %record.state,
                failures = record.failure_count,
                "circuit failure recorded"
            );
        }
        self.finish(key, result).await;
    }

    /// Force `key` closed with all counters zeroed. Idempotent.
    pub async fn reset(&self, key: &str) -> Result<(), StoreError> {
        let (_, transition) = self
            .update(key, |record| {
                let from = record.state;
                if *record == CircuitRecord::default() {
                    return None;
                }
                *record = CircuitRecord::default();
                Some(Transition {
                    from,
                    to: CircuitState::Closed,
                })
            })
            .await?;
        if let Some(transition) = transition {
            tracing::info!(key, from = %transition.from, "circuit reset");
            self.audit
                .record(&AuditEvent::circuit(
                    AuditEventKind::CircuitReset,
                    key,
                    transition.from.as_str(),
                    transition.to.as_str(),
                ))
                .await;
        }
        Ok(())
    }

    /// The stored record for `key` (closed defaults when absent).
    pub async fn record(&self, key: &str) -> Result<CircuitRecord, StoreError> {
        let raw = self.store.get(&store_key(key)).await?;
        decode(raw)
    }

    /// Current state of `key`, without triggering any transition.
    pub async fn state(&self, key: &str) -> Result<CircuitState, StoreError> {
        Ok(self.record(key).await?.state)
    }

    /// Snapshot of `key` for dashboards.
    pub async fn get_metrics(&self, key: &str) -> Result<CircuitMetrics, StoreError> {
        let record = self.record(key).await?;
        Ok(CircuitMetrics {
            key: key.to_string(),
            state: record.state,
            failure_count: record.failure_count,
            success_count: record.success_count,
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
            recovery_timeout_secs: self.config.recovery_timeout.as_secs(),
            opened_at: record.opened_at,
        })
    }

    /// Every circuit key currently in the open state, sorted.
    pub async fn get_open_circuits(&self) -> Result<Vec<String>, StoreError> {
        let mut open = Vec::new();
        for skey in self.store.keys_with_prefix(KEY_PREFIX).await? {
            let Some(key) = skey.strip_prefix(KEY_PREFIX) else {
                continue;
            };
            if self.state(key).await? == CircuitState::Open {
                open.push(key.to_string());
            }
        }
        open.sort();
        Ok(open)
    }

    /// Read-modify-write `key` with compare-and-swap, re-applying `apply` to
    /// the freshest record after every lost race.
    async fn update<F>(
        &self,
        key: &str,
        mut apply: F,
    ) -> Result<(CircuitRecord, Option<Transition>), StoreError>
    where
        F: FnMut(&mut CircuitRecord) -> Option<Transition>,
    {
        let skey = store_key(key);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let raw = self.store.get(&skey).await?;
            let mut record = decode(raw.clone())?;
            let before = record.clone();
            let transition = apply(&mut record);
            if record == before {
                return Ok((record, transition));
            }
            let new = serde_json::to_value(&record)?;
            if self
                .store
                .compare_and_swap(&skey, raw.as_ref(), new, None)
                .await?
            {
                return Ok((record, transition));
            }
            tracing::trace!(key, "circuit update lost a race, retrying");
        }
        Err(StoreError::Unavailable(format!(
            "circuit '{key}' still contended after {MAX_CAS_ATTEMPTS} attempts"
        )))
    }

    async fn finish(
        &self,
        key: &str,
        result: Result<(CircuitRecord, Option<Transition>), StoreError>,
    ) {
        match result {
            Ok((_, Some(transition))) => self.announce(key, transition).await,
            Ok((_, None)) => {}
            Err(e) => tracing::warn!(key, error = %e, "circuit update dropped: store unavailable"),
        }
    }

    async fn announce(&self, key: &str, transition: Transition) {
        let kind = match transition.to {
            CircuitState::Open => {
                tracing::warn!(key, from = %transition.from, "circuit breaker opened");
                AuditEventKind::CircuitOpened
            }
            CircuitState::HalfOpen => {
                tracing::info!(key, "circuit breaker half-open, admitting trial call");
                AuditEventKind::CircuitHalfOpen
            }
            CircuitState::Closed => {
                tracing::info!(key, "circuit breaker closed after successful trials");
                AuditEventKind::CircuitClosed
            }
        };
        self.audit
            .record(&AuditEvent::circuit(
                kind,
                key,
                transition.from.as_str(),
                transition.to.as_str(),
            ))
            .await;
    }
}

fn decode(raw: Option<serde_json::Value>) -> Result<CircuitRecord, StoreError> {
    match raw {
        Some(value) => Ok(serde_json::from_value(value)?),
        None => Ok(CircuitRecord::default()),
    }
}
