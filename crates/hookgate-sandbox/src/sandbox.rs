//! The resource sandbox.
//!
//! Tracks per-invocation time and memory, enforces fixed one-minute rate
//! windows, checks outbound domains against per-plugin whitelists and keeps
//! the temporary block list. All cross-request state lives in the
//! [`SharedCounterStore`]; the sandbox itself holds only configuration.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use hookgate_audit::{AuditEvent, AuditEventKind, AuditSink, NoopAuditSink};
use hookgate_config::{LimitOverrides, SandboxOverrides};
use hookgate_error::SandboxViolation;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;

use crate::domain;
use crate::execution::{ExecutionSample, ExecutionStats, MemoryProbe, ProcessMemoryProbe};
use crate::limits::SandboxLimits;
use crate::store::{SharedCounterStore, StoreError};

/// Length of every rate-limit window.
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

const RATE_PREFIX: &str = "sandbox:rate:";
const BLOCK_PREFIX: &str = "sandbox:blocked:";

/// The rolling-window counters the sandbox maintains per plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateCounter {
    /// Calls into host APIs.
    ApiRequests,
    /// Plugin hook callbacks dispatched.
    HookExecutions,
    /// Outbound network requests.
    NetworkRequests,
}

impl RateCounter {
    /// Counter name used in store keys and violation details.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiRequests => "api_requests",
            Self::HookExecutions => "hook_executions",
            Self::NetworkRequests => "network_requests",
        }
    }

    fn limit(&self, limits: &SandboxLimits) -> u64 {
        match self {
            Self::ApiRequests => limits.api_requests_per_minute,
            Self::HookExecutions => limits.hook_executions_per_minute,
            Self::NetworkRequests => limits.network_requests_per_minute,
        }
    }
}

impl fmt::Display for RateCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current-window counter values for one plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PluginUsage {
    /// API requests in the current window.
    pub api_requests: u64,
    /// Hook executions in the current window.
    pub hook_executions: u64,
    /// Network requests in the current window.
    pub network_requests: u64,
}

/// Per-plugin resource ceilings backed by a shared store.
pub struct ResourceSandbox {
    enabled: bool,
    enforce_timeout: bool,
    defaults: SandboxLimits,
    overrides: RwLock<HashMap<String, LimitOverrides>>,
    store: Arc<dyn SharedCounterStore>,
    probe: Arc<dyn MemoryProbe>,
    audit: Arc<dyn AuditSink>,
}

impl ResourceSandbox {
    /// Create an enabled sandbox with built-in default limits.
    pub fn new(store: Arc<dyn SharedCounterStore>) -> Self {
        Self {
            enabled: true,
            enforce_timeout: false,
            defaults: SandboxLimits::default(),
            overrides: RwLock::new(HashMap::new()),
            store,
            probe: Arc::new(ProcessMemoryProbe::new()),
            audit: Arc::new(NoopAuditSink),
        }
    }

    /// Build a sandbox from the `[sandbox]` config section.
    pub fn from_config(config: &SandboxOverrides, store: Arc<dyn SharedCounterStore>) -> Self {
        let sandbox = Self::new(store)
            .with_enabled(config.enabled.unwrap_or(true))
            .with_enforce_timeout(config.enforce_timeout.unwrap_or(false))
            .with_defaults(SandboxLimits::default().merged(&config.defaults()));
        for (slug, limits) in &config.plugins {
            sandbox.set_plugin_limits(slug, limits.clone());
        }
        sandbox
    }

    /// Toggle the global kill-switch.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Cancel over-budget callbacks at their next await point.
    pub fn with_enforce_timeout(mut self, enforce: bool) -> Self {
        self.enforce_timeout = enforce;
        self
    }

    /// Replace the process-wide default limits.
    pub fn with_defaults(mut self, defaults: SandboxLimits) -> Self {
        self.defaults = defaults;
        self
    }

    /// Replace the memory probe.
    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Emit block-list changes to `sink`.
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    /// Whether sandbox checks are active.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether callbacks are cancelled when they exceed their time budget.
    pub fn enforces_timeout(&self) -> bool {
        self.enforce_timeout
    }

    /// The shared store this sandbox writes to.
    pub fn store(&self) -> &Arc<dyn SharedCounterStore> {
        &self.store
    }

    /// Process-wide default limits.
    pub fn default_limits(&self) -> &SandboxLimits {
        &self.defaults
    }

    /// Set per-plugin overrides, replacing any previous ones for `plugin`.
    pub fn set_plugin_limits(&self, plugin: &str, overrides: LimitOverrides) {
        self.overrides.write().insert(plugin.to_string(), overrides);
    }

    /// Drop per-plugin overrides. Returns whether any were set.
    pub fn clear_plugin_limits(&self, plugin: &str) -> bool {
        self.overrides.write().remove(plugin).is_some()
    }

    /// Effective limits for `plugin`: its overrides layered over the defaults.
    pub fn plugin_limits(&self, plugin: &str) -> SandboxLimits {
        match self.overrides.read().get(plugin) {
            Some(overrides) => self.defaults.merged(overrides),
            None => self.defaults.clone(),
        }
    }

    /// Snapshot start time and memory for one invocation.
    pub fn begin_execution(&self, plugin: &str) -> ExecutionSample {
        ExecutionSample {
            plugin: plugin.to_string(),
            started: Instant::now(),
            start_memory: self.probe.current_bytes(),
        }
    }

    /// Close a sample and compute what the invocation used.
    pub fn end_execution(&self, sample: ExecutionSample) -> ExecutionStats {
        let elapsed = sample.started.elapsed();
        let end_memory = self.probe.current_bytes();
        ExecutionStats {
            plugin: sample.plugin,
            execution_time_ms: elapsed.as_millis() as u64,
            memory_used_bytes: end_memory.saturating_sub(sample.start_memory),
            peak_memory_bytes: end_memory.max(sample.start_memory),
        }
    }

    /// Compare completed-invocation stats against the plugin's limits.
    ///
    /// This is detection after the fact; the invocation has already run.
    pub fn check_execution_limits(&self, stats: &ExecutionStats) -> Result<(), SandboxViolation> {
        if !self.enabled {
            return Ok(());
        }
        let limits = self.plugin_limits(&stats.plugin);
        let elapsed = Duration::from_millis(stats.execution_time_ms);
        if elapsed > limits.execution_time() {
            return Err(self.raise(SandboxViolation::execution_time_exceeded(
                &stats.plugin,
                elapsed,
                limits.execution_time(),
            )));
        }
        if stats.memory_used_bytes > limits.memory_bytes() {
            return Err(self.raise(SandboxViolation::memory_limit_exceeded(
                &stats.plugin,
                stats.memory_used_bytes,
                limits.memory_bytes(),
            )));
        }
        Ok(())
    }

    /// Count one event against `counter` and fail if the window is over budget.
    ///
    /// Store failures are logged and treated as within budget.
    pub async fn check_rate_limits(
        &self,
        plugin: &str,
        counter: RateCounter,
    ) -> Result<(), SandboxViolation> {
        if !self.enabled {
            return Ok(());
        }
        let limit = counter.limit(&self.plugin_limits(plugin));
        let key = rate_key(plugin, counter);
        let count = match self.store.increment(&key, Some(RATE_WINDOW)).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(plugin, counter = %counter, error = %e, "rate limit check skipped: store unavailable");
                return Ok(());
            }
        };
        if count.max(0) as u64 > limit {
            let violation = match counter {
                RateCounter::NetworkRequests => SandboxViolation::network_limit_exceeded(plugin, limit),
                _ => SandboxViolation::rate_limit_exceeded(plugin, counter.as_str(), limit),
            };
            return Err(self.raise(violation));
        }
        Ok(())
    }

    /// Whether `plugin` may contact `domain`.
    pub fn is_domain_allowed(&self, plugin: &str, domain: &str) -> bool {
        if !self.enabled {
            return true;
        }
        domain::is_allowed(&self.plugin_limits(plugin).network_whitelist, domain)
    }

    /// Fail with `domain_blocked` unless `plugin` may contact `domain`.
    pub fn check_domain(&self, plugin: &str, domain: &str) -> Result<(), SandboxViolation> {
        if self.is_domain_allowed(plugin, domain) {
            Ok(())
        } else {
            Err(self.raise(SandboxViolation::domain_blocked(plugin, domain)))
        }
    }

    /// Fail with `storage_limit` when `used_bytes` exceeds the plugin's quota.
    pub fn check_storage(&self, plugin: &str, used_bytes: u64) -> Result<(), SandboxViolation> {
        if !self.enabled {
            return Ok(());
        }
        let limit = self.plugin_limits(plugin).storage_bytes();
        if used_bytes > limit {
            return Err(self.raise(SandboxViolation::storage_limit_exceeded(
                plugin, used_bytes, limit,
            )));
        }
        Ok(())
    }

    /// Block `plugin` from all hook execution for `duration`.
    ///
    /// Re-blocking replaces the previous deadline.
    pub async fn block_plugin(
        &self,
        plugin: &str,
        duration: Duration,
    ) -> Result<DateTime<Utc>, StoreError> {
        let until = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.store
            .set(
                &block_key(plugin),
                serde_json::json!({ "blocked_until": until.to_rfc3339() }),
                Some(duration),
            )
            .await?;
        tracing::warn!(plugin, seconds = duration.as_secs(), "plugin blocked");
        self.audit
            .record(
                &AuditEvent::new(
                    AuditEventKind::PluginBlocked,
                    serde_json::json!({
                        "blocked_until": until.to_rfc3339(),
                        "seconds": duration.as_secs(),
                    }),
                )
                .with_plugin(plugin),
            )
            .await;
        Ok(until)
    }

    /// Lift a block early. Returns whether a block was in place.
    pub async fn unblock_plugin(&self, plugin: &str) -> Result<bool, StoreError> {
        let removed = self.store.delete(&block_key(plugin)).await?;
        if removed {
            tracing::info!(plugin, "plugin unblocked");
            self.audit
                .record(
                    &AuditEvent::new(AuditEventKind::PluginUnblocked, Value::Null)
                        .with_plugin(plugin),
                )
                .await;
        }
        Ok(removed)
    }

    /// Deadline of the current block, if any.
    pub async fn blocked_until(&self, plugin: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let Some(record) = self.store.get(&block_key(plugin)).await? else {
            return Ok(None);
        };
        let until = record
            .get("blocked_until")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));
        match until {
            Some(until) if until > Utc::now() => Ok(Some(until)),
            Some(_) => Ok(None),
            // An unreadable record still blocks; the TTL bounds it
            None => Ok(Some(Utc::now())),
        }
    }

    /// Whether `plugin` is currently blocked.
    ///
    /// Always false when the sandbox is disabled. Store failures are logged
    /// and treated as not blocked.
    pub async fn is_blocked(&self, plugin: &str) -> bool {
        if !self.enabled {
            return false;
        }
        match self.blocked_until(plugin).await {
            Ok(until) => until.is_some(),
            Err(e) => {
                tracing::warn!(plugin, error = %e, "block check skipped: store unavailable");
                false
            }
        }
    }

    /// Current-window counter values for `plugin`.
    pub async fn usage(&self, plugin: &str) -> Result<PluginUsage, StoreError> {
        Ok(PluginUsage {
            api_requests: self.counter_value(plugin, RateCounter::ApiRequests).await?,
            hook_executions: self.counter_value(plugin, RateCounter::HookExecutions).await?,
            network_requests: self.counter_value(plugin, RateCounter::NetworkRequests).await?,
        })
    }

    async fn counter_value(&self, plugin: &str, counter: RateCounter) -> Result<u64, StoreError> {
        Ok(self
            .store
            .get(&rate_key(plugin, counter))
            .await?
            .and_then(|v| v.as_u64())
            .unwrap_or(0))
    }

    fn raise(&self, violation: SandboxViolation) -> SandboxViolation {
        tracing::warn!(
            plugin = violation.plugin(),
            violation_type = %violation.violation_type(),
            "{}",
            violation
        );
        violation
    }
}

fn rate_key(plugin: &str, counter: RateCounter) -> String {
    format!("{RATE_PREFIX}{plugin}:{}", counter.as_str())
}

fn block_key(plugin: &str) -> String {
    format!("{BLOCK_PREFIX}{plugin}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::FixedMemoryProbe;
    use crate::store::InMemoryStore;
    use hookgate_audit::MemoryAuditSink;
    use hookgate_error::ViolationType;

    fn sandbox() -> ResourceSandbox {
        ResourceSandbox::new(Arc::new(InMemoryStore::new()))
            .with_memory_probe(Arc::new(FixedMemoryProbe::new(0)))
    }

    #[test]
    fn plugin_limits_fall_back_to_defaults() {
        let sb = sandbox();
        sb.set_plugin_limits(
            "acme",
            LimitOverrides {
                memory_mb: Some(256),
                ..LimitOverrides::default()
            },
        );
        let limits = sb.plugin_limits("acme");
        assert_eq!(limits.memory_mb, 256);
        assert_eq!(
            limits.hook_executions_per_minute,
            sb.default_limits().hook_executions_per_minute
        );
        assert_eq!(sb.plugin_limits("other"), *sb.default_limits());
        assert!(sb.clear_plugin_limits("acme"));
        assert_eq!(sb.plugin_limits("acme").memory_mb, 64);
    }

    #[tokio::test]
    async fn rate_limit_trips_after_limit() {
        let sb = sandbox();
        sb.set_plugin_limits(
            "p",
            LimitOverrides {
                api_requests_per_minute: Some(3),
                ..LimitOverrides::default()
            },
        );
        for _ in 0..3 {
            sb.check_rate_limits("p", RateCounter::ApiRequests)
                .await
                .unwrap();
        }
        let err = sb
            .check_rate_limits("p", RateCounter::ApiRequests)
            .await
            .unwrap_err();
        assert_eq!(err.violation_type(), ViolationType::RateLimit);
        assert_eq!(err.details()["limit_type"], "api_requests");
        // Counters are independent
        sb.check_rate_limits("p", RateCounter::HookExecutions)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn network_counter_raises_network_limit() {
        let sb = sandbox();
        sb.set_plugin_limits(
            "p",
            LimitOverrides {
                network_requests_per_minute: Some(1),
                ..LimitOverrides::default()
            },
        );
        sb.check_rate_limits("p", RateCounter::NetworkRequests)
            .await
            .unwrap();
        let err = sb
            .check_rate_limits("p", RateCounter::NetworkRequests)
            .await
            .unwrap_err();
        assert_eq!(err.violation_type(), ViolationType::NetworkLimit);
    }

    #[tokio::test]
    async fn usage_reports_counters() {
        let sb = sandbox();
        sb.check_rate_limits("p", RateCounter::HookExecutions)
            .await
            .unwrap();
        sb.check_rate_limits("p", RateCounter::HookExecutions)
            .await
            .unwrap();
        let usage = sb.usage("p").await.unwrap();
        assert_eq!(usage.hook_executions, 2);
        assert_eq!(usage.api_requests, 0);
    }

    #[tokio::test]
    async fn disabled_sandbox_is_a_no_op() {
        let sb = sandbox().with_enabled(false);
        sb.set_plugin_limits(
            "p",
            LimitOverrides {
                api_requests_per_minute: Some(0),
                network_whitelist: Some(vec!["only.com".into()]),
                ..LimitOverrides::default()
            },
        );
        assert!(sb
            .check_rate_limits("p", RateCounter::ApiRequests)
            .await
            .is_ok());
        assert!(sb.is_domain_allowed("p", "other.com"));
        sb.block_plugin("p", Duration::from_secs(60)).await.unwrap();
        assert!(!sb.is_blocked("p").await);
    }

    #[tokio::test]
    async fn block_lifecycle() {
        let audit = MemoryAuditSink::new();
        let sb = sandbox().with_audit_sink(Arc::new(audit.clone()));
        assert!(!sb.is_blocked("p").await);
        let until = sb.block_plugin("p", Duration::from_secs(60)).await.unwrap();
        assert!(sb.is_blocked("p").await);
        assert!(until > Utc::now());
        assert!(sb.blocked_until("p").await.unwrap().is_some());
        assert!(sb.unblock_plugin("p").await.unwrap());
        assert!(!sb.is_blocked("p").await);
        assert!(!sb.unblock_plugin("p").await.unwrap());

        assert_eq!(audit.events_of(AuditEventKind::PluginBlocked).len(), 1);
        assert_eq!(audit.events_of(AuditEventKind::PluginUnblocked).len(), 1);
    }

    #[tokio::test]
    async fn block_expires_with_ttl() {
        let sb = sandbox();
        sb.block_plugin("p", Duration::from_millis(30)).await.unwrap();
        assert!(sb.is_blocked("p").await);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!sb.is_blocked("p").await);
    }

    #[tokio::test]
    async fn oversized_block_saturates() {
        let sb = sandbox();
        let until = sb.block_plugin("p", Duration::MAX).await.unwrap();
        assert_eq!(until, DateTime::<Utc>::MAX_UTC);
        assert!(sb.is_blocked("p").await);
        assert!(sb.unblock_plugin("p").await.unwrap());
    }

    #[test]
    fn execution_limits_detect_overruns() {
        let probe = FixedMemoryProbe::new(1000);
        let sb = ResourceSandbox::new(Arc::new(InMemoryStore::new()))
            .with_memory_probe(Arc::new(probe.clone()));
        sb.set_plugin_limits(
            "p",
            LimitOverrides {
                memory_mb: Some(1),
                ..LimitOverrides::default()
            },
        );

        let sample = sb.begin_execution("p");
        probe.grow(2 * 1024 * 1024);
        let stats = sb.end_execution(sample);
        assert_eq!(stats.memory_used_bytes, 2 * 1024 * 1024);
        assert_eq!(stats.peak_memory_bytes, 1000 + 2 * 1024 * 1024);
        let err = sb.check_execution_limits(&stats).unwrap_err();
        assert_eq!(err.violation_type(), ViolationType::MemoryLimit);

        let stats = ExecutionStats {
            plugin: "p".into(),
            execution_time_ms: 31_000,
            memory_used_bytes: 0,
            peak_memory_bytes: 0,
        };
        let err = sb.check_execution_limits(&stats).unwrap_err();
        assert_eq!(err.violation_type(), ViolationType::ExecutionTime);
    }

    #[test]
    fn nested_samples_do_not_interfere() {
        let probe = FixedMemoryProbe::new(0);
        let sb = ResourceSandbox::new(Arc::new(InMemoryStore::new()))
            .with_memory_probe(Arc::new(probe.clone()));

        let outer = sb.begin_execution("outer");
        probe.grow(100);
        let inner = sb.begin_execution("inner");
        probe.grow(10);
        let inner_stats = sb.end_execution(inner);
        let outer_stats = sb.end_execution(outer);

        assert_eq!(inner_stats.plugin, "inner");
        assert_eq!(inner_stats.memory_used_bytes, 10);
        assert_eq!(outer_stats.plugin, "outer");
        assert_eq!(outer_stats.memory_used_bytes, 110);
    }

    #[test]
    fn storage_quota() {
        let sb = sandbox();
        sb.set_plugin_limits(
            "p",
            LimitOverrides {
                storage_mb: Some(1),
                ..LimitOverrides::default()
            },
        );
        assert!(sb.check_storage("p", 1024).is_ok());
        let err = sb.check_storage("p", 2 * 1024 * 1024).unwrap_err();
        assert_eq!(err.violation_type(), ViolationType::StorageLimit);
    }

    #[test]
    fn domain_checks_use_plugin_whitelist() {
        let sb = sandbox();
        sb.set_plugin_limits(
            "p",
            LimitOverrides {
                network_whitelist: Some(vec!["allowed.com".into(), "*.example.com".into()]),
                ..LimitOverrides::default()
            },
        );
        assert!(sb.is_domain_allowed("p", "allowed.com"));
        assert!(sb.is_domain_allowed("p", "api.example.com"));
        assert!(!sb.is_domain_allowed("p", "blocked.com"));
        assert!(sb.is_domain_allowed("unrestricted", "blocked.com"));
        let err = sb.check_domain("p", "blocked.com").unwrap_err();
        assert_eq!(err.code(), 403);
    }

    #[test]
    fn from_config_applies_sections() {
        let config = hookgate_config::HookgateConfig::from_toml(
            r#"
            [sandbox]
            enabled = false
            enforce_timeout = true
            memory_mb = 16

            [sandbox.plugins.acme]
            memory_mb = 48
        "#,
        )
        .unwrap();
        let sb = ResourceSandbox::from_config(&config.sandbox, Arc::new(InMemoryStore::new()));
        assert!(!sb.is_enabled());
        assert!(sb.enforces_timeout());
        assert_eq!(sb.default_limits().memory_mb, 16);
        assert_eq!(sb.plugin_limits("acme").memory_mb, 48);
        assert_eq!(sb.plugin_limits("other").memory_mb, 16);
    }
}
