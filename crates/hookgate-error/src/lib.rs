#![warn(missing_docs)]

//! Typed error types for the hookgate plugin runtime.
//!
//! Provides [`SandboxViolation`], the closed taxonomy of resource-limit
//! crossings raised by the sandbox, and [`HookError`], the per-callback
//! failure type threaded through guarded hook dispatch.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// The kind of limit a plugin crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationType {
    /// Too many API requests or hook executions in the current window.
    RateLimit,
    /// A single invocation grew process memory past the plugin's budget.
    MemoryLimit,
    /// A single invocation ran longer than the plugin's time budget.
    ExecutionTime,
    /// The plugin's persisted data exceeds its storage quota.
    StorageLimit,
    /// Too many outbound network requests in the current window.
    NetworkLimit,
    /// An outbound request targeted a domain outside the plugin's whitelist.
    DomainBlocked,
    /// The plugin is on the temporary block list.
    PluginBlocked,
}

impl ViolationType {
    /// All violation kinds, in declaration order.
    pub const ALL: [ViolationType; 7] = [
        Self::RateLimit,
        Self::MemoryLimit,
        Self::ExecutionTime,
        Self::StorageLimit,
        Self::NetworkLimit,
        Self::DomainBlocked,
        Self::PluginBlocked,
    ];

    /// Machine-readable name used in logs and audit payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::MemoryLimit => "memory_limit",
            Self::ExecutionTime => "execution_time",
            Self::StorageLimit => "storage_limit",
            Self::NetworkLimit => "network_limit",
            Self::DomainBlocked => "domain_blocked",
            Self::PluginBlocked => "plugin_blocked",
        }
    }

    /// HTTP-status-like severity code.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::RateLimit | Self::MemoryLimit | Self::StorageLimit | Self::NetworkLimit => 429,
            Self::ExecutionTime => 408,
            Self::DomainBlocked => 403,
            Self::PluginBlocked => 503,
        }
    }
}

impl fmt::Display for ViolationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected crossing of a sandbox limit by a plugin.
///
/// Always recoverable at the call site: the offending callback is skipped or
/// its result discarded, and dispatch continues.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct SandboxViolation {
    plugin: String,
    violation_type: ViolationType,
    message: String,
    details: Map<String, Value>,
}

impl SandboxViolation {
    fn new(
        plugin: &str,
        violation_type: ViolationType,
        message: String,
        details: Map<String, Value>,
    ) -> Self {
        Self {
            plugin: plugin.to_string(),
            violation_type,
            message,
            details,
        }
    }

    /// A rolling-window counter (`api_requests`, `hook_executions`, ...) overflowed.
    pub fn rate_limit_exceeded(plugin: &str, limit_type: &str, limit: u64) -> Self {
        let mut details = Map::new();
        details.insert("limit_type".into(), Value::from(limit_type));
        details.insert("limit".into(), Value::from(limit));
        details.insert("window_seconds".into(), Value::from(60));
        Self::new(
            plugin,
            ViolationType::RateLimit,
            format!("plugin '{plugin}' exceeded rate limit for {limit_type} ({limit} per minute)"),
            details,
        )
    }

    /// An invocation grew memory by `used_bytes`, above `limit_bytes`.
    pub fn memory_limit_exceeded(plugin: &str, used_bytes: u64, limit_bytes: u64) -> Self {
        let mut details = Map::new();
        details.insert("used_bytes".into(), Value::from(used_bytes));
        details.insert("limit_bytes".into(), Value::from(limit_bytes));
        Self::new(
            plugin,
            ViolationType::MemoryLimit,
            format!(
                "plugin '{plugin}' exceeded memory limit ({} MB used, limit {} MB)",
                used_bytes / (1024 * 1024),
                limit_bytes / (1024 * 1024)
            ),
            details,
        )
    }

    /// An invocation ran for `elapsed`, longer than `limit`.
    pub fn execution_time_exceeded(plugin: &str, elapsed: Duration, limit: Duration) -> Self {
        let mut details = Map::new();
        details.insert(
            "execution_time_ms".into(),
            Value::from(elapsed.as_millis() as u64),
        );
        details.insert("limit_ms".into(), Value::from(limit.as_millis() as u64));
        Self::new(
            plugin,
            ViolationType::ExecutionTime,
            format!(
                "plugin '{plugin}' exceeded execution time limit ({}ms, limit {}ms)",
                elapsed.as_millis(),
                limit.as_millis()
            ),
            details,
        )
    }

    /// The plugin's stored data (`used_bytes`) exceeds its quota.
    pub fn storage_limit_exceeded(plugin: &str, used_bytes: u64, limit_bytes: u64) -> Self {
        let mut details = Map::new();
        details.insert("used_bytes".into(), Value::from(used_bytes));
        details.insert("limit_bytes".into(), Value::from(limit_bytes));
        Self::new(
            plugin,
            ViolationType::StorageLimit,
            format!(
                "plugin '{plugin}' exceeded storage limit ({used_bytes} bytes, limit {limit_bytes} bytes)"
            ),
            details,
        )
    }

    /// Outbound network requests overflowed the per-minute budget.
    pub fn network_limit_exceeded(plugin: &str, limit: u64) -> Self {
        let mut details = Map::new();
        details.insert("limit".into(), Value::from(limit));
        details.insert("window_seconds".into(), Value::from(60));
        Self::new(
            plugin,
            ViolationType::NetworkLimit,
            format!("plugin '{plugin}' exceeded network request limit ({limit} per minute)"),
            details,
        )
    }

    /// An outbound request targeted a domain the plugin may not reach.
    pub fn domain_blocked(plugin: &str, domain: &str) -> Self {
        let mut details = Map::new();
        details.insert("domain".into(), Value::from(domain));
        Self::new(
            plugin,
            ViolationType::DomainBlocked,
            format!("plugin '{plugin}' is not allowed to access domain '{domain}'"),
            details,
        )
    }

    /// The plugin is blocked, optionally until `until`.
    pub fn plugin_blocked(plugin: &str, until: Option<DateTime<Utc>>) -> Self {
        let mut details = Map::new();
        if let Some(until) = until {
            details.insert("blocked_until".into(), Value::from(until.to_rfc3339()));
        }
        Self::new(
            plugin,
            ViolationType::PluginBlocked,
            format!("plugin '{plugin}' is temporarily blocked due to repeated violations"),
            details,
        )
    }

    /// Slug of the offending plugin.
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// The violation kind.
    pub fn violation_type(&self) -> ViolationType {
        self.violation_type
    }

    /// HTTP-status-like severity code.
    pub fn code(&self) -> u16 {
        self.violation_type.status_code()
    }

    /// Structured detail fields.
    pub fn details(&self) -> &Map<String, Value> {
        &self.details
    }

    /// Stable JSON shape for logging and audit collaborators.
    pub fn to_structured(&self) -> Value {
        serde_json::json!({
            "error": true,
            "plugin": self.plugin,
            "violation_type": self.violation_type.as_str(),
            "code": self.code(),
            "message": self.message,
            "details": self.details,
        })
    }
}

/// Why a single guarded callback application produced no value.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HookError {
    /// The callback returned an error.
    #[error("callback failed: {0}")]
    Callback(#[from] anyhow::Error),

    /// The callback panicked; the payload message is captured when it is a string.
    #[error("callback panicked: {0}")]
    Panicked(String),

    /// A sandbox check refused the call before it ran, or the call was cancelled
    /// by the sandbox.
    #[error(transparent)]
    Violation(#[from] SandboxViolation),

    /// The circuit breaker for this plugin and hook is open.
    #[error("circuit breaker open: {key}")]
    CircuitOpen {
        /// The circuit key (`plugin:hook` or `core:hook`).
        key: String,
    },
}

impl HookError {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Callback(_) => "CALLBACK_FAILED",
            Self::Panicked(_) => "CALLBACK_PANICKED",
            Self::Violation(_) => "SANDBOX_VIOLATION",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
        }
    }

    /// True when the callback was never invoked.
    pub fn is_refusal(&self) -> bool {
        match self {
            Self::CircuitOpen { .. } => true,
            Self::Violation(v) => matches!(
                v.violation_type(),
                ViolationType::PluginBlocked | ViolationType::RateLimit
            ),
            Self::Callback(_) | Self::Panicked(_) => false,
        }
    }
}

// Compile-time assertion: both error types cross task boundaries.
const _: fn() = || {
    fn assert_bounds<T: Send + Sync + 'static>() {}
    assert_bounds::<SandboxViolation>();
    assert_bounds::<HookError>();
};
