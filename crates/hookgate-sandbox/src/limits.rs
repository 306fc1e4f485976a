//! Per-plugin resource limits.

use std::time::Duration;

use hookgate_config::LimitOverrides;
use serde::Serialize;

const MB: u64 = 1024 * 1024;

/// Effective resource ceilings for one plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxLimits {
    /// Memory growth allowed per invocation, in megabytes.
    pub memory_mb: u64,
    /// Wall-clock time allowed per invocation, in seconds.
    pub execution_time_seconds: u64,
    /// API requests allowed per one-minute window.
    pub api_requests_per_minute: u64,
    /// Hook executions allowed per one-minute window.
    pub hook_executions_per_minute: u64,
    /// Persistent storage quota, in megabytes.
    pub storage_mb: u64,
    /// Outbound network requests allowed per one-minute window.
    pub network_requests_per_minute: u64,
    /// Domains the plugin may contact; empty allows all.
    pub network_whitelist: Vec<String>,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            memory_mb: 64,
            execution_time_seconds: 30,
            api_requests_per_minute: 60,
            hook_executions_per_minute: 1000,
            storage_mb: 100,
            network_requests_per_minute: 30,
            network_whitelist: Vec::new(),
        }
    }
}

impl SandboxLimits {
    /// Layer `overrides` on top of `self`; absent keys keep the current value.
    pub fn merged(&self, overrides: &LimitOverrides) -> Self {
        Self {
            memory_mb: overrides.memory_mb.unwrap_or(self.memory_mb),
            execution_time_seconds: overrides
                .execution_time_seconds
                .unwrap_or(self.execution_time_seconds),
            api_requests_per_minute: overrides
                .api_requests_per_minute
                .unwrap_or(self.api_requests_per_minute),
            hook_executions_per_minute: overrides
                .hook_executions_per_minute
                .unwrap_or(self.hook_executions_per_minute),
            storage_mb: overrides.storage_mb.unwrap_or(self.storage_mb),
            network_requests_per_minute: overrides
                .network_requests_per_minute
                .unwrap_or(self.network_requests_per_minute),
            network_whitelist: overrides
                .network_whitelist
                .clone()
                .unwrap_or_else(|| self.network_whitelist.clone()),
        }
    }

    /// Memory budget in bytes.
    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb.saturating_mul(MB)
    }

    /// Storage quota in bytes.
    pub fn storage_bytes(&self) -> u64 {
        self.storage_mb.saturating_mul(MB)
    }

    /// Execution time budget.
    pub fn execution_time(&self) -> Duration {
        Duration::from_secs(self.execution_time_seconds)
    }
}
