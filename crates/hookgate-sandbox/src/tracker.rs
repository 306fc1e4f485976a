//! Auto-block escalation.
//!
//! Counts violations per plugin in a fixed window and blocks the plugin for
//! a cooldown once the count reaches the threshold. `plugin_blocked`
//! violations are never counted, so a blocked plugin cannot extend its own
//! block by being refused.

use std::sync::Arc;
use std::time::Duration;

use hookgate_config::AutoBlockOverrides;
use hookgate_error::{SandboxViolation, ViolationType};

use crate::sandbox::ResourceSandbox;

const VIOLATION_PREFIX: &str = "sandbox:violations:";

/// When to escalate repeated violations into a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoBlockPolicy {
    /// Violations within `window` that trigger a block.
    pub violation_threshold: u64,
    /// Counting window.
    pub window: Duration,
    /// Block duration once triggered.
    pub cooldown: Duration,
}

impl Default for AutoBlockPolicy {
    fn default() -> Self {
        Self {
            violation_threshold: 10,
            window: Duration::from_secs(300),
            cooldown: Duration::from_secs(3600),
        }
    }
}

impl AutoBlockPolicy {
    /// Build the policy from the `[auto_block]` section; `None` when disabled.
    pub fn from_config(config: &AutoBlockOverrides) -> Option<Self> {
        if config.enabled == Some(false) {
            return None;
        }
        let defaults = Self::default();
        Some(Self {
            violation_threshold: config
                .violation_threshold
                .unwrap_or(defaults.violation_threshold),
            window: config
                .window_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.window),
            cooldown: config
                .cooldown_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.cooldown),
        })
    }
}

/// Counts violations and blocks plugins that cross the policy threshold.
pub struct ViolationTracker {
    policy: AutoBlockPolicy,
    sandbox: Arc<ResourceSandbox>,
}

impl ViolationTracker {
    /// Create a tracker that blocks through `sandbox`.
    pub fn new(policy: AutoBlockPolicy, sandbox: Arc<ResourceSandbox>) -> Self {
        Self { policy, sandbox }
    }

    /// The active policy.
    pub fn policy(&self) -> &AutoBlockPolicy {
        &self.policy
    }

    /// Count `violation`. Returns true when this violation caused a block.
    pub async fn record(&self, violation: &SandboxViolation) -> bool {
        if violation.violation_type() == ViolationType::PluginBlocked {
            return false;
        }
        let plugin = violation.plugin();
        let key = format!("{VIOLATION_PREFIX}{plugin}");
        let store = self.sandbox.store();

        let count = match store.increment(&key, Some(self.policy.window)).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(plugin, error = %e, "violation not counted: store unavailable");
                return false;
            }
        };
        if (count.max(0) as u64) < self.policy.violation_threshold {
            tracing::debug!(plugin, count, "violation counted");
            return false;
        }

        if let Err(e) = self.sandbox.block_plugin(plugin, self.policy.cooldown).await {
            tracing::warn!(plugin, error = %e, "failed to block plugin");
            return false;
        }
        // Start the next episode from zero once the block lapses
        if let Err(e) = store.delete(&key).await {
            tracing::debug!(plugin, error = %e, "failed to reset violation counter");
        }
        tracing::warn!(
            plugin,
            violations = count,
            cooldown_secs = self.policy.cooldown.as_secs(),
            "plugin auto-blocked after repeated violations"
        );
        true
    }

    /// Violations counted in the current window.
    pub async fn count(&self, plugin: &str) -> u64 {
        let key = format!("{VIOLATION_PREFIX}{plugin}");
        match self.sandbox.store().get(&key).await {
            Ok(value) => value.and_then(|v| v.as_u64()).unwrap_or(0),
            Err(_) => 0,
        }
    }
}
