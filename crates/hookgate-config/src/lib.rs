#![warn(missing_docs)]

//! # hookgate-config
//!
//! Configuration loading for the hookgate plugin runtime.
//!
//! Supports TOML configuration files with environment variable expansion.
//! Every section and key is optional; absent values fall back to the
//! runtime's built-in defaults.
//!
//! ## Example
//!
//! ```toml
//! [sandbox]
//! enabled = true
//! memory_mb = 64
//! execution_time_seconds = 30
//! hook_executions_per_minute = 1000
//!
//! [sandbox.plugins.acme]
//! memory_mb = 128
//! network_whitelist = ["api.acme.com", "*.cdn.acme.com"]
//!
//! [circuit_breaker]
//! failure_threshold = 5
//! success_threshold = 2
//! recovery_timeout_secs = 60
//!
//! [auto_block]
//! violation_threshold = 10
//! window_secs = 300
//! cooldown_secs = 3600
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Upper bound for every configured window, cooldown and timeout.
pub const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level hookgate configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HookgateConfig {
    /// Resource sandbox settings (`plugin.sandbox.*`).
    #[serde(default)]
    pub sandbox: SandboxOverrides,

    /// Circuit breaker thresholds.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerOverrides,

    /// Automatic blocking of plugins that keep violating limits.
    #[serde(default)]
    pub auto_block: AutoBlockOverrides,
}

/// Per-plugin resource limit overrides.
///
/// The same shape is used for the process-wide defaults and for each entry
/// under `[sandbox.plugins.<slug>]`. Missing keys fall back to the next
/// level up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct LimitOverrides {
    /// Memory growth allowed per invocation, in megabytes.
    #[serde(default)]
    pub memory_mb: Option<u64>,

    /// Wall-clock time allowed per invocation, in seconds.
    #[serde(default)]
    pub execution_time_seconds: Option<u64>,

    /// API requests allowed per one-minute window.
    #[serde(default)]
    pub api_requests_per_minute: Option<u64>,

    /// Hook executions allowed per one-minute window.
    #[serde(default)]
    pub hook_executions_per_minute: Option<u64>,

    /// Persistent storage quota, in megabytes.
    #[serde(default)]
    pub storage_mb: Option<u64>,

    /// Outbound network requests allowed per one-minute window.
    #[serde(default)]
    pub network_requests_per_minute: Option<u64>,

    /// Domains the plugin may contact. `*.example.com` matches any subdomain.
    /// An empty or absent list allows every domain.
    #[serde(default)]
    pub network_whitelist: Option<Vec<String>>,
}

/// Sandbox configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SandboxOverrides {
    /// Global kill-switch. When false every sandbox check is a no-op.
    #[serde(default)]
    pub enabled: Option<bool>,

    /// Cancel plugin callbacks that exceed their execution time at their next
    /// await point, instead of only reporting the overrun afterwards.
    #[serde(default)]
    pub enforce_timeout: Option<bool>,

    /// Default memory budget in megabytes.
    #[serde(default)]
    pub memory_mb: Option<u64>,

    /// Default execution time budget in seconds.
    #[serde(default)]
    pub execution_time_seconds: Option<u64>,

    /// Default API requests per minute.
    #[serde(default)]
    pub api_requests_per_minute: Option<u64>,

    /// Default hook executions per minute.
    #[serde(default)]
    pub hook_executions_per_minute: Option<u64>,

    /// Default storage quota in megabytes.
    #[serde(default)]
    pub storage_mb: Option<u64>,

    /// Default outbound network requests per minute.
    #[serde(default)]
    pub network_requests_per_minute: Option<u64>,

    /// Default network whitelist.
    #[serde(default)]
    pub network_whitelist: Option<Vec<String>>,

    /// Per-plugin overrides, keyed by plugin slug.
    #[serde(default)]
    pub plugins: HashMap<String, LimitOverrides>,
}

impl SandboxOverrides {
    /// The process-wide default overrides as a [`LimitOverrides`].
    pub fn defaults(&self) -> LimitOverrides {
        LimitOverrides {
            memory_mb: self.memory_mb,
            execution_time_seconds: self.execution_time_seconds,
            api_requests_per_minute: self.api_requests_per_minute,
            hook_executions_per_minute: self.hook_executions_per_minute,
            storage_mb: self.storage_mb,
            network_requests_per_minute: self.network_requests_per_minute,
            network_whitelist: self.network_whitelist.clone(),
        }
    }
}

/// Circuit breaker configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CircuitBreakerOverrides {
    /// Failures in the closed state before the circuit opens.
    #[serde(default)]
    pub failure_threshold: Option<u32>,

    /// Successes in the half-open state before the circuit closes.
    #[serde(default)]
    pub success_threshold: Option<u32>,

    /// Seconds an open circuit waits before admitting a trial call.
    #[serde(default)]
    pub recovery_timeout_secs: Option<u64>,
}

/// Auto-block policy overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AutoBlockOverrides {
    /// Set to false to disable automatic blocking entirely.
    #[serde(default)]
    pub enabled: Option<bool>,

    /// Violations within the window that trigger a block.
    #[serde(default)]
    pub violation_threshold: Option<u64>,

    /// Length of the violation counting window, in seconds.
    #[serde(default)]
    pub window_secs: Option<u64>,

    /// How long a triggered block lasts, in seconds.
    #[serde(default)]
    pub cooldown_secs: Option<u64>,
}

impl HookgateConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: HookgateConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let cb = &self.circuit_breaker;
        if cb.failure_threshold == Some(0) {
            return Err(ConfigError::Invalid(
                "circuit_breaker.failure_threshold must be at least 1".into(),
            ));
        }
        if cb.success_threshold == Some(0) {
            return Err(ConfigError::Invalid(
                "circuit_breaker.success_threshold must be at least 1".into(),
            ));
        }

        let ab = &self.auto_block;
        if ab.violation_threshold == Some(0) {
            return Err(ConfigError::Invalid(
                "auto_block.violation_threshold must be at least 1".into(),
            ));
        }
        if ab.window_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "auto_block.window_secs must be at least 1".into(),
            ));
        }
        for (name, secs) in [
            ("auto_block.window_secs", ab.window_secs),
            ("auto_block.cooldown_secs", ab.cooldown_secs),
            ("circuit_breaker.recovery_timeout_secs", cb.recovery_timeout_secs),
        ] {
            if secs.is_some_and(|s| s > MAX_DURATION_SECS) {
                return Err(ConfigError::Invalid(format!(
                    "{} must be at most {} (one year)",
                    name, MAX_DURATION_SECS
                )));
            }
        }

        if self.sandbox.execution_time_seconds == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.execution_time_seconds must be at least 1".into(),
            ));
        }

        validate_whitelist("sandbox", self.sandbox.network_whitelist.as_deref())?;
        for (slug, limits) in &self.sandbox.plugins {
            if slug.is_empty() || slug.contains(':') {
                return Err(ConfigError::Invalid(format!(
                    "plugin slug '{}' must be non-empty and must not contain ':'",
                    slug
                )));
            }
            validate_whitelist(
                &format!("sandbox.plugins.{}", slug),
                limits.network_whitelist.as_deref(),
            )?;
        }
        Ok(())
    }
}

fn validate_whitelist(section: &str, entries: Option<&[String]>) -> Result<(), ConfigError> {
    for entry in entries.unwrap_or_default() {
        let valid = match entry.strip_prefix("*.") {
            Some(suffix) => !suffix.is_empty() && !suffix.contains('*'),
            None => !entry.is_empty() && !entry.contains('*'),
        };
        if !valid {
            return Err(ConfigError::Invalid(format!(
                "{}.network_whitelist: invalid domain pattern '{}' (expected 'host' or '*.suffix')",
                section, entry
            )));
        }
    }
    Ok(())
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                // Unresolved placeholders are kept verbatim
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(ch);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_empty_is_valid() {
        let config = HookgateConfig::from_toml("").unwrap();
        assert!(config.sandbox.enabled.is_none());
        assert!(config.sandbox.plugins.is_empty());
        assert!(config.circuit_breaker.failure_threshold.is_none());
        assert!(config.auto_block.violation_threshold.is_none());
    }

    #[test]
    fn config_parses_sandbox_defaults() {
        let toml = r#"
            [sandbox]
            enabled = true
            memory_mb = 32
            execution_time_seconds = 10
            hook_executions_per_minute = 500
            network_whitelist = ["api.example.com"]
        "#;

        let config = HookgateConfig::from_toml(toml).unwrap();
        assert_eq!(config.sandbox.enabled, Some(true));
        let defaults = config.sandbox.defaults();
        assert_eq!(defaults.memory_mb, Some(32));
        assert_eq!(defaults.execution_time_seconds, Some(10));
        assert_eq!(defaults.hook_executions_per_minute, Some(500));
        assert!(defaults.api_requests_per_minute.is_none());
        assert_eq!(
            defaults.network_whitelist,
            Some(vec!["api.example.com".to_string()])
        );
    }

    #[test]
    fn config_parses_plugin_overrides() {
        let toml = r#"
            [sandbox.plugins.acme]
            memory_mb = 128
            network_whitelist = ["api.acme.com", "*.cdn.acme.com"]

            [sandbox.plugins.seo-tools]
            api_requests_per_minute = 10
        "#;

        let config = HookgateConfig::from_toml(toml).unwrap();
        assert_eq!(config.sandbox.plugins.len(), 2);
        let acme = &config.sandbox.plugins["acme"];
        assert_eq!(acme.memory_mb, Some(128));
        assert_eq!(acme.network_whitelist.as_ref().unwrap().len(), 2);
        assert_eq!(
            config.sandbox.plugins["seo-tools"].api_requests_per_minute,
            Some(10)
        );
    }

    #[test]
    fn config_parses_breaker_and_auto_block() {
        let toml = r#"
            [circuit_breaker]
            failure_threshold = 3
            success_threshold = 1
            recovery_timeout_secs = 120

            [auto_block]
            violation_threshold = 4
            window_secs = 60
            cooldown_secs = 900
        "#;

        let config = HookgateConfig::from_toml(toml).unwrap();
        assert_eq!(config.circuit_breaker.failure_threshold, Some(3));
        assert_eq!(config.circuit_breaker.success_threshold, Some(1));
        assert_eq!(config.circuit_breaker.recovery_timeout_secs, Some(120));
        assert_eq!(config.auto_block.violation_threshold, Some(4));
        assert_eq!(config.auto_block.window_secs, Some(60));
        assert_eq!(config.auto_block.cooldown_secs, Some(900));
    }

    #[test]
    fn config_rejects_zero_failure_threshold() {
        let err = HookgateConfig::from_toml("[circuit_breaker]\nfailure_threshold = 0").unwrap_err();
        assert!(err.to_string().contains("failure_threshold"), "got: {err}");
    }

    #[test]
    fn config_rejects_zero_window() {
        let err = HookgateConfig::from_toml("[auto_block]\nwindow_secs = 0").unwrap_err();
        assert!(err.to_string().contains("window_secs"), "got: {err}");
    }

    #[test]
    fn config_rejects_unbounded_cooldown() {
        let err = HookgateConfig::from_toml("[auto_block]\ncooldown_secs = 9223372036854775807")
            .unwrap_err();
        assert!(err.to_string().contains("cooldown_secs"), "got: {err}");

        let ok = format!("[auto_block]\ncooldown_secs = {MAX_DURATION_SECS}");
        assert!(HookgateConfig::from_toml(&ok).is_ok());
    }

    #[test]
    fn config_rejects_malformed_wildcard() {
        let toml = r#"
            [sandbox.plugins.acme]
            network_whitelist = ["api.*.com"]
        "#;
        let err = HookgateConfig::from_toml(toml).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("api.*.com"), "should name the pattern: {msg}");
        assert!(msg.contains("sandbox.plugins.acme"), "should name the section: {msg}");
    }

    #[test]
    fn config_rejects_bare_star() {
        let err = HookgateConfig::from_toml("[sandbox]\nnetwork_whitelist = [\"*.\"]").unwrap_err();
        assert!(err.to_string().contains("*."));
    }

    #[test]
    fn config_rejects_slug_with_colon() {
        let toml = r#"
            [sandbox.plugins."a:b"]
            memory_mb = 1
        "#;
        let err = HookgateConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("a:b"));
    }

    #[test]
    fn config_rejects_unknown_types() {
        let err = HookgateConfig::from_toml("[sandbox]\nmemory_mb = \"lots\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn config_expands_environment_variables() {
        std::env::set_var("HOOKGATE_TEST_API_HOST", "api.internal.test");
        let toml = r#"
            [sandbox]
            network_whitelist = ["${HOOKGATE_TEST_API_HOST}"]
        "#;

        let config = HookgateConfig::from_toml_with_env(toml).unwrap();
        assert_eq!(
            config.sandbox.network_whitelist,
            Some(vec!["api.internal.test".to_string()])
        );
        std::env::remove_var("HOOKGATE_TEST_API_HOST");
    }

    #[test]
    fn config_loads_from_file() {
        let dir = std::env::temp_dir().join("hookgate-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("hookgate.toml");
        std::fs::write(
            &path,
            r#"
            [sandbox]
            enabled = false
        "#,
        )
        .unwrap();

        let config = HookgateConfig::from_file(&path).unwrap();
        assert_eq!(config.sandbox.enabled, Some(false));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn env_var_expansion_preserves_unresolved() {
        let result = expand_env_vars("prefix ${DEFINITELY_NOT_SET_12345} suffix");
        assert_eq!(result, "prefix ${DEFINITELY_NOT_SET_12345} suffix");
    }

    #[test]
    fn env_var_expansion_handles_no_vars() {
        assert_eq!(expand_env_vars("no variables here"), "no variables here");
    }
}
