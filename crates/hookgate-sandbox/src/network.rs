//! Pre-flight checks for outbound plugin network requests.
//!
//! HTTP client wrappers handed to plugins construct a [`NetworkGuard`] for
//! the owning plugin and call [`NetworkGuard::check_url`] before every
//! request, so violations are attributed to the right plugin.

use std::sync::Arc;

use hookgate_error::SandboxViolation;
use url::Url;

use crate::sandbox::{RateCounter, ResourceSandbox};
use crate::tracker::ViolationTracker;

/// Errors from [`NetworkGuard::check_url`].
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// The URL could not be parsed or has no host.
    #[error("invalid request url '{url}': {reason}")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },
    /// A sandbox limit refused the request.
    #[error(transparent)]
    Violation(#[from] SandboxViolation),
}

/// Outbound request gate bound to a single plugin.
pub struct NetworkGuard {
    sandbox: Arc<ResourceSandbox>,
    tracker: Option<Arc<ViolationTracker>>,
    plugin: String,
}

impl NetworkGuard {
    /// Create a guard attributing requests to `plugin`.
    pub fn for_plugin(sandbox: Arc<ResourceSandbox>, plugin: impl Into<String>) -> Self {
        Self {
            sandbox,
            tracker: None,
            plugin: plugin.into(),
        }
    }

    /// Count refusals towards the auto-block policy.
    pub fn with_tracker(mut self, tracker: Arc<ViolationTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// The plugin requests are attributed to.
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Check a request to `domain`: block list, whitelist, then rate.
    ///
    /// Only requests that pass the whitelist consume rate budget.
    pub async fn check_domain(&self, domain: &str) -> Result<(), SandboxViolation> {
        let result = self.evaluate(domain).await;
        if let (Err(violation), Some(tracker)) = (&result, &self.tracker) {
            tracker.record(violation).await;
        }
        result
    }

    /// Parse `url` and check its host.
    pub async fn check_url(&self, url: &str) -> Result<(), NetworkError> {
        let parsed = Url::parse(url).map_err(|e| NetworkError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let host = parsed.host_str().ok_or_else(|| NetworkError::InvalidUrl {
            url: url.to_string(),
            reason: "url has no host".into(),
        })?;
        self.check_domain(host).await?;
        Ok(())
    }

    async fn evaluate(&self, domain: &str) -> Result<(), SandboxViolation> {
        if self.sandbox.is_blocked(&self.plugin).await {
            let until = self.sandbox.blocked_until(&self.plugin).await.ok().flatten();
            return Err(SandboxViolation::plugin_blocked(&self.plugin, until));
        }
        self.sandbox.check_domain(&self.plugin, domain)?;
        self.sandbox
            .check_rate_limits(&self.plugin, RateCounter::NetworkRequests)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::tracker::AutoBlockPolicy;
    use hookgate_config::LimitOverrides;
    use hookgate_error::ViolationType;
    use std::time::Duration;

    fn sandbox() -> Arc<ResourceSandbox> {
        let sandbox = ResourceSandbox::new(Arc::new(InMemoryStore::new()));
        sandbox.set_plugin_limits(
            "acme",
            LimitOverrides {
                network_requests_per_minute: Some(2),
                network_whitelist: Some(vec!["api.acme.com".into(), "*.cdn.acme.com".into()]),
                ..LimitOverrides::default()
            },
        );
        Arc::new(sandbox)
    }

    #[tokio::test]
    async fn allows_whitelisted_url() {
        let guard = NetworkGuard::for_plugin(sandbox(), "acme");
        guard.check_url("https://api.acme.com/v1/items").await.unwrap();
        guard
            .check_url("https://img.cdn.acme.com/logo.png")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rejects_domain_outside_whitelist() {
        let guard = NetworkGuard::for_plugin(sandbox(), "acme");
        let err = guard.check_url("https://evil.com/steal").await.unwrap_err();
        match err {
            NetworkError::Violation(v) => {
                assert_eq!(v.violation_type(), ViolationType::DomainBlocked);
                assert_eq!(v.plugin(), "acme");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn rejects_over_rate() {
        let guard = NetworkGuard::for_plugin(sandbox(), "acme");
        guard.check_domain("api.acme.com").await.unwrap();
        guard.check_domain("api.acme.com").await.unwrap();
        let err = guard.check_domain("api.acme.com").await.unwrap_err();
        assert_eq!(err.violation_type(), ViolationType::NetworkLimit);
    }

    #[tokio::test]
    async fn rejects_blocked_plugin() {
        let sandbox = sandbox();
        sandbox
            .block_plugin("acme", Duration::from_secs(60))
            .await
            .unwrap();
        let guard = NetworkGuard::for_plugin(sandbox, "acme");
        let err = guard.check_domain("api.acme.com").await.unwrap_err();
        assert_eq!(err.violation_type(), ViolationType::PluginBlocked);
        assert!(err.details().contains_key("blocked_until"));
    }

    #[tokio::test]
    async fn rejects_unparseable_url() {
        let guard = NetworkGuard::for_plugin(sandbox(), "acme");
        let err = guard.check_url("not a url").await.unwrap_err();
        assert!(matches!(err, NetworkError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn refusals_feed_auto_block() {
        let sandbox = sandbox();
        let tracker = Arc::new(ViolationTracker::new(
            AutoBlockPolicy {
                violation_threshold: 2,
                ..AutoBlockPolicy::default()
            },
            sandbox.clone(),
        ));
        let guard = NetworkGuard::for_plugin(sandbox.clone(), "acme").with_tracker(tracker);
        let _ = guard.check_domain("evil.com").await;
        let _ = guard.check_domain("evil.com").await;
        assert!(sandbox.is_blocked("acme").await);
    }
}
