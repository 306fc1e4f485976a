//! The hook manager: registration tables and dispatch entry points.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hookgate_audit::{AuditSink, NoopAuditSink};
use hookgate_breaker::{CircuitBreaker, CircuitBreakerConfig};
use hookgate_config::HookgateConfig;
#[cfg(feature = "metrics")]
use hookgate_sandbox::metrics::GuardMetrics;
use hookgate_sandbox::{
    AutoBlockPolicy, InMemoryStore, NetworkGuard, ResourceSandbox, SharedCounterStore,
    ViolationTracker,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::callback::HookCallback;
use crate::context::DispatchContext;
use crate::guard::Guard;
use crate::registry::{CallbackId, HookTable, Registration};

/// Registers action and filter callbacks and dispatches hooks through the
/// sandbox and circuit breaker.
///
/// Registration and lookup take short-lived locks; dispatch works on a
/// snapshot of the callback list, so callbacks may register or remove
/// callbacks (including on the running hook) without affecting the dispatch
/// already in progress.
pub struct HookManager {
    actions: RwLock<HookTable>,
    filters: RwLock<HookTable>,
    next_sequence: AtomicU64,
    plugin_context: RwLock<Option<String>>,
    action_counts: Mutex<HashMap<String, u64>>,
    guard: RwLock<Guard>,
    auto_block: Option<AutoBlockPolicy>,
}

impl HookManager {
    /// Create a manager guarded by `sandbox` and `breaker`, with auto-block
    /// disabled and no audit sink.
    pub fn new(sandbox: Arc<ResourceSandbox>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            actions: RwLock::new(HookTable::default()),
            filters: RwLock::new(HookTable::default()),
            next_sequence: AtomicU64::new(0),
            plugin_context: RwLock::new(None),
            action_counts: Mutex::new(HashMap::new()),
            guard: RwLock::new(Guard {
                sandbox,
                breaker,
                tracker: None,
                audit: Arc::new(NoopAuditSink),
                #[cfg(feature = "metrics")]
                metrics: None,
            }),
            auto_block: None,
        }
    }

    /// A single-process manager over an [`InMemoryStore`] with default
    /// limits, thresholds and auto-block policy.
    pub fn in_memory() -> Self {
        Self::from_config(
            &HookgateConfig::default(),
            Arc::new(InMemoryStore::new()),
            Arc::new(NoopAuditSink),
        )
    }

    /// Wire a manager from configuration. `audit` receives violations,
    /// circuit transitions, block-list changes and callback failures.
    pub fn from_config(
        config: &HookgateConfig,
        store: Arc<dyn SharedCounterStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let sandbox = ResourceSandbox::from_config(&config.sandbox, store.clone())
            .with_audit_sink(audit.clone());
        let breaker = CircuitBreaker::new(
            store,
            CircuitBreakerConfig::from(&config.circuit_breaker),
        )
        .with_audit_sink(audit.clone());

        let manager = Self::new(Arc::new(sandbox), Arc::new(breaker)).with_audit_sink(audit);
        match AutoBlockPolicy::from_config(&config.auto_block) {
            Some(policy) => manager.with_auto_block(policy),
            None => manager,
        }
    }

    /// Block plugins that keep violating limits.
    pub fn with_auto_block(mut self, policy: AutoBlockPolicy) -> Self {
        {
            let guard = self.guard.get_mut();
            guard.tracker = Some(Arc::new(ViolationTracker::new(
                policy.clone(),
                guard.sandbox.clone(),
            )));
        }
        self.auto_block = Some(policy);
        self
    }

    /// Emit dispatch violations and callback failures to `sink`.
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.guard.get_mut().audit = sink;
        self
    }

    /// Record guarded-call outcomes to Prometheus.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<GuardMetrics>) -> Self {
        self.guard.get_mut().metrics = Some(metrics);
        self
    }

    /// Swap the sandbox. Takes effect for callbacks started afterwards.
    pub fn set_sandbox(&self, sandbox: Arc<ResourceSandbox>) {
        let mut guard = self.guard.write();
        guard.tracker = self
            .auto_block
            .clone()
            .map(|policy| Arc::new(ViolationTracker::new(policy, sandbox.clone())));
        guard.sandbox = sandbox;
    }

    /// Swap the circuit breaker. Takes effect for callbacks started afterwards.
    pub fn set_circuit_breaker(&self, breaker: Arc<CircuitBreaker>) {
        self.guard.write().breaker = breaker;
    }

    /// The active sandbox.
    pub fn sandbox(&self) -> Arc<ResourceSandbox> {
        self.guard.read().sandbox.clone()
    }

    /// The active circuit breaker.
    pub fn circuit_breaker(&self) -> Arc<CircuitBreaker> {
        self.guard.read().breaker.clone()
    }

    /// The auto-block tracker, when auto-block is enabled.
    pub fn violation_tracker(&self) -> Option<Arc<ViolationTracker>> {
        self.guard.read().tracker.clone()
    }

    /// An outbound request gate for `plugin`, counting refusals towards
    /// auto-block.
    pub fn network_guard(&self, plugin: &str) -> NetworkGuard {
        let guard = self.guard.read();
        let network = NetworkGuard::for_plugin(guard.sandbox.clone(), plugin);
        match &guard.tracker {
            Some(tracker) => network.with_tracker(tracker.clone()),
            None => network,
        }
    }

    /// Attribute subsequent `add_action` / `add_filter` calls to `plugin`
    /// (`None` for host code). The plugin loader sets this around each
    /// plugin's registration code and clears it afterwards.
    pub fn set_plugin_context(&self, plugin: Option<&str>) {
        *self.plugin_context.write() = plugin.map(str::to_string);
    }

    /// The plugin new registrations are attributed to.
    pub fn plugin_context(&self) -> Option<String> {
        self.plugin_context.read().clone()
    }

    /// A registrar bound to `owner`, independent of the ambient context.
    pub fn scoped(&self, owner: Option<&str>) -> PluginScope<'_> {
        PluginScope {
            manager: self,
            owner: owner.map(str::to_string),
        }
    }

    /// Register an action callback under the current plugin context.
    pub fn add_action(
        &self,
        hook: &str,
        callback: Arc<dyn HookCallback>,
        priority: i32,
    ) -> CallbackId {
        let owner = self.plugin_context();
        self.register(&self.actions, hook, callback, priority, owner)
    }

    /// Register a filter callback under the current plugin context.
    pub fn add_filter(
        &self,
        hook: &str,
        callback: Arc<dyn HookCallback>,
        priority: i32,
    ) -> CallbackId {
        let owner = self.plugin_context();
        self.register(&self.filters, hook, callback, priority, owner)
    }

    /// Remove an action callback. When `priority` is given it must match the
    /// registration. Returns whether anything was removed.
    pub fn remove_action(&self, hook: &str, id: CallbackId, priority: Option<i32>) -> bool {
        self.actions.write().remove(hook, id, priority)
    }

    /// Remove a filter callback. See [`remove_action`](Self::remove_action).
    pub fn remove_filter(&self, hook: &str, id: CallbackId, priority: Option<i32>) -> bool {
        self.filters.write().remove(hook, id, priority)
    }

    /// Remove all action callbacks on `hook`, or only those at `priority`.
    pub fn remove_all_actions(&self, hook: &str, priority: Option<i32>) -> usize {
        self.actions.write().remove_all(hook, priority)
    }

    /// Remove all filter callbacks on `hook`, or only those at `priority`.
    pub fn remove_all_filters(&self, hook: &str, priority: Option<i32>) -> usize {
        self.filters.write().remove_all(hook, priority)
    }

    /// Whether `hook` has any action callbacks.
    pub fn has_action(&self, hook: &str) -> bool {
        self.actions.read().contains(hook)
    }

    /// Whether `hook` has any filter callbacks.
    pub fn has_filter(&self, hook: &str) -> bool {
        self.filters.read().contains(hook)
    }

    /// Priority of action callback `id` on `hook`, if registered there.
    pub fn has_action_callback(&self, hook: &str, id: CallbackId) -> Option<i32> {
        self.actions.read().priority_of(hook, id)
    }

    /// Priority of filter callback `id` on `hook`, if registered there.
    pub fn has_filter_callback(&self, hook: &str, id: CallbackId) -> Option<i32> {
        self.filters.read().priority_of(hook, id)
    }

    /// Hooks with at least one action callback, sorted.
    pub fn action_hooks(&self) -> Vec<String> {
        self.actions.read().hook_names()
    }

    /// Hooks with at least one filter callback, sorted.
    pub fn filter_hooks(&self) -> Vec<String> {
        self.filters.read().hook_names()
    }

    /// How many times `hook` has been fired as an action by this manager.
    pub fn did_action(&self, hook: &str) -> u64 {
        self.action_counts.lock().get(hook).copied().unwrap_or(0)
    }

    /// A fresh dispatch context, for hosts that fire several hooks as one
    /// logical dispatch.
    pub fn context(&self) -> DispatchContext<'_> {
        DispatchContext::new(self)
    }

    /// Fire action `hook` in a fresh dispatch context.
    pub async fn do_action(&self, hook: &str, args: &[Value]) {
        self.context().do_action(hook, args).await
    }

    /// Filter `value` through `hook` in a fresh dispatch context.
    pub async fn apply_filters(&self, hook: &str, value: Value, args: &[Value]) -> Value {
        self.context().apply_filters(hook, value, args).await
    }

    pub(crate) fn guard(&self) -> Guard {
        self.guard.read().clone()
    }

    pub(crate) fn action_snapshot(&self, hook: &str) -> Vec<Registration> {
        self.actions.read().snapshot(hook)
    }

    pub(crate) fn filter_snapshot(&self, hook: &str) -> Vec<Registration> {
        self.filters.read().snapshot(hook)
    }

    pub(crate) fn count_action(&self, hook: &str) {
        *self.action_counts.lock().entry(hook.to_string()).or_insert(0) += 1;
    }

    fn register(
        &self,
        table: &RwLock<HookTable>,
        hook: &str,
        callback: Arc<dyn HookCallback>,
        priority: i32,
        owner: Option<String>,
    ) -> CallbackId {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            hook,
            priority,
            plugin = owner.as_deref().unwrap_or("core"),
            "callback registered"
        );
        table.write().insert(hook, sequence, priority, owner, callback)
    }
}

impl Default for HookManager {
    fn default() -> Self {
        Self::in_memory()
    }
}

/// Registrar that attributes every callback to one owner.
///
/// Unlike [`HookManager::set_plugin_context`] this carries the owner
/// explicitly, so concurrent plugin loaders cannot misattribute callbacks.
pub struct PluginScope<'m> {
    manager: &'m HookManager,
    owner: Option<String>,
}

impl PluginScope<'_> {
    /// The owner callbacks are attributed to.
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// Register an action callback for this scope's owner.
    pub fn add_action(
        &self,
        hook: &str,
        callback: Arc<dyn HookCallback>,
        priority: i32,
    ) -> CallbackId {
        self.manager.register(
            &self.manager.actions,
            hook,
            callback,
            priority,
            self.owner.clone(),
        )
    }

    /// Register a filter callback for this scope's owner.
    pub fn add_filter(
        &self,
        hook: &str,
        callback: Arc<dyn HookCallback>,
        priority: i32,
    ) -> CallbackId {
        self.manager.register(
            &self.manager.filters,
            hook,
            callback,
            priority,
            self.owner.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{action_fn, callback_fn};
    use crate::registry::DEFAULT_PRIORITY;
    use serde_json::json;

    fn noop() -> Arc<dyn HookCallback> {
        action_fn(|_| Ok(()))
    }

    #[test]
    fn registration_is_attributed_to_plugin_context() {
        let manager = HookManager::in_memory();
        manager.set_plugin_context(Some("acme"));
        manager.add_action("init", noop(), DEFAULT_PRIORITY);
        manager.set_plugin_context(None);
        manager.add_action("init", noop(), DEFAULT_PRIORITY);

        let owners: Vec<Option<String>> = manager
            .action_snapshot("init")
            .iter()
            .map(|r| r.owner().map(str::to_string))
            .collect();
        assert_eq!(owners, vec![Some("acme".to_string()), None]);
    }

    #[test]
    fn scoped_registration_ignores_ambient_context() {
        let manager = HookManager::in_memory();
        manager.set_plugin_context(Some("other"));
        let scope = manager.scoped(Some("acme"));
        scope.add_filter("title", noop(), 5);
        assert_eq!(scope.owner(), Some("acme"));
        assert_eq!(manager.filter_snapshot("title")[0].owner(), Some("acme"));
    }

    #[test]
    fn actions_and_filters_are_separate() {
        let manager = HookManager::in_memory();
        let id = manager.add_action("save", noop(), DEFAULT_PRIORITY);
        assert!(manager.has_action("save"));
        assert!(!manager.has_filter("save"));
        assert!(!manager.remove_filter("save", id, None));
        assert_eq!(manager.has_action_callback("save", id), Some(DEFAULT_PRIORITY));
        assert_eq!(manager.has_filter_callback("save", id), None);
        assert!(manager.remove_action("save", id, Some(DEFAULT_PRIORITY)));
        assert!(!manager.has_action("save"));
    }

    #[test]
    fn lists_hooks_with_callbacks() {
        let manager = HookManager::in_memory();
        manager.add_action("shutdown", noop(), DEFAULT_PRIORITY);
        let id = manager.add_action("init", noop(), DEFAULT_PRIORITY);
        manager.add_filter("title", noop(), DEFAULT_PRIORITY);
        assert_eq!(manager.action_hooks(), vec!["init", "shutdown"]);
        assert_eq!(manager.filter_hooks(), vec!["title"]);

        manager.remove_action("init", id, None);
        assert_eq!(manager.action_hooks(), vec!["shutdown"]);
    }

    #[test]
    fn removal_of_missing_entries_is_a_no_op() {
        let manager = HookManager::in_memory();
        let id = manager.add_filter("title", noop(), DEFAULT_PRIORITY);
        assert!(!manager.remove_filter("missing", id, None));
        assert_eq!(manager.remove_all_actions("missing", None), 0);
        assert_eq!(manager.remove_all_filters("title", Some(99)), 0);
        assert_eq!(manager.remove_all_filters("title", None), 1);
    }

    #[tokio::test]
    async fn counts_action_dispatches() {
        let manager = HookManager::in_memory();
        assert_eq!(manager.did_action("init"), 0);
        manager.do_action("init", &[]).await;
        manager.do_action("init", &[]).await;
        assert_eq!(manager.did_action("init"), 2);
        assert_eq!(manager.did_action("other"), 0);
    }

    #[tokio::test]
    async fn filter_threads_value() {
        let manager = HookManager::in_memory();
        manager.add_filter(
            "title",
            callback_fn(|args| Ok(json!(format!("{}!", args[0].as_str().unwrap_or_default())))),
            DEFAULT_PRIORITY,
        );
        manager.add_filter(
            "title",
            callback_fn(|args| Ok(json!(args[0].as_str().unwrap_or_default().to_uppercase()))),
            20,
        );
        let value = manager.apply_filters("title", json!("hi"), &[]).await;
        assert_eq!(value, json!("HI!"));
    }

    #[test]
    fn swapping_sandbox_rebuilds_tracker() {
        let manager = HookManager::in_memory();
        let replacement = Arc::new(ResourceSandbox::new(Arc::new(InMemoryStore::new())));
        manager.set_sandbox(replacement.clone());
        assert!(Arc::ptr_eq(&manager.sandbox(), &replacement));
        assert!(manager.violation_tracker().is_some());
    }

    #[test]
    fn network_guard_is_bound_to_plugin() {
        let manager = HookManager::in_memory();
        assert_eq!(manager.network_guard("acme").plugin(), "acme");
    }
}
