//! Process-wide free-function entry points.
//!
//! Plugin bootstrap code and host extension points call these instead of
//! threading a [`HookManager`] through every layer. The host installs its
//! configured manager once at startup with [`install`]; if nothing is
//! installed, the first call lazily creates [`HookManager::in_memory`].
//!
//! [`current_filter`] and [`doing_filter`] answer for the callback running
//! on the calling task. Inside a callback they agree with the
//! [`DispatchContext`](crate::DispatchContext) it receives; work spawned onto
//! another task sees no running hook.

use std::sync::{Arc, OnceLock};

use serde_json::Value;

use crate::callback::HookCallback;
use crate::context::task_hook_stack;
use crate::manager::HookManager;
use crate::registry::CallbackId;

static MANAGER: OnceLock<HookManager> = OnceLock::new();

/// Install the process-wide manager.
///
/// Fails, handing the manager back, if one is already installed or was
/// lazily created by an earlier call.
pub fn install(manager: HookManager) -> Result<(), HookManager> {
    MANAGER.set(manager)
}

/// The process-wide manager.
pub fn manager() -> &'static HookManager {
    MANAGER.get_or_init(|| {
        tracing::debug!("no hook manager installed, using in-memory defaults");
        HookManager::in_memory()
    })
}

/// Innermost hook running on this task, if any.
pub fn current_filter() -> Option<String> {
    task_hook_stack().pop()
}

/// With `Some(hook)`, whether `hook` is running on this task; with `None`,
/// whether any hook is.
pub fn doing_filter(hook: Option<&str>) -> bool {
    let stack = task_hook_stack();
    match hook {
        Some(hook) => stack.iter().any(|h| h == hook),
        None => !stack.is_empty(),
    }
}

/// See [`HookManager::set_plugin_context`].
pub fn set_plugin_context(plugin: Option<&str>) {
    manager().set_plugin_context(plugin)
}

/// See [`HookManager::add_action`].
pub fn add_action(hook: &str, callback: Arc<dyn HookCallback>, priority: i32) -> CallbackId {
    manager().add_action(hook, callback, priority)
}

/// See [`HookManager::add_filter`].
pub fn add_filter(hook: &str, callback: Arc<dyn HookCallback>, priority: i32) -> CallbackId {
    manager().add_filter(hook, callback, priority)
}

/// See [`HookManager::remove_action`].
pub fn remove_action(hook: &str, id: CallbackId, priority: Option<i32>) -> bool {
    manager().remove_action(hook, id, priority)
}

/// See [`HookManager::remove_filter`].
pub fn remove_filter(hook: &str, id: CallbackId, priority: Option<i32>) -> bool {
    manager().remove_filter(hook, id, priority)
}

/// See [`HookManager::remove_all_actions`].
pub fn remove_all_actions(hook: &str, priority: Option<i32>) -> usize {
    manager().remove_all_actions(hook, priority)
}

/// See [`HookManager::remove_all_filters`].
pub fn remove_all_filters(hook: &str, priority: Option<i32>) -> usize {
    manager().remove_all_filters(hook, priority)
}

/// See [`HookManager::has_action`].
pub fn has_action(hook: &str) -> bool {
    manager().has_action(hook)
}

/// See [`HookManager::has_filter`].
pub fn has_filter(hook: &str) -> bool {
    manager().has_filter(hook)
}

/// See [`HookManager::did_action`].
pub fn did_action(hook: &str) -> u64 {
    manager().did_action(hook)
}

/// See [`HookManager::do_action`].
pub async fn do_action(hook: &str, args: &[Value]) {
    manager().do_action(hook, args).await
}

/// See [`HookManager::apply_filters`].
pub async fn apply_filters(hook: &str, value: Value, args: &[Value]) -> Value {
    manager().apply_filters(hook, value, args).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::callback_fn;
    use serde_json::json;

    // The facade is process-global, so this is its only test and it uses
    // hook names no other test touches.
    #[tokio::test]
    async fn facade_round_trip() {
        set_plugin_context(Some("facade-test"));
        let id = add_filter(
            "facade_test_title",
            callback_fn(|args| Ok(json!(format!("[{}]", args[0].as_str().unwrap_or_default())))),
            10,
        );
        set_plugin_context(None);

        assert!(has_filter("facade_test_title"));
        assert_eq!(
            apply_filters("facade_test_title", json!("x"), &[]).await,
            json!("[x]")
        );

        do_action("facade_test_init", &[]).await;
        assert_eq!(did_action("facade_test_init"), 1);

        assert!(remove_filter("facade_test_title", id, Some(10)));
        assert!(!has_filter("facade_test_title"));
        assert!(install(HookManager::in_memory()).is_err());
    }
}
