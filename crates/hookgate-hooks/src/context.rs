//! Per-dispatch state.
//!
//! A [`DispatchContext`] is created for every top-level `do_action` /
//! `apply_filters` call and handed to each callback, so nested dispatch
//! shares one hook stack while concurrent dispatches never see each other's.
//! While a callback runs, a copy of the stack is also published as a task
//! local so code without access to the context can ask which hook is running.

use std::future::Future;

use serde_json::Value;

use crate::guard;
use crate::manager::HookManager;

tokio::task_local! {
    static HOOK_STACK: Vec<String>;
}

/// Run `fut` with `stack` visible to [`task_hook_stack`].
pub(crate) async fn scope_hook_stack<F: Future>(stack: Vec<String>, fut: F) -> F::Output {
    HOOK_STACK.scope(stack, fut).await
}

/// Hook stack of the callback running on this task; empty outside any
/// callback.
pub(crate) fn task_hook_stack() -> Vec<String> {
    HOOK_STACK.try_with(Vec::clone).unwrap_or_default()
}

/// The hook stack of one dispatch and its entry points for nested hooks.
pub struct DispatchContext<'m> {
    manager: &'m HookManager,
    stack: Vec<String>,
}

impl<'m> DispatchContext<'m> {
    pub(crate) fn new(manager: &'m HookManager) -> Self {
        Self {
            manager,
            stack: Vec::new(),
        }
    }

    /// The manager this dispatch runs against.
    pub fn manager(&self) -> &'m HookManager {
        self.manager
    }

    /// Innermost hook currently running, if any.
    pub fn current_filter(&self) -> Option<&str> {
        self.stack.last().map(String::as_str)
    }

    /// With `Some(hook)`, whether `hook` is anywhere on the stack; with
    /// `None`, whether any hook is running.
    pub fn doing_filter(&self, hook: Option<&str>) -> bool {
        match hook {
            Some(hook) => self.stack.iter().any(|h| h == hook),
            None => !self.stack.is_empty(),
        }
    }

    /// Running hooks, outermost first.
    pub fn hook_stack(&self) -> &[String] {
        &self.stack
    }

    pub(crate) fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Drop entries pushed by a callback that did not return normally.
    pub(crate) fn unwind_to(&mut self, depth: usize) {
        self.stack.truncate(depth);
    }

    /// Run every action callback for `hook` in priority order.
    ///
    /// Failures and refusals are logged and recorded; they never stop the
    /// remaining callbacks.
    pub async fn do_action(&mut self, hook: &str, args: &[Value]) {
        self.manager.count_action(hook);
        let callbacks = self.manager.action_snapshot(hook);
        if callbacks.is_empty() {
            return;
        }

        self.stack.push(hook.to_string());
        for registration in &callbacks {
            match guard::invoke(self, hook, registration, args).await {
                Ok(_) => {}
                Err(e) if e.is_refusal() => {
                    tracing::trace!(
                        hook,
                        callback = %registration.id(),
                        code = e.code(),
                        "action callback refused"
                    );
                }
                Err(e) => {
                    tracing::trace!(
                        hook,
                        callback = %registration.id(),
                        code = e.code(),
                        "action callback failed"
                    );
                }
            }
        }
        self.stack.pop();
    }

    /// Thread `value` through every filter callback for `hook`.
    ///
    /// Each callback sees the current value as its first argument followed
    /// by `args`. A refused or failed callback leaves the value unchanged.
    pub async fn apply_filters(&mut self, hook: &str, value: Value, args: &[Value]) -> Value {
        let callbacks = self.manager.filter_snapshot(hook);
        if callbacks.is_empty() {
            return value;
        }

        self.stack.push(hook.to_string());
        let mut value = value;
        for registration in &callbacks {
            let mut call_args = Vec::with_capacity(args.len() + 1);
            call_args.push(value.clone());
            call_args.extend_from_slice(args);

            match guard::invoke(self, hook, registration, &call_args).await {
                Ok(next) => value = next,
                Err(e) if e.is_refusal() => {
                    tracing::trace!(
                        hook,
                        callback = %registration.id(),
                        code = e.code(),
                        "filter refused, value unchanged"
                    );
                }
                Err(e) => {
                    tracing::trace!(
                        hook,
                        callback = %registration.id(),
                        code = e.code(),
                        "filter failed, value unchanged"
                    );
                }
            }
        }
        self.stack.pop();
        value
    }
}
