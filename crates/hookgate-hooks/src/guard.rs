//! The guarded call wrapped around every callback invocation.
//!
//! Order of checks for a plugin-owned callback while the sandbox is enabled:
//!
//! 1. block list (`plugin_blocked` violation, callback skipped)
//! 2. circuit breaker for `plugin:hook` (skipped, no violation)
//! 3. hook-execution rate limit (`rate_limit` violation, skipped)
//! 4. execution tracking around the call, optionally under a deadline
//! 5. post-hoc time and memory checks, then breaker success or failure
//!
//! Host callbacks and plugins under a disabled sandbox skip steps 1, 3 and 4
//! but still go through the circuit breaker under `core:hook` (or
//! `plugin:hook`) so a reliably failing callback stops being retried.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use hookgate_audit::{AuditEvent, AuditSink};
use hookgate_breaker::{hook_key, CircuitBreaker};
use hookgate_error::{HookError, SandboxViolation};
#[cfg(feature = "metrics")]
use hookgate_sandbox::metrics::GuardMetrics;
use hookgate_sandbox::{RateCounter, ResourceSandbox, ViolationTracker};
use serde_json::Value;

use crate::context::{self, DispatchContext};
use crate::registry::Registration;

/// Collaborators consulted by a guarded call, snapshotted per invocation so
/// no lock is held while callbacks run.
#[derive(Clone)]
pub(crate) struct Guard {
    pub(crate) sandbox: Arc<ResourceSandbox>,
    pub(crate) breaker: Arc<CircuitBreaker>,
    pub(crate) tracker: Option<Arc<ViolationTracker>>,
    pub(crate) audit: Arc<dyn AuditSink>,
    #[cfg(feature = "metrics")]
    pub(crate) metrics: Option<Arc<GuardMetrics>>,
}

impl Guard {
    async fn report(&self, violation: &SandboxViolation, hook: &str) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_violation(violation.plugin(), violation.violation_type().as_str());
        }
        self.audit
            .record(&AuditEvent::violation(violation, Some(hook)))
            .await;
        if let Some(tracker) = &self.tracker {
            tracker.record(violation).await;
        }
    }

    fn outcome(&self, owner: Option<&str>, outcome: &str) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_call(owner.unwrap_or("core"), outcome);
        }
        #[cfg(not(feature = "metrics"))]
        let _ = (owner, outcome);
    }

    fn observe(&self, owner: Option<&str>, elapsed: Duration) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.observe_duration(owner.unwrap_or("core"), elapsed.as_secs_f64());
        }
        #[cfg(not(feature = "metrics"))]
        let _ = (owner, elapsed);
    }
}

/// Run one registered callback under the sandbox and circuit breaker.
///
/// With the sandbox disabled the callback runs unguarded: no block, circuit
/// or limit checks and no breaker bookkeeping. Panics are still contained.
/// `Err` means the callback was refused or failed; filter chains keep the
/// previous value in that case.
pub(crate) async fn invoke(
    ctx: &mut DispatchContext<'_>,
    hook: &str,
    registration: &Registration,
    args: &[Value],
) -> Result<Value, HookError> {
    let guard = ctx.manager().guard();
    let owner = registration.owner();
    let key = hook_key(hook, owner);
    let guarded = guard.sandbox.is_enabled();
    let plugin = owner.filter(|_| guarded);

    if let Some(plugin) = plugin {
        if guard.sandbox.is_blocked(plugin).await {
            let until = guard.sandbox.blocked_until(plugin).await.ok().flatten();
            let violation = SandboxViolation::plugin_blocked(plugin, until);
            tracing::debug!(plugin, hook, "plugin blocked, skipping callback");
            guard.report(&violation, hook).await;
            guard.outcome(owner, "skipped_blocked");
            return Err(violation.into());
        }
    }

    if guarded && guard.breaker.is_open(&key).await {
        tracing::debug!(key = %key, hook, "circuit open, skipping callback");
        guard.outcome(owner, "skipped_open");
        return Err(HookError::CircuitOpen { key });
    }

    if let Some(plugin) = plugin {
        if let Err(violation) = guard
            .sandbox
            .check_rate_limits(plugin, RateCounter::HookExecutions)
            .await
        {
            guard.report(&violation, hook).await;
            guard.outcome(owner, "skipped_rate");
            return Err(violation.into());
        }
    }

    let sample = plugin.map(|p| guard.sandbox.begin_execution(p));
    let deadline = plugin
        .filter(|_| guard.sandbox.enforces_timeout())
        .map(|p| (p, guard.sandbox.plugin_limits(p).execution_time()));
    let depth = ctx.depth();
    let started = Instant::now();

    let stack = ctx.hook_stack().to_vec();
    let call = AssertUnwindSafe(context::scope_hook_stack(
        stack,
        registration.callback().call(ctx, args),
    ))
    .catch_unwind();
    let result = match deadline {
        Some((plugin, limit)) => match tokio::time::timeout(limit, call).await {
            Ok(result) => settle(result),
            Err(_) => Err(SandboxViolation::execution_time_exceeded(
                plugin,
                started.elapsed(),
                limit,
            )
            .into()),
        },
        None => settle(call.await),
    };
    ctx.unwind_to(depth);

    let stats = sample.map(|s| guard.sandbox.end_execution(s));
    guard.observe(owner, started.elapsed());

    match result {
        Ok(value) => {
            if let Some(stats) = &stats {
                if let Err(violation) = guard.sandbox.check_execution_limits(stats) {
                    guard.report(&violation, hook).await;
                }
            }
            if guarded {
                guard.breaker.record_success(&key).await;
            }
            guard.outcome(owner, "ok");
            Ok(value)
        }
        Err(err) => {
            tracing::warn!(
                plugin = owner.unwrap_or("core"),
                hook,
                callback = %registration.id(),
                error = %err,
                "hook callback failed"
            );
            if let HookError::Violation(violation) = &err {
                guard.report(violation, hook).await;
            }
            guard
                .audit
                .record(&AuditEvent::callback_failed(owner, hook, &err))
                .await;
            if guarded {
                guard.breaker.record_failure(&key, &err.to_string()).await;
            }
            guard.outcome(owner, "failed");
            Err(err)
        }
    }
}

fn settle(result: Result<anyhow::Result<Value>, Box<dyn Any + Send>>) -> Result<Value, HookError> {
    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(HookError::Callback(e)),
        Err(panic) => Err(HookError::Panicked(panic_message(panic.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "callback panicked with a non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_messages() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("kaboom"));
        assert_eq!(panic_message(boxed.as_ref()), "kaboom");
        let boxed: Box<dyn Any + Send> = Box::new(42u8);
        assert!(panic_message(boxed.as_ref()).contains("non-string"));
    }

    #[test]
    fn settle_maps_outcomes() {
        assert_eq!(settle(Ok(Ok(Value::from(1)))).unwrap(), Value::from(1));
        let err = settle(Ok(Err(anyhow::anyhow!("nope")))).unwrap_err();
        assert_eq!(err.code(), "CALLBACK_FAILED");
        let payload: Box<dyn Any + Send> = Box::new("boom");
        let err = settle(Err(payload)).unwrap_err();
        assert_eq!(err.code(), "CALLBACK_PANICKED");
        assert!(err.to_string().contains("boom"));
    }
}
