//! Hook callback trait and closure adapters.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::context::DispatchContext;

/// A callback registered against an action or filter hook.
///
/// Filters receive the value being filtered as `args[0]`, followed by any
/// extra arguments, and return the replacement value. Actions receive the
/// dispatch arguments and their return value is discarded.
///
/// The dispatch context lets a callback fire nested hooks and inspect the
/// filter stack.
#[async_trait]
pub trait HookCallback: Send + Sync {
    /// Invoke the callback.
    async fn call(&self, ctx: &mut DispatchContext<'_>, args: &[Value]) -> Result<Value>;
}

/// Adapter turning a synchronous closure into a [`HookCallback`].
pub struct FnCallback<F> {
    f: F,
}

#[async_trait]
impl<F> HookCallback for FnCallback<F>
where
    F: Fn(&[Value]) -> Result<Value> + Send + Sync,
{
    async fn call(&self, _ctx: &mut DispatchContext<'_>, args: &[Value]) -> Result<Value> {
        (self.f)(args)
    }
}

/// Wrap a closure returning the (filtered) value.
pub fn callback_fn<F>(f: F) -> Arc<dyn HookCallback>
where
    F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
{
    Arc::new(FnCallback { f })
}

/// Wrap a side-effect-only closure for use as an action.
pub fn action_fn<F>(f: F) -> Arc<dyn HookCallback>
where
    F: Fn(&[Value]) -> Result<()> + Send + Sync + 'static,
{
    callback_fn(move |args| f(args).map(|()| Value::Null))
}
