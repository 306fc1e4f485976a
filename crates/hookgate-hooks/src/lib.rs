#![warn(missing_docs)]

//! # hookgate-hooks
//!
//! Action and filter hooks for untrusted plugin code.
//!
//! Callbacks register against named hooks with a priority (lower runs
//! earlier, ties run in registration order). Dispatching a hook runs every
//! callback through a guarded call: plugin-owned callbacks are checked
//! against the [`ResourceSandbox`](hookgate_sandbox::ResourceSandbox) block
//! list and rate limits, every callback is gated by a per-`plugin:hook`
//! [`CircuitBreaker`](hookgate_breaker::CircuitBreaker), and failures
//! (errors and panics) are recorded and contained. One plugin's fault never
//! stops another plugin's callback; a failing filter passes its input value
//! through unchanged.
//!
//! ```no_run
//! # async fn example() {
//! use hookgate_hooks::{callback_fn, HookManager, DEFAULT_PRIORITY};
//! use serde_json::json;
//!
//! let manager = HookManager::in_memory();
//! manager.scoped(Some("acme")).add_filter(
//!     "the_title",
//!     callback_fn(|args| Ok(json!(format!("{}!", args[0].as_str().unwrap_or_default())))),
//!     DEFAULT_PRIORITY,
//! );
//! let title = manager.apply_filters("the_title", json!("Hello"), &[]).await;
//! assert_eq!(title, json!("Hello!"));
//! # }
//! ```

pub mod api;
pub mod callback;
pub mod context;
mod guard;
pub mod manager;
pub mod registry;

pub use callback::{action_fn, callback_fn, FnCallback, HookCallback};
pub use context::DispatchContext;
pub use manager::{HookManager, PluginScope};
pub use registry::{CallbackId, Registration, DEFAULT_PRIORITY};
