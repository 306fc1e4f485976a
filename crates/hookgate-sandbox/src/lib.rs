#![warn(missing_docs)]

//! # hookgate-sandbox
//!
//! Cooperative, in-process resource sandbox for plugin callbacks.
//!
//! Plugins share the host's memory space, so nothing here can forcibly stop
//! plugin code. Instead the sandbox constrains plugins through counters,
//! measurements and voluntary checks before risky operations:
//!
//! - **Execution tracking**: wall time and memory growth per invocation,
//!   compared against per-plugin limits after the call returns
//! - **Rate limits**: fixed one-minute windows for API requests, hook
//!   executions and network requests, counted in a shared store
//! - **Network whitelist**: exact and `*.suffix` domain patterns per plugin
//! - **Block list**: TTL-bounded blocks, escalated automatically by the
//!   [`ViolationTracker`] when a plugin keeps violating limits
//!
//! All cross-request state goes through [`SharedCounterStore`] so that every
//! worker process sees the same counters.

pub mod domain;
pub mod execution;
pub mod limits;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod network;
pub mod sandbox;
pub mod store;
pub mod tracker;

pub use execution::{
    ExecutionSample, ExecutionStats, FixedMemoryProbe, MemoryProbe, ProcessMemoryProbe,
};
pub use limits::SandboxLimits;
pub use network::{NetworkError, NetworkGuard};
pub use sandbox::{PluginUsage, RateCounter, ResourceSandbox, RATE_WINDOW};
pub use store::{InMemoryStore, SharedCounterStore, StoreError};
pub use tracker::{AutoBlockPolicy, ViolationTracker};
