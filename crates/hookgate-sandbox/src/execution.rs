//! Call-scoped execution tracking.
//!
//! [`ExecutionSample`] is a value owned by the caller of
//! [`ResourceSandbox::begin_execution`](crate::ResourceSandbox::begin_execution),
//! so nested invocations for different plugins each hold their own sample
//! and can never clobber one another.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::{Pid, System};

/// Source of process memory readings.
pub trait MemoryProbe: Send + Sync {
    /// Current resident memory of the host process, in bytes.
    fn current_bytes(&self) -> u64;
}

/// Reads the resident set size of the current process via `sysinfo`.
pub struct ProcessMemoryProbe {
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl ProcessMemoryProbe {
    /// Create a probe for the current process.
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid().ok();
        if pid.is_none() {
            tracing::warn!("unable to determine current pid, memory limits will not be measured");
        }
        Self {
            pid,
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for ProcessMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn current_bytes(&self) -> u64 {
        let Some(pid) = self.pid else {
            return 0;
        };
        let mut system = self.system.lock();
        system.refresh_process(pid);
        system.process(pid).map(|p| p.memory()).unwrap_or(0)
    }
}

/// A probe whose reading is set by hand. Lets hosts without a meaningful
/// process-wide figure (and tests) drive memory accounting directly.
#[derive(Debug, Default, Clone)]
pub struct FixedMemoryProbe {
    bytes: Arc<AtomicU64>,
}

impl FixedMemoryProbe {
    /// Create a probe reporting `bytes`.
    pub fn new(bytes: u64) -> Self {
        Self {
            bytes: Arc::new(AtomicU64::new(bytes)),
        }
    }

    /// Change the reported value.
    pub fn set(&self, bytes: u64) {
        self.bytes.store(bytes, Ordering::SeqCst);
    }

    /// Add to the reported value.
    pub fn grow(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::SeqCst);
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn current_bytes(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }
}

/// Start-of-call snapshot for one plugin invocation.
#[derive(Debug)]
#[must_use = "an execution sample must be passed to end_execution"]
pub struct ExecutionSample {
    pub(crate) plugin: String,
    pub(crate) started: Instant,
    pub(crate) start_memory: u64,
}

impl ExecutionSample {
    /// Plugin the sample belongs to.
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Time elapsed since the sample was taken.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Resource usage of a completed invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionStats {
    /// Plugin that ran.
    pub plugin: String,
    /// Wall-clock duration.
    pub execution_time_ms: u64,
    /// Memory growth over the call (never negative).
    pub memory_used_bytes: u64,
    /// Highest memory reading observed at either end of the call.
    pub peak_memory_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_probe_reports_updates() {
        let probe = FixedMemoryProbe::new(10);
        assert_eq!(probe.current_bytes(), 10);
        probe.grow(5);
        assert_eq!(probe.current_bytes(), 15);
        let clone = probe.clone();
        clone.set(1);
        assert_eq!(probe.current_bytes(), 1, "clones share the reading");
    }
}
