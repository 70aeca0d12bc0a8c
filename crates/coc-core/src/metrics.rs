//! Global atomic counters for COC observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event, typically at the end of a directive run.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lock-free counters.
pub struct Metrics {
    tasks_executed: AtomicU64,
    retries: AtomicU64,
    escalations: AtomicU64,
    infrastructure_failures: AtomicU64,
    persistence_retries: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            tasks_executed: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            escalations: AtomicU64::new(0),
            infrastructure_failures: AtomicU64::new(0),
            persistence_retries: AtomicU64::new(0),
        }
    }

    /// One task went through pick → evaluate.
    pub fn inc_tasks_executed(&self) {
        self.tasks_executed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "tasks_executed", "counter incremented");
    }

    pub fn inc_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "retries", "counter incremented");
    }

    pub fn inc_escalations(&self) {
        self.escalations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "escalations", "counter incremented");
    }

    /// A model, retrieval or registry call failed or timed out.
    pub fn inc_infrastructure_failures(&self) {
        self.infrastructure_failures.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "infrastructure_failures", "counter incremented");
    }

    /// A bandit or trace write had to be retried or buffered.
    pub fn inc_persistence_retries(&self) {
        self.persistence_retries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "persistence_retries", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            tasks_executed = self.tasks_executed(),
            retries = self.retries(),
            escalations = self.escalations(),
            infrastructure_failures = self.infrastructure_failures(),
            persistence_retries = self.persistence_retries(),
        );
    }

    pub fn tasks_executed(&self) -> u64 {
        self.tasks_executed.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn escalations(&self) -> u64 {
        self.escalations.load(Ordering::Relaxed)
    }

    pub fn infrastructure_failures(&self) -> u64 {
        self.infrastructure_failures.load(Ordering::Relaxed)
    }

    pub fn persistence_retries(&self) -> u64 {
        self.persistence_retries.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        self.tasks_executed.store(0, Ordering::Relaxed);
        self.retries.store(0, Ordering::Relaxed);
        self.escalations.store(0, Ordering::Relaxed);
        self.infrastructure_failures.store(0, Ordering::Relaxed);
        self.persistence_retries.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment_independently() {
        let m = Metrics::new();
        m.inc_tasks_executed();
        m.inc_tasks_executed();
        m.inc_retries();
        m.inc_infrastructure_failures();
        assert_eq!(m.tasks_executed(), 2);
        assert_eq!(m.retries(), 1);
        assert_eq!(m.escalations(), 0);
        assert_eq!(m.infrastructure_failures(), 1);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_escalations();
        m.inc_persistence_retries();
        m.reset();
        assert_eq!(m.escalations(), 0);
        assert_eq!(m.persistence_retries(), 0);
    }
}
