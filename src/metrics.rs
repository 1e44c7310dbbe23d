//! Per-stage counters for observability.
use std::sync::atomic::{AtomicU64, Ordering};

/// Three monotonic, non-negative counters maintained by every stage.
///
/// At a quiescent point (no items mid-flight), `working_count() == 0` and
/// `input_count() == output_count()`.
#[derive(Debug, Default)]
pub struct StageMetrics {
    input_count: AtomicU64,
    working_count: AtomicU64,
    output_count: AtomicU64,
}

impl StageMetrics {
    /// Creates a fresh, zeroed set of counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total items for which `send` has completed enqueueing.
    pub fn input_count(&self) -> u64 {
        self.input_count.load(Ordering::SeqCst)
    }

    /// Items currently dequeued and between `action` start and `done` return.
    pub fn working_count(&self) -> u64 {
        self.working_count.load(Ordering::SeqCst)
    }

    /// Total items for which `done` has returned.
    pub fn output_count(&self) -> u64 {
        self.output_count.load(Ordering::SeqCst)
    }

    /// Increment before enqueue is observable to producers.
    pub(crate) fn mark_input(&self) {
        self.input_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Increment on dequeue, immediately before running `action`.
    pub(crate) fn mark_working_start(&self) {
        self.working_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrement after `action` returns (regardless of whether `done` runs).
    pub(crate) fn mark_working_end(&self) {
        self.working_count.fetch_sub(1, Ordering::SeqCst);
    }

    /// Increment after `done` returns.
    pub(crate) fn mark_output(&self) {
        self.output_count.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_zero() {
        let m = StageMetrics::new();
        assert_eq!(m.input_count(), 0);
        assert_eq!(m.working_count(), 0);
        assert_eq!(m.output_count(), 0);
    }

    #[test]
    fn tracks_in_flight_items() {
        let m = StageMetrics::new();
        m.mark_input();
        m.mark_working_start();
        assert_eq!(m.input_count(), 1);
        assert_eq!(m.working_count(), 1);
        assert_eq!(m.output_count(), 0);

        m.mark_working_end();
        m.mark_output();
        assert_eq!(m.working_count(), 0);
        assert_eq!(m.output_count(), 1);
    }
}
