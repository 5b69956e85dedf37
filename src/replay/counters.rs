//! Run-wide replay counters shared by every worker.

use parking_lot::Mutex;
use serde::Serialize;

use super::client::ReplayOutcome;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub total: u64,
    pub success: u64,
    pub fail: u64,
}

/// Aggregate outcome counters.
///
/// `total` and the matching `success`/`fail` counter move together under one lock, so
/// `total == success + fail` holds for every snapshot, not only once workers are idle.
#[derive(Debug, Default)]
pub struct RunCounters {
    inner: Mutex<CounterSnapshot>,
}

impl RunCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self) {
        let mut counts = self.inner.lock();
        counts.total += 1;
        counts.success += 1;
    }

    pub fn record_failure(&self) {
        let mut counts = self.inner.lock();
        counts.total += 1;
        counts.fail += 1;
    }

    pub fn record(&self, outcome: &ReplayOutcome) {
        if outcome.success {
            self.record_success();
        } else {
            self.record_failure();
        }
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        *self.inner.lock()
    }
}
