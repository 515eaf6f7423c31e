use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic per-process counters, one per routing outcome.
#[derive(Debug, Default)]
pub struct StageStats {
    pub received: AtomicU64,
    pub duplicates: AtomicU64,
    pub no_face: AtomicU64,
    pub forwarded: AtomicU64,
    pub rejected: AtomicU64,
    pub dropped: AtomicU64,
    pub recognized: AtomicU64,
    pub unknown: AtomicU64,
    pub retried: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub duplicates: u64,
    pub no_face: u64,
    pub forwarded: u64,
    pub rejected: u64,
    pub dropped: u64,
    pub recognized: u64,
    pub unknown: u64,
    pub retried: u64,
}

impl StageStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let read = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            received: read(&self.received),
            duplicates: read(&self.duplicates),
            no_face: read(&self.no_face),
            forwarded: read(&self.forwarded),
            rejected: read(&self.rejected),
            dropped: read(&self.dropped),
            recognized: read(&self.recognized),
            unknown: read(&self.unknown),
            retried: read(&self.retried),
        }
    }
}
