use std::sync::atomic::{AtomicU64, Ordering};

/// Running counters updated by the flush and compaction paths.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) flushes: AtomicU64,
    pub(crate) compactions: AtomicU64,
    pub(crate) compaction_failures: AtomicU64,
    pub(crate) failing_ticks: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time health snapshot of an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    /// Memtable flushes since open.
    pub flushes: u64,
    /// Successful level merges since open.
    pub compactions: u64,
    /// Level merges that returned an error, background and manual.
    pub compaction_failures: u64,
    /// Background ticks in a row with at least one failed level; drives the
    /// scheduler's backoff and resets on a clean tick.
    pub consecutive_failed_ticks: u64,
    /// Approximate memtable size in bytes.
    pub memtable_bytes: usize,
    pub memtable_entries: usize,
    /// Bytes currently in the WAL.
    pub wal_bytes: u64,
    /// Number of live tables, indexed by level.
    pub tables_per_level: Vec<usize>,
}

impl EngineStats {
    pub fn total_tables(&self) -> usize {
        self.tables_per_level.iter().sum()
    }

    pub(crate) fn load(counters: &Counters) -> (u64, u64, u64, u64) {
        (
            counters.flushes.load(Ordering::Relaxed),
            counters.compactions.load(Ordering::Relaxed),
            counters.compaction_failures.load(Ordering::Relaxed),
            counters.failing_ticks.load(Ordering::Relaxed),
        )
    }
}
