//! Leveled compaction: the merge cascade and the background thread that
//! drives it.

use anyhow::{anyhow, Result};
use crossbeam_channel::{after, bounded, select, Receiver, Sender};
use sstable::SSTable;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::engine::EngineInner;
use crate::error::EngineError;
use crate::stats::Counters;

/// Failing ticks stretch the wait up to `interval * 2^MAX_BACKOFF_SHIFT`.
const MAX_BACKOFF_SHIFT: u32 = 5;

impl EngineInner {
    /// Merges `start` into `start + 1` and keeps going upward while each
    /// receiving level reaches the threshold in turn.
    pub(crate) fn compact_level(&self, start: usize) -> Result<usize> {
        let _guard = self.compaction_lock.lock();
        let mut merges = 0;
        let mut level = start;
        while level < self.config.max_level {
            if !self.merge_level(level)? {
                break;
            }
            merges += 1;
            level += 1;
        }
        Ok(merges)
    }

    /// One merge of every table at `level`. Returns `false` when the level
    /// is below the threshold.
    ///
    /// Reads and writes happen without the state lock; only swapping the
    /// inputs for the output takes it, so gets and puts keep flowing while
    /// the merge runs.
    fn merge_level(&self, level: usize) -> Result<bool> {
        let (inputs, drop_tombstones) = {
            let state = self.state.read();
            self.ensure_open()?;
            // read order puts the newest table of the level first
            let inputs: Vec<Arc<SSTable>> = state
                .tables
                .iter()
                .filter(|t| t.level() == level)
                .cloned()
                .collect();
            if inputs.len() < self.config.level_threshold {
                return Ok(false);
            }
            // a tombstone may only go once nothing deeper can hold its key
            let deeper = state.tables.iter().any(|t| t.level() > level);
            (inputs, !deeper)
        };

        let target = level + 1;
        let id = self.next_table_id();
        debug!(level, inputs = inputs.len(), target, table_id = id, "merging level");
        let merged = sstable::merge(
            inputs.iter().map(|t| t.as_ref()),
            &self.config.data_dir,
            target,
            id,
            drop_tombstones,
        )?;
        let keys = merged.len();

        {
            let mut state = self.state.write();
            if self.is_closed() {
                drop(state);
                merged.delete()?;
                return Err(EngineError::Closed.into());
            }
            state
                .tables
                .retain(|t| !inputs.iter().any(|input| Arc::ptr_eq(input, t)));
            state.install(Arc::new(merged));
        }

        // Oldest first: if a delete fails, whatever is left over is the
        // newest inputs, which agree with the merged table on every key.
        for input in inputs.iter().rev() {
            input.delete()?;
        }

        Counters::bump(&self.counters.compactions);
        info!(
            level,
            target,
            table_id = id,
            inputs = inputs.len(),
            keys,
            drop_tombstones,
            "compacted level"
        );
        Ok(true)
    }

    /// One background pass over levels `0..max_level`. A failing level is
    /// logged and the pass moves on. Returns `true` if nothing failed.
    pub(crate) fn compact_tick(&self) -> bool {
        let mut clean = true;
        for level in 0..self.config.max_level {
            if self.is_closed() {
                break;
            }
            if let Err(e) = self.compact_level(level) {
                if self.is_closed() {
                    break;
                }
                clean = false;
                Counters::bump(&self.counters.compaction_failures);
                error!(level, error = %format!("{:#}", e), "error during compaction");
            }
        }
        clean
    }
}

fn backoff(interval: Duration, failed_ticks: u32) -> Duration {
    interval.saturating_mul(1 << failed_ticks.min(MAX_BACKOFF_SHIFT))
}

/// Handle to the compaction thread.
pub(crate) struct Scheduler {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

impl Scheduler {
    pub(crate) fn spawn(inner: Arc<EngineInner>) -> Result<Self> {
        let (shutdown, rx) = bounded(1);
        let handle = thread::Builder::new()
            .name("levelkv-compaction".into())
            .spawn(move || run(inner, rx))?;
        Ok(Self { shutdown, handle })
    }

    /// Signals the thread and waits for it; an in-flight pass finishes first.
    pub(crate) fn shutdown(self) -> Result<()> {
        // a full channel means a stop is already pending
        let _ = self.shutdown.try_send(());
        self.handle
            .join()
            .map_err(|_| anyhow!("compaction thread panicked"))
    }

    /// A scheduler whose thread has already died, for exercising `close`.
    #[cfg(test)]
    pub(crate) fn panicked() -> Self {
        let (shutdown, _) = bounded(1);
        let handle = thread::spawn(|| panic!("compaction thread died"));
        Self { shutdown, handle }
    }
}

fn run(inner: Arc<EngineInner>, shutdown: Receiver<()>) {
    let interval = inner.config.compaction_interval;
    let mut failed_ticks: u32 = 0;
    debug!(?interval, "compaction scheduler started");

    loop {
        let delay = backoff(interval, failed_ticks);
        select! {
            recv(shutdown) -> _ => break,
            recv(after(delay)) -> _ => {
                if inner.compact_tick() {
                    failed_ticks = 0;
                } else {
                    failed_ticks = failed_ticks.saturating_add(1);
                    warn!(failed_ticks, next_in = ?backoff(interval, failed_ticks), "compaction tick failed, backing off");
                }
                inner.counters.failing_ticks.store(u64::from(failed_ticks), Ordering::Relaxed);
            }
        }
    }

    debug!("compaction scheduler stopped");
}
