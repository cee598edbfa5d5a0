use anyhow::{Context, Result};
use memtable::Memtable;
use parking_lot::{Mutex, RwLock};
use record::{Record, Value};
use sstable::SSTable;
use std::cmp::Reverse;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use wal::Wal;

use crate::compaction::Scheduler;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::stats::{Counters, EngineStats};

/// Everything a read needs, swapped as one unit by flush and compaction.
pub(crate) struct State {
    pub(crate) memtable: Memtable,
    /// Live tables in read order: level ascending, then id descending.
    pub(crate) tables: Vec<Arc<SSTable>>,
}

impl State {
    pub(crate) fn install(&mut self, table: Arc<SSTable>) {
        self.tables.push(table);
        sort_read_order(&mut self.tables);
    }
}

/// Lower levels hold newer data, and within a level a higher id is newer.
fn sort_read_order(tables: &mut [Arc<SSTable>]) {
    tables.sort_by_key(|t| (t.level(), Reverse(t.id())));
}

pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) state: RwLock<State>,
    pub(crate) wal: Wal,
    next_table_id: AtomicU64,
    /// Serializes level merges; taken before `state`, never after.
    pub(crate) compaction_lock: Mutex<()>,
    closed: AtomicBool,
    pub(crate) counters: Counters,
}

impl EngineInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(EngineError::Closed.into());
        }
        Ok(())
    }

    pub(crate) fn next_table_id(&self) -> u64 {
        self.next_table_id.fetch_add(1, Ordering::SeqCst)
    }

    fn write(&self, key: Vec<u8>, value: Value) -> Result<()> {
        let mut state = self.state.write();
        self.ensure_open()?;

        self.wal.append(&key, &value)?;
        state.memtable.apply(key, value);

        if state.memtable.size() >= self.config.flush_threshold {
            self.flush_locked(&mut state)?;
        }
        Ok(())
    }

    /// Writes the memtable out as a new level-0 table and starts a fresh one.
    ///
    /// The caller holds the state write lock, so no write can slip in between
    /// taking the snapshot and clearing the WAL.
    pub(crate) fn flush_locked(&self, state: &mut State) -> Result<()> {
        if state.memtable.is_empty() {
            return Ok(());
        }

        let entries: Vec<Record> = state
            .memtable
            .iter()
            .map(|(key, value)| Record { key, value })
            .collect();
        let id = self.next_table_id();
        let table = SSTable::create(&self.config.data_dir, 0, id)?;
        if let Err(e) = table.write(entries) {
            if let Err(cleanup) = table.delete() {
                warn!(table_id = id, error = %cleanup, "failed to remove partial flush output");
            }
            return Err(e.context("flushing memtable"));
        }

        let keys = table.len();
        let bytes = table.size_bytes();
        state.install(Arc::new(table));
        state.memtable = Memtable::new();
        // the new table holds everything the log did
        self.wal.clear()?;

        Counters::bump(&self.counters.flushes);
        info!(table_id = id, keys, bytes, "memtable flushed to level 0");
        Ok(())
    }
}

/// The storage engine orchestrating the WAL, the memtable and the leveled
/// SSTables.
///
/// # Write path
///
/// 1. Append the record to the WAL (fsynced before returning).
/// 2. Apply it to the memtable.
/// 3. If the memtable size reaches `flush_threshold`, flush it to a new
///    level-0 table and clear the WAL before the call returns.
///
/// # Read path
///
/// 1. Check the memtable (freshest data, tombstones included).
/// 2. Check tables level by level, newest first within a level.
/// 3. First hit wins; a tombstone reads as "not found".
///
/// # Compaction
///
/// A background thread wakes every `compaction_interval` and, for each
/// level below `max_level`, merges all of that level's tables into one
/// table at the next level once there are `level_threshold` of them.
///
/// All methods take `&self`; share an engine across threads with `Arc`.
pub struct Engine {
    inner: Arc<EngineInner>,
    scheduler: Mutex<Option<Scheduler>>,
}

impl Engine {
    /// Opens (or creates) an engine in `config.data_dir`.
    ///
    /// # Recovery steps
    ///
    /// 1. Create `data_dir` and `data_dir/level`.
    /// 2. Open the WAL.
    /// 3. Load every table found under `level/<N>/<id>/data.sst`; table
    ///    directories without a data file are leftovers of an interrupted
    ///    write and are removed.
    /// 4. Replay the WAL into a fresh memtable, flushing it if it is already
    ///    over the threshold.
    /// 5. Start the compaction thread.
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let data_dir = config.data_dir.clone();
        fs::create_dir_all(data_dir.join(sstable::LEVEL_DIR))
            .with_context(|| format!("creating data dir {}", data_dir.display()))?;

        let wal = Wal::open(config.wal_path())
            .with_context(|| format!("opening wal in {}", data_dir.display()))?;

        let listing = sstable::list_tables(&data_dir)
            .with_context(|| format!("scanning tables in {}", data_dir.display()))?;
        for orphan in &listing.orphans {
            warn!(dir = %orphan.display(), "removing table directory without data file");
            fs::remove_dir_all(orphan)
                .with_context(|| format!("removing orphan table dir {}", orphan.display()))?;
        }

        let mut tables = Vec::with_capacity(listing.tables.len());
        let mut max_id = 0;
        for loc in &listing.tables {
            let table = SSTable::open(&data_dir, loc.level, loc.id).with_context(|| {
                format!("failed to load sstable {} at level {}", loc.id, loc.level)
            })?;
            max_id = max_id.max(loc.id);
            tables.push(Arc::new(table));
        }
        sort_read_order(&mut tables);

        let memtable = Memtable::new();
        let replayed = wal.recover().context("replaying wal")?;
        let replayed_count = replayed.len();
        for rec in replayed {
            memtable.apply(rec.key, rec.value);
        }

        let inner = Arc::new(EngineInner {
            config,
            state: RwLock::new(State { memtable, tables }),
            wal,
            next_table_id: AtomicU64::new(max_id + 1),
            compaction_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            counters: Counters::default(),
        });

        {
            let mut state = inner.state.write();
            if !state.memtable.is_empty() && state.memtable.size() >= inner.config.flush_threshold
            {
                inner.flush_locked(&mut state)?;
            }
            info!(
                data_dir = %data_dir.display(),
                tables = state.tables.len(),
                wal_records = replayed_count,
                "engine opened"
            );
        }

        let scheduler = Scheduler::spawn(Arc::clone(&inner))?;
        Ok(Self {
            inner,
            scheduler: Mutex::new(Some(scheduler)),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.inner.config.data_dir
    }

    /// Inserts or overwrites a key. An empty value is a real value, not a
    /// deletion.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.inner.write(key, Value::Put(value))
    }

    /// Looks up a key, returning `None` if it was never written or its
    /// newest record is a deletion.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        // Held for the whole lookup so a compaction swap can't pull a table
        // out from under the scan.
        let state = self.inner.state.read();
        self.inner.ensure_open()?;

        if let Some(value) = state.memtable.get(key) {
            return Ok(value.into_bytes());
        }

        for table in &state.tables {
            if let Some(value) = table.get(key)? {
                debug!(level = table.level(), table_id = table.id(), "read hit in sstable");
                return Ok(value.into_bytes());
            }
        }
        Ok(None)
    }

    /// Deletes a key by writing a tombstone. Deleting an absent key is not
    /// an error.
    pub fn delete(&self, key: Vec<u8>) -> Result<()> {
        self.inner.write(key, Value::Tombstone)
    }

    /// Forces the memtable out to a level-0 table. No-op when it is empty.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.inner.state.write();
        self.inner.ensure_open()?;
        self.inner.flush_locked(&mut state)
    }

    /// Runs one compaction pass over every level below `max_level`,
    /// the same pass the background thread runs. Returns the number of
    /// merges performed.
    pub fn compact(&self) -> Result<usize> {
        let mut merges = 0;
        for level in 0..self.inner.config.max_level {
            merges += self.compact_level(level)?;
        }
        Ok(merges)
    }

    /// Merges `level` into `level + 1` if it holds enough tables, cascading
    /// upward while the receiving level fills up in turn. Returns the number
    /// of merges performed.
    pub fn compact_level(&self, level: usize) -> Result<usize> {
        self.inner.ensure_open()?;
        self.inner.compact_level(level).map_err(|e| {
            Counters::bump(&self.inner.counters.compaction_failures);
            e
        })
    }

    pub fn stats(&self) -> EngineStats {
        let state = self.inner.state.read();
        let mut tables_per_level = vec![0; self.inner.config.max_level + 1];
        for table in &state.tables {
            if table.level() >= tables_per_level.len() {
                tables_per_level.resize(table.level() + 1, 0);
            }
            tables_per_level[table.level()] += 1;
        }
        let (flushes, compactions, compaction_failures, consecutive_failed_ticks) =
            EngineStats::load(&self.inner.counters);
        EngineStats {
            flushes,
            compactions,
            compaction_failures,
            consecutive_failed_ticks,
            memtable_bytes: state.memtable.size(),
            memtable_entries: state.memtable.len(),
            wal_bytes: self.inner.wal.offset(),
            tables_per_level,
        }
    }

    /// Stops compaction, then closes the WAL and every table.
    ///
    /// Calling it again is a no-op; any other operation afterwards fails
    /// with [`EngineError::Closed`]. The memtable is not flushed, its
    /// contents are replayed from the WAL on the next open.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // handles are closed even if the compaction thread died
        let shutdown = match self.scheduler.lock().take() {
            Some(scheduler) => scheduler.shutdown(),
            None => Ok(()),
        };

        // wait out a manual compaction and any in-flight read or write
        let _compaction = self.inner.compaction_lock.lock();
        let state = self.inner.state.write();

        let wal_result = self.inner.wal.close();
        for table in &state.tables {
            table.close();
        }
        wal_result.context("closing wal")?;
        shutdown?;

        info!(data_dir = %self.inner.config.data_dir.display(), "engine closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("data_dir", &self.inner.config.data_dir)
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "error closing engine on drop");
        }
    }
}
