use anyhow::{Context, Result};
use record::Record;
use std::path::Path;
use tracing::warn;

use crate::SSTable;

/// Collapses several runs of records into one sorted, de-duplicated run.
///
/// `runs` must be ordered newest first. The sort is stable, so among equal
/// keys the record from the newest run comes first and is the one kept.
/// With `drop_tombstones` the surviving deletion markers are removed too;
/// that is only safe when no older table can still hold the key.
pub fn merge_entries(runs: Vec<Vec<Record>>, drop_tombstones: bool) -> Vec<Record> {
    let mut all: Vec<Record> = runs.into_iter().flatten().collect();
    all.sort_by(|a, b| a.key.cmp(&b.key));
    all.dedup_by(|later, kept| later.key == kept.key);
    if drop_tombstones {
        all.retain(|r| !r.value.is_tombstone());
    }
    all
}

/// Merges `tables` (newest first) into one new table at `level`.
///
/// The inputs are left untouched; deleting them once the merged table is in
/// place is the caller's job. If writing fails the partial output is removed.
pub fn merge<'a, I>(
    tables: I,
    data_dir: &Path,
    level: usize,
    id: u64,
    drop_tombstones: bool,
) -> Result<SSTable>
where
    I: IntoIterator<Item = &'a SSTable>,
{
    let mut runs = Vec::new();
    for t in tables {
        let entries = t
            .all_entries()
            .with_context(|| format!("reading merge input {}", t.path().display()))?;
        runs.push(entries);
    }
    let merged_entries = merge_entries(runs, drop_tombstones);

    let merged = SSTable::create(data_dir, level, id)?;
    if let Err(e) = merged.write(merged_entries) {
        if let Err(cleanup) = merged.delete() {
            warn!(path = %merged.path().display(), error = %cleanup, "failed to remove partial merge output");
        }
        return Err(e);
    }
    Ok(merged)
}
