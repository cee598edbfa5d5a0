//! # SSTable — Sorted String Table
//!
//! Immutable, on-disk storage files for the levelkv storage engine.
//!
//! A level-0 table is written when the engine flushes its memtable; a
//! level-N table (N > 0) is written when compaction merges every table of
//! level N-1. Once written a table is never modified, only deleted after a
//! merge has superseded it.
//!
//! ## On-disk layout
//!
//! ```text
//! <data_dir>/
//! └── level/
//!     ├── 0/
//!     │   ├── 000007/data.sst
//!     │   └── 000009/data.sst
//!     └── 1/
//!         └── 000008/data.sst
//! ```
//!
//! Each `data.sst` is a plain run of [`record`]s sorted by key:
//!
//! ```text
//! ┌──────────────────┬────────────────────┬─────┬───────┐
//! │ key_len (u32 LE) │ value_len (u32 LE) │ key │ value │  ... repeated to EOF
//! └──────────────────┴────────────────────┴─────┴───────┘
//! ```
//!
//! No index or footer is stored. Opening an existing table rebuilds the
//! key → offset index with one sequential pass that reads every header and
//! key and seeks past the values.

mod format;
mod merge;
mod reader;
mod writer;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use format::{level_dir, list_tables, table_dir, Listing, TableLocation, DATA_FILE, LEVEL_DIR};
pub use merge::{merge, merge_entries};
pub use record::{Record, Value};

#[derive(Debug, Error)]
pub enum SSTableError {
    #[error("sstable {0} is closed")]
    Closed(PathBuf),
}

struct Inner {
    /// Read + append handle; `None` once closed or deleted.
    file: Option<File>,
    /// Key → byte offset of its record.
    index: HashMap<Vec<u8>, u64>,
    /// End of the last complete record.
    end: u64,
    deleted: bool,
}

/// One sorted table file plus its in-memory index.
///
/// All operations go through a single reader-writer lock. Point lookups use
/// positional reads, so any number of them can run under the shared lock.
pub struct SSTable {
    level: usize,
    id: u64,
    dir: PathBuf,
    path: PathBuf,
    inner: RwLock<Inner>,
}

impl SSTable {
    pub fn level(&self) -> usize {
        self.level
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The table's own directory, `level/<N>/<id>`.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of `data.sst`.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of distinct keys in the index.
    pub fn len(&self) -> usize {
        self.inner.read().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().index.is_empty()
    }

    /// Bytes of complete records in the data file.
    pub fn size_bytes(&self) -> u64 {
        self.inner.read().end
    }

    pub fn is_closed(&self) -> bool {
        self.inner.read().file.is_none()
    }

    /// Drops the file handle. Later reads fail with [`SSTableError::Closed`].
    pub fn close(&self) {
        self.inner.write().file = None;
    }

    /// Closes the table and removes its directory from disk.
    ///
    /// Only call this once no read path can reach the table any more. A
    /// second call is a no-op.
    pub fn delete(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.write();
        if inner.deleted {
            return Ok(());
        }
        inner.file = None;
        inner.index.clear();
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("removing sstable dir {}", self.dir.display())))
            }
        }
        inner.deleted = true;
        Ok(())
    }

    fn closed_error(&self) -> anyhow::Error {
        SSTableError::Closed(self.path.clone()).into()
    }
}

impl std::fmt::Debug for SSTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SSTable")
            .field("level", &self.level)
            .field("id", &self.id)
            .field("path", &self.path)
            .finish()
    }
}
