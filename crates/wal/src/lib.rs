//! Write-ahead log: one append-only file of [`record`] entries, fsynced on
//! every append.
//!
//! A write is acknowledged only after its record is on disk, so the engine
//! can rebuild the memtable from this file after a crash. Once the memtable
//! has been flushed to an SSTable the table carries that durability and the
//! log is [`clear`](Wal::clear)ed.

use parking_lot::Mutex;
use record::{encode_record, Record, RecordReader, Value};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum WalError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("wal is closed")]
    Closed,
}

struct Inner {
    /// Append handle; `None` once closed.
    file: Option<File>,
    /// End of the last fully written record.
    offset: u64,
}

/// Append-only durability log.
///
/// `append`, `recover`, `clear` and `close` are serialized by one mutex.
pub struct Wal {
    path: PathBuf,
    inner: Mutex<Inner>,
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl Wal {
    /// Opens (creating if needed) the log at `path` for appending.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = open_append(&path)?;
        let offset = file.metadata()?.len();
        Ok(Self {
            path,
            inner: Mutex::new(Inner {
                file: Some(file),
                offset,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current write offset (bytes of complete records in the file).
    pub fn offset(&self) -> u64 {
        self.inner.lock().offset
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().file.is_none()
    }

    /// Appends one record and fsyncs it.
    ///
    /// Returns the new write offset. On any error the caller must treat the
    /// logical write as failed and must not apply it to the memtable.
    pub fn append(&self, key: &[u8], value: &Value) -> Result<u64, WalError> {
        let buf = encode_record(key, value)?;

        let mut inner = self.inner.lock();
        let start = inner.offset;
        let file = inner.file.as_mut().ok_or(WalError::Closed)?;

        let written = file.write_all(&buf).and_then(|_| file.sync_all());
        if let Err(e) = written {
            // Drop whatever part of the record made it out so the next append
            // starts on a record boundary.
            if let Err(undo) = file.set_len(start) {
                warn!(path = %self.path.display(), error = %undo, "failed to roll back partial wal record");
            }
            return Err(e.into());
        }

        inner.offset = start + buf.len() as u64;
        Ok(inner.offset)
    }

    /// Replays every complete record in write order.
    ///
    /// The append handle is closed while reading and reopened afterwards. A
    /// partial trailing record (a crash mid-append) marks the end of the log;
    /// it is cut off so later appends do not land behind it.
    pub fn recover(&self) -> Result<Vec<Record>, WalError> {
        let mut inner = self.inner.lock();
        if inner.file.is_none() {
            return Err(WalError::Closed);
        }
        inner.file = None;

        let replayed = self.read_all();

        let file = open_append(&self.path)?;
        inner.offset = file.metadata()?.len();
        inner.file = Some(file);
        let (records, valid) = replayed?;
        inner.offset = valid;

        debug!(path = %self.path.display(), records = records.len(), "wal replayed");
        Ok(records)
    }

    fn read_all(&self) -> Result<(Vec<Record>, u64), WalError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e.into()),
        };

        let mut reader = RecordReader::new(BufReader::new(file));
        let mut records = Vec::new();
        while let Some(rec) = reader.next_record()? {
            records.push(rec);
        }

        let valid = reader.offset();
        if reader.truncated() {
            warn!(
                path = %self.path.display(),
                valid_bytes = valid,
                "truncated trailing wal record, discarding tail"
            );
            let f = OpenOptions::new().write(true).open(&self.path)?;
            f.set_len(valid)?;
            f.sync_all()?;
        }
        Ok((records, valid))
    }

    /// Recreates the log as an empty file and reopens it for appends.
    pub fn clear(&self) -> Result<(), WalError> {
        let mut inner = self.inner.lock();
        if inner.file.is_none() {
            return Err(WalError::Closed);
        }
        inner.file = None;

        let f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        f.sync_all()?;
        drop(f);

        inner.file = Some(open_append(&self.path)?);
        inner.offset = 0;
        Ok(())
    }

    /// Syncs and closes the append handle. Calling it again is a no-op.
    pub fn close(&self) -> Result<(), WalError> {
        let mut inner = self.inner.lock();
        if let Some(file) = inner.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn put(k: &[u8], v: &[u8]) -> Record {
        Record::put(k.to_vec(), v.to_vec())
    }

    #[test]
    fn wal_write_and_recover() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");

        {
            let w = Wal::open(&path).unwrap();
            w.append(b"k", &Value::Put(b"v1".to_vec())).unwrap();
            w.append(b"k2", &Value::Put(b"v2".to_vec())).unwrap();
            w.append(b"k", &Value::Tombstone).unwrap();
        }

        let w = Wal::open(&path).unwrap();
        let recs = w.recover().unwrap();
        assert_eq!(
            recs,
            vec![
                put(b"k", b"v1"),
                put(b"k2", b"v2"),
                Record::tombstone(b"k".to_vec()),
            ]
        );
    }

    #[test]
    fn append_returns_growing_offset() {
        let dir = tempdir().unwrap();
        let w = Wal::open(dir.path().join("wal.log")).unwrap();
        assert_eq!(w.offset(), 0);
        let first = w.append(b"a", &Value::Put(b"1".to_vec())).unwrap();
        assert_eq!(first, 8 + 1 + 1);
        let second = w.append(b"b", &Value::Tombstone).unwrap();
        assert_eq!(second, first + 8 + 1);
        assert_eq!(w.offset(), second);
    }

    #[test]
    fn open_creates_parent_dir() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("data").join("wal.log");
        let w = Wal::open(&path).unwrap();
        w.append(b"k", &Value::Put(b"v".to_vec())).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn recover_empty_log() {
        let dir = tempdir().unwrap();
        let w = Wal::open(dir.path().join("wal.log")).unwrap();
        assert!(w.recover().unwrap().is_empty());
    }

    #[test]
    fn recover_keeps_log_appendable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let w = Wal::open(&path).unwrap();
        w.append(b"a", &Value::Put(b"1".to_vec())).unwrap();
        assert_eq!(w.recover().unwrap().len(), 1);

        w.append(b"b", &Value::Put(b"2".to_vec())).unwrap();
        assert_eq!(
            w.recover().unwrap(),
            vec![put(b"a", b"1"), put(b"b", b"2")]
        );
    }

    #[test]
    fn truncated_tail_is_dropped_and_not_replayed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");

        {
            let w = Wal::open(&path).unwrap();
            w.append(b"a", &Value::Put(b"1".to_vec())).unwrap();
            w.append(b"b", &Value::Put(b"22222".to_vec())).unwrap();
        }
        // Simulate a crash part-way through the second record.
        let len = fs::metadata(&path).unwrap().len();
        let f = OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(len - 3).unwrap();
        drop(f);

        let w = Wal::open(&path).unwrap();
        assert_eq!(w.recover().unwrap(), vec![put(b"a", b"1")]);
        assert_eq!(fs::metadata(&path).unwrap().len(), 10);

        // New appends must decode cleanly after the cut.
        w.append(b"c", &Value::Put(b"3".to_vec())).unwrap();
        drop(w);
        let w = Wal::open(&path).unwrap();
        assert_eq!(
            w.recover().unwrap(),
            vec![put(b"a", b"1"), put(b"c", b"3")]
        );
    }

    #[test]
    fn clear_empties_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let w = Wal::open(&path).unwrap();
        w.append(b"a", &Value::Put(b"1".to_vec())).unwrap();
        w.clear().unwrap();

        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
        assert_eq!(w.offset(), 0);
        assert!(w.recover().unwrap().is_empty());

        w.append(b"b", &Value::Put(b"2".to_vec())).unwrap();
        assert_eq!(w.recover().unwrap(), vec![put(b"b", b"2")]);
    }

    #[test]
    fn closed_log_rejects_writes() {
        let dir = tempdir().unwrap();
        let w = Wal::open(dir.path().join("wal.log")).unwrap();
        w.close().unwrap();
        assert!(w.is_closed());
        assert!(matches!(
            w.append(b"k", &Value::Put(b"v".to_vec())),
            Err(WalError::Closed)
        ));
        assert!(matches!(w.clear(), Err(WalError::Closed)));
        assert!(matches!(w.recover(), Err(WalError::Closed)));
        // second close is harmless
        w.close().unwrap();
    }

    #[test]
    fn empty_values_and_keys_roundtrip() {
        let dir = tempdir().unwrap();
        let w = Wal::open(dir.path().join("wal.log")).unwrap();
        w.append(b"", &Value::Put(Vec::new())).unwrap();
        w.append(b"k", &Value::Put(Vec::new())).unwrap();
        assert_eq!(
            w.recover().unwrap(),
            vec![put(b"", b""), put(b"k", b"")]
        );
    }
}
