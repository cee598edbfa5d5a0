use anyhow::{Context, Result};
use parking_lot::RwLock;
use record::{write_record, Record};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::warn;

use crate::format::{table_dir, DATA_FILE};
use crate::{Inner, SSTable};

impl SSTable {
    /// Creates a new, empty table at `<data_dir>/level/<level>/<id>/data.sst`.
    ///
    /// Fails if a table with that id already exists at the level.
    pub fn create<P: AsRef<Path>>(data_dir: P, level: usize, id: u64) -> Result<Self> {
        let dir = table_dir(data_dir, level, id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating sstable dir {}", dir.display()))?;
        let path = dir.join(DATA_FILE);
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("creating sstable {}", path.display()))?;

        Ok(Self {
            level,
            id,
            dir,
            path,
            inner: RwLock::new(Inner {
                file: Some(file),
                index: HashMap::new(),
                end: 0,
                deleted: false,
            }),
        })
    }

    /// Sorts `entries` by key, appends them and fsyncs the file.
    ///
    /// Tables are meant to be written once. A second call appends another
    /// sorted run after the first without re-sorting the whole file, so a
    /// multiply-written table is only locally ordered; lookups still return
    /// the most recently written record for a key.
    pub fn write(&self, mut entries: Vec<Record>) -> Result<()> {
        entries.sort_by(|a, b| a.key.cmp(&b.key));

        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let file = match inner.file.as_ref() {
            Some(f) => f,
            None => return Err(self.closed_error()),
        };

        let start = inner.end;
        let mut offsets = Vec::with_capacity(entries.len());
        let written = (|| -> std::io::Result<u64> {
            let mut w = BufWriter::new(file);
            let mut offset = start;
            for e in &entries {
                offsets.push(offset);
                offset += write_record(&mut w, &e.key, &e.value)?;
            }
            w.flush()?;
            file.sync_all()?;
            Ok(offset)
        })();

        let end = match written {
            Ok(end) => end,
            Err(e) => {
                // keep the file ending on a record boundary
                roll_back(file, start, &self.path);
                return Err(anyhow::Error::new(e)
                    .context(format!("writing sstable {}", self.path.display())));
            }
        };

        for (e, offset) in entries.into_iter().zip(offsets) {
            inner.index.insert(e.key, offset);
        }
        inner.end = end;
        Ok(())
    }
}

/// Truncates `file` to `len` after a failed write. Returns `false` (and
/// logs) if even that fails.
fn roll_back(file: &File, len: u64, path: &Path) -> bool {
    match file.set_len(len) {
        Ok(()) => true,
        Err(undo) => {
            warn!(path = %path.display(), error = %undo, "failed to roll back partial sstable write");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memtable::Memtable;
    use record::{RecordReader, Value};
    use tempfile::tempdir;

    fn make_sample_memtable() -> Memtable {
        let m = Memtable::new();
        m.put(b"a".to_vec(), b"apple".to_vec());
        m.put(b"b".to_vec(), b"banana".to_vec());
        m.put(b"c".to_vec(), b"".to_vec()); // present but empty string
        m.delete(b"d".to_vec()); // tombstone
        m
    }

    fn drain(m: &Memtable) -> Vec<Record> {
        m.iter()
            .map(|(key, value)| Record { key, value })
            .collect()
    }

    #[test]
    fn flush_memtable_and_inspect_file() -> Result<()> {
        let dir = tempdir()?;
        let t = SSTable::create(dir.path(), 0, 1)?;
        t.write(drain(&make_sample_memtable()))?;

        let path = dir.path().join("level").join("0").join("000001").join("data.sst");
        assert_eq!(t.path(), path.as_path());

        // The file is nothing but records, in key order.
        let bytes = fs::read(&path)?;
        let recs: Vec<Record> = RecordReader::new(&bytes[..]).collect::<std::io::Result<_>>()?;
        assert_eq!(
            recs,
            vec![
                Record::put(b"a".to_vec(), b"apple".to_vec()),
                Record::put(b"b".to_vec(), b"banana".to_vec()),
                Record::put(b"c".to_vec(), Vec::new()),
                Record::tombstone(b"d".to_vec()),
            ]
        );
        assert_eq!(t.size_bytes(), bytes.len() as u64);
        Ok(())
    }

    #[test]
    fn write_sorts_unsorted_batch() -> Result<()> {
        let dir = tempdir()?;
        let t = SSTable::create(dir.path(), 0, 1)?;
        t.write(vec![
            Record::put(b"z".to_vec(), b"1".to_vec()),
            Record::put(b"a".to_vec(), b"2".to_vec()),
            Record::put(b"m".to_vec(), b"3".to_vec()),
        ])?;

        let keys: Vec<_> = t.all_entries()?.into_iter().map(|r| r.key).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"m".to_vec(), b"z".to_vec()]);
        Ok(())
    }

    #[test]
    fn create_refuses_existing_table() -> Result<()> {
        let dir = tempdir()?;
        let _t = SSTable::create(dir.path(), 1, 7)?;
        assert!(SSTable::create(dir.path(), 1, 7).is_err());
        Ok(())
    }

    #[test]
    fn second_write_appends_local_run() -> Result<()> {
        let dir = tempdir()?;
        let t = SSTable::create(dir.path(), 0, 1)?;
        t.write(vec![
            Record::put(b"b".to_vec(), b"old".to_vec()),
            Record::put(b"d".to_vec(), b"4".to_vec()),
        ])?;
        t.write(vec![
            Record::put(b"c".to_vec(), b"3".to_vec()),
            Record::put(b"b".to_vec(), b"new".to_vec()),
        ])?;

        // Two locally sorted runs, no global re-sort.
        let keys: Vec<_> = t.all_entries()?.into_iter().map(|r| r.key).collect();
        assert_eq!(
            keys,
            vec![b"b".to_vec(), b"d".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );
        assert_eq!(t.get(b"b")?, Some(Value::Put(b"new".to_vec())));

        // Reopen agrees with the in-memory index.
        drop(t);
        let t = SSTable::open(dir.path(), 0, 1)?;
        assert_eq!(t.get(b"b")?, Some(Value::Put(b"new".to_vec())));
        assert_eq!(t.len(), 3);
        Ok(())
    }

    #[test]
    fn write_after_close_fails() -> Result<()> {
        let dir = tempdir()?;
        let t = SSTable::create(dir.path(), 0, 1)?;
        t.close();
        assert!(t
            .write(vec![Record::put(b"k".to_vec(), b"v".to_vec())])
            .is_err());
        Ok(())
    }

    #[test]
    fn roll_back_truncates_or_reports() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("data.sst");
        fs::write(&path, b"complete|partial")?;

        // set_len needs a writable handle
        let read_only = File::open(&path)?;
        assert!(!roll_back(&read_only, 8, &path));
        assert_eq!(fs::metadata(&path)?.len(), 16);

        let writable = OpenOptions::new().write(true).open(&path)?;
        assert!(roll_back(&writable, 8, &path));
        assert_eq!(fs::read(&path)?, b"complete");
        Ok(())
    }
}
