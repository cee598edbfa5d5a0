use anyhow::{bail, Context, Result};
use parking_lot::RwLock;
use record::{read_body, read_header, read_record, Decoded, Record, RecordReader, Value};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read};
use std::path::Path;
use tracing::{debug, warn};

use crate::format::{table_dir, ReadAt, DATA_FILE};
use crate::{Inner, SSTable};

/// Index rebuilt from a data file.
struct ScannedIndex {
    index: HashMap<Vec<u8>, u64>,
    /// End of the last complete record.
    end: u64,
    truncated: bool,
}

/// Walks the file once, reading each header and key and seeking past the
/// value. A later record for the same key replaces the earlier offset.
fn scan_index(file: &File, file_len: u64) -> io::Result<ScannedIndex> {
    let mut r = BufReader::new(ReadAt::new(file, 0));
    let mut index = HashMap::new();
    let mut offset = 0u64;
    let mut truncated = false;

    loop {
        let header = match read_header(&mut r)? {
            Decoded::Item(h) => h,
            Decoded::Eof => break,
            Decoded::Truncated => {
                truncated = true;
                break;
            }
        };
        if offset + header.record_len() > file_len {
            truncated = true;
            break;
        }
        let key = match read_body(&mut r, header.key_len as u64)? {
            Decoded::Item(k) => k,
            _ => {
                truncated = true;
                break;
            }
        };
        r.seek_relative(header.value_bytes() as i64)?;
        index.insert(key, offset);
        offset += header.record_len();
    }

    Ok(ScannedIndex {
        index,
        end: offset,
        truncated,
    })
}

impl SSTable {
    /// Opens an existing table and rebuilds its index by a full scan.
    ///
    /// A partial trailing record is treated as the end of the table.
    pub fn open<P: AsRef<Path>>(data_dir: P, level: usize, id: u64) -> Result<Self> {
        let dir = table_dir(data_dir, level, id);
        let path = dir.join(DATA_FILE);
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening sstable {}", path.display()))?;
        let file_len = file.metadata()?.len();

        let scanned = scan_index(&file, file_len)
            .with_context(|| format!("rebuilding index of {}", path.display()))?;
        if scanned.truncated {
            warn!(
                path = %path.display(),
                valid_bytes = scanned.end,
                file_bytes = file_len,
                "sstable ends in a partial record, ignoring tail"
            );
        }
        debug!(
            path = %path.display(),
            level,
            id,
            keys = scanned.index.len(),
            "sstable index rebuilt"
        );

        Ok(Self {
            level,
            id,
            dir,
            path,
            inner: RwLock::new(Inner {
                file: Some(file),
                index: scanned.index,
                end: scanned.end,
                deleted: false,
            }),
        })
    }

    /// Point lookup.
    ///
    /// Returns `Ok(None)` if the key is not in the index. A hit may be a
    /// [`Value::Tombstone`]; the caller must stop searching older tables then.
    pub fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        let inner = self.inner.read();
        let offset = match inner.index.get(key) {
            Some(&offset) => offset,
            None => return Ok(None),
        };
        let file = match inner.file.as_ref() {
            Some(f) => f,
            None => return Err(self.closed_error()),
        };

        let rec = match read_record(&mut ReadAt::new(file, offset))? {
            Decoded::Item(rec) => rec,
            _ => bail!(
                "record at offset {} of {} is truncated",
                offset,
                self.path.display()
            ),
        };
        if rec.key != key {
            bail!("index pointed to mismatching key at offset {}", offset);
        }
        Ok(Some(rec.value))
    }

    /// Every record in file order, tombstones included.
    pub fn all_entries(&self) -> Result<Vec<Record>> {
        let inner = self.inner.read();
        let file = match inner.file.as_ref() {
            Some(f) => f,
            None => return Err(self.closed_error()),
        };

        let bounded = BufReader::new(ReadAt::new(file, 0)).take(inner.end);
        let mut entries = Vec::with_capacity(inner.index.len());
        for rec in RecordReader::new(bounded) {
            entries.push(rec.with_context(|| format!("scanning {}", self.path.display()))?);
        }
        Ok(entries)
    }

    /// The indexed keys, in no particular order.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.inner.read().index.keys().cloned().collect()
    }
}
