//! # Memtable
//!
//! The in-memory, mutable write buffer of the levelkv storage engine.
//!
//! Every `put` and `delete` lands here right after its WAL record is durable.
//! Once the buffer's approximate size reaches the engine's flush threshold the
//! engine drains it through a [`Snapshot`] into a level-0 SSTable and installs
//! a fresh, empty memtable.
//!
//! ## Key properties
//! - **Tagged values**: deletes are stored as [`Value::Tombstone`], never as an
//!   empty value and never by removing the key, so a deletion keeps shadowing
//!   older values on disk after it is flushed.
//! - **Approximate size tracking**: only value bytes are counted; each write
//!   moves the counter by `len(new) - len(old)`.
//! - **Internally synchronized**: one reader-writer lock; every method takes
//!   `&self`.
//!
//! ## Example
//! ```rust
//! use memtable::{Memtable, Value};
//!
//! let m = Memtable::new();
//! m.put(b"hello".to_vec(), b"world".to_vec());
//! assert_eq!(m.get(b"hello"), Some(Value::Put(b"world".to_vec())));
//!
//! m.delete(b"hello".to_vec());
//! assert_eq!(m.get(b"hello"), Some(Value::Tombstone));
//! ```

use parking_lot::RwLock;
use std::collections::BTreeMap;

pub use record::Value;

#[derive(Debug, Default)]
struct Inner {
    map: BTreeMap<Vec<u8>, Value>,
    size: usize,
}

impl Inner {
    fn upsert(&mut self, key: Vec<u8>, value: Value) {
        let new_len = value.len();
        let old_len = self.map.insert(key, value).map(|v| v.len()).unwrap_or(0);
        self.size = self.size.saturating_sub(old_len).saturating_add(new_len);
    }
}

/// Lock-guarded in-memory key → [`Value`] buffer.
#[derive(Debug, Default)]
pub struct Memtable {
    inner: RwLock<Inner>,
}

impl Memtable {
    /// Creates a new, empty memtable.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the live value for `key`.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) {
        self.inner.write().upsert(key, Value::Put(value));
    }

    /// Records a tombstone for `key`, whether or not it is present.
    ///
    /// The tombstone has zero length, so the size counter drops by the length
    /// of whatever value it replaces.
    pub fn delete(&self, key: Vec<u8>) {
        self.inner.write().upsert(key, Value::Tombstone);
    }

    /// Applies an already-tagged value, as read back from the WAL.
    pub fn apply(&self, key: Vec<u8>, value: Value) {
        self.inner.write().upsert(key, value);
    }

    /// Looks up `key`.
    ///
    /// - `None`: this memtable knows nothing about the key; keep searching.
    /// - `Some(Value::Tombstone)`: deleted here; older layers must not be consulted.
    /// - `Some(Value::Put(bytes))`: live value.
    pub fn get(&self, key: &[u8]) -> Option<Value> {
        self.inner.read().map.get(key).cloned()
    }

    /// Returns `true` if the memtable holds the key (including tombstones).
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.inner.read().map.contains_key(key)
    }

    /// Approximate size in bytes: the sum of live value lengths.
    pub fn size(&self) -> usize {
        self.inner.read().size
    }

    /// Number of entries, tombstones included.
    pub fn len(&self) -> usize {
        self.inner.read().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().map.is_empty()
    }

    /// Takes a point-in-time copy of every entry.
    ///
    /// The copy is made under the shared lock, so writes that happen after
    /// this call returns never show up in (or corrupt) the snapshot.
    pub fn iter(&self) -> Snapshot {
        let guard = self.inner.read();
        let entries: Vec<(Vec<u8>, Value)> = guard
            .map
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Snapshot {
            entries: entries.into_iter(),
        }
    }
}

/// One-shot iterator over a memtable snapshot.
///
/// Entries currently come out in ascending key order because the buffer is a
/// `BTreeMap`; flush sorts again and nothing should depend on it.
pub struct Snapshot {
    entries: std::vec::IntoIter<(Vec<u8>, Value)>,
}

impl Iterator for Snapshot {
    type Item = (Vec<u8>, Value);

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.entries.size_hint()
    }
}

impl ExactSizeIterator for Snapshot {}
