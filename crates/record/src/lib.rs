//! # Record
//!
//! The binary key/value record shared by the write-ahead log and by every
//! SSTable. Both files are nothing more than a run of these records; there is
//! no header, footer, checksum or terminator.
//!
//! ## Layout
//!
//! ```text
//! ┌──────────────────┬────────────────────┬───────────┬─────────────┐
//! │ key_len (u32 LE) │ value_len (u32 LE) │ key bytes │ value bytes │
//! └──────────────────┴────────────────────┴───────────┴─────────────┘
//! ```
//!
//! A tombstone is written with `value_len == u32::MAX` ([`TOMBSTONE_LEN`])
//! and no value bytes, so deletions survive flush and compaction without
//! changing the layout above.
//!
//! End of file is the only record boundary signal. A record cut short by a
//! crash mid-append is reported as [`Decoded::Truncated`] and readers treat it
//! as the end of usable data, never as an error.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Size of the fixed record header: `key_len` + `value_len`.
pub const HEADER_BYTES: u64 = 4 + 4;

/// `value_len` sentinel marking a tombstone.
pub const TOMBSTONE_LEN: u32 = u32::MAX;

/// The value half of a record: either live bytes or a deletion marker.
///
/// `Put(vec![])` is a real, empty value and is not a deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Put(Vec<u8>),
    Tombstone,
}

impl Value {
    /// Payload length in bytes; a tombstone counts as zero.
    pub fn len(&self) -> usize {
        match self {
            Value::Put(v) => v.len(),
            Value::Tombstone => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, Value::Tombstone)
    }

    /// Borrow the live bytes, `None` for a tombstone.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Put(v) => Some(v),
            Value::Tombstone => None,
        }
    }

    /// Convert into the live bytes, `None` for a tombstone.
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Value::Put(v) => Some(v),
            Value::Tombstone => None,
        }
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Put(v)
    }
}

/// A decoded `(key, value)` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Value,
}

impl Record {
    pub fn put(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            key,
            value: Value::Put(value),
        }
    }

    pub fn tombstone(key: Vec<u8>) -> Self {
        Self {
            key,
            value: Value::Tombstone,
        }
    }

    /// Number of bytes this record occupies on disk.
    pub fn encoded_len(&self) -> u64 {
        HEADER_BYTES + self.key.len() as u64 + self.value.len() as u64
    }
}

/// Decoded record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub key_len: u32,
    pub value_len: u32,
}

impl Header {
    pub fn is_tombstone(&self) -> bool {
        self.value_len == TOMBSTONE_LEN
    }

    /// Number of value bytes following the key.
    pub fn value_bytes(&self) -> u64 {
        if self.is_tombstone() {
            0
        } else {
            self.value_len as u64
        }
    }

    /// Total on-disk size of the record this header starts.
    pub fn record_len(&self) -> u64 {
        HEADER_BYTES + self.key_len as u64 + self.value_bytes()
    }
}

/// Outcome of decoding one item from a record stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded<T> {
    Item(T),
    /// Clean end of input on a record boundary.
    Eof,
    /// Input ended part-way through a record.
    Truncated,
}

fn invalid_input(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}

fn header_for(key: &[u8], value: &Value) -> io::Result<Header> {
    let key_len = u32::try_from(key.len())
        .map_err(|_| invalid_input(format!("key of {} bytes is too large", key.len())))?;
    let value_len = match value {
        Value::Put(v) if v.len() >= TOMBSTONE_LEN as usize => {
            return Err(invalid_input(format!(
                "value of {} bytes is too large",
                v.len()
            )));
        }
        Value::Put(v) => v.len() as u32,
        Value::Tombstone => TOMBSTONE_LEN,
    };
    Ok(Header { key_len, value_len })
}

/// Writes one record to `w`, returning the number of bytes written.
///
/// Fails with `InvalidInput` before writing anything if the key or value does
/// not fit the `u32` length fields.
pub fn write_record<W: Write>(w: &mut W, key: &[u8], value: &Value) -> io::Result<u64> {
    let header = header_for(key, value)?;
    w.write_u32::<LittleEndian>(header.key_len)?;
    w.write_u32::<LittleEndian>(header.value_len)?;
    w.write_all(key)?;
    if let Value::Put(v) = value {
        w.write_all(v)?;
    }
    Ok(header.record_len())
}

/// Encodes one record into a fresh buffer.
pub fn encode_record(key: &[u8], value: &Value) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(HEADER_BYTES as usize + key.len() + value.len());
    write_record(&mut buf, key, value)?;
    Ok(buf)
}

// Fills `buf` as far as the input allows and reports how many bytes landed.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Reads a record header.
pub fn read_header<R: Read>(r: &mut R) -> io::Result<Decoded<Header>> {
    let mut buf = [0u8; HEADER_BYTES as usize];
    match read_full(r, &mut buf)? {
        0 => return Ok(Decoded::Eof),
        n if n < buf.len() => return Ok(Decoded::Truncated),
        _ => {}
    }
    let mut cur = &buf[..];
    let key_len = cur.read_u32::<LittleEndian>()?;
    let value_len = cur.read_u32::<LittleEndian>()?;
    Ok(Decoded::Item(Header { key_len, value_len }))
}

/// Reads exactly `len` bytes following a header, or reports truncation.
pub fn read_body<R: Read>(r: &mut R, len: u64) -> io::Result<Decoded<Vec<u8>>> {
    // Grow with the data actually present instead of trusting `len` for the
    // allocation; a torn header can carry any length.
    let mut buf = Vec::new();
    let got = r.take(len).read_to_end(&mut buf)?;
    if (got as u64) < len {
        return Ok(Decoded::Truncated);
    }
    Ok(Decoded::Item(buf))
}

/// Reads one full record.
pub fn read_record<R: Read>(r: &mut R) -> io::Result<Decoded<Record>> {
    let header = match read_header(r)? {
        Decoded::Item(h) => h,
        Decoded::Eof => return Ok(Decoded::Eof),
        Decoded::Truncated => return Ok(Decoded::Truncated),
    };
    let key = match read_body(r, header.key_len as u64)? {
        Decoded::Item(k) => k,
        _ => return Ok(Decoded::Truncated),
    };
    if header.is_tombstone() {
        return Ok(Decoded::Item(Record::tombstone(key)));
    }
    match read_body(r, header.value_bytes())? {
        Decoded::Item(v) => Ok(Decoded::Item(Record::put(key, v))),
        _ => Ok(Decoded::Truncated),
    }
}

/// Sequential record decoder over any byte stream.
///
/// Yields records in stream order and stops at EOF or at a truncated
/// trailing record. After iteration, [`offset`](RecordReader::offset) is the
/// end of the last complete record and [`truncated`](RecordReader::truncated)
/// tells whether a partial record followed it.
pub struct RecordReader<R> {
    inner: R,
    offset: u64,
    truncated: bool,
    done: bool,
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            offset: 0,
            truncated: false,
            done: false,
        }
    }

    /// Byte offset just past the last complete record read so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// `true` once a partial trailing record has been seen.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Decodes the next record; `Ok(None)` at end of usable data.
    pub fn next_record(&mut self) -> io::Result<Option<Record>> {
        if self.done {
            return Ok(None);
        }
        match read_record(&mut self.inner)? {
            Decoded::Item(rec) => {
                self.offset += rec.encoded_len();
                Ok(Some(rec))
            }
            Decoded::Eof => {
                self.done = true;
                Ok(None)
            }
            Decoded::Truncated => {
                self.done = true;
                self.truncated = true;
                Ok(None)
            }
        }
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = io::Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_record() {
            Ok(Some(rec)) => Some(Ok(rec)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_little_endian_lengths_then_bytes() {
        let buf = encode_record(b"ab", &Value::Put(b"xyz".to_vec())).unwrap();
        assert_eq!(
            buf,
            vec![2, 0, 0, 0, 3, 0, 0, 0, b'a', b'b', b'x', b'y', b'z']
        );
    }

    #[test]
    fn tombstone_uses_sentinel_and_no_value_bytes() {
        let buf = encode_record(b"k", &Value::Tombstone).unwrap();
        assert_eq!(buf, vec![1, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF, b'k']);

        let rec = Record::tombstone(b"k".to_vec());
        assert_eq!(rec.encoded_len(), buf.len() as u64);
    }

    #[test]
    fn empty_value_is_not_a_tombstone() {
        let buf = encode_record(b"k", &Value::Put(Vec::new())).unwrap();
        match read_record(&mut &buf[..]).unwrap() {
            Decoded::Item(rec) => assert_eq!(rec.value, Value::Put(Vec::new())),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn reader_yields_records_in_order() {
        let mut buf = Vec::new();
        write_record(&mut buf, b"b", &Value::Put(b"2".to_vec())).unwrap();
        write_record(&mut buf, b"a", &Value::Tombstone).unwrap();
        write_record(&mut buf, b"c", &Value::Put(b"3".to_vec())).unwrap();

        let recs: Vec<Record> = RecordReader::new(&buf[..])
            .collect::<io::Result<_>>()
            .unwrap();
        assert_eq!(
            recs,
            vec![
                Record::put(b"b".to_vec(), b"2".to_vec()),
                Record::tombstone(b"a".to_vec()),
                Record::put(b"c".to_vec(), b"3".to_vec()),
            ]
        );
    }

    #[test]
    fn partial_trailing_record_ends_stream() {
        let mut buf = Vec::new();
        let first = write_record(&mut buf, b"k1", &Value::Put(b"v1".to_vec())).unwrap();
        write_record(&mut buf, b"k2", &Value::Put(b"value-two".to_vec())).unwrap();

        // Every cut inside the second record must leave exactly the first one.
        for cut in (first as usize + 1)..buf.len() {
            let mut reader = RecordReader::new(&buf[..cut]);
            let rec = reader.next_record().unwrap().unwrap();
            assert_eq!(rec.key, b"k1");
            assert!(reader.next_record().unwrap().is_none());
            assert!(reader.truncated(), "cut at {} not flagged", cut);
            assert_eq!(reader.offset(), first);
        }
    }

    #[test]
    fn clean_eof_is_not_truncation() {
        let buf = encode_record(b"k", &Value::Put(b"v".to_vec())).unwrap();
        let mut reader = RecordReader::new(&buf[..]);
        assert!(reader.next_record().unwrap().is_some());
        assert!(reader.next_record().unwrap().is_none());
        assert!(!reader.truncated());
        assert_eq!(reader.offset(), buf.len() as u64);
    }

    #[test]
    fn header_record_len_accounts_for_tombstone() {
        let live = Header {
            key_len: 3,
            value_len: 5,
        };
        assert_eq!(live.record_len(), 8 + 3 + 5);

        let dead = Header {
            key_len: 3,
            value_len: TOMBSTONE_LEN,
        };
        assert_eq!(dead.record_len(), 8 + 3);
    }
}
