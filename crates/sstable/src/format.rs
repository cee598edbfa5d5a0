//! Directory layout helpers and the positional reader used for lookups.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Directory under the data dir that holds one subdirectory per level.
pub const LEVEL_DIR: &str = "level";

/// File name of a table's data inside its directory.
pub const DATA_FILE: &str = "data.sst";

/// `<data_dir>/level/<level>`
pub fn level_dir<P: AsRef<Path>>(data_dir: P, level: usize) -> PathBuf {
    data_dir.as_ref().join(LEVEL_DIR).join(level.to_string())
}

/// `<data_dir>/level/<level>/<id>`; ids are zero-padded so a directory
/// listing sorts oldest first.
pub fn table_dir<P: AsRef<Path>>(data_dir: P, level: usize, id: u64) -> PathBuf {
    level_dir(data_dir, level).join(format!("{:06}", id))
}

/// A table found on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TableLocation {
    pub level: usize,
    pub id: u64,
}

/// Result of scanning `<data_dir>/level`.
#[derive(Debug, Default)]
pub struct Listing {
    /// Tables with a data file, sorted by `(level, id)`.
    pub tables: Vec<TableLocation>,
    /// Table directories without a data file, left behind by an interrupted
    /// create.
    pub orphans: Vec<PathBuf>,
}

fn numeric_dirs(dir: &Path) -> io::Result<Vec<(u64, PathBuf)>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let parsed = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u64>().ok());
        if let Some(n) = parsed {
            out.push((n, entry.path()));
        }
    }
    Ok(out)
}

/// Lists every table under `<data_dir>/level`.
///
/// Entries whose names are not numbers are ignored. A missing level
/// directory yields an empty listing.
pub fn list_tables<P: AsRef<Path>>(data_dir: P) -> io::Result<Listing> {
    let root = data_dir.as_ref().join(LEVEL_DIR);
    let mut listing = Listing::default();
    if !root.exists() {
        return Ok(listing);
    }

    for (level, level_path) in numeric_dirs(&root)? {
        for (id, table_path) in numeric_dirs(&level_path)? {
            if table_path.join(DATA_FILE).is_file() {
                listing.tables.push(TableLocation {
                    level: level as usize,
                    id,
                });
            } else {
                listing.orphans.push(table_path);
            }
        }
    }
    listing.tables.sort();
    Ok(listing)
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}

/// `Read + Seek` over a shared `&File` that never touches the file cursor,
/// so concurrent readers holding the same handle cannot disturb each other.
pub(crate) struct ReadAt<'a> {
    file: &'a File,
    pos: u64,
}

impl<'a> ReadAt<'a> {
    pub(crate) fn new(file: &'a File, pos: u64) -> Self {
        Self { file, pos }
    }
}

impl Read for ReadAt<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = read_at(self.file, buf, self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for ReadAt<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
            SeekFrom::End(d) => self.file.metadata()?.len().checked_add_signed(d),
        };
        match target {
            Some(p) => {
                self.pos = p;
                Ok(p)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative position",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn table_dir_is_nested_under_level() {
        let p = table_dir("/data", 2, 17);
        assert_eq!(p, PathBuf::from("/data/level/2/000017"));
    }

    #[test]
    fn list_tables_skips_junk_and_reports_orphans() {
        let dir = tempdir().unwrap();
        let root = dir.path();

        for (level, id) in [(0usize, 3u64), (0, 1), (2, 2)] {
            let d = table_dir(root, level, id);
            fs::create_dir_all(&d).unwrap();
            fs::write(d.join(DATA_FILE), b"").unwrap();
        }
        fs::create_dir_all(table_dir(root, 1, 9)).unwrap(); // no data file
        fs::create_dir_all(root.join(LEVEL_DIR).join("not-a-level")).unwrap();
        fs::write(level_dir(root, 0).join("README"), b"x").unwrap();

        let listing = list_tables(root).unwrap();
        assert_eq!(
            listing.tables,
            vec![
                TableLocation { level: 0, id: 1 },
                TableLocation { level: 0, id: 3 },
                TableLocation { level: 2, id: 2 },
            ]
        );
        assert_eq!(listing.orphans, vec![table_dir(root, 1, 9)]);
    }

    #[test]
    fn list_tables_without_level_dir() {
        let dir = tempdir().unwrap();
        let listing = list_tables(dir.path()).unwrap();
        assert!(listing.tables.is_empty());
        assert!(listing.orphans.is_empty());
    }

    #[test]
    fn read_at_does_not_share_cursor() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"0123456789").unwrap();
        let file = File::open(&path).unwrap();

        let mut a = ReadAt::new(&file, 2);
        let mut b = ReadAt::new(&file, 7);
        let mut buf = [0u8; 2];
        a.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"23");
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"78");
        a.seek(SeekFrom::Current(1)).unwrap();
        a.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"56");
    }
}
