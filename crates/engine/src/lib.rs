//! # levelkv engine
//!
//! An embedded leveled LSM key-value store built from the workspace crates:
//!
//! - [`wal`]: every write is appended and fsynced before it is applied.
//! - [`memtable`]: the mutable in-memory buffer reads check first.
//! - [`sstable`]: immutable sorted tables under `level/<N>/`.
//!
//! [`Engine`] ties them together: writes go WAL → memtable → (at the size
//! threshold) a new level-0 table; reads go memtable → tables newest to
//! oldest; a background thread merges a level's tables into the next level
//! once the level holds `level_threshold` of them.
//!
//! ```no_run
//! use engine::{Engine, EngineConfig};
//!
//! # fn main() -> anyhow::Result<()> {
//! let engine = Engine::open(EngineConfig::new("./data"))?;
//! engine.put(b"name".to_vec(), b"alice".to_vec())?;
//! assert_eq!(engine.get(b"name")?, Some(b"alice".to_vec()));
//! engine.delete(b"name".to_vec())?;
//! assert_eq!(engine.get(b"name")?, None);
//! engine.close()?;
//! # Ok(())
//! # }
//! ```

mod compaction;
mod config;
mod engine;
mod error;
mod stats;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::EngineError;
pub use stats::EngineStats;
