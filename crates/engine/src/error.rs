use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Engine-level failures callers may want to tell apart.
///
/// Public engine methods return `anyhow::Result`; these variants can be
/// recovered with `downcast_ref::<EngineError>()`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine is closed")]
    Closed,
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] serde_yaml::Error),
}
