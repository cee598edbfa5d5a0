use engine::EngineConfig;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Config whose background thread never fires during a test.
pub fn manual_config(dir: &Path) -> EngineConfig {
    EngineConfig::new(dir)
        .flush_threshold(1024 * 1024)
        .compaction_interval(Duration::from_secs(3600))
}

/// Number of table directories holding a data file at `level`.
pub fn tables_on_disk(dir: &Path, level: usize) -> usize {
    match fs::read_dir(sstable::level_dir(dir, level)) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().join(sstable::DATA_FILE).exists())
            .count(),
        Err(_) => 0,
    }
}

/// Polls `cond` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}
