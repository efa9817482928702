//! Persisted "history was just loaded" timestamp.
//!
//! The in-memory latch dies with the controller; this store survives it so a
//! controller recreated moments after a load does not fetch again.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use time::OffsetDateTime;
use tracing::{debug, warn};

pub trait GuardStore: Send + Sync {
    fn last_load(&self) -> Option<OffsetDateTime>;
    fn record_load(&self, at: OffsetDateTime);
    fn clear(&self);
}

/// Stores the timestamp as unix milliseconds in a small text file.
#[derive(Debug, Clone)]
pub struct FileGuardStore {
    path: PathBuf,
}

impl FileGuardStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, at: OffsetDateTime) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let millis = at.unix_timestamp_nanos() / 1_000_000;
        fs::write(&self.path, millis.to_string())
    }
}

impl GuardStore for FileGuardStore {
    fn last_load(&self) -> Option<OffsetDateTime> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(target: "pantry::history", path = %self.path.display(), error = %err, "unreadable history guard");
                return None;
            }
        };
        let millis = raw.trim().parse::<i128>().ok()?;
        OffsetDateTime::from_unix_timestamp_nanos(millis * 1_000_000).ok()
    }

    fn record_load(&self, at: OffsetDateTime) {
        if let Err(err) = self.write(at) {
            warn!(target: "pantry::history", path = %self.path.display(), error = %err, "failed to persist history guard");
        }
    }

    fn clear(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(target: "pantry::history", path = %self.path.display(), "history guard cleared"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(target: "pantry::history", path = %self.path.display(), error = %err, "failed to clear history guard")
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryGuardStore {
    last: Mutex<Option<OffsetDateTime>>,
}

impl MemoryGuardStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GuardStore for MemoryGuardStore {
    fn last_load(&self) -> Option<OffsetDateTime> {
        *self.last.lock()
    }

    fn record_load(&self, at: OffsetDateTime) {
        *self.last.lock() = Some(at);
    }

    fn clear(&self) {
        self.last.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("pantry-guard-{}", uuid::Uuid::new_v4()))
            .join(name)
    }

    #[test]
    fn file_store_round_trips_millisecond_timestamps() {
        let store = FileGuardStore::new(scratch_path("history.guard"));
        assert_eq!(store.last_load(), None);

        let at = OffsetDateTime::UNIX_EPOCH + Duration::milliseconds(1_714_557_600_123);
        store.record_load(at);
        assert_eq!(store.last_load(), Some(at));

        store.clear();
        assert_eq!(store.last_load(), None);
        store.clear();
        if let Some(parent) = store.path().parent() {
            let _ = fs::remove_dir_all(parent);
        }
    }

    #[test]
    fn corrupt_file_reads_as_absent() {
        let store = FileGuardStore::new(scratch_path("history.guard"));
        store.record_load(OffsetDateTime::UNIX_EPOCH);
        fs::write(store.path(), "yesterday").unwrap();
        assert_eq!(store.last_load(), None);
        if let Some(parent) = store.path().parent() {
            let _ = fs::remove_dir_all(parent);
        }
    }

    #[test]
    fn memory_store_clears() {
        let store = MemoryGuardStore::new();
        store.record_load(OffsetDateTime::UNIX_EPOCH);
        assert!(store.last_load().is_some());
        store.clear();
        assert!(store.last_load().is_none());
    }
}
