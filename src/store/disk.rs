// One-file-per-key disk cache with compressed payloads and embedded expiry.
// Writes truncate and rewrite without locking; concurrent writers to one key can
// interleave, and a payload that no longer decodes is deleted on the next read.
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use super::{CacheStore, report_soft_failure, stamp_expiry};
use crate::core::clock::Clock;
use crate::core::codec;
use crate::core::config::BackendKind;
use crate::core::error::{Error, ErrorKind, io_error_kind};
use crate::core::snapshot::CacheEntry;

#[derive(Debug)]
pub struct DiskStore {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
    show_errors: bool,
}

impl DiskStore {
    /// Uses `dir` as-is; a missing directory makes every write a soft failure.
    pub fn new(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            dir: dir.into(),
            clock,
            show_errors: false,
        }
    }

    /// Like `new`, but tries to create the directory first.
    pub fn open(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        let store = Self::new(dir, clock);
        if let Err(err) = fs::create_dir_all(&store.dir) {
            debug!(dir = %store.dir.display(), error = %err, "could not create cache dir");
        }
        store
    }

    pub fn with_show_errors(mut self, show_errors: bool) -> Self {
        self.show_errors = show_errors;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &str) -> Result<PathBuf, Error> {
        validate_key(key)?;
        Ok(self.dir.join(key))
    }

    fn read_entry(&self, path: &Path) -> Result<Option<CacheEntry>, Error> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(Error::new(io_error_kind(&err))
                    .with_message("failed to read cache file")
                    .with_path(path)
                    .with_source(err));
            }
        };
        codec::decode_compressed(&bytes)
            .map(Some)
            .map_err(|err| err.with_path(path))
    }

    fn write_entry(&self, path: &Path, entry: &CacheEntry) -> Result<(), Error> {
        if !self.dir.is_dir() {
            return Err(Error::new(ErrorKind::NotFound)
                .with_message("could not open cache dir")
                .with_path(&self.dir));
        }
        let payload = codec::encode_compressed(entry)?;
        if payload.is_empty() {
            return Err(Error::new(ErrorKind::Internal).with_message("empty cache payload"));
        }
        let mut file = File::create(path).map_err(|err| {
            Error::new(io_error_kind(&err))
                .with_message("failed to open cache file for writing")
                .with_path(path)
                .with_source(err)
        })?;
        file.write_all(&payload).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to write cache file")
                .with_path(path)
                .with_source(err)
        })
    }

    fn remove(&self, path: &Path) -> bool {
        match fs::remove_file(path) {
            Ok(()) => true,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    let err = Error::new(io_error_kind(&err))
                        .with_message("failed to remove cache file")
                        .with_path(path)
                        .with_source(err);
                    report_soft_failure(self.show_errors, BackendKind::Disk, "delete", &err);
                }
                false
            }
        }
    }
}

impl CacheStore for DiskStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Disk
    }

    fn get(&mut self, key: &str) -> Option<CacheEntry> {
        let path = self.path_for(key).ok()?;
        match self.read_entry(&path) {
            Ok(Some(entry)) if entry.is_expired(self.clock.now()) => {
                debug!(key, "disk cache entry expired");
                self.remove(&path);
                None
            }
            Ok(entry) => entry,
            Err(err) => {
                report_soft_failure(self.show_errors, BackendKind::Disk, "get", &err);
                if err.kind() == ErrorKind::Corrupt {
                    self.remove(&path);
                }
                None
            }
        }
    }

    fn set(&mut self, key: &str, entry: &CacheEntry, ttl: u64) -> bool {
        let entry = stamp_expiry(entry, ttl, self.clock.now());
        let result = self
            .path_for(key)
            .and_then(|path| self.write_entry(&path, &entry));
        match result {
            Ok(()) => true,
            Err(err) => {
                report_soft_failure(self.show_errors, BackendKind::Disk, "set", &err);
                false
            }
        }
    }

    fn delete(&mut self, key: &str, timeout: u64) -> bool {
        let Ok(path) = self.path_for(key) else {
            return false;
        };
        if timeout == 0 {
            return self.remove(&path);
        }
        let mut entry = match self.read_entry(&path) {
            Ok(Some(entry)) => entry,
            Ok(None) => return false,
            Err(_) => return self.remove(&path),
        };
        entry.expires_at = self.clock.now() + timeout as f64;
        match self.write_entry(&path, &entry) {
            Ok(()) => true,
            Err(err) => {
                report_soft_failure(self.show_errors, BackendKind::Disk, "delete", &err);
                false
            }
        }
    }

    fn flush(&mut self) -> bool {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => {
                let err = Error::new(io_error_kind(&err))
                    .with_message("failed to read cache dir")
                    .with_path(&self.dir)
                    .with_source(err);
                report_soft_failure(self.show_errors, BackendKind::Disk, "flush", &err);
                return false;
            }
        };
        let mut ok = true;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() && !self.remove(&path) {
                ok = false;
            }
        }
        ok
    }
}

fn validate_key(key: &str) -> Result<(), Error> {
    if key.is_empty() {
        return Err(Error::new(ErrorKind::Usage).with_message("cache key is empty"));
    }
    if key == "." || key == ".." || key.contains(['/', '\\', '\0']) {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("cache key must be a flat file name")
            .with_key(key));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::DiskStore;
    use crate::core::clock::{Clock, ManualClock};
    use crate::core::snapshot::{CacheEntry, Cell, ColumnMeta};
    use crate::store::CacheStore;
    use std::sync::Arc;

    fn entry(clock: &ManualClock, ttl: u64) -> CacheEntry {
        CacheEntry::new(
            vec![ColumnMeta::new("n", "int")],
            vec![vec![Cell::Int(1)], vec![Cell::Int(2)], vec![Cell::Int(3)]],
            3,
            3,
            clock.now(),
            ttl,
        )
    }

    #[test]
    fn keys_with_separators_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = Arc::new(ManualClock::new(100));
        let mut store = DiskStore::new(dir.path(), clock.clone());
        assert!(store.path_for("../escape").is_err());
        assert!(store.path_for("").is_err());
        assert!(!store.set("a/b", &entry(&clock, 5), 5));
        assert!(store.get("..").is_none());
    }

    #[test]
    fn missing_dir_is_soft_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = Arc::new(ManualClock::new(100));
        let mut store = DiskStore::new(dir.path().join("absent"), clock.clone());
        assert!(!store.set("k", &entry(&clock, 5), 5));
        assert!(store.get("k").is_none());
        assert!(!store.flush());
    }

    #[test]
    fn delayed_delete_shortens_expiry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = Arc::new(ManualClock::new(100));
        let mut store = DiskStore::new(dir.path(), clock.clone());
        assert!(store.set("k", &entry(&clock, 600), 600));
        assert!(store.delete("k", 2));
        clock.advance_secs(1);
        assert!(store.get("k").is_some());
        clock.advance_secs(2);
        assert!(store.get("k").is_none());
        assert!(!store.path_for("k").expect("path").exists());
    }
}
