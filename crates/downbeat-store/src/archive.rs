//! Append-only archive of terminal-error tasks.

use crate::error::StoreError;
use crate::files::{read_json_unlocked, write_json_unlocked};
use crate::lock::FileLock;
use downbeat_core::task::TaskRecord;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Handle on `errors.json`. Appends are deduplicated by uuid.
#[derive(Clone, Debug)]
pub struct ErrorArchive {
    path: PathBuf,
    lock: FileLock,
}

impl ErrorArchive {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock = FileLock::for_file(&path);
        Self { path, lock }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Initialize the file to `[]` when missing or unreadable.
    pub fn ensure_initialized(&self) -> Result<(), StoreError> {
        let _guard = self.lock.acquire_write()?;
        let current: Result<Vec<TaskRecord>, StoreError> =
            read_json_unlocked(&self.path, Vec::new);
        match current {
            Ok(_) if self.path.exists() => Ok(()),
            _ => {
                tracing::warn!(path = %self.path.display(), "initializing errors archive to []");
                write_json_unlocked(&self.path, &Vec::<TaskRecord>::new())
            }
        }
    }

    pub fn load(&self) -> Result<Vec<TaskRecord>, StoreError> {
        let _guard = self.lock.acquire_read()?;
        read_json_unlocked(&self.path, Vec::new)
    }

    /// Append records whose uuid is not already archived. Returns the
    /// number actually added.
    pub fn append_dedup(&self, records: &[TaskRecord]) -> Result<usize, StoreError> {
        let _guard = self.lock.acquire_write()?;
        let mut existing: Vec<TaskRecord> = read_json_unlocked(&self.path, Vec::new)?;
        let known: HashSet<&str> = existing.iter().map(|t| t.uuid.as_str()).collect();
        let fresh: Vec<TaskRecord> = records
            .iter()
            .filter(|t| !known.contains(t.uuid.as_str()))
            .cloned()
            .collect();
        let added = fresh.len();
        if added > 0 {
            existing.extend(fresh);
            write_json_unlocked(&self.path, &existing)?;
            tracing::info!(added, "archived error tasks");
        }
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use downbeat_core::link::{LinkInfo, LinkKind};
    use downbeat_core::task::TaskStatus;

    fn error_task(uuid: &str) -> TaskRecord {
        let mut task = TaskRecord::placeholder(
            "alice",
            "https://music.apple.com/us/album/x/1",
            LinkInfo {
                kind: LinkKind::Album,
                storefront: "us".to_string(),
                id: "1".to_string(),
            },
            "2026-01-01T00:00:00",
            0,
            false,
        );
        task.uuid = uuid.to_string();
        task.status = TaskStatus::Error;
        task
    }

    #[test]
    fn append_dedups_by_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ErrorArchive::new(dir.path().join("errors.json"));

        let added = archive
            .append_dedup(&[error_task("a"), error_task("b")])
            .unwrap();
        assert_eq!(added, 2);

        // second append with one duplicate adds exactly one
        let added = archive
            .append_dedup(&[error_task("b"), error_task("c")])
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(archive.load().unwrap().len(), 3);
    }

    #[test]
    fn ensure_initialized_fixes_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("errors.json");
        std::fs::write(&path, "garbage").unwrap();
        let archive = ErrorArchive::new(&path);
        archive.ensure_initialized().unwrap();
        assert!(archive.load().unwrap().is_empty());
    }
}
