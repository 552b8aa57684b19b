//! Persisted API token record.
//!
//! The ingest service memoizes the scraped bearer token here so restarts
//! reuse it until the validity window runs out.

use crate::error::StoreError;
use crate::files::{read_json_unlocked, write_json_unlocked};
use crate::lock::FileLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The on-disk token document: the token plus its fetch timestamp.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub token: String,
    /// ISO-8601 timestamp (local zone) of the successful fetch.
    pub timestamp: String,
}

/// Handle on `api_token.json`.
#[derive(Clone, Debug)]
pub struct TokenFile {
    path: PathBuf,
    lock: FileLock,
}

impl TokenFile {
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

    /// Load the stored record, `None` when absent or unreadable.
    pub fn load(&self) -> Result<Option<TokenRecord>, StoreError> {
        let _guard = self.lock.acquire_read()?;
        read_json_unlocked(&self.path, || None)
    }

    /// Atomically persist a record.
    pub fn save(&self, record: &TokenRecord) -> Result<(), StoreError> {
        let _guard = self.lock.acquire_write()?;
        write_json_unlocked(&self.path, record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let file = TokenFile::new(dir.path().join("api_token.json"));
        assert!(file.load().unwrap().is_none());

        let record = TokenRecord {
            token: "eyJtest".to_string(),
            timestamp: "2026-01-01T08:00:00+08:00".to_string(),
        };
        file.save(&record).unwrap();
        assert_eq!(file.load().unwrap(), Some(record));
    }
}
