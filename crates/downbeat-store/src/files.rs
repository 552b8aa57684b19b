//! Lock-guarded JSON and YAML file access.
//!
//! Reads tolerate a missing or empty file by returning the caller's
//! default. Writes serialize to `<path>.tmp`, fsync, then atomically
//! rename over the target.

use crate::error::StoreError;
use crate::lock::FileLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::Path;

/// Read a JSON file under its lock, returning `default` when the file is
/// absent or empty.
pub fn read_json_with_lock<T: DeserializeOwned>(
    path: &Path,
    lock: &FileLock,
    default: impl FnOnce() -> T,
) -> Result<T, StoreError> {
    let _guard = lock.acquire_read()?;
    read_json_unlocked(path, default)
}

/// Read without taking the lock; callers that already hold a guard from a
/// read-modify-write use this.
pub(crate) fn read_json_unlocked<T: DeserializeOwned>(
    path: &Path,
    default: impl FnOnce() -> T,
) -> Result<T, StoreError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(default()),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    if content.trim().is_empty() {
        return Ok(default());
    }
    serde_json::from_str(&content).map_err(|e| StoreError::parse(path, e))
}

/// Write a JSON file under its lock via temp-file + atomic rename.
pub fn write_json_with_lock<T: Serialize>(
    path: &Path,
    lock: &FileLock,
    data: &T,
) -> Result<(), StoreError> {
    let _guard = lock.acquire_write()?;
    write_json_unlocked(path, data)
}

pub(crate) fn write_json_unlocked<T: Serialize>(path: &Path, data: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StoreError::io(path, e))?;
    }
    let mut tmp_path = path.as_os_str().to_owned();
    tmp_path.push(".tmp");
    let tmp_path = Path::new(&tmp_path);

    let serialized =
        serde_json::to_vec_pretty(data).map_err(|e| StoreError::parse(path, e))?;

    let result = (|| -> std::io::Result<()> {
        let mut file = std::fs::File::create(tmp_path)?;
        file.write_all(&serialized)?;
        file.sync_all()?;
        std::fs::rename(tmp_path, path)
    })();

    if let Err(e) = result {
        let _ = std::fs::remove_file(tmp_path);
        return Err(StoreError::io(path, e));
    }
    tracing::debug!(path = %path.display(), "wrote JSON file");
    Ok(())
}

/// Read a YAML file under its lock, returning `default` when absent/empty.
pub fn read_yaml_with_lock<T: DeserializeOwned>(
    path: &Path,
    lock: &FileLock,
    default: impl FnOnce() -> T,
) -> Result<T, StoreError> {
    let _guard = lock.acquire_read()?;
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "YAML file not found, using default");
            return Ok(default());
        }
        Err(e) => return Err(StoreError::io(path, e)),
    };
    if content.trim().is_empty() {
        return Ok(default());
    }
    serde_yaml::from_str(&content).map_err(|e| StoreError::parse(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        name: String,
        count: u32,
    }

    #[test]
    fn json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let lock = FileLock::for_file(&path);

        let doc = Doc {
            name: "x".to_string(),
            count: 3,
        };
        write_json_with_lock(&path, &lock, &doc).unwrap();
        let read: Doc = read_json_with_lock(&path, &lock, || Doc {
            name: String::new(),
            count: 0,
        })
        .unwrap();
        assert_eq!(read, doc);
        // no temp file left behind
        assert!(!dir.path().join("doc.json.tmp").exists());
    }

    #[test]
    fn missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        let lock = FileLock::for_file(&path);
        let read: Vec<u32> = read_json_with_lock(&path, &lock, Vec::new).unwrap();
        assert!(read.is_empty());
    }

    #[test]
    fn corrupt_json_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        let lock = FileLock::for_file(&path);
        let err = read_json_with_lock::<Vec<u32>>(&path, &lock, Vec::new).unwrap_err();
        assert!(matches!(err, StoreError::Parse { .. }));
    }

    #[test]
    fn yaml_read_with_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf.yaml");
        std::fs::write(&path, "name: y\ncount: 7\n").unwrap();
        let lock = FileLock::for_file(&path);
        let read: Doc = read_yaml_with_lock(&path, &lock, || Doc {
            name: String::new(),
            count: 0,
        })
        .unwrap();
        assert_eq!(read.count, 7);
    }
}
