//! Disk-backed memoization of upstream search responses.
//!
//! Entries are files named by the MD5 of `storefront:canonical-params`,
//! aged by mtime. Only successful upstream responses are stored; corrupt
//! entries are deleted on read. When the directory outgrows the size cap,
//! oldest entries are evicted until usage falls to 80% of the cap.

use downbeat_core::settings::SearchCacheSettings;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Handle on the search cache directory.
#[derive(Debug)]
pub struct SearchCache {
    settings: SearchCacheSettings,
    dir: PathBuf,
}

impl SearchCache {
    /// Open (and optionally clear) the cache under the project root.
    /// Returns `None` when caching is disabled.
    #[must_use]
    pub fn open(settings: &SearchCacheSettings, root: &Path) -> Option<Self> {
        if !settings.enabled {
            tracing::info!("search cache disabled by configuration");
            return None;
        }
        let configured = Path::new(&settings.cache_dir);
        let dir = if configured.is_absolute() {
            configured.to_path_buf()
        } else {
            root.join(configured)
        };
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::error!(dir = %dir.display(), error = %e, "cannot create search cache dir");
            return None;
        }
        let cache = Self {
            settings: settings.clone(),
            dir,
        };
        if cache.settings.clear_on_startup {
            cache.clear();
        }
        tracing::info!(
            dir = %cache.dir.display(),
            lifetime_hours = cache.settings.cache_lifetime_hours,
            "search cache ready"
        );
        Some(cache)
    }

    /// Cache key: MD5 over the storefront and the canonical (sorted-key)
    /// JSON encoding of the query parameters.
    fn cache_key(storefront: &str, params: &BTreeMap<String, String>) -> String {
        let canonical = serde_json::to_string(params).unwrap_or_default();
        format!("{:x}", md5::compute(format!("{storefront}:{canonical}")))
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Look up a cached response. Expired and corrupt entries are removed
    /// and count as misses.
    #[must_use]
    pub fn lookup(
        &self,
        storefront: &str,
        params: &BTreeMap<String, String>,
    ) -> Option<serde_json::Value> {
        let key = Self::cache_key(storefront, params);
        let path = self.entry_path(&key);

        let metadata = std::fs::metadata(&path).ok()?;
        let age = metadata
            .modified()
            .ok()
            .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())?;
        let lifetime_secs = self.settings.cache_lifetime_hours * 3600;
        if age.as_secs() > lifetime_secs {
            tracing::debug!(key, age_secs = age.as_secs(), "cache entry expired");
            let _ = std::fs::remove_file(&path);
            return None;
        }

        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(value) => {
                    tracing::info!(key, "search cache hit");
                    Some(value)
                }
                Err(e) => {
                    tracing::warn!(key, error = %e, "corrupt cache entry, deleting");
                    let _ = std::fs::remove_file(&path);
                    None
                }
            },
            Err(e) => {
                tracing::warn!(key, error = %e, "cannot read cache entry");
                None
            }
        }
    }

    /// Store a successful response, evicting old entries first when the
    /// directory exceeds its size cap.
    pub fn store(
        &self,
        storefront: &str,
        params: &BTreeMap<String, String>,
        response: &serde_json::Value,
    ) {
        self.evict_if_needed();
        let key = Self::cache_key(storefront, params);
        let path = self.entry_path(&key);
        match serde_json::to_vec(response) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&path, bytes) {
                    tracing::warn!(key, error = %e, "cannot write cache entry");
                } else {
                    tracing::debug!(key, "search response cached");
                }
            }
            Err(e) => tracing::warn!(key, error = %e, "cannot serialize search response"),
        }
    }

    /// Evict mtime-ascending until total size is at most 80% of the cap.
    fn evict_if_needed(&self) {
        let cap_bytes = self.settings.max_cache_size_mb * 1024 * 1024;
        let mut entries: Vec<(PathBuf, u64, SystemTime)> = Vec::new();
        let mut total: u64 = 0;

        let Ok(read_dir) = std::fs::read_dir(&self.dir) else {
            return;
        };
        for entry in read_dir.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            if let Ok(meta) = entry.metadata() {
                let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                total += meta.len();
                entries.push((path, meta.len(), mtime));
            }
        }
        if total <= cap_bytes {
            return;
        }

        tracing::info!(
            total_bytes = total,
            cap_bytes,
            "search cache over size cap, evicting oldest entries"
        );
        entries.sort_by_key(|(_, _, mtime)| *mtime);
        let target = cap_bytes * 8 / 10;
        for (path, size, _) in entries {
            if std::fs::remove_file(&path).is_ok() {
                total = total.saturating_sub(size);
            }
            if total <= target {
                break;
            }
        }
    }

    /// Remove every cached entry.
    pub fn clear(&self) {
        let Ok(read_dir) = std::fs::read_dir(&self.dir) else {
            return;
        };
        let mut removed = 0usize;
        for entry in read_dir.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json")
                && std::fs::remove_file(&path).is_ok()
            {
                removed += 1;
            }
        }
        tracing::info!(removed, "cleared search cache");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache(dir: &Path) -> SearchCache {
        let settings = SearchCacheSettings {
            enabled: true,
            cache_dir: dir.join("search").display().to_string(),
            cache_lifetime_hours: 24,
            max_cache_size_mb: 1,
            clear_on_startup: false,
        };
        SearchCache::open(&settings, dir).unwrap()
    }

    fn params(term: &str) -> BTreeMap<String, String> {
        BTreeMap::from([("term".to_string(), term.to_string())])
    }

    #[test]
    fn store_then_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let response = json!({"results": {"songs": []}});

        assert!(cache.lookup("us", &params("hello")).is_none());
        cache.store("us", &params("hello"), &response);
        assert_eq!(cache.lookup("us", &params("hello")), Some(response));
        // different storefront is a different key
        assert!(cache.lookup("cn", &params("hello")).is_none());
    }

    #[test]
    fn key_is_order_insensitive() {
        // BTreeMap keeps parameters sorted, so two insertion orders agree
        let a: BTreeMap<String, String> = BTreeMap::from([
            ("term".to_string(), "x".to_string()),
            ("types".to_string(), "albums".to_string()),
        ]);
        let b: BTreeMap<String, String> = BTreeMap::from([
            ("types".to_string(), "albums".to_string()),
            ("term".to_string(), "x".to_string()),
        ]);
        assert_eq!(
            SearchCache::cache_key("us", &a),
            SearchCache::cache_key("us", &b)
        );
    }

    #[test]
    fn corrupt_entry_is_deleted_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let key = SearchCache::cache_key("us", &params("bad"));
        let path = cache.entry_path(&key);
        std::fs::write(&path, "{broken").unwrap();

        assert!(cache.lookup("us", &params("bad")).is_none());
        assert!(!path.exists());
    }

    #[test]
    fn disabled_cache_does_not_open() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SearchCacheSettings {
            enabled: false,
            ..SearchCacheSettings::default()
        };
        assert!(SearchCache::open(&settings, dir.path()).is_none());
    }

    #[test]
    fn clear_removes_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        cache.store("us", &params("one"), &json!({"a": 1}));
        cache.store("us", &params("two"), &json!({"b": 2}));
        cache.clear();
        assert!(cache.lookup("us", &params("one")).is_none());
        assert!(cache.lookup("us", &params("two")).is_none());
    }
}
