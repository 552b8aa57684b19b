//! Resolution of the shared on-disk files against a project root.

use crate::settings::PathSettings;
use std::path::{Path, PathBuf};

pub const DEFAULT_QUEUE_FILE: &str = "info/task_queue.json";
pub const DEFAULT_ERRORS_FILE: &str = "info/errors.json";
pub const DEFAULT_USERS_FILE: &str = "config/users.yaml";
pub const DEFAULT_SOURCE_FILE: &str = "config/source.yaml";
pub const DEFAULT_TOKEN_FILE: &str = "config/api_token.json";

/// Absolute locations of every shared file, resolved once at boot.
#[derive(Clone, Debug)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub task_queue: PathBuf,
    pub errors: PathBuf,
    pub users: PathBuf,
    pub source: PathBuf,
    pub token: PathBuf,
    pub logs: PathBuf,
}

impl ProjectPaths {
    /// Resolve configured (or default) relative paths against `root`.
    #[must_use]
    pub fn resolve(root: &Path, paths: &PathSettings, log_path: &str) -> Self {
        let resolve_one = |configured: Option<&String>, default: &str| -> PathBuf {
            let rel = configured.map_or(default, String::as_str);
            let p = Path::new(rel);
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                root.join(p)
            }
        };

        Self {
            root: root.to_path_buf(),
            task_queue: resolve_one(paths.task_queue.as_ref(), DEFAULT_QUEUE_FILE),
            errors: resolve_one(paths.errors.as_ref(), DEFAULT_ERRORS_FILE),
            users: resolve_one(paths.users.as_ref(), DEFAULT_USERS_FILE),
            source: resolve_one(paths.source.as_ref(), DEFAULT_SOURCE_FILE),
            token: resolve_one(paths.token.as_ref(), DEFAULT_TOKEN_FILE),
            logs: resolve_one(Some(&log_path.to_string()), "logs.log"),
        }
    }

    /// Create the parent directory of every resolved file.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        for file in [
            &self.task_queue,
            &self.errors,
            &self.users,
            &self.source,
            &self.token,
            &self.logs,
        ] {
            if let Some(parent) = file.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::PathSettings;

    #[test]
    fn defaults_resolve_under_root() {
        let paths = ProjectPaths::resolve(Path::new("/srv/app"), &PathSettings::default(), "logs.log");
        assert_eq!(paths.task_queue, Path::new("/srv/app/info/task_queue.json"));
        assert_eq!(paths.errors, Path::new("/srv/app/info/errors.json"));
        assert_eq!(paths.token, Path::new("/srv/app/config/api_token.json"));
    }

    #[test]
    fn absolute_overrides_win() {
        let settings = PathSettings {
            task_queue: Some("/var/lib/downbeat/queue.json".to_string()),
            ..PathSettings::default()
        };
        let paths = ProjectPaths::resolve(Path::new("/srv/app"), &settings, "logs.log");
        assert_eq!(paths.task_queue, Path::new("/var/lib/downbeat/queue.json"));
        assert_eq!(paths.users, Path::new("/srv/app/config/users.yaml"));
    }

    #[test]
    fn ensure_directories_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ProjectPaths::resolve(dir.path(), &PathSettings::default(), "logs.log");
        paths.ensure_directories().unwrap();
        assert!(dir.path().join("info").is_dir());
        assert!(dir.path().join("config").is_dir());
    }
}
