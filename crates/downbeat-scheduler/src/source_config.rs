//! Rendering of the downloader's source config.
//!
//! The shared `source.yaml` is a template: its port fields may be lists
//! (one entry per decryptor instance), the `{user}` placeholder selects
//! the submitting user's layout, and the freshly fetched API token is
//! injected. Port selection is round-robin so concurrent subprocesses
//! talk to different decryptor instances.

use crate::error::SchedulerError;
use downbeat_store::{read_yaml_with_lock, FileLock};
use serde_yaml::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

const DECRYPT_PORT_KEY: &str = "decrypt-m3u8-port";
const GET_PORT_KEY: &str = "get-m3u8-port";
const API_TOKEN_KEY: &str = "api_token";

/// Renders per-invocation downloader configs from the shared template.
#[derive(Debug)]
pub struct SourceConfigRenderer {
    path: PathBuf,
    lock: FileLock,
    decrypt_counter: AtomicUsize,
    get_counter: AtomicUsize,
}

impl SourceConfigRenderer {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock = FileLock::for_file(&path);
        Self {
            path,
            lock,
            decrypt_counter: AtomicUsize::new(0),
            get_counter: AtomicUsize::new(0),
        }
    }

    /// Produce the YAML document for one subprocess invocation.
    pub fn render(&self, user: &str, api_token: Option<&str>) -> Result<String, SchedulerError> {
        let mut doc: Value = read_yaml_with_lock(&self.path, &self.lock, || Value::Null)?;
        let Value::Mapping(mapping) = &mut doc else {
            return Err(SchedulerError::SourceConfig(format!(
                "{} is not a YAML mapping",
                self.path.display()
            )));
        };

        Self::pick_port(mapping, DECRYPT_PORT_KEY, &self.decrypt_counter);
        Self::pick_port(mapping, GET_PORT_KEY, &self.get_counter);

        match api_token {
            Some(token) => {
                mapping.insert(
                    Value::String(API_TOKEN_KEY.to_string()),
                    Value::String(token.to_string()),
                );
            }
            None => {
                tracing::warn!("no API token available, downloader will fetch its own");
            }
        }

        let rendered = serde_yaml::to_string(&doc)
            .map_err(|e| SchedulerError::SourceConfig(e.to_string()))?;
        Ok(rendered.replace("{user}", user))
    }

    /// Collapse a list-valued port field to one entry, round-robin.
    fn pick_port(mapping: &mut serde_yaml::Mapping, key: &str, counter: &AtomicUsize) {
        let key_value = Value::String(key.to_string());
        let Some(Value::Sequence(ports)) = mapping.get(&key_value) else {
            return;
        };
        if ports.is_empty() {
            return;
        }
        let index = counter.fetch_add(1, Ordering::Relaxed) % ports.len();
        let chosen = ports[index].clone();
        tracing::debug!(key, index, "round-robin port selected");
        mapping.insert(key_value, chosen);
    }
}
