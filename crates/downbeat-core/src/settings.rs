//! Service configuration loaded from a single YAML file.
//!
//! Every knob has a serde default so a minimal config file works; the
//! upstream section (API base URL, token scrape URL and regexes) must be
//! present for the ingest service to function and is checked by
//! [`Settings::validate`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Default scheduler wake port, loopback UDP.
pub const DEFAULT_SIGNAL_PORT: u16 = 51234;
/// Default ingest HTTP port.
pub const DEFAULT_INGEST_PORT: u16 = 5000;
/// Default SSE HTTP port on the scheduler.
pub const DEFAULT_SSE_PORT: u16 = 5001;

const fn default_max_parallel() -> usize {
    5
}
const fn default_max_parallel_tasks() -> usize {
    10
}
const fn default_max_global_processes() -> usize {
    10
}
const fn default_max_retries() -> u32 {
    2
}
const fn default_retry_delay() -> u64 {
    10
}
const fn default_long_poll() -> u64 {
    60
}
const fn default_fast_poll() -> u64 {
    3
}
const fn default_signal_port() -> u16 {
    DEFAULT_SIGNAL_PORT
}
const fn default_ingest_port() -> u16 {
    DEFAULT_INGEST_PORT
}
fn default_ingest_base_url() -> String {
    format!("http://127.0.0.1:{DEFAULT_INGEST_PORT}")
}
const fn default_sse_port() -> u16 {
    DEFAULT_SSE_PORT
}
const fn default_sse_max_connections() -> usize {
    50
}
const fn default_token_validity_hours() -> u64 {
    12
}
const fn default_token_refresh_interval() -> u64 {
    5 * 60
}
const fn default_token_refresh_threshold() -> u64 {
    60 * 60
}
const fn default_true() -> bool {
    true
}
const fn default_cache_lifetime_hours() -> u64 {
    24
}
const fn default_cache_size_mb() -> u64 {
    100
}
fn default_cache_dir() -> String {
    "cache/search".to_string()
}
fn default_storefront() -> String {
    "cn".to_string()
}
fn default_push_path() -> String {
    "/Apple-Music-Downloader/{info}".to_string()
}
fn default_push_icon() -> String {
    "https://music.apple.com/assets/favicon/favicon-180.png".to_string()
}

/// Scheduler timing and capacity knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Maximum tasks in `running` at once.
    pub max_parallel: usize,
    /// Per-task track worker pool size.
    pub max_parallel_tasks: usize,
    /// Hard cap on live downloader subprocesses across all tasks.
    pub max_global_processes: usize,
    /// Idle poll interval, seconds.
    pub long_poll_interval: u64,
    /// Poll interval after a wake signal, seconds.
    pub fast_poll_interval: u64,
    /// Loopback UDP port the scheduler listens on for wake datagrams.
    pub signal_port: u16,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            max_parallel_tasks: default_max_parallel_tasks(),
            max_global_processes: default_max_global_processes(),
            long_poll_interval: default_long_poll(),
            fast_poll_interval: default_fast_poll(),
            signal_port: default_signal_port(),
        }
    }
}

/// Upstream catalog API and token scrape configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamSettings {
    /// Catalog API base, e.g. `https://amp-api.music.apple.com/v1/catalog`.
    pub api_base_url: String,
    /// Landing page the token is scraped from.
    pub token_fetch_url: String,
    /// Regex locating the legacy JS bundle URI in the landing page.
    pub token_fetch_js_regex: String,
    /// Regex locating the bearer token inside the JS bundle.
    pub token_fetch_token_regex: String,
    #[serde(default = "default_token_validity_hours")]
    pub token_validity_hours: u64,
    /// Background refresher wake interval, seconds.
    #[serde(default = "default_token_refresh_interval")]
    pub token_refresh_interval_seconds: u64,
    /// Refresh when remaining validity drops below this, seconds.
    #[serde(default = "default_token_refresh_threshold")]
    pub token_refresh_threshold_seconds: u64,
    pub user_agent: String,
    /// storefront → BCP-47 language tag for `l=` parameters.
    pub storefront_language_map: BTreeMap<String, String>,
    /// Storefront reported by `GET /token` and used as the search default.
    #[serde(default = "default_storefront")]
    pub default_storefront: String,
}

/// Search cache behavior.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchCacheSettings {
    pub enabled: bool,
    pub cache_dir: String,
    pub cache_lifetime_hours: u64,
    pub max_cache_size_mb: u64,
    pub clear_on_startup: bool,
}

impl Default for SearchCacheSettings {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            cache_dir: default_cache_dir(),
            cache_lifetime_hours: default_cache_lifetime_hours(),
            max_cache_size_mb: default_cache_size_mb(),
            clear_on_startup: default_true(),
        }
    }
}

/// SSE server limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SseSettings {
    pub port: u16,
    pub max_connections: usize,
}

impl Default for SseSettings {
    fn default() -> Self {
        Self {
            port: default_sse_port(),
            max_connections: default_sse_max_connections(),
        }
    }
}

/// Push notification rendering.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PushSettings {
    /// Path template appended to each endpoint; `{info}` is replaced with
    /// the URL-encoded message.
    pub path: String,
    pub icon: String,
    /// Click-through fallback when no deep link can be built.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_url: Option<String>,
    /// Library user id used when querying for album deep links.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library_user_id: Option<String>,
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            path: default_push_path(),
            icon: default_push_icon(),
            fallback_url: None,
            library_user_id: None,
        }
    }
}

/// SMTP credentials for summary emails.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpSettings {
    pub smtp_server: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: String,
}

impl SmtpSettings {
    /// Whether enough is configured to attempt sending.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.smtp_server.is_empty() && self.smtp_port != 0 && !self.username.is_empty()
    }
}

/// File locations, relative paths resolved against the project root.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
}

/// Top-level configuration document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    pub scheduler: SchedulerSettings,
    pub sse: SseSettings,
    /// Ingest HTTP listen port.
    #[serde(default = "default_ingest_port")]
    pub ingest_port: u16,
    /// Base URL the scheduler uses to reach the ingest service.
    #[serde(default = "default_ingest_base_url")]
    pub ingest_base_url: String,
    /// Frontend origins allowed to call the HTTP APIs cross-origin.
    /// Empty means same-origin only: the identity header makes every
    /// request preflighted, and without CORS approval the preflight
    /// fails, so third-party pages cannot reach the API. `"*"` opts
    /// into allowing any origin.
    #[serde(default)]
    pub cors_allowed_origins: Vec<String>,
    pub upstream: UpstreamSettings,
    pub search_cache: SearchCacheSettings,
    pub push_notification: PushSettings,
    pub email: SmtpSettings,
    pub paths: PathSettings,
    /// Path to the downloader binary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloader_binary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    /// Legacy flat log path key; `paths.logs` is canonical. Both are
    /// recognized on read, the legacy key is never written back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file_path: Option<String>,
}

/// Settings parse / validation errors.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("missing required config key: {0}")]
    MissingKey(&'static str),
    #[error("invalid config value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

impl Settings {
    /// Load and validate settings from a YAML file.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let settings: Self = serde_yaml::from_str(&text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check the keys the services cannot run without.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.upstream.api_base_url.is_empty() {
            return Err(SettingsError::MissingKey("upstream.api_base_url"));
        }
        if self.upstream.token_fetch_url.is_empty() {
            return Err(SettingsError::MissingKey("upstream.token_fetch_url"));
        }
        if self.upstream.token_fetch_js_regex.is_empty() {
            return Err(SettingsError::MissingKey("upstream.token_fetch_js_regex"));
        }
        if self.upstream.token_fetch_token_regex.is_empty() {
            return Err(SettingsError::MissingKey(
                "upstream.token_fetch_token_regex",
            ));
        }
        if self.upstream.user_agent.is_empty() {
            return Err(SettingsError::MissingKey("upstream.user_agent"));
        }
        if self.upstream.storefront_language_map.is_empty() {
            return Err(SettingsError::MissingKey(
                "upstream.storefront_language_map",
            ));
        }
        if self.scheduler.max_parallel == 0 {
            return Err(SettingsError::InvalidValue {
                key: "scheduler.max_parallel",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.scheduler.max_global_processes == 0 {
            return Err(SettingsError::InvalidValue {
                key: "scheduler.max_global_processes",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.sse.max_connections == 0 {
            return Err(SettingsError::InvalidValue {
                key: "sse.max_connections",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Effective log file path: `paths.logs` wins, then the legacy flat
    /// `log_file_path` key, then the default.
    #[must_use]
    pub fn effective_log_path(&self) -> String {
        self.paths
            .logs
            .clone()
            .or_else(|| self.log_file_path.clone())
            .unwrap_or_else(|| "logs.log".to_string())
    }

    /// Language tag for a storefront, falling back to `en-US`.
    #[must_use]
    pub fn language_for(&self, storefront: &str) -> &str {
        self.upstream
            .storefront_language_map
            .get(storefront)
            .map_or("en-US", String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
upstream:
  api_base_url: https://amp-api.music.apple.com/v1/catalog
  token_fetch_url: https://music.apple.com
  token_fetch_js_regex: "/assets/index-legacy-[^/]+\\.js"
  token_fetch_token_regex: "eyJh[^\"]+"
  user_agent: Mozilla/5.0
  storefront_language_map:
    us: en-US
    cn: zh-CN
"#
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let settings: Settings = serde_yaml::from_str(minimal_yaml()).unwrap();
        settings.validate().unwrap();
        assert_eq!(settings.max_retries, 2);
        assert_eq!(settings.retry_delay_seconds, 10);
        assert_eq!(settings.scheduler.max_parallel, 5);
        assert_eq!(settings.scheduler.long_poll_interval, 60);
        assert_eq!(settings.scheduler.fast_poll_interval, 3);
        assert_eq!(settings.scheduler.signal_port, DEFAULT_SIGNAL_PORT);
        assert_eq!(settings.sse.max_connections, 50);
        assert!(settings.search_cache.enabled);
        assert_eq!(settings.upstream.token_validity_hours, 12);
    }

    #[test]
    fn missing_upstream_is_rejected() {
        let settings: Settings = serde_yaml::from_str("max_retries: 3").unwrap();
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::MissingKey("upstream.api_base_url"))
        ));
    }

    #[test]
    fn zero_parallelism_is_rejected() {
        let mut settings: Settings = serde_yaml::from_str(minimal_yaml()).unwrap();
        settings.scheduler.max_parallel = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn legacy_log_path_is_recognized() {
        let mut settings: Settings = serde_yaml::from_str(minimal_yaml()).unwrap();
        settings.log_file_path = Some("old/logs.log".to_string());
        assert_eq!(settings.effective_log_path(), "old/logs.log");

        // paths.logs wins over the legacy key
        settings.paths.logs = Some("new/logs.log".to_string());
        assert_eq!(settings.effective_log_path(), "new/logs.log");
    }

    #[test]
    fn language_lookup_falls_back() {
        let settings: Settings = serde_yaml::from_str(minimal_yaml()).unwrap();
        assert_eq!(settings.language_for("cn"), "zh-CN");
        assert_eq!(settings.language_for("zz"), "en-US");
    }

    #[test]
    fn cors_origins_default_to_same_origin_only() {
        let settings: Settings = serde_yaml::from_str(minimal_yaml()).unwrap();
        assert!(settings.cors_allowed_origins.is_empty());

        let yaml = format!("{}cors_allowed_origins: [\"https://ui.example.com\"]\n", minimal_yaml());
        let settings: Settings = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(settings.cors_allowed_origins, vec!["https://ui.example.com"]);
    }
}
