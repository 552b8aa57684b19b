//! Upstream API token manager.
//!
//! The bearer token is scraped from the public web player: fetch the
//! landing page, locate the legacy JS bundle by regex, fetch the bundle,
//! and extract a JWT-shaped token. Successful fetches are persisted with
//! their timestamp so restarts reuse a still-valid token.
//!
//! Only one refresh runs at a time; concurrent callers get the currently
//! cached value instead of queueing. After a failed fetch the manager
//! cools down before trying again.

use chrono::{DateTime, Duration as ChronoDuration, Local};
use downbeat_core::settings::UpstreamSettings;
use downbeat_store::{TokenFile, TokenRecord};
use regex::Regex;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

/// Cool-down between fetch attempts after a failure, seconds.
const FETCH_RETRY_COOLDOWN_SECONDS: i64 = 60;

/// Fallback pattern when the configured token regex stops matching.
static FALLBACK_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"eyJ[a-zA-Z0-9+/_\-.]+").expect("fallback token regex"));

#[derive(Debug, Default)]
struct TokenState {
    token: Option<String>,
    timestamp: Option<DateTime<Local>>,
    last_failure: Option<DateTime<Local>>,
}

/// Shared token manager. Cheap to clone behind an `Arc`.
pub struct TokenManager {
    settings: UpstreamSettings,
    file: TokenFile,
    client: reqwest::Client,
    state: Mutex<TokenState>,
    /// Single-refresh guard; try-locked so callers never queue.
    fetch_lock: tokio::sync::Mutex<()>,
}

impl TokenManager {
    /// Create a manager, loading any persisted token from disk.
    #[must_use]
    pub fn new(settings: UpstreamSettings, file: TokenFile, client: reqwest::Client) -> Self {
        let mut state = TokenState::default();
        match file.load() {
            Ok(Some(record)) => match DateTime::parse_from_rfc3339(&record.timestamp) {
                Ok(ts) => {
                    tracing::info!("loaded persisted API token");
                    state.token = Some(record.token);
                    state.timestamp = Some(ts.with_timezone(&Local));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "persisted token has an unparseable timestamp");
                }
            },
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "could not read persisted token"),
        }
        Self {
            settings,
            file,
            client,
            state: Mutex::new(state),
            fetch_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn validity(&self) -> ChronoDuration {
        ChronoDuration::hours(self.settings.token_validity_hours.try_into().unwrap_or(12))
    }

    /// Seconds until the current token expires; `None` without a token.
    #[must_use]
    pub fn remaining_seconds(&self) -> Option<i64> {
        let state = self.state.lock().expect("token state lock");
        let timestamp = state.timestamp?;
        state.token.as_ref()?;
        Some((timestamp + self.validity() - Local::now()).num_seconds())
    }

    /// Expiry timestamp of the current token.
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Local>> {
        let state = self.state.lock().expect("token state lock");
        state.timestamp.map(|ts| ts + self.validity())
    }

    fn is_valid(&self) -> bool {
        self.remaining_seconds().is_some_and(|secs| secs > 0)
    }

    fn current_token(&self) -> Option<String> {
        self.state.lock().expect("token state lock").token.clone()
    }

    /// Current token, refreshing first when expired.
    pub async fn get(&self) -> Option<String> {
        if self.is_valid() {
            return self.current_token();
        }
        tracing::info!("token expired, refreshing");
        self.refresh().await
    }

    /// Force the token to be treated as expired so the next `get` fetches
    /// a fresh one. Call on upstream 401/403.
    pub fn invalidate(&self) {
        tracing::warn!("invalidating API token on upstream auth failure");
        let mut state = self.state.lock().expect("token state lock");
        state.timestamp = Some(Local::now() - self.validity() * 2);
    }

    /// Run one refresh attempt, respecting the single-flight guard and
    /// failure cool-down. Returns the (possibly stale) current token.
    pub async fn refresh(&self) -> Option<String> {
        let Ok(_guard) = self.fetch_lock.try_lock() else {
            tracing::debug!("another refresh is in flight, returning cached token");
            return self.current_token();
        };

        {
            let state = self.state.lock().expect("token state lock");
            if let Some(failed_at) = state.last_failure {
                let since = Local::now() - failed_at;
                if since.num_seconds() < FETCH_RETRY_COOLDOWN_SECONDS {
                    tracing::warn!(
                        seconds_since_failure = since.num_seconds(),
                        "token fetch cooling down after recent failure"
                    );
                    return state.token.clone();
                }
            }
        }

        match self.fetch_from_website().await {
            Some(token) => {
                let now = Local::now();
                {
                    let mut state = self.state.lock().expect("token state lock");
                    state.token = Some(token.clone());
                    state.timestamp = Some(now);
                    state.last_failure = None;
                }
                let record = TokenRecord {
                    token: token.clone(),
                    timestamp: now.to_rfc3339(),
                };
                if let Err(e) = self.file.save(&record) {
                    tracing::error!(error = %e, "could not persist refreshed token");
                }
                tracing::info!("token refreshed");
                Some(token)
            }
            None => {
                tracing::error!("token fetch failed");
                let mut state = self.state.lock().expect("token state lock");
                state.last_failure = Some(Local::now());
                state.token.clone()
            }
        }
    }

    /// Scrape the landing page and JS bundle for a token.
    async fn fetch_from_website(&self) -> Option<String> {
        let base = &self.settings.token_fetch_url;
        tracing::info!(url = %base, "fetching landing page for token scrape");

        let html = self.fetch_text(base).await?;

        let js_re = match Regex::new(&self.settings.token_fetch_js_regex) {
            Ok(re) => re,
            Err(e) => {
                tracing::error!(error = %e, "configured JS bundle regex is invalid");
                return None;
            }
        };
        let Some(js_uri) = js_re.find(&html) else {
            tracing::error!("legacy JS bundle URI not found in landing page");
            return None;
        };
        let js_url = format!("{}{}", base.trim_end_matches('/'), js_uri.as_str());
        tracing::info!(url = %js_url, "fetching JS bundle");
        let js = self.fetch_text(&js_url).await?;

        let token_match = match Regex::new(&self.settings.token_fetch_token_regex) {
            Ok(re) => re.find(&js),
            Err(e) => {
                tracing::error!(error = %e, "configured token regex is invalid");
                None
            }
        };
        let token_match = token_match.or_else(|| {
            tracing::warn!("configured token regex missed, trying fallback pattern");
            FALLBACK_TOKEN_RE.find(&js)
        })?;

        Some(token_match.as_str().trim_matches('"').to_string())
    }

    async fn fetch_text(&self, url: &str) -> Option<String> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, &self.settings.user_agent)
            .timeout(Duration::from_secs(15))
            .send()
            .await;
        match response {
            Ok(resp) if resp.status().is_success() => match resp.text().await {
                Ok(text) => Some(text),
                Err(e) => {
                    tracing::error!(url, error = %e, "reading token scrape body failed");
                    None
                }
            },
            Ok(resp) => {
                tracing::error!(url, status = %resp.status(), "token scrape request rejected");
                None
            }
            Err(e) => {
                tracing::error!(url, error = %e, "token scrape request failed");
                None
            }
        }
    }

    /// Background worker: wake every refresh interval, refresh when the
    /// remaining validity drops under the threshold.
    pub fn spawn_background_refresh(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = Duration::from_secs(manager.settings.token_refresh_interval_seconds.max(1));
        let threshold = i64::try_from(manager.settings.token_refresh_threshold_seconds).unwrap_or(3600);
        tokio::spawn(async move {
            tracing::info!(
                interval_seconds = interval.as_secs(),
                threshold_seconds = threshold,
                "token background refresher started"
            );
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let needs_refresh = match manager.remaining_seconds() {
                    Some(remaining) if remaining >= threshold => false,
                    Some(remaining) => {
                        tracing::info!(remaining, "token nearing expiry, refreshing proactively");
                        true
                    }
                    None => {
                        tracing::info!("no token held, attempting fetch");
                        true
                    }
                };
                if needs_refresh {
                    manager.refresh().await;
                }
            }
        })
    }
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("valid", &self.is_valid())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with(record: Option<TokenRecord>) -> (tempfile::TempDir, TokenManager) {
        let dir = tempfile::tempdir().unwrap();
        let file = TokenFile::new(dir.path().join("api_token.json"));
        if let Some(record) = &record {
            file.save(record).unwrap();
        }
        let settings = UpstreamSettings {
            token_validity_hours: 12,
            ..UpstreamSettings::default()
        };
        let manager = TokenManager::new(settings, file, reqwest::Client::new());
        (dir, manager)
    }

    #[test]
    fn loads_persisted_token() {
        let record = TokenRecord {
            token: "eyJpersisted".to_string(),
            timestamp: Local::now().to_rfc3339(),
        };
        let (_dir, manager) = manager_with(Some(record));
        assert!(manager.is_valid());
        assert_eq!(manager.current_token().as_deref(), Some("eyJpersisted"));
    }

    #[test]
    fn stale_persisted_token_is_invalid() {
        let record = TokenRecord {
            token: "eyJold".to_string(),
            timestamp: (Local::now() - ChronoDuration::hours(48)).to_rfc3339(),
        };
        let (_dir, manager) = manager_with(Some(record));
        assert!(!manager.is_valid());
        // the stale value is still held for callers that accept it
        assert_eq!(manager.current_token().as_deref(), Some("eyJold"));
    }

    #[test]
    fn invalidate_forces_expiry() {
        let record = TokenRecord {
            token: "eyJfresh".to_string(),
            timestamp: Local::now().to_rfc3339(),
        };
        let (_dir, manager) = manager_with(Some(record));
        assert!(manager.is_valid());
        manager.invalidate();
        assert!(!manager.is_valid());
    }

    #[test]
    fn fallback_regex_matches_jwt_shape() {
        let js = r#"var x = {token:"eyJhbGciOiJFUzI1NiJ9.payload.sig"}"#;
        let m = FALLBACK_TOKEN_RE.find(js).unwrap();
        assert!(m.as_str().starts_with("eyJhbGciOiJFUzI1NiJ9"));
    }
}
