//! User directory loaded from `config/users.yaml`.
//!
//! Each canonical user may carry aliases, notification endpoints, and an
//! avatar. Submitted user names (from the trusted `X-User` header) are
//! matched case-insensitively against canonical names and aliases.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One push-notification endpoint for a user.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PushEndpoint {
    /// Base URL of the push server.
    pub server: String,
    /// Deep-link template; `{id}` is replaced with the library album id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub click_url_template: Option<String>,
}

/// Per-user configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UserProfile {
    /// Accepted aliases for this user, matched case-insensitively.
    #[serde(default)]
    pub other_name: Vec<String>,
    #[serde(default)]
    pub email: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emby_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emby_api_key: Option<String>,
    #[serde(default)]
    pub bark_urls: Vec<PushEndpoint>,
    #[serde(default)]
    pub enable_email_notification: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// The full user directory, keyed by canonical user name.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserDirectory {
    users: BTreeMap<String, UserProfile>,
}

impl UserDirectory {
    /// Parse the directory from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Map a submitted name to the canonical user name, checking the
    /// canonical names and every alias case-insensitively.
    #[must_use]
    pub fn normalize(&self, submitted: &str) -> Option<&str> {
        let lower = submitted.trim().to_lowercase();
        if lower.is_empty() {
            return None;
        }
        for (canonical, profile) in &self.users {
            if canonical.to_lowercase() == lower {
                return Some(canonical);
            }
            if profile
                .other_name
                .iter()
                .any(|alias| alias.to_lowercase() == lower)
            {
                return Some(canonical);
            }
        }
        None
    }

    /// Look up a profile by canonical name.
    #[must_use]
    pub fn profile(&self, canonical: &str) -> Option<&UserProfile> {
        self.users.get(canonical)
    }

    /// Iterate over (canonical name, profile).
    pub fn iter(&self) -> impl Iterator<Item = (&String, &UserProfile)> {
        self.users.iter()
    }
}
