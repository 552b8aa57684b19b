//! Best-effort completion notifications.
//!
//! Three channels: a library-refresh POST, push endpoints with an
//! optional deep link into the library, and per-user SMTP summaries sent
//! during idle housekeeping. Every failure is logged and swallowed -
//! notification problems never block task termination.

pub mod email;
pub mod library;
pub mod push;

use downbeat_core::settings::{PushSettings, SmtpSettings};
use downbeat_core::task::TaskRecord;
use downbeat_core::users::UserProfile;

/// Notification fan-out for terminal tasks.
#[derive(Clone, Debug)]
pub struct Notifier {
    client: reqwest::Client,
    push: PushSettings,
    smtp: SmtpSettings,
}

impl Notifier {
    #[must_use]
    pub fn new(client: reqwest::Client, push: PushSettings, smtp: SmtpSettings) -> Self {
        Self { client, push, smtp }
    }

    /// Fire the per-task notifications for a terminal transition:
    /// library refresh plus one push call per configured endpoint.
    pub async fn task_completed(&self, profile: &UserProfile, task: &TaskRecord, success: bool) {
        if profile.emby_url.is_some() {
            library::send_refresh(&self.client, profile, &task.user, &task.uuid).await;
        }

        // Album successes get a deep link into the library when the album
        // can be found there.
        let album_id = if success
            && task.link_info.kind == downbeat_core::link::LinkKind::Album
            && !profile.bark_urls.is_empty()
        {
            library::query_album_id(
                &self.client,
                profile,
                self.push.library_user_id.as_deref(),
                &task.display_name(),
            )
            .await
        } else {
            None
        };

        for endpoint in &profile.bark_urls {
            push::send_push(
                &self.client,
                &self.push,
                endpoint,
                task,
                success,
                album_id.as_deref(),
            )
            .await;
        }
    }

    /// Send one user's idle-housekeeping summary email.
    pub async fn send_summary(&self, user: &str, profile: &UserProfile, body: String) {
        email::send_summary_email(&self.smtp, user, profile, body).await;
    }
}
