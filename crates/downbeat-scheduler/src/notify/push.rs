//! Push-endpoint notifications.
//!
//! Each endpoint gets one GET with the URL-encoded message in the path
//! plus icon and click-through query parameters. The click URL prefers
//! the endpoint's deep-link template (with the library album id), then
//! the task's own link, then the configured fallback.

use downbeat_core::settings::PushSettings;
use downbeat_core::task::TaskRecord;
use downbeat_core::users::PushEndpoint;
use std::time::Duration;

/// Compose the full push URL for one endpoint.
#[must_use]
pub fn build_push_url(
    settings: &PushSettings,
    endpoint: &PushEndpoint,
    task: &TaskRecord,
    success: bool,
    album_id: Option<&str>,
) -> String {
    let status_text = if success { "下载成功" } else { "下载失败" };
    let info = format!("{}「{}」{status_text}", task.type_label(), task.display_name());

    let click_url = endpoint
        .click_url_template
        .as_ref()
        .zip(album_id)
        .map(|(template, id)| template.replace("{id}", id))
        .or_else(|| (!task.link.is_empty()).then(|| task.link.clone()))
        .or_else(|| settings.fallback_url.clone());

    let base = endpoint.server.trim_end_matches('/');
    let path = settings
        .path
        .replace("{info}", &urlencoding::encode(&info));
    let mut url = format!("{base}{path}?icon={}", urlencoding::encode(&settings.icon));
    if let Some(click) = click_url {
        url.push_str(&format!("&url={}", urlencoding::encode(&click)));
    }
    url
}

/// Fire one push notification; failures are logged only.
pub async fn send_push(
    client: &reqwest::Client,
    settings: &PushSettings,
    endpoint: &PushEndpoint,
    task: &TaskRecord,
    success: bool,
    album_id: Option<&str>,
) {
    if endpoint.server.is_empty() {
        return;
    }
    let url = build_push_url(settings, endpoint, task, success, album_id);
    tracing::info!(uuid = %task.uuid, user = %task.user, url, "sending push notification");
    match client
        .get(&url)
        .timeout(Duration::from_secs(10))
        .send()
        .await
    {
        Ok(resp) if resp.status().is_success() => {
            tracing::info!(uuid = %task.uuid, "push notification delivered");
        }
        Ok(resp) => {
            tracing::error!(uuid = %task.uuid, status = %resp.status(), "push endpoint rejected");
        }
        Err(e) => tracing::error!(uuid = %task.uuid, error = %e, "push notification failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use downbeat_core::link::{LinkInfo, LinkKind};
    use downbeat_core::task::TaskMetadata;

    fn task() -> TaskRecord {
        let mut task = TaskRecord::placeholder(
            "alice",
            "https://music.apple.com/us/album/x/1",
            LinkInfo {
                kind: LinkKind::Album,
                storefront: "us".to_string(),
                id: "1".to_string(),
            },
            "ts",
            0,
            false,
        );
        task.metadata = Some(TaskMetadata {
            name: "Album X".to_string(),
            id: "1".to_string(),
            ..TaskMetadata::default()
        });
        task
    }

    fn settings() -> PushSettings {
        PushSettings {
            path: "/Apple-Music-Downloader/{info}".to_string(),
            icon: "https://icon.png".to_string(),
            fallback_url: Some("https://fallback".to_string()),
            library_user_id: None,
        }
    }

    #[test]
    fn deep_link_uses_album_id_template() {
        let endpoint = PushEndpoint {
            server: "https://push.example.com/key/".to_string(),
            click_url_template: Some("https://media/item/{id}".to_string()),
        };
        let url = build_push_url(&settings(), &endpoint, &task(), true, Some("al-42"));
        assert!(url.starts_with("https://push.example.com/key/Apple-Music-Downloader/"));
        assert!(url.contains(&*urlencoding::encode("专辑「Album X」下载成功")));
        assert!(url.contains(&format!("url={}", urlencoding::encode("https://media/item/al-42"))));
        assert!(url.contains(&format!("icon={}", urlencoding::encode("https://icon.png"))));
    }

    #[test]
    fn failure_message_and_link_fallback() {
        let endpoint = PushEndpoint {
            server: "https://push.example.com/key".to_string(),
            click_url_template: Some("https://media/item/{id}".to_string()),
        };
        // no album id: falls back to the task link
        let url = build_push_url(&settings(), &endpoint, &task(), false, None);
        assert!(url.contains(&*urlencoding::encode("下载失败")));
        assert!(url.contains(&*urlencoding::encode("https://music.apple.com/us/album/x/1")));
    }
}
