//! Media library integration: refresh trigger and album lookup.

use downbeat_core::users::UserProfile;
use std::time::Duration;

/// How long to poll the library for a freshly imported album. The scan
/// usually surfaces the album within seconds of the refresh.
const ALBUM_QUERY_ATTEMPTS: u32 = 120;
const ALBUM_QUERY_INTERVAL: Duration = Duration::from_millis(500);

/// POST a library refresh for the user's media server.
pub async fn send_refresh(client: &reqwest::Client, profile: &UserProfile, user: &str, uuid: &str) {
    let (Some(base), Some(api_key)) = (&profile.emby_url, &profile.emby_api_key) else {
        tracing::warn!(user, uuid, "library refresh skipped, no server configured");
        return;
    };
    let url = format!("{}/emby/Library/Refresh", base.trim_end_matches('/'));
    tracing::info!(user, uuid, url, "triggering library refresh");

    let result = client
        .post(&url)
        .header("X-Emby-Token", api_key)
        .header(reqwest::header::ACCEPT, "application/json")
        .timeout(Duration::from_secs(15))
        .send()
        .await;
    match result {
        Ok(resp) if resp.status().is_success() => {
            tracing::info!(user, uuid, "library refresh accepted");
        }
        Ok(resp) => {
            tracing::error!(user, uuid, status = %resp.status(), "library refresh rejected");
        }
        Err(e) => tracing::error!(user, uuid, error = %e, "library refresh failed"),
    }
}

/// Poll the library search endpoint for the album's id, used to compose
/// push deep links. Returns `None` when the album never shows up.
pub async fn query_album_id(
    client: &reqwest::Client,
    profile: &UserProfile,
    library_user_id: Option<&str>,
    album_name: &str,
) -> Option<String> {
    let (Some(base), Some(api_key)) = (&profile.emby_url, &profile.emby_api_key) else {
        return None;
    };
    let user_id = library_user_id?;
    if album_name.is_empty() {
        return None;
    }
    let url = format!(
        "{}/emby/Users/{user_id}/Items",
        base.trim_end_matches('/')
    );
    let params = [
        ("SearchTerm", album_name),
        ("IncludeItemTypes", "Audio"),
        ("Recursive", "true"),
        ("Fields", "Id,Name,AlbumId"),
    ];

    for attempt in 0..ALBUM_QUERY_ATTEMPTS {
        let response = client
            .get(&url)
            .query(&params)
            .header("X-Emby-Token", api_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(Duration::from_secs(5))
            .send()
            .await;
        match response {
            Ok(resp) if resp.status().is_success() => {
                if let Ok(body) = resp.json::<serde_json::Value>().await {
                    let album_id = body
                        .get("Items")
                        .and_then(serde_json::Value::as_array)
                        .and_then(|items| {
                            items.iter().find(|item| {
                                item.get("Album").and_then(serde_json::Value::as_str)
                                    == Some(album_name)
                            })
                        })
                        .and_then(|item| item.get("AlbumId").and_then(serde_json::Value::as_str))
                        .map(ToString::to_string);
                    if let Some(id) = album_id {
                        tracing::info!(album_name, id, "found library album id");
                        return Some(id);
                    }
                }
            }
            Ok(resp) => {
                tracing::warn!(attempt, status = %resp.status(), "library album query rejected");
            }
            Err(e) => tracing::warn!(attempt, error = %e, "library album query failed"),
        }
        tokio::time::sleep(ALBUM_QUERY_INTERVAL).await;
    }
    tracing::warn!(album_name, "album never appeared in the library");
    None
}
