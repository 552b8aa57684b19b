//! Asynchronous metadata resolution.
//!
//! One worker per accepted placeholder: fetch the upstream resource,
//! filter it into the canonical task metadata, flip the record to `ready`
//! (or `error`), and wake the scheduler. Song links are rewritten to their
//! containing album first, deduplicating against an existing album task
//! for the same user.

use crate::context::AppState;
use crate::wake::send_wake;
use downbeat_core::link::{parse_link, LinkInfo, LinkKind};
use downbeat_core::task::{TaskMetadata, TaskStatus, Track};
use serde_json::Value;
use std::time::Duration;

/// Error reason recorded when the upstream never returned usable data.
pub const REASON_FETCH_FAILED: &str = "元数据获取失败 (API 未返回有效数据)";
/// Error reason recorded when the response could not be filtered.
pub const REASON_FILTER_FAILED: &str = "元数据过滤失败或格式无效";

/// Upstream error code for an invalid `l=` language tag (fatal, no retry).
const INVALID_LANGUAGE_CODE: &str = "40005";

/// Entry point for the per-task resolver worker.
pub async fn resolve_task(ctx: AppState, uuid: String) {
    let Some((mut link_info, user, mut link)) = load_task_identity(&ctx, &uuid) else {
        tracing::error!(uuid, "resolver started but task is not in the queue");
        return;
    };
    tracing::info!(uuid, user, link, "metadata resolution started");

    // Song links become album tasks before the real fetch.
    if link_info.kind == LinkKind::Song {
        match rewrite_song_to_album(&ctx, &uuid, &user, &link_info).await {
            SongRewrite::Rewritten { info, url } => {
                link_info = info;
                link = url;
            }
            SongRewrite::DuplicateRemoved => {
                tracing::info!(uuid, "song task removed in favor of existing album task");
                return;
            }
            SongRewrite::Unchanged => {}
        }
    }

    let (status, metadata, error_reason) = match fetch_metadata(&ctx, &link_info).await {
        Some(raw) => match filter_metadata(&link_info, &raw) {
            Some(filtered) => (TaskStatus::Ready, Some(filtered), None),
            None => {
                tracing::error!(uuid, "metadata filtering failed");
                (TaskStatus::Error, None, Some(REASON_FILTER_FAILED))
            }
        },
        None => {
            tracing::error!(uuid, "metadata fetch failed");
            (TaskStatus::Error, None, Some(REASON_FETCH_FAILED))
        }
    };

    let updated = ctx.queue.with_queue(|tasks| {
        let Some(task) = tasks.iter_mut().find(|t| t.uuid == uuid) else {
            return false;
        };
        task.status = status;
        task.metadata = metadata.clone();
        task.link = link.clone();
        task.link_info = link_info.clone();
        match error_reason {
            Some(reason) => task.error_reason = Some(reason.to_string()),
            None => task.error_reason = None,
        }
        true
    });

    match updated {
        Ok(true) => {
            tracing::info!(uuid, status = status.as_str(), "task record updated");
            if status == TaskStatus::Ready {
                send_wake(ctx.settings.scheduler.signal_port).await;
            }
        }
        Ok(false) => tracing::error!(uuid, "task vanished before resolution finished"),
        Err(e) => tracing::error!(uuid, error = %e, "could not write resolved task"),
    }
}

fn load_task_identity(ctx: &AppState, uuid: &str) -> Option<(LinkInfo, String, String)> {
    let tasks = ctx.queue.load().ok()?;
    let task = tasks.iter().find(|t| t.uuid == uuid)?;
    Some((task.link_info.clone(), task.user.clone(), task.link.clone()))
}

enum SongRewrite {
    Rewritten { info: LinkInfo, url: String },
    DuplicateRemoved,
    Unchanged,
}

/// Resolve the song's album URL and either rewrite this task to the album
/// or drop it as a duplicate of an existing album task for the same user.
async fn rewrite_song_to_album(
    ctx: &AppState,
    uuid: &str,
    user: &str,
    link_info: &LinkInfo,
) -> SongRewrite {
    let Some(raw) = fetch_metadata(ctx, link_info).await else {
        tracing::error!(uuid, "song metadata fetch failed, keeping song link");
        return SongRewrite::Unchanged;
    };
    let Some(album_url) = filter_metadata(link_info, &raw).and_then(|m| m.album_url) else {
        tracing::error!(uuid, "song metadata has no album URL");
        return SongRewrite::Unchanged;
    };
    let Some(album_info) = parse_link(&album_url, &ctx.allowed_storefronts()) else {
        tracing::error!(uuid, album_url, "rewritten album link did not parse");
        return SongRewrite::Unchanged;
    };

    let outcome = ctx.queue.with_queue(|tasks| {
        let duplicate = tasks.iter().any(|t| {
            t.uuid != uuid
                && t.user == user
                && t.link_info.kind == LinkKind::Album
                && t.link_info.id == album_info.id
        });
        if duplicate {
            tasks.retain(|t| t.uuid != uuid);
            return SongRewrite::DuplicateRemoved;
        }
        if let Some(task) = tasks.iter_mut().find(|t| t.uuid == uuid) {
            task.link = album_url.clone();
            task.link_info = album_info.clone();
            return SongRewrite::Rewritten {
                info: album_info.clone(),
                url: album_url.clone(),
            };
        }
        SongRewrite::Unchanged
    });

    match outcome {
        Ok(result) => {
            if let SongRewrite::Rewritten { .. } = &result {
                tracing::info!(uuid, album_id = %album_info.id, "song task rewritten to album");
            }
            result
        }
        Err(e) => {
            tracing::error!(uuid, error = %e, "song-to-album rewrite write failed");
            SongRewrite::Unchanged
        }
    }
}

/// Fetch the raw upstream document for a link, with retries.
///
/// 401/403 invalidates the token and grants one retry that does not count
/// toward `max_retries`; 404 and invalid-language 400s are fatal; 429 and
/// 5xx/network errors are retried with delays.
pub async fn fetch_metadata(ctx: &AppState, link_info: &LinkInfo) -> Option<Value> {
    let settings = &ctx.settings;
    let base = settings.upstream.api_base_url.trim_end_matches('/');
    let url = format!(
        "{base}/{}/{}/{}",
        link_info.storefront,
        link_info.kind.api_resource(),
        link_info.id
    );
    let language = settings.language_for(&link_info.storefront);

    let mut params: Vec<(&str, &str)> = vec![("l", language)];
    match link_info.kind {
        LinkKind::Album => {
            params.push(("include", "tracks,artists"));
            params.push(("include[songs]", "artists"));
            params.push(("extend", "editorialVideo"));
        }
        LinkKind::Song => {
            params.push(("extend", "extendedAssetUrls"));
            params.push(("include", "albums"));
        }
        LinkKind::Playlist => {
            params.push(("include", "tracks,curator"));
            params.push(("include[songs]", "artists"));
        }
        LinkKind::MusicVideo => {}
    }

    let max_retries = settings.max_retries.max(1);
    let retry_delay = Duration::from_secs(settings.retry_delay_seconds);
    let mut token_retry_used = false;
    let mut attempt = 0;

    while attempt < max_retries {
        let Some(token) = ctx.token.get().await else {
            tracing::error!(id = %link_info.id, "no API token available for metadata fetch");
            return None;
        };

        tracing::info!(
            kind = ?link_info.kind,
            id = %link_info.id,
            attempt = attempt + 1,
            max = max_retries,
            "fetching metadata"
        );
        let response = ctx
            .client
            .get(&url)
            .query(&params)
            .header(reqwest::header::USER_AGENT, &settings.upstream.user_agent)
            .header(reqwest::header::ORIGIN, &settings.upstream.token_fetch_url)
            .bearer_auth(&token)
            .timeout(Duration::from_secs(20))
            .send()
            .await;

        match response {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    match resp.json::<Value>().await {
                        Ok(value) => return Some(value),
                        Err(e) => {
                            tracing::error!(error = %e, "metadata body was not valid JSON");
                            return None;
                        }
                    }
                } else if status == reqwest::StatusCode::UNAUTHORIZED
                    || status == reqwest::StatusCode::FORBIDDEN
                {
                    tracing::warn!(status = %status, "token rejected, invalidating");
                    ctx.token.invalidate();
                    if !token_retry_used {
                        // one free retry with a fresh token
                        token_retry_used = true;
                        continue;
                    }
                } else if status == reqwest::StatusCode::NOT_FOUND {
                    tracing::error!(id = %link_info.id, "upstream returned 404, giving up");
                    return None;
                } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                    let backoff = retry_delay * (attempt + 1) * 2;
                    tracing::warn!(backoff_secs = backoff.as_secs(), "rate limited, backing off");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                    continue;
                } else if status.is_client_error() {
                    let body: Value = resp.json().await.unwrap_or(Value::Null);
                    if is_invalid_language_error(&body) {
                        tracing::error!(language, "upstream rejected the language tag, giving up");
                        return None;
                    }
                    tracing::error!(status = %status, "client error from upstream, giving up");
                    return None;
                } else {
                    tracing::warn!(status = %status, "server error from upstream, will retry");
                }
            }
            Err(e) if e.is_timeout() => {
                tracing::warn!("metadata fetch timed out, will retry");
            }
            Err(e) => {
                tracing::error!(error = %e, "metadata fetch network error, will retry");
            }
        }

        attempt += 1;
        if attempt < max_retries {
            tokio::time::sleep(retry_delay).await;
        }
    }

    tracing::error!(
        kind = ?link_info.kind,
        id = %link_info.id,
        attempts = max_retries,
        "metadata fetch exhausted retries"
    );
    None
}

fn is_invalid_language_error(body: &Value) -> bool {
    body.get("errors")
        .and_then(Value::as_array)
        .and_then(|errors| errors.first())
        .is_some_and(|first| {
            first.get("code").and_then(Value::as_str) == Some(INVALID_LANGUAGE_CODE)
                && first
                    .pointer("/source/parameter")
                    .and_then(Value::as_str)
                    == Some("l")
        })
}

fn str_attr(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(ToString::to_string)
}

/// Filter a raw upstream document into the canonical metadata view for
/// its link kind. Returns `None` when the document is malformed or the
/// filtered view misses its id or name.
#[must_use]
pub fn filter_metadata(link_info: &LinkInfo, raw: &Value) -> Option<TaskMetadata> {
    let primary = raw.get("data").and_then(Value::as_array)?.first()?;
    let attributes = primary.get("attributes").unwrap_or(&Value::Null);
    let relationships = primary.get("relationships").unwrap_or(&Value::Null);
    let artwork = attributes.get("artwork").unwrap_or(&Value::Null);
    let artwork_url = str_attr(artwork, "url");
    let id = str_attr(primary, "id")?;

    let mut meta = TaskMetadata {
        name: str_attr(attributes, "name")?,
        id,
        artwork_url,
        ..TaskMetadata::default()
    };
    if meta.name.is_empty() {
        return None;
    }

    match link_info.kind {
        LinkKind::Album => {
            meta.artist_name = str_attr(attributes, "artistName");
            meta.track_count = attributes
                .get("trackCount")
                .and_then(Value::as_u64)
                .and_then(|n| u32::try_from(n).ok());
            meta.tracks = Some(filter_album_tracks(relationships));
        }
        LinkKind::Playlist => {
            meta.curator_name = str_attr(attributes, "curatorName").or_else(|| {
                relationships
                    .pointer("/curator/data/0/attributes/name")
                    .and_then(Value::as_str)
                    .map(ToString::to_string)
            });
            meta.last_modified_date = str_attr(attributes, "lastModifiedDate");
            let tracks = filter_playlist_tracks(relationships);
            meta.track_count = u32::try_from(tracks.len()).ok();
            meta.tracks = Some(tracks);
        }
        LinkKind::MusicVideo => {
            meta.artist_name = str_attr(attributes, "artistName");
            meta.duration_in_millis = attributes.get("durationInMillis").and_then(Value::as_u64);
            meta.width = artwork
                .get("width")
                .and_then(Value::as_u64)
                .and_then(|n| u32::try_from(n).ok());
            meta.height = artwork
                .get("height")
                .and_then(Value::as_u64)
                .and_then(|n| u32::try_from(n).ok());
        }
        LinkKind::Song => {
            meta.artist_name = str_attr(attributes, "artistName");
            meta.has_lyrics = attributes.get("hasLyrics").and_then(Value::as_bool);
            meta.album_url = relationships
                .pointer("/albums/data/0/attributes/url")
                .and_then(Value::as_str)
                .map(ToString::to_string);
        }
    }

    tracing::info!(kind = ?link_info.kind, id = %meta.id, "metadata filtered");
    Some(meta)
}

fn song_items(relationships: &Value) -> Vec<&Value> {
    relationships
        .pointer("/tracks/data")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter(|item| item.get("type").and_then(Value::as_str) == Some("songs"))
                .collect()
        })
        .unwrap_or_default()
}

fn filter_album_tracks(relationships: &Value) -> Vec<Track> {
    let items = song_items(relationships);

    // Disc fields only make sense on multi-disc albums.
    let max_disc = items
        .iter()
        .filter_map(|item| item.pointer("/attributes/discNumber").and_then(Value::as_u64))
        .max()
        .unwrap_or(1);

    let mut tracks = Vec::with_capacity(items.len());
    for item in items {
        let attributes = item.get("attributes").unwrap_or(&Value::Null);
        let Some(song_id) = str_attr(item, "id") else {
            tracing::warn!("skipping album track without an id");
            continue;
        };
        let Some(name) = str_attr(attributes, "name") else {
            tracing::warn!(song_id, "skipping album track without a name");
            continue;
        };
        let Some(track_number) = attributes
            .get("trackNumber")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
        else {
            tracing::warn!(song_id, "skipping album track without a track number");
            continue;
        };
        let disc_number = attributes
            .get("discNumber")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(1);

        tracks.push(Track {
            track_number,
            name,
            has_lyrics: attributes
                .get("hasLyrics")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            song_id: Some(song_id),
            url: str_attr(attributes, "url"),
            disc_number: (max_disc > 1).then_some(disc_number),
            disc_total: (max_disc > 1).then(|| u32::try_from(max_disc).unwrap_or(u32::MAX)),
            ..Track::default()
        });
    }
    tracks
}

fn filter_playlist_tracks(relationships: &Value) -> Vec<Track> {
    let mut tracks = Vec::new();
    for (index, item) in song_items(relationships).into_iter().enumerate() {
        let attributes = item.get("attributes").unwrap_or(&Value::Null);
        let (Some(song_id), Some(name)) = (str_attr(item, "id"), str_attr(attributes, "name"))
        else {
            tracing::warn!(index, "skipping playlist entry missing id or name");
            continue;
        };
        tracks.push(Track {
            track_number: u32::try_from(index + 1).unwrap_or(u32::MAX),
            name,
            has_lyrics: attributes
                .get("hasLyrics")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            song_id: Some(song_id),
            url: str_attr(attributes, "url"),
            ..Track::default()
        });
    }
    tracks
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn info(kind: LinkKind) -> LinkInfo {
        LinkInfo {
            kind,
            storefront: "us".to_string(),
            id: "1".to_string(),
        }
    }

    #[test]
    fn filters_single_disc_album() {
        let raw = json!({"data": [{
            "id": "1440857781",
            "attributes": {
                "name": "Album X",
                "artistName": "Artist",
                "trackCount": 2,
                "artwork": {"url": "https://art/{w}x{h}.jpg"}
            },
            "relationships": {"tracks": {"data": [
                {"type": "songs", "id": "s1", "attributes": {"trackNumber": 1, "name": "One", "hasLyrics": true, "url": "https://song/1", "discNumber": 1}},
                {"type": "songs", "id": "s2", "attributes": {"trackNumber": 2, "name": "Two", "discNumber": 1}}
            ]}}
        }]});
        let meta = filter_metadata(&info(LinkKind::Album), &raw).unwrap();
        assert_eq!(meta.id, "1440857781");
        assert_eq!(meta.track_count, Some(2));
        let tracks = meta.tracks.unwrap();
        assert_eq!(tracks.len(), 2);
        assert!(tracks[0].has_lyrics);
        // single disc: no disc fields
        assert_eq!(tracks[0].disc_number, None);
        assert_eq!(tracks[0].disc_total, None);
    }

    #[test]
    fn multi_disc_album_gets_disc_totals() {
        let raw = json!({"data": [{
            "id": "9",
            "attributes": {"name": "Double", "trackCount": 2},
            "relationships": {"tracks": {"data": [
                {"type": "songs", "id": "s1", "attributes": {"trackNumber": 1, "name": "A", "discNumber": 1}},
                {"type": "songs", "id": "s2", "attributes": {"trackNumber": 1, "name": "B", "discNumber": 2}}
            ]}}
        }]});
        let meta = filter_metadata(&info(LinkKind::Album), &raw).unwrap();
        let tracks = meta.tracks.unwrap();
        assert_eq!(tracks[0].disc_number, Some(1));
        assert_eq!(tracks[0].disc_total, Some(2));
        assert_eq!(tracks[1].disc_number, Some(2));
    }

    #[test]
    fn album_skips_incomplete_tracks() {
        let raw = json!({"data": [{
            "id": "9",
            "attributes": {"name": "X"},
            "relationships": {"tracks": {"data": [
                {"type": "songs", "id": "s1", "attributes": {"name": "missing number"}},
                {"type": "music-videos", "id": "mv", "attributes": {"trackNumber": 1, "name": "not a song"}},
                {"type": "songs", "id": "s2", "attributes": {"trackNumber": 1, "name": "Ok"}}
            ]}}
        }]});
        let meta = filter_metadata(&info(LinkKind::Album), &raw).unwrap();
        let tracks = meta.tracks.unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].song_id.as_deref(), Some("s2"));
    }

    #[test]
    fn filters_playlist_with_curator_fallback() {
        let raw = json!({"data": [{
            "id": "pl.x",
            "attributes": {"name": "Mix", "lastModifiedDate": "2026-01-01"},
            "relationships": {
                "curator": {"data": [{"attributes": {"name": "Curator"}}]},
                "tracks": {"data": [
                    {"type": "songs", "id": "s1", "attributes": {"name": "One"}},
                    {"type": "songs", "id": "s2", "attributes": {"name": "Two"}}
                ]}
            }
        }]});
        let meta = filter_metadata(&info(LinkKind::Playlist), &raw).unwrap();
        assert_eq!(meta.curator_name.as_deref(), Some("Curator"));
        assert_eq!(meta.track_count, Some(2));
        // playlist track numbers are positional
        let tracks = meta.tracks.unwrap();
        assert_eq!(tracks[1].track_number, 2);
    }

    #[test]
    fn filters_song_album_url() {
        let raw = json!({"data": [{
            "id": "5678",
            "attributes": {"name": "Song Y", "artistName": "Artist", "hasLyrics": true},
            "relationships": {"albums": {"data": [{"attributes": {"url": "https://music.apple.com/us/album/x/1234"}}]}}
        }]});
        let meta = filter_metadata(&info(LinkKind::Song), &raw).unwrap();
        assert_eq!(
            meta.album_url.as_deref(),
            Some("https://music.apple.com/us/album/x/1234")
        );
        assert_eq!(meta.has_lyrics, Some(true));
    }

    #[test]
    fn filters_music_video_dimensions() {
        let raw = json!({"data": [{
            "id": "77",
            "attributes": {
                "name": "Clip",
                "artistName": "Artist",
                "durationInMillis": 215_000,
                "artwork": {"url": "https://art", "width": 1920, "height": 1080}
            }
        }]});
        let meta = filter_metadata(&info(LinkKind::MusicVideo), &raw).unwrap();
        assert_eq!(meta.duration_in_millis, Some(215_000));
        assert_eq!(meta.width, Some(1920));
        assert_eq!(meta.height, Some(1080));
    }

    #[test]
    fn malformed_document_is_rejected() {
        assert!(filter_metadata(&info(LinkKind::Album), &json!({})).is_none());
        assert!(filter_metadata(&info(LinkKind::Album), &json!({"data": []})).is_none());
        // missing name
        let raw = json!({"data": [{"id": "1", "attributes": {}}]});
        assert!(filter_metadata(&info(LinkKind::Album), &raw).is_none());
    }

    #[test]
    fn invalid_language_error_detection() {
        let body = json!({"errors": [{"code": "40005", "source": {"parameter": "l"}}]});
        assert!(is_invalid_language_error(&body));
        let other = json!({"errors": [{"code": "40005", "source": {"parameter": "ids"}}]});
        assert!(!is_invalid_language_error(&other));
        assert!(!is_invalid_language_error(&json!({})));
    }
}
