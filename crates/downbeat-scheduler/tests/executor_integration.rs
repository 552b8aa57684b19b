//! End-to-end executor tests against a scripted downloader binary.
//!
//! A shell script stands in for the real downloader: it consumes stdin,
//! emits the sentinel lines a real run produces, and branches on its argv
//! so the album verification pass (no `--song`) behaves differently from
//! per-track invocations.

#![cfg(unix)]

use downbeat_core::link::{LinkInfo, LinkKind};
use downbeat_core::paths::ProjectPaths;
use downbeat_core::settings::Settings;
use downbeat_core::task::{TaskMetadata, TaskRecord, TaskStatus, Track, TrackState};
use downbeat_core::users::UserDirectory;
use downbeat_scheduler::executor::execute_task;
use downbeat_scheduler::SchedulerContext;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

fn write_fake_downloader(dir: &Path, body: &str) -> std::path::PathBuf {
    let path = dir.join("bin/downloader");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, format!("#!/bin/sh\ncat > /dev/null\n{body}")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn test_settings() -> Settings {
    serde_yaml::from_str(
        r#"
max_retries: 1
retry_delay_seconds: 0
ingest_base_url: http://127.0.0.1:1
scheduler:
  max_parallel: 2
  max_parallel_tasks: 4
  max_global_processes: 3
search_cache:
  enabled: false
upstream:
  api_base_url: http://127.0.0.1:1/v1/catalog
  token_fetch_url: http://127.0.0.1:1
  token_fetch_js_regex: "x"
  token_fetch_token_regex: "x"
  user_agent: downbeat-test
  storefront_language_map:
    us: en-US
"#,
    )
    .unwrap()
}

fn build_context(dir: &Path, downloader_body: &str) -> Arc<SchedulerContext> {
    let settings = test_settings();
    let paths = ProjectPaths::resolve(dir, &settings.paths, "logs.log");
    paths.ensure_directories().unwrap();
    std::fs::write(
        &paths.source,
        "media-user-name: \"{user}\"\ndecrypt-m3u8-port: [\"127.0.0.1:10020\"]\n",
    )
    .unwrap();
    let users = UserDirectory::from_yaml("alice:\n  other_name: [Al]\n").unwrap();
    let binary = write_fake_downloader(dir, downloader_body);
    SchedulerContext::build(settings, paths, users, binary).unwrap()
}

fn track(num: u32, song_id: &str) -> Track {
    Track {
        track_number: num,
        name: format!("Track {num}"),
        song_id: Some(song_id.to_string()),
        url: Some(format!("https://music.apple.com/us/song/t/{song_id}")),
        ..Track::default()
    }
}

fn queued_task(kind: LinkKind, tracks: Vec<Track>) -> TaskRecord {
    let mut task = TaskRecord::placeholder(
        "alice",
        "https://music.apple.com/us/album/x/1234",
        LinkInfo {
            kind,
            storefront: "us".to_string(),
            id: "1234".to_string(),
        },
        "2026-01-01T00:00:00+08:00",
        0,
        false,
    );
    task.status = TaskStatus::Running;
    task.metadata = Some(TaskMetadata {
        name: "Album X".to_string(),
        id: "1234".to_string(),
        track_count: u32::try_from(tracks.len()).ok(),
        tracks: Some(tracks),
        ..TaskMetadata::default()
    });
    task
}

fn seed_queue(ctx: &SchedulerContext, task: &TaskRecord) {
    let task = task.clone();
    ctx.queue.with_queue(move |tasks| tasks.push(task)).unwrap();
}

fn reload(ctx: &SchedulerContext, uuid: &str) -> TaskRecord {
    ctx.queue
        .load()
        .unwrap()
        .into_iter()
        .find(|t| t.uuid == uuid)
        .expect("task still in queue")
}

/// Per-track runs (`--song` present) report a clean download; the
/// verification pass walks both tracks.
const HAPPY_ALBUM_SCRIPT: &str = r#"
if [ "$2" = "--song" ]; then
  echo "connected"
  echo "DL_PROGRESS:50/100"
  echo "DL_PROGRESS:100/100"
  echo "24-bit / 48000 Hz"
  echo "Downloaded"
  echo "Decrypted"
else
  echo "Track 1 of 2:"
  echo "Decrypted"
  echo "Track 2 of 2:"
  echo "Decrypted"
fi
exit 0
"#;

#[tokio::test]
async fn album_happy_path_downloads_verifies_and_finishes() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = build_context(dir.path(), HAPPY_ALBUM_SCRIPT);

    let task = queued_task(LinkKind::Album, vec![track(1, "s1"), track(2, "s2")]);
    seed_queue(&ctx, &task);
    ctx.mark_running(&task.uuid);

    let mut notice_sub = ctx.bus.subscribe_notice().unwrap();
    execute_task(Arc::clone(&ctx), task.clone()).await;

    let finished = reload(&ctx, &task.uuid);
    assert_eq!(finished.status, TaskStatus::Finish);
    assert!(finished.process_complete_time.is_some());
    assert_eq!(finished.checking, None);
    for t in finished.tracks() {
        assert_eq!(t.download_status, Some(TrackState::Success));
        assert_eq!(t.decryption_status, Some(TrackState::Success));
        assert_eq!(t.connection_status, Some(TrackState::Success));
        assert_eq!(t.bit_depth, Some(24));
        assert_eq!(t.sample_rate, Some(48000));
        // stamped by the verification pass
        assert_eq!(t.check_success, Some(true));
        assert_eq!(t.download_progress.as_ref().unwrap().percent, 100.0);
    }

    // executor released its running-set entry and announced success
    assert!(!ctx.is_running(&task.uuid));
    let notice = notice_sub.rx.recv().await.unwrap();
    assert!(notice.contains("\"type\":\"success\""));
    assert!(notice.contains("专辑《Album X》下载完成"));
}

#[tokio::test]
async fn playlist_skips_verification() {
    let dir = tempfile::tempdir().unwrap();
    // no verification branch needed: every invocation carries --song
    let ctx = build_context(
        dir.path(),
        "echo connected\necho Downloaded\necho Decrypted\nexit 0\n",
    );

    let mut task = queued_task(LinkKind::Playlist, vec![track(1, "p1")]);
    task.link_info.kind = LinkKind::Playlist;
    seed_queue(&ctx, &task);
    ctx.mark_running(&task.uuid);

    execute_task(Arc::clone(&ctx), task.clone()).await;

    let finished = reload(&ctx, &task.uuid);
    assert_eq!(finished.status, TaskStatus::Finish);
    // no verification pass ran, so no check_success stamps
    assert_eq!(finished.tracks()[0].check_success, None);
}

#[tokio::test]
async fn failing_track_marks_task_error_with_reason() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = build_context(dir.path(), "echo 'E:2'\nexit 1\n");

    let task = queued_task(LinkKind::Album, vec![track(1, "s1")]);
    seed_queue(&ctx, &task);
    ctx.mark_running(&task.uuid);

    let mut notice_sub = ctx.bus.subscribe_notice().unwrap();
    execute_task(Arc::clone(&ctx), task.clone()).await;

    let failed = reload(&ctx, &task.uuid);
    assert_eq!(failed.status, TaskStatus::Error);
    let reason = failed.error_reason.unwrap();
    assert!(reason.contains("任务失败: 1 个音轨下载失败"));
    assert!(reason.contains("音轨 1 (ID: s1) 失败"));
    assert!(reason.contains("返回码 1 非零"));
    assert!(failed.error_log.unwrap().contains("E:2"));

    let notice = notice_sub.rx.recv().await.unwrap();
    assert!(notice.contains("\"type\":\"error\""));
}

#[tokio::test]
async fn single_song_task_uses_virtual_track() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = build_context(dir.path(), "echo Downloaded\nexit 0\n");

    let mut task = queued_task(LinkKind::MusicVideo, vec![]);
    task.metadata.as_mut().unwrap().tracks = None;
    seed_queue(&ctx, &task);
    ctx.mark_running(&task.uuid);

    execute_task(Arc::clone(&ctx), task.clone()).await;
    assert_eq!(reload(&ctx, &task.uuid).status, TaskStatus::Finish);
}

#[tokio::test]
async fn verification_failure_overrides_track_success() {
    let dir = tempfile::tempdir().unwrap();
    // tracks succeed, the verification pass reports detected errors
    let script = r#"
if [ "$2" = "--song" ]; then
  echo "Downloaded"
  echo "Decrypted"
  exit 0
fi
echo "Track 1 of 1:"
echo "E:1"
exit 0
"#;
    let ctx = build_context(dir.path(), script);

    let task = queued_task(LinkKind::Album, vec![track(1, "s1")]);
    seed_queue(&ctx, &task);
    ctx.mark_running(&task.uuid);

    execute_task(Arc::clone(&ctx), task.clone()).await;

    let failed = reload(&ctx, &task.uuid);
    assert_eq!(failed.status, TaskStatus::Error);
    assert!(failed.error_reason.unwrap().starts_with("专辑校验失败"));
}

#[tokio::test]
async fn already_existing_tracks_skip_verification() {
    let dir = tempfile::tempdir().unwrap();
    // every track reports "already exists"; a verification run would
    // error loudly, proving it never happened
    let script = r#"
if [ "$2" = "--song" ]; then
  echo "Track already exists locally."
  exit 0
fi
echo "E:9"
exit 1
"#;
    let ctx = build_context(dir.path(), script);

    let task = queued_task(LinkKind::Album, vec![track(1, "s1"), track(2, "s2")]);
    seed_queue(&ctx, &task);
    ctx.mark_running(&task.uuid);

    execute_task(Arc::clone(&ctx), task.clone()).await;

    let finished = reload(&ctx, &task.uuid);
    assert_eq!(finished.status, TaskStatus::Finish);
    for t in finished.tracks() {
        assert_eq!(t.download_status, Some(TrackState::Exists));
        assert_eq!(t.decryption_status, Some(TrackState::Exists));
    }
}
