//! Per-task execution.
//!
//! An executor owns one `running` task: it fans out over the track list
//! with a bounded per-task pool, supervises one downloader subprocess per
//! track under the global process cap, retries on failures and the
//! interactive-retry sentinel, runs the album verification pass, and
//! drives the terminal transition with notices and notifications.

use crate::context::SchedulerContext;
use crate::parser::{parse_line, patch_for, should_log_line, OutputAnalysis, OutputEvent};
use crate::process::{run_downloader, SpawnSpec};
use crate::verify;
use downbeat_core::events::{NoticeEvent, NoticeKind, ProgressEvent};
use downbeat_core::link::LinkKind;
use downbeat_core::task::{sort_tracks_in_place, TaskRecord, TaskStatus, Track};
use downbeat_store::StatusPatch;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Outcome of one track's full retry loop.
#[derive(Clone, Debug)]
pub struct TrackResult {
    pub success: bool,
    pub reason: String,
    pub log: String,
    pub track_number: u32,
    pub song_id: Option<String>,
}

impl TrackResult {
    fn success(track: &Track) -> Self {
        Self {
            success: true,
            reason: String::new(),
            log: String::new(),
            track_number: track.track_number,
            song_id: track.song_id.clone(),
        }
    }

    fn failure(track: &Track, reason: impl Into<String>, log: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: reason.into(),
            log: log.into(),
            track_number: track.track_number,
            song_id: track.song_id.clone(),
        }
    }
}

/// Execute one task to its terminal state. Always clears the running-set
/// entry on the way out.
pub async fn execute_task(ctx: Arc<SchedulerContext>, task: TaskRecord) {
    let uuid = task.uuid.clone();
    tracing::info!(uuid, user = %task.user, "task execution started");
    run_task(&ctx, &task).await;
    ctx.clear_running(&uuid);
    tracing::info!(uuid, "task execution finished");
}

async fn run_task(ctx: &Arc<SchedulerContext>, task: &TaskRecord) {
    match task.link_info.kind {
        LinkKind::Album | LinkKind::Playlist => run_multi_track_task(ctx, task).await,
        LinkKind::Song | LinkKind::MusicVideo => run_single_item_task(ctx, task).await,
    }
}

async fn run_multi_track_task(ctx: &Arc<SchedulerContext>, task: &TaskRecord) {
    let mut tracks = task.tracks().to_vec();
    if tracks.is_empty() {
        let msg = "专辑/播放列表任务没有音轨信息".to_string();
        tracing::error!(uuid = %task.uuid, "{msg}");
        finalize_error(ctx, task, msg.clone(), msg).await;
        return;
    }
    sort_tracks_in_place(&mut tracks);

    // Per-task worker pool; each worker additionally takes a global
    // process slot before spawning its subprocess.
    let pool = Arc::new(Semaphore::new(ctx.settings.scheduler.max_parallel_tasks.max(1)));
    let task_snapshot = Arc::new(task.clone());
    let mut join_set = JoinSet::new();
    for track in tracks {
        let ctx = Arc::clone(ctx);
        let task = Arc::clone(&task_snapshot);
        let pool = Arc::clone(&pool);
        join_set.spawn(async move {
            let _slot = pool.acquire_owned().await;
            execute_single_track(&ctx, &task, &track, false).await
        });
    }

    let mut failure_count = 0usize;
    let mut first_error_reason = String::new();
    let mut first_error_log = String::new();
    while let Some(joined) = join_set.join_next().await {
        let result = match joined {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(uuid = %task.uuid, error = %e, "track worker panicked");
                failure_count += 1;
                if first_error_reason.is_empty() {
                    first_error_reason = format!("音轨执行失败: {e}");
                }
                continue;
            }
        };
        if result.success {
            continue;
        }
        failure_count += 1;
        let song_display = result.song_id.clone().unwrap_or_else(|| "N/A".to_string());
        if first_error_reason.is_empty() && !result.reason.is_empty() {
            first_error_reason = format!(
                "音轨 {} (ID: {}) 失败: {}",
                result.track_number, song_display, result.reason
            );
        }
        if first_error_log.is_empty() && !result.log.is_empty() {
            first_error_log = format!(
                "--- 音轨 {} (ID: {}) 错误日志 ---\n{}",
                result.track_number, song_display, result.log
            );
        }
    }

    if failure_count > 0 {
        let reason = format!(
            "任务失败: {failure_count} 个音轨下载失败。首个错误: {first_error_reason}"
        );
        finalize_error(ctx, task, reason, first_error_log).await;
        return;
    }

    if task.link_info.kind == LinkKind::Album {
        run_album_verification(ctx, task).await;
    } else {
        finalize_success(ctx, task).await;
    }
}

/// All tracks downloaded; decide whether the album verification pass can
/// be skipped (every track already existed locally) and run it otherwise.
async fn run_album_verification(ctx: &Arc<SchedulerContext>, task: &TaskRecord) {
    let all_exist = ctx
        .queue
        .load()
        .ok()
        .and_then(|tasks| {
            tasks
                .into_iter()
                .find(|t| t.uuid == task.uuid)
                .map(|t| t.all_tracks_exist_locally())
        })
        .unwrap_or(false);
    if all_exist {
        tracing::info!(uuid = %task.uuid, "all tracks already local, skipping verification");
        finalize_success(ctx, task).await;
        return;
    }

    tracing::info!(uuid = %task.uuid, "starting album verification pass");
    let patch = StatusPatch::to_status(TaskStatus::Running).with_checking(true);
    if let Err(e) = ctx.queue.update_status(&task.uuid, &patch) {
        tracing::error!(uuid = %task.uuid, error = %e, "could not mark verification start");
    }

    let check_track = Track {
        track_number: 0,
        name: task
            .metadata
            .as_ref()
            .map_or_else(|| "专辑校验".to_string(), |m| m.name.clone()),
        url: Some(task.link.clone()),
        song_id: None,
        ..Track::default()
    };
    let result = execute_single_track(ctx, task, &check_track, true).await;

    if result.success {
        tracing::info!(uuid = %task.uuid, "album verification succeeded");
        finalize_success(ctx, task).await;
    } else {
        tracing::error!(uuid = %task.uuid, reason = %result.reason, "album verification failed");
        let reason = format!("专辑校验失败: {}", result.reason);
        finalize_error(ctx, task, reason, result.log).await;
    }
}

async fn run_single_item_task(ctx: &Arc<SchedulerContext>, task: &TaskRecord) {
    // One virtual track whose URL is the task link itself.
    let track = Track {
        track_number: 1,
        name: task
            .metadata
            .as_ref()
            .map_or_else(|| "单项任务".to_string(), |m| m.name.clone()),
        url: Some(task.link.clone()),
        song_id: None,
        ..Track::default()
    };
    let result = execute_single_track(ctx, task, &track, false).await;
    if result.success {
        finalize_success(ctx, task).await;
    } else {
        finalize_error(ctx, task, result.reason, result.log).await;
    }
}

/// Supervise one track's subprocess with the retry loop.
///
/// Verification invocations (`is_check`) never pass `--skip-check` or
/// `--song` and are exempt from the global process cap.
pub(crate) async fn execute_single_track(
    ctx: &Arc<SchedulerContext>,
    task: &TaskRecord,
    track: &Track,
    is_check: bool,
) -> TrackResult {
    let uuid = &task.uuid;
    let Some(url) = track.url.clone() else {
        let msg = format!("音轨 {} 缺少URL信息", track.track_number);
        tracing::error!(uuid, track = track.track_number, "{msg}");
        return TrackResult::failure(track, msg.clone(), msg);
    };
    tracing::info!(
        uuid,
        track = track.track_number,
        song_id = track.song_id.as_deref().unwrap_or("N/A"),
        name = %track.name,
        "track processing started"
    );

    let max_retries = ctx.settings.max_retries;
    let retry_delay = Duration::from_secs(ctx.settings.retry_delay_seconds);
    let mut last_reason = String::new();
    let mut last_log = String::new();

    for attempt in 0..=max_retries {
        tracing::info!(
            uuid,
            track = track.track_number,
            attempt = attempt + 1,
            total = max_retries + 1,
            "starting attempt"
        );

        // Verification subprocesses run outside the global cap.
        let _slot = if is_check {
            None
        } else {
            ctx.process_slots.clone().acquire_owned().await.ok()
        };

        let api_token = ctx.fetch_api_token().await;
        let stdin_yaml = match ctx.source.render(&task.user, api_token.as_deref()) {
            Ok(yaml) => yaml,
            Err(e) => {
                let msg = format!("无法获取 source.yaml 内容: {e}");
                tracing::error!(uuid, error = %e, "source config rendering failed");
                return TrackResult::failure(track, msg.clone(), msg);
            }
        };

        let spec = SpawnSpec {
            binary: ctx.downloader_binary.clone(),
            url: url.clone(),
            song_flag: !is_check,
            skip_check: task.skip_check && !is_check,
            stdin_yaml,
        };

        let mut verify_state = verify::VerifyState::new(task.tracks());
        let outcome = {
            let ctx = Arc::clone(ctx);
            let uuid = uuid.clone();
            let song_id = track.song_id.clone();
            run_downloader(&spec, |line| {
                if is_check {
                    verify::handle_check_line(&ctx, &uuid, &mut verify_state, line);
                } else {
                    handle_track_line(&ctx, &uuid, song_id.as_deref(), line);
                }
            })
            .await
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                last_reason = format!("下载器启动失败: {e}");
                last_log = last_reason.clone();
                tracing::error!(uuid, error = %e, "downloader invocation failed");
                if attempt < max_retries {
                    tokio::time::sleep(retry_delay).await;
                    continue;
                }
                break;
            }
        };

        if outcome.retry_signal {
            tracing::warn!(
                uuid,
                track = track.track_number,
                "retry sentinel consumed attempt"
            );
            last_reason = "下载器请求重试，已终止本次进程".to_string();
            last_log = outcome.output;
            if attempt < max_retries {
                tokio::time::sleep(retry_delay).await;
                continue;
            }
            break;
        }

        let analysis = OutputAnalysis::scan(&outcome.output);
        match analysis.verdict(outcome.exit_code) {
            Ok(()) => {
                tracing::info!(
                    uuid,
                    track = track.track_number,
                    attempt = attempt + 1,
                    "attempt succeeded"
                );
                return TrackResult::success(track);
            }
            Err(reason) => {
                tracing::warn!(
                    uuid,
                    track = track.track_number,
                    attempt = attempt + 1,
                    reason,
                    "attempt failed"
                );
                last_reason = reason;
                last_log = outcome.output;
                if attempt < max_retries {
                    tokio::time::sleep(retry_delay).await;
                } else {
                    tracing::error!(uuid, track = track.track_number, "retries exhausted");
                }
            }
        }
    }

    TrackResult::failure(track, last_reason, last_log)
}

/// Normal-mode stdout handling: parse, log, merge state, publish.
fn handle_track_line(ctx: &SchedulerContext, uuid: &str, song_id: Option<&str>, line: &str) {
    let event = parse_line(line);

    // Raw-line logging, with progress spam filtered out.
    if !matches!(event, Some(OutputEvent::Progress { .. })) && should_log_line(line) {
        tracing::info!(target: "downloader", uuid, "{}", line.trim_end());
    }

    let Some(event) = event else {
        return;
    };
    let Some(song_id) = song_id else {
        // Single-item tasks have no track record to patch.
        return;
    };
    let Some(patch) = patch_for(&event) else {
        return;
    };

    if let Some(progress) = &patch.download_progress {
        ctx.bus.publish_progress(
            uuid,
            &ProgressEvent {
                song_id: song_id.to_string(),
                progress: progress.clone(),
            },
        );
    }
    if let Err(e) = ctx.queue.update_track_by_song_id(uuid, song_id, &patch) {
        tracing::error!(uuid, song_id, error = %e, "track state write failed");
    }
}

/// Terminal transition: `finish`, completion notice, notifications.
async fn finalize_success(ctx: &Arc<SchedulerContext>, task: &TaskRecord) {
    let completed_at = ctx.now_iso();
    let patch = StatusPatch::to_status(TaskStatus::Finish).with_complete_time(completed_at.clone());
    if let Err(e) = ctx.queue.update_status(&task.uuid, &patch) {
        tracing::error!(uuid = %task.uuid, error = %e, "could not mark task finished");
    }

    let name = task.display_name();
    let message = match task.link_info.kind {
        LinkKind::Album => format!("专辑《{name}》下载完成"),
        LinkKind::Playlist => format!("播放列表《{name}》下载完成"),
        LinkKind::Song | LinkKind::MusicVideo => format!("任务《{name}》下载完成"),
    };
    publish_notice(ctx, task, NoticeKind::Success, message, &completed_at);
    notify_user(ctx, task, true).await;
}

/// Terminal transition: `error`, completion notice, notifications.
async fn finalize_error(ctx: &Arc<SchedulerContext>, task: &TaskRecord, reason: String, log: String) {
    let completed_at = ctx.now_iso();
    let patch = StatusPatch::to_status(TaskStatus::Error)
        .with_error(reason.clone(), log)
        .with_complete_time(completed_at.clone());
    if let Err(e) = ctx.queue.update_status(&task.uuid, &patch) {
        tracing::error!(uuid = %task.uuid, error = %e, "could not mark task errored");
    }

    let name = task.display_name();
    let message = match task.link_info.kind {
        LinkKind::Album => format!("专辑《{name}》下载失败: {reason}"),
        _ => format!("任务《{name}》下载失败: {reason}"),
    };
    publish_notice(ctx, task, NoticeKind::Error, message, &completed_at);
    notify_user(ctx, task, false).await;
}

fn publish_notice(
    ctx: &SchedulerContext,
    task: &TaskRecord,
    kind: NoticeKind,
    message: String,
    timestamp: &str,
) {
    let notice = NoticeEvent::task_completed(
        kind,
        task.uuid.clone(),
        task.user.clone(),
        task.display_name(),
        task.type_label(),
        message,
        timestamp,
    );
    ctx.bus.publish_notice(&notice);
}

async fn notify_user(ctx: &Arc<SchedulerContext>, task: &TaskRecord, success: bool) {
    let Some(profile) = ctx.users.profile(&task.user) else {
        tracing::warn!(uuid = %task.uuid, user = %task.user, "no profile, skipping notifications");
        return;
    };
    ctx.notifier.task_completed(profile, task, success).await;
}
