//! Task submission and queue listing.
//!
//! `POST /task` validates a batch of links against the user directory and
//! the current queue, appends `pending_meta` placeholders, and spawns one
//! resolver worker per accepted task. `GET /task` returns the queue, with
//! long-poll semantics when it is empty.

use crate::context::AppState;
use crate::error::HttpError;
use crate::metadata::resolve_task;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::Local;
use downbeat_core::link::{parse_link, strip_track_param};
use downbeat_core::task::TaskRecord;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// Rejection reasons surfaced in `failure_summary`.
mod reason {
    pub const MALFORMED: &str = "格式错误或缺少链接";
    pub const UNKNOWN_USER: &str = "用户无效";
    pub const BAD_LINK: &str = "链接无效";
    pub const DUP_IN_REQUEST: &str = "请求内重复";
    pub const DUP_IN_QUEUE: &str = "队列中已存在";
    pub const QUEUE_WRITE_FAILED: &str = "服务器内部错误(队列写失败)";
}

/// One submitted item.
#[derive(Debug, Deserialize)]
pub struct SubmitItem {
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub skip_check: bool,
}

/// Submission response.
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub status: &'static str,
    pub message: String,
    pub accepted_count: usize,
    pub failed_count: usize,
    pub failure_summary: BTreeMap<String, usize>,
}

/// `POST /task`
pub async fn submit(
    State(ctx): State<AppState>,
    headers: HeaderMap,
    Json(batch): Json<Vec<SubmitItem>>,
) -> Result<Json<SubmitResponse>, HttpError> {
    let submitted_user = headers
        .get("X-User")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| HttpError::BadRequest("缺少必需的 X-User HTTP 头。".to_string()))?;

    tracing::info!(count = batch.len(), user = submitted_user, "received task batch");

    let allowed = ctx.allowed_storefronts();
    let submit_time = Local::now().to_rfc3339();
    let mut failures: Vec<&'static str> = Vec::new();
    let mut placeholders: Vec<TaskRecord> = Vec::new();
    let mut seen: HashSet<(String, String)> = HashSet::new();

    for (index, item) in batch.iter().enumerate() {
        let Some(link) = item.link.as_deref().map(str::trim).filter(|l| !l.is_empty()) else {
            failures.push(reason::MALFORMED);
            continue;
        };
        let Some(user) = ctx.users.normalize(submitted_user) else {
            failures.push(reason::UNKNOWN_USER);
            continue;
        };
        let link = strip_track_param(link);
        let Some(link_info) = parse_link(link, &allowed) else {
            failures.push(reason::BAD_LINK);
            continue;
        };
        let identity = (user.to_string(), link.to_string());
        if !seen.insert(identity) {
            failures.push(reason::DUP_IN_REQUEST);
            continue;
        }
        placeholders.push(TaskRecord::placeholder(
            user,
            link,
            link_info,
            submit_time.clone(),
            index,
            item.skip_check,
        ));
    }

    // Queue-side duplicate check and append, one lock acquisition.
    let mut accepted_uuids: Vec<String> = Vec::new();
    let pending_count = placeholders.len();
    if !placeholders.is_empty() {
        let append = ctx.queue.with_queue(|tasks| {
            let existing: HashSet<(String, String)> = tasks
                .iter()
                .filter(|t| !t.status.is_terminal())
                .map(|t| (t.user.clone(), t.link.clone()))
                .collect();
            let mut queued = Vec::new();
            let mut rejected = 0usize;
            for placeholder in placeholders.drain(..) {
                if existing.contains(&(placeholder.user.clone(), placeholder.link.clone())) {
                    rejected += 1;
                } else {
                    queued.push(placeholder.uuid.clone());
                    tasks.push(placeholder);
                }
            }
            (queued, rejected)
        });
        match append {
            Ok((queued, rejected)) => {
                for _ in 0..rejected {
                    failures.push(reason::DUP_IN_QUEUE);
                }
                accepted_uuids = queued;
            }
            Err(e) => {
                tracing::error!(error = %e, "appending placeholders failed");
                for _ in 0..pending_count {
                    failures.push(reason::QUEUE_WRITE_FAILED);
                }
            }
        }
    }

    for uuid in &accepted_uuids {
        let ctx = ctx.clone();
        let uuid = uuid.clone();
        tokio::spawn(async move {
            resolve_task(ctx, uuid).await;
        });
    }
    tracing::info!(
        accepted = accepted_uuids.len(),
        failed = failures.len(),
        "task batch processed"
    );

    let accepted_count = accepted_uuids.len();
    let failed_count = failures.len();
    let mut failure_summary: BTreeMap<String, usize> = BTreeMap::new();
    for reason in failures {
        *failure_summary.entry(reason.to_string()).or_insert(0) += 1;
    }

    let (status, message) = if accepted_count > 0 && failed_count == 0 {
        ("success", format!("成功接受 {accepted_count} 个任务。"))
    } else if accepted_count > 0 {
        (
            "partial_success",
            format!("接受 {accepted_count} 个任务，{failed_count} 个被拒绝。"),
        )
    } else if batch.is_empty() {
        ("success", "请求为空，未处理任何任务。".to_string())
    } else {
        (
            "failure",
            format!("所有 {} 个任务均未能通过验证或添加。", batch.len()),
        )
    };

    Ok(Json(SubmitResponse {
        status,
        message,
        accepted_count,
        failed_count,
        failure_summary,
    }))
}

/// Long-poll query parameters for `GET /task`.
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub wait: bool,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

const fn default_timeout() -> u64 {
    30
}

/// `GET /task`
pub async fn list(
    State(ctx): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<TaskRecord>>, HttpError> {
    let tasks = ctx.queue.load()?;
    if !query.wait || !tasks.is_empty() {
        return Ok(Json(tasks));
    }

    // Empty queue with wait=true: block until a mutation or the timeout.
    let timeout = Duration::from_secs(query.timeout.min(60));
    tracing::debug!(timeout_secs = timeout.as_secs(), "long-polling empty queue");
    if ctx.queue.notifier().wait_for_change(timeout).await {
        return Ok(Json(ctx.queue.load()?));
    }
    Ok(Json(Vec::new()))
}
