//! The scheduler loop.
//!
//! A single long-lived task: read the queue, requeue orphans, start the
//! next `ready` task under the parallelism cap, and when fully idle run
//! housekeeping (summary emails, error archival, queue compaction). The
//! loop sleeps on a loopback UDP socket with a timeout; any datagram
//! wakes it immediately and switches it to fast polling until the next
//! idle stretch.

use crate::context::SchedulerContext;
use crate::executor::execute_task;
use crate::notify::email::build_summary_body;
use downbeat_core::task::{TaskRecord, TaskStatus};
use downbeat_store::StatusPatch;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

/// Pause between error archival and queue compaction. Kept from the
/// long-observed behavior of the idle housekeeping sequence.
const COMPACTION_DELAY: Duration = Duration::from_secs(2);

/// Poll cadence state: fast after a wake, long when idle.
#[derive(Debug)]
struct PollState {
    long: Duration,
    fast: Duration,
    fast_mode: bool,
}

impl PollState {
    fn current(&self) -> Duration {
        if self.fast_mode {
            self.fast
        } else {
            self.long
        }
    }
}

/// Run the scheduler loop forever.
pub async fn run(ctx: Arc<SchedulerContext>) {
    let signal_port = ctx.settings.scheduler.signal_port;
    let socket = match UdpSocket::bind(("127.0.0.1", signal_port)).await {
        Ok(socket) => {
            tracing::info!(port = signal_port, "scheduler wake socket bound");
            Some(socket)
        }
        Err(e) => {
            // Degrade to timer-only polling rather than refusing to run.
            tracing::error!(
                port = signal_port,
                error = %e,
                "cannot bind wake socket, falling back to timer-only polling"
            );
            None
        }
    };

    let mut poll = PollState {
        long: Duration::from_secs(ctx.settings.scheduler.long_poll_interval.max(1)),
        fast: Duration::from_secs(ctx.settings.scheduler.fast_poll_interval.max(1)),
        fast_mode: false,
    };
    tracing::info!(
        max_parallel = ctx.settings.scheduler.max_parallel,
        long_poll = poll.long.as_secs(),
        fast_poll = poll.fast.as_secs(),
        "scheduler loop started"
    );

    loop {
        match iteration(&ctx, &mut poll).await {
            Ok(IterationOutcome::StartedTask) => {
                // Check for further startable work immediately.
            }
            Ok(IterationOutcome::Wait) => {
                if wait_for_wake(socket.as_ref(), poll.current()).await && !poll.fast_mode {
                    tracing::info!("wake signal received, switching to fast polling");
                    poll.fast_mode = true;
                }
            }
            Err(e) => {
                // Contain loop errors with a bounded sleep so a persistent
                // failure cannot become a hot crash loop.
                tracing::error!(error = %e, "scheduler iteration failed");
                tokio::time::sleep(poll.current()).await;
            }
        }
    }
}

enum IterationOutcome {
    StartedTask,
    Wait,
}

async fn iteration(
    ctx: &Arc<SchedulerContext>,
    poll: &mut PollState,
) -> Result<IterationOutcome, crate::SchedulerError> {
    let tasks = ctx.queue.load()?;

    requeue_orphans(ctx, &tasks).await?;

    let any_running = ctx.running_count() > 0;
    let any_ready = tasks.iter().any(|t| t.status == TaskStatus::Ready);

    if !any_running && !any_ready {
        if poll.fast_mode {
            tracing::info!("queue idle, switching back to long polling");
            poll.fast_mode = false;
        }
        run_idle_housekeeping(ctx, &tasks).await?;
        return Ok(IterationOutcome::Wait);
    }

    // Pick the first ready task in submission order, self-healing records
    // whose file state lags the in-memory running set.
    let mut candidate = None;
    for task in &tasks {
        if task.status != TaskStatus::Ready {
            continue;
        }
        if ctx.is_running(&task.uuid) {
            tracing::warn!(
                uuid = %task.uuid,
                "file says ready but task is executing, repairing file state"
            );
            ctx.queue
                .update_status(&task.uuid, &StatusPatch::to_status(TaskStatus::Running))?;
            continue;
        }
        candidate = Some(task.clone());
        break;
    }

    let running_count = ctx.running_count();
    let max_parallel = ctx.settings.scheduler.max_parallel;
    match candidate {
        Some(task) if running_count < max_parallel => {
            tracing::info!(
                uuid = %task.uuid,
                user = %task.user,
                running = running_count,
                max_parallel,
                "dispatching task"
            );
            let patch = StatusPatch::to_status(TaskStatus::Running)
                .with_start_time(ctx.now_iso());
            ctx.queue.update_status(&task.uuid, &patch)?;
            ctx.mark_running(&task.uuid);

            let ctx_for_task = Arc::clone(ctx);
            let mut task = task;
            task.status = TaskStatus::Running;
            tokio::spawn(async move {
                execute_task(ctx_for_task, task).await;
            });
            Ok(IterationOutcome::StartedTask)
        }
        Some(_) => {
            tracing::debug!(running = running_count, max_parallel, "at parallelism cap");
            Ok(IterationOutcome::Wait)
        }
        None => Ok(IterationOutcome::Wait),
    }
}

/// Tasks that lost their resolver (metadata null but no longer
/// `pending_meta`) are pulled out of the queue and resubmitted to the
/// ingest API, grouped per user so the identity header is right.
async fn requeue_orphans(
    ctx: &Arc<SchedulerContext>,
    tasks: &[TaskRecord],
) -> Result<(), crate::SchedulerError> {
    let orphans: Vec<&TaskRecord> = tasks
        .iter()
        .filter(|t| t.metadata.is_none() && t.status != TaskStatus::PendingMeta)
        .collect();
    if orphans.is_empty() {
        return Ok(());
    }

    let orphan_uuids: Vec<String> = orphans.iter().map(|t| t.uuid.clone()).collect();
    let mut by_user: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for task in &orphans {
        by_user
            .entry(task.user.clone())
            .or_default()
            .push(task.link.clone());
    }

    ctx.queue.with_queue(|queue| {
        queue.retain(|t| !orphan_uuids.contains(&t.uuid));
    })?;
    tracing::info!(count = orphan_uuids.len(), "removed orphaned tasks for resubmission");

    let submit_url = format!(
        "{}/task",
        ctx.settings.ingest_base_url.trim_end_matches('/')
    );
    for (user, links) in by_user {
        let body: Vec<serde_json::Value> = links
            .iter()
            .map(|link| serde_json::json!({ "link": link }))
            .collect();
        let result = ctx
            .client
            .post(&submit_url)
            .header("X-User", &user)
            .json(&body)
            .timeout(Duration::from_secs(10))
            .send()
            .await;
        match result {
            Ok(resp) => tracing::info!(
                user,
                count = links.len(),
                status = %resp.status(),
                "resubmitted orphaned tasks"
            ),
            Err(e) => tracing::error!(user, error = %e, "orphan resubmission failed"),
        }
    }
    Ok(())
}

/// Idle housekeeping: per-user summary emails for newly terminal tasks,
/// error archival (dedup by uuid), a short pause, then compaction.
async fn run_idle_housekeeping(
    ctx: &Arc<SchedulerContext>,
    tasks: &[TaskRecord],
) -> Result<(), crate::SchedulerError> {
    let completed: Vec<&TaskRecord> = tasks.iter().filter(|t| t.status.is_terminal()).collect();
    if completed.is_empty() {
        return Ok(());
    }
    tracing::info!(count = completed.len(), "processing terminal tasks");

    // 1. Summary emails, one per affected user.
    let mut by_user: BTreeMap<&str, Vec<&TaskRecord>> = BTreeMap::new();
    for task in &completed {
        by_user.entry(task.user.as_str()).or_default().push(task);
    }
    for (user, user_tasks) in by_user {
        let Some(profile) = ctx.users.profile(user) else {
            tracing::warn!(user, "terminal tasks for unknown user, no summary sent");
            continue;
        };
        let body = build_summary_body(user, &user_tasks);
        ctx.notifier.send_summary(user, profile, body).await;
    }

    // 2. Archive errors.
    let error_tasks: Vec<TaskRecord> = completed
        .iter()
        .filter(|t| t.status == TaskStatus::Error)
        .map(|t| (*t).clone())
        .collect();
    if !error_tasks.is_empty() {
        ctx.errors.append_dedup(&error_tasks)?;
    }

    // 3. Pause, then drop every terminal record from the queue.
    tokio::time::sleep(COMPACTION_DELAY).await;
    let removed = ctx.queue.with_queue(|queue| {
        let before = queue.len();
        queue.retain(|t| !t.status.is_terminal());
        before - queue.len()
    })?;
    tracing::info!(removed, "queue compacted");

    for task in &completed {
        ctx.bus.clear_task(&task.uuid);
    }
    Ok(())
}

/// Wait for a wake datagram or the poll timeout. Returns `true` on wake.
async fn wait_for_wake(socket: Option<&UdpSocket>, timeout: Duration) -> bool {
    match socket {
        Some(socket) => {
            let mut buf = [0u8; 1024];
            tokio::select! {
                received = socket.recv_from(&mut buf) => match received {
                    Ok(_) => {
                        tracing::debug!("wake datagram received");
                        true
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "wake socket read failed");
                        false
                    }
                },
                () = tokio::time::sleep(timeout) => false,
            }
        }
        None => {
            tokio::time::sleep(timeout).await;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_state_switches_intervals() {
        let mut poll = PollState {
            long: Duration::from_secs(60),
            fast: Duration::from_secs(3),
            fast_mode: false,
        };
        assert_eq!(poll.current(), Duration::from_secs(60));
        poll.fast_mode = true;
        assert_eq!(poll.current(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn wait_times_out_without_signal() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        assert!(!wait_for_wake(Some(&socket), Duration::from_millis(30)).await);
    }

    #[tokio::test]
    async fn wait_wakes_on_datagram() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();

        let sender = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let tx = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            tx.send_to(b"anything", ("127.0.0.1", port)).await.unwrap();
        });
        assert!(wait_for_wake(Some(&socket), Duration::from_secs(5)).await);
        sender.await.unwrap();
    }

    #[tokio::test]
    async fn no_socket_degrades_to_timer() {
        assert!(!wait_for_wake(None, Duration::from_millis(20)).await);
    }
}
