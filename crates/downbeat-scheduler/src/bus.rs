//! In-memory progress bus.
//!
//! Two channel families: per-task progress subscribers and a global
//! notice family for task-completion events. Each subscriber owns a
//! bounded queue; a full queue drops the newest message rather than
//! blocking a publisher. A global connection cap rejects new SSE
//! subscriptions once reached, and per-task progress is cached so a new
//! subscriber first sees the current snapshot.

use downbeat_core::events::{NoticeEvent, ProgressEvent};
use downbeat_core::task::TrackProgress;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Per-subscriber queue depth.
const SUBSCRIBER_QUEUE_CAPACITY: usize = 100;

struct Subscriber {
    id: uuid::Uuid,
    tx: mpsc::Sender<String>,
}

#[derive(Default)]
struct BusInner {
    /// Progress subscribers keyed by task uuid.
    task_subscribers: HashMap<String, Vec<Subscriber>>,
    notice_subscribers: Vec<Subscriber>,
    /// Latest progress per (task, song), replayed to new subscribers.
    progress_cache: HashMap<String, HashMap<String, TrackProgress>>,
}

/// Snapshot returned by the status endpoint.
#[derive(Debug, serde::Serialize)]
pub struct BusStatus {
    pub current_connections: usize,
    pub max_connections: usize,
    pub usage_percentage: f64,
    pub task_connections: HashMap<String, usize>,
    pub total_task_clients: usize,
    pub notice_clients: usize,
}

/// The bus. Shared behind an `Arc` between executors and the SSE server.
pub struct ProgressBus {
    inner: Mutex<BusInner>,
    connections: AtomicUsize,
    max_connections: usize,
}

/// Live subscription handle; unregisters and releases its connection
/// slot on drop.
pub struct Subscription {
    bus: Arc<ProgressBus>,
    id: uuid::Uuid,
    /// Task uuid for progress subscriptions, `None` for notice ones.
    task_uuid: Option<String>,
    /// Cached progress frames to deliver before anything live.
    pub replay: Vec<String>,
    pub rx: mpsc::Receiver<String>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unregister(self.task_uuid.as_deref(), self.id);
    }
}

impl ProgressBus {
    #[must_use]
    pub fn new(max_connections: usize) -> Self {
        Self {
            inner: Mutex::new(BusInner::default()),
            connections: AtomicUsize::new(0),
            max_connections,
        }
    }

    /// Reserve a connection slot. Returns `false` at the cap.
    fn try_reserve_connection(&self) -> bool {
        let mut current = self.connections.load(Ordering::Acquire);
        loop {
            if current >= self.max_connections {
                return false;
            }
            match self.connections.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Subscribe to one task's progress stream. `None` once the global
    /// connection cap is reached.
    pub fn subscribe_task(self: &Arc<Self>, task_uuid: &str) -> Option<Subscription> {
        if !self.try_reserve_connection() {
            tracing::warn!(
                task_uuid,
                current = self.connections.load(Ordering::Relaxed),
                max = self.max_connections,
                "rejecting SSE subscription at connection cap"
            );
            return None;
        }
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let id = uuid::Uuid::new_v4();

        let mut inner = self.inner.lock().expect("bus lock");
        let replay = inner
            .progress_cache
            .get(task_uuid)
            .map(|songs| {
                songs
                    .iter()
                    .filter_map(|(song_id, progress)| {
                        serde_json::to_string(&ProgressEvent {
                            song_id: song_id.clone(),
                            progress: progress.clone(),
                        })
                        .ok()
                    })
                    .collect()
            })
            .unwrap_or_default();
        inner
            .task_subscribers
            .entry(task_uuid.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        drop(inner);

        tracing::info!(task_uuid, "progress subscriber connected");
        Some(Subscription {
            bus: Arc::clone(self),
            id,
            task_uuid: Some(task_uuid.to_string()),
            replay,
            rx,
        })
    }

    /// Subscribe to the completion notice stream.
    pub fn subscribe_notice(self: &Arc<Self>) -> Option<Subscription> {
        if !self.try_reserve_connection() {
            tracing::warn!("rejecting notice subscription at connection cap");
            return None;
        }
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let id = uuid::Uuid::new_v4();
        self.inner
            .lock()
            .expect("bus lock")
            .notice_subscribers
            .push(Subscriber { id, tx });
        tracing::info!("notice subscriber connected");
        Some(Subscription {
            bus: Arc::clone(self),
            id,
            task_uuid: None,
            replay: Vec::new(),
            rx,
        })
    }

    fn unregister(&self, task_uuid: Option<&str>, id: uuid::Uuid) {
        let mut inner = self.inner.lock().expect("bus lock");
        match task_uuid {
            Some(task_uuid) => {
                if let Some(subs) = inner.task_subscribers.get_mut(task_uuid) {
                    subs.retain(|s| s.id != id);
                    if subs.is_empty() {
                        inner.task_subscribers.remove(task_uuid);
                    }
                }
            }
            None => inner.notice_subscribers.retain(|s| s.id != id),
        }
        drop(inner);
        self.connections.fetch_sub(1, Ordering::AcqRel);
        tracing::info!(?task_uuid, "SSE subscriber disconnected");
    }

    /// Publish a per-track progress frame. Updates the replay cache and
    /// fans out to the task's subscribers; full queues drop the frame.
    pub fn publish_progress(&self, task_uuid: &str, event: &ProgressEvent) {
        let Ok(payload) = serde_json::to_string(event) else {
            return;
        };
        let mut inner = self.inner.lock().expect("bus lock");
        inner
            .progress_cache
            .entry(task_uuid.to_string())
            .or_default()
            .insert(event.song_id.clone(), event.progress.clone());
        if let Some(subs) = inner.task_subscribers.get_mut(task_uuid) {
            subs.retain(|sub| match sub.tx.try_send(payload.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(task_uuid, "subscriber queue full, dropping frame");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
    }

    /// Publish a completion notice to every notice subscriber.
    pub fn publish_notice(&self, notice: &NoticeEvent) {
        let Ok(payload) = serde_json::to_string(notice) else {
            return;
        };
        let mut inner = self.inner.lock().expect("bus lock");
        let mut sent = 0usize;
        inner.notice_subscribers.retain(|sub| {
            match sub.tx.try_send(payload.clone()) {
                Ok(()) => {
                    sent += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!("notice subscriber queue full, dropping notice");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        tracing::info!(sent, uuid = %notice.uuid, "completion notice published");
    }

    /// Drop the cached progress for a task (housekeeping after removal).
    pub fn clear_task(&self, task_uuid: &str) {
        self.inner
            .lock()
            .expect("bus lock")
            .progress_cache
            .remove(task_uuid);
    }

    /// Connection counts for the status endpoint.
    #[must_use]
    pub fn status(&self) -> BusStatus {
        let inner = self.inner.lock().expect("bus lock");
        let task_connections: HashMap<String, usize> = inner
            .task_subscribers
            .iter()
            .map(|(uuid, subs)| (uuid.clone(), subs.len()))
            .collect();
        let total_task_clients = task_connections.values().sum();
        let current = self.connections.load(Ordering::Relaxed);
        #[allow(clippy::cast_precision_loss)]
        let usage_percentage = if self.max_connections > 0 {
            ((current as f64 / self.max_connections as f64) * 10_000.0).round() / 100.0
        } else {
            0.0
        };
        BusStatus {
            current_connections: current,
            max_connections: self.max_connections,
            usage_percentage,
            task_connections,
            total_task_clients,
            notice_clients: inner.notice_subscribers.len(),
        }
    }
}
