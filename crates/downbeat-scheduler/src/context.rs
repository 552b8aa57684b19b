//! Shared state for the scheduler process.

use crate::bus::ProgressBus;
use crate::notify::Notifier;
use crate::source_config::SourceConfigRenderer;
use downbeat_core::paths::ProjectPaths;
use downbeat_core::settings::Settings;
use downbeat_core::users::UserDirectory;
use downbeat_store::{ErrorArchive, QueueNotifier, TaskQueueStore};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

/// Everything the scheduler loop, executors, and SSE server share.
pub struct SchedulerContext {
    pub settings: Settings,
    pub paths: ProjectPaths,
    pub users: UserDirectory,
    pub queue: TaskQueueStore,
    pub errors: ErrorArchive,
    pub source: SourceConfigRenderer,
    pub bus: Arc<ProgressBus>,
    pub notifier: Notifier,
    pub client: reqwest::Client,
    pub downloader_binary: PathBuf,
    /// Ground truth for "currently executing" between queue snapshots.
    /// Mutated only by the scheduler loop and finishing executors.
    pub running: Mutex<HashSet<String>>,
    /// Global downloader subprocess cap. Verification subprocesses do not
    /// take a permit.
    pub process_slots: Arc<Semaphore>,
}

impl SchedulerContext {
    /// Wire up the context from validated settings.
    pub fn build(
        settings: Settings,
        paths: ProjectPaths,
        users: UserDirectory,
        downloader_binary: PathBuf,
    ) -> Result<Arc<Self>, downbeat_core::CoreError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| downbeat_core::CoreError::Internal(e.to_string()))?;

        let queue = TaskQueueStore::new(paths.task_queue.clone(), QueueNotifier::new());
        let errors = ErrorArchive::new(paths.errors.clone());
        let source = SourceConfigRenderer::new(paths.source.clone());
        let bus = Arc::new(ProgressBus::new(settings.sse.max_connections));
        let notifier = Notifier::new(
            client.clone(),
            settings.push_notification.clone(),
            settings.email.clone(),
        );
        let process_slots = Arc::new(Semaphore::new(settings.scheduler.max_global_processes));

        Ok(Arc::new(Self {
            settings,
            paths,
            users,
            queue,
            errors,
            source,
            bus,
            notifier,
            client,
            downloader_binary,
            running: Mutex::new(HashSet::new()),
            process_slots,
        }))
    }

    /// Number of tasks currently executing.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.running.lock().expect("running set lock").len()
    }

    #[must_use]
    pub fn is_running(&self, uuid: &str) -> bool {
        self.running.lock().expect("running set lock").contains(uuid)
    }

    pub fn mark_running(&self, uuid: &str) {
        self.running
            .lock()
            .expect("running set lock")
            .insert(uuid.to_string());
    }

    pub fn clear_running(&self, uuid: &str) {
        self.running.lock().expect("running set lock").remove(uuid);
    }

    /// Current timestamp in the host zone, ISO-8601.
    #[must_use]
    pub fn now_iso(&self) -> String {
        chrono::Local::now().to_rfc3339()
    }

    /// Fetch the current API token from the ingest service. Best-effort:
    /// a failure means the downloader falls back to fetching its own.
    pub async fn fetch_api_token(&self) -> Option<String> {
        let url = format!(
            "{}/token",
            self.settings.ingest_base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .get(&url)
            .timeout(std::time::Duration::from_secs(5))
            .send()
            .await;
        match response {
            Ok(resp) if resp.status().is_success() => {
                match resp.json::<serde_json::Value>().await {
                    Ok(body) => body
                        .get("token")
                        .and_then(serde_json::Value::as_str)
                        .map(ToString::to_string),
                    Err(e) => {
                        tracing::warn!(error = %e, "token response was not JSON");
                        None
                    }
                }
            }
            Ok(resp) => {
                tracing::warn!(status = %resp.status(), "ingest token endpoint rejected request");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not reach ingest token endpoint");
                None
            }
        }
    }
}
