//! Scheduler-side error type.

use thiserror::Error;

/// Errors inside the scheduler and executors. These never cross a task
/// boundary - workers convert them into task-level `error` records.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] downbeat_store::StoreError),

    #[error("downloader spawn failed: {0}")]
    Spawn(std::io::Error),

    #[error("source config error: {0}")]
    SourceConfig(String),

    #[error("{0}")]
    Internal(String),
}
