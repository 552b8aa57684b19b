//! Events published on the progress and notice buses.
//!
//! The wire format is what browser SSE clients consume: per-track progress
//! frames keyed by `song_id`, and `task_completed` notices with a
//! human-readable message.

use crate::task::TrackProgress;
use serde::{Deserialize, Serialize};

/// A per-track progress frame for one task's SSE stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub song_id: String,
    pub progress: TrackProgress,
}

/// Completion outcome carried by a notice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    Success,
    Error,
}

/// A task-completion notice broadcast to all notice subscribers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NoticeEvent {
    /// Always `task_completed`.
    pub event: String,
    #[serde(rename = "type")]
    pub kind: NoticeKind,
    pub uuid: String,
    pub user: String,
    pub task_name: String,
    pub task_type: String,
    pub message: String,
    pub timestamp: String,
}

impl NoticeEvent {
    /// Build a `task_completed` notice.
    #[must_use]
    pub fn task_completed(
        kind: NoticeKind,
        uuid: impl Into<String>,
        user: impl Into<String>,
        task_name: impl Into<String>,
        task_type: impl Into<String>,
        message: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            event: "task_completed".to_string(),
            kind,
            uuid: uuid.into(),
            user: user.into(),
            task_name: task_name.into(),
            task_type: task_type.into(),
            message: message.into(),
            timestamp: timestamp.into(),
        }
    }
}
