//! Core domain types for downbeat.
//!
//! This crate holds everything the ingest and scheduler services share that
//! is not I/O: the task record and its state machine, the Apple Music link
//! parser, the user directory, progress/notice events, settings, and path
//! resolution. Infrastructure concerns (file locks, HTTP, subprocesses)
//! live in the adapter crates.

pub mod error;
pub mod events;
pub mod link;
pub mod paths;
pub mod settings;
pub mod task;
pub mod users;

// Re-export commonly used types for convenience
pub use error::CoreError;
pub use events::{NoticeEvent, NoticeKind, ProgressEvent};
pub use link::{parse_link, strip_track_param, LinkInfo, LinkKind};
pub use paths::{ProjectPaths, DEFAULT_ERRORS_FILE, DEFAULT_QUEUE_FILE};
pub use settings::{Settings, SettingsError};
pub use task::{
    global_track_number, sort_tracks_in_place, track_sort_key, TaskMetadata, TaskRecord,
    TaskStatus, Track, TrackPatch, TrackProgress, TrackState,
};
pub use users::{PushEndpoint, UserDirectory, UserProfile};
