//! Task records - the unit of work tracked through the queue file.
//!
//! A task is born as a `pending_meta` placeholder when the submission API
//! accepts a link, gains metadata from the resolver (`ready`), is picked up
//! by the scheduler (`running`), and ends `finish` or `error`. Terminal
//! records are immutable until the scheduler's idle housekeeping archives
//! and drops them.
//!
//! Field names follow the on-disk JSON contract, which mixes snake_case
//! task fields with the camelCase attribute names the upstream API uses
//! inside `metadata`.

use crate::link::{LinkInfo, LinkKind};
use serde::{Deserialize, Serialize};

/// Task lifecycle states. See the state machine in the service docs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Placeholder accepted, metadata resolution not finished yet.
    PendingMeta,
    /// Metadata resolved, waiting for the scheduler.
    Ready,
    /// An executor owns this task.
    Running,
    /// All tracks downloaded (and verified, for albums).
    Finish,
    /// Metadata, download, or verification failed.
    Error,
}

impl TaskStatus {
    /// True for `finish` and `error` - the states housekeeping removes.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Finish | Self::Error)
    }

    /// Canonical string form as stored on disk.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PendingMeta => "pending_meta",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Finish => "finish",
            Self::Error => "error",
        }
    }
}

/// Outcome of one stage of a track's processing, as reported by the
/// downloader's stdout sentinels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    Success,
    Exists,
    Failed,
}

/// Byte-level download progress for one track.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackProgress {
    /// Bytes downloaded so far.
    pub current: u64,
    /// Total bytes.
    pub total: u64,
    /// Percent complete, rounded to two decimals.
    pub percent: f64,
}

impl TrackProgress {
    /// Build a progress record from raw byte counts.
    #[must_use]
    pub fn from_bytes(current: u64, total: u64) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let percent = if total > 0 {
            ((current as f64 * 100.0 / total as f64) * 100.0).round() / 100.0
        } else {
            0.0
        };
        Self {
            current,
            total,
            percent,
        }
    }

    /// A synthetic 100% record, used by the verification pass.
    #[must_use]
    pub const fn complete() -> Self {
        Self {
            current: 1,
            total: 1,
            percent: 100.0,
        }
    }
}

/// One track inside an album or playlist, with runtime state attached by
/// the executor as the downloader reports it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Track {
    pub track_number: u32,
    pub name: String,
    #[serde(rename = "hasLyrics", default)]
    pub has_lyrics: bool,
    /// Catalog id. Always set for album/playlist entries; the virtual
    /// track of a single-song or MV task has none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub song_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Only populated when the album spans more than one disc.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disc_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disc_total: Option<u32>,

    // Runtime state, merged in from parsed downloader output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_progress: Option<TrackProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_status: Option<TrackState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decryption_status: Option<TrackState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_status: Option<TrackState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lyrics_status: Option<TrackState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bit_depth: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_success: Option<bool>,
}

impl Track {
    /// True when the downloader reported this track as already present
    /// locally (both download and decryption stages).
    #[must_use]
    pub fn exists_locally(&self) -> bool {
        self.download_status == Some(TrackState::Exists)
            && self.decryption_status == Some(TrackState::Exists)
    }
}

/// A partial update to one track's runtime state, produced by the
/// downloader output parser and merged into the queue file.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrackPatch {
    pub download_progress: Option<TrackProgress>,
    pub download_status: Option<TrackState>,
    pub decryption_status: Option<TrackState>,
    pub connection_status: Option<TrackState>,
    pub lyrics_status: Option<TrackState>,
    pub bit_depth: Option<u32>,
    pub sample_rate: Option<u32>,
    pub check_success: Option<bool>,
}

impl TrackPatch {
    /// True when the patch carries nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Merge every populated field into `track`.
    pub fn apply(&self, track: &mut Track) {
        if let Some(progress) = &self.download_progress {
            track.download_progress = Some(progress.clone());
        }
        if let Some(status) = self.download_status {
            track.download_status = Some(status);
        }
        if let Some(status) = self.decryption_status {
            track.decryption_status = Some(status);
        }
        if let Some(status) = self.connection_status {
            track.connection_status = Some(status);
        }
        if let Some(status) = self.lyrics_status {
            track.lyrics_status = Some(status);
        }
        if let Some(bits) = self.bit_depth {
            track.bit_depth = Some(bits);
        }
        if let Some(rate) = self.sample_rate {
            track.sample_rate = Some(rate);
        }
        if let Some(check) = self.check_success {
            track.check_success = Some(check);
        }
    }
}

/// Filtered metadata view, shaped per link kind.
///
/// Album and playlist carry a track list; song and music-video do not.
/// Optional fields that the kind does not use stay `None` and are omitted
/// from the serialized form.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub name: String,
    pub id: String,
    #[serde(rename = "artistName", default, skip_serializing_if = "Option::is_none")]
    pub artist_name: Option<String>,
    #[serde(
        rename = "curatorName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub curator_name: Option<String>,
    #[serde(rename = "trackCount", default, skip_serializing_if = "Option::is_none")]
    pub track_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artwork_url: Option<String>,
    #[serde(
        rename = "lastModifiedDate",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_modified_date: Option<String>,
    #[serde(
        rename = "durationInMillis",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub duration_in_millis: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(rename = "hasLyrics", default, skip_serializing_if = "Option::is_none")]
    pub has_lyrics: Option<bool>,
    /// Song metadata only: the related album's URL, used to rewrite a
    /// song task into an album task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracks: Option<Vec<Track>>,
}

/// The authoritative task record as stored in the queue file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskRecord {
    pub uuid: String,
    pub user: String,
    pub link: String,
    pub link_info: LinkInfo,
    pub status: TaskStatus,
    pub metadata: Option<TaskMetadata>,
    pub submit_time: String,
    pub order_index: usize,
    #[serde(default)]
    pub skip_check: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_complete_time: Option<String>,
    /// Transient flag set while the album verification subprocess runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checking: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_log: Option<String>,
}

impl TaskRecord {
    /// Create a fresh `pending_meta` placeholder.
    #[must_use]
    pub fn placeholder(
        user: impl Into<String>,
        link: impl Into<String>,
        link_info: LinkInfo,
        submit_time: impl Into<String>,
        order_index: usize,
        skip_check: bool,
    ) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            user: user.into(),
            link: link.into(),
            link_info,
            status: TaskStatus::PendingMeta,
            metadata: None,
            submit_time: submit_time.into(),
            order_index,
            skip_check,
            process_start_time: None,
            process_complete_time: None,
            checking: None,
            error_reason: None,
            error_log: None,
        }
    }

    /// Display name for notifications and summaries.
    #[must_use]
    pub fn display_name(&self) -> String {
        match &self.metadata {
            Some(meta) if !meta.name.is_empty() => meta.name.clone(),
            Some(meta) => format!("ID: {}", meta.id),
            None => "未知名称".to_string(),
        }
    }

    /// Localized task type label for user-facing messages.
    #[must_use]
    pub const fn type_label(&self) -> &'static str {
        match self.link_info.kind {
            LinkKind::Album => "专辑",
            LinkKind::Playlist => "播放列表",
            LinkKind::Song => "单曲",
            LinkKind::MusicVideo => "MV",
        }
    }

    /// Tracks of this task, empty for single-song / MV tasks.
    #[must_use]
    pub fn tracks(&self) -> &[Track] {
        self.metadata
            .as_ref()
            .and_then(|m| m.tracks.as_deref())
            .unwrap_or(&[])
    }

    /// Whether every track reported both stages as already existing.
    /// Decides if the album verification pass can be skipped.
    #[must_use]
    pub fn all_tracks_exist_locally(&self) -> bool {
        let tracks = self.tracks();
        !tracks.is_empty() && tracks.iter().all(Track::exists_locally)
    }
}

/// Ordering key for tracks: (disc_number, track_number), with missing or
/// zero values pushed last.
#[must_use]
pub fn track_sort_key(track: &Track) -> (u32, u32) {
    (
        track.disc_number.unwrap_or(1),
        if track.track_number == 0 {
            u32::MAX
        } else {
            track.track_number
        },
    )
}

/// Sort tracks by (disc_number, track_number).
///
/// This is the order the executor dispatches in and the order the
/// verification pass counts over.
pub fn sort_tracks_in_place(tracks: &mut [Track]) {
    tracks.sort_by_key(track_sort_key);
}

/// Compute the 1-based position of (disc_number, track_number) within the
/// disc-then-track ordering of a multi-disc album.
///
/// Returns `None` when the target track number exceeds the disc's track
/// count or the track list is empty.
#[must_use]
pub fn global_track_number(
    tracks: &[Track],
    disc_number: Option<u32>,
    track_number: u32,
) -> Option<u32> {
    if tracks.is_empty() || track_number == 0 {
        return None;
    }

    let mut disc_counts: Vec<(u32, u32)> = Vec::new();
    for track in tracks {
        let disc = track.disc_number.unwrap_or(1);
        match disc_counts.iter_mut().find(|(d, _)| *d == disc) {
            Some((_, count)) => *count += 1,
            None => disc_counts.push((disc, 1)),
        }
    }
    disc_counts.sort_by_key(|(d, _)| *d);

    let target_disc = disc_number.unwrap_or(1);
    let disc_size = disc_counts
        .iter()
        .find(|(d, _)| *d == target_disc)
        .map(|(_, c)| *c)?;
    if track_number > disc_size {
        return None;
    }

    let mut global = 0;
    for (disc, count) in disc_counts {
        if disc < target_disc {
            global += count;
        } else if disc == target_disc {
            return Some(global + track_number);
        } else {
            break;
        }
    }
    None
}
