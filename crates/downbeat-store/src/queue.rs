//! The authoritative task queue file.
//!
//! A single JSON array of task records. The only sanctioned mutation path
//! is [`TaskQueueStore::with_queue`]: one write-lock acquisition around
//! read-modify-write, temp-file + atomic-rename on the way out, and a
//! notifier broadcast so long-poll clients unblock.

use crate::error::StoreError;
use crate::files::{read_json_unlocked, write_json_unlocked};
use crate::lock::FileLock;
use crate::notifier::QueueNotifier;
use downbeat_core::task::{
    track_sort_key, TaskRecord, TaskStatus, TrackPatch, TrackProgress, TrackState,
};
use std::path::{Path, PathBuf};

/// A status transition applied to one task record.
#[derive(Clone, Debug, Default)]
pub struct StatusPatch {
    pub status: Option<TaskStatus>,
    pub error_reason: Option<String>,
    pub error_log: Option<String>,
    pub process_start_time: Option<String>,
    pub process_complete_time: Option<String>,
    /// `Some(flag)` sets the transient checking flag; `None` clears it.
    pub checking: Option<bool>,
}

impl StatusPatch {
    /// Transition to `status`, clearing the checking flag.
    #[must_use]
    pub fn to_status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_error(mut self, reason: impl Into<String>, log: impl Into<String>) -> Self {
        self.error_reason = Some(reason.into());
        self.error_log = Some(log.into());
        self
    }

    #[must_use]
    pub fn with_start_time(mut self, ts: impl Into<String>) -> Self {
        self.process_start_time = Some(ts.into());
        self
    }

    #[must_use]
    pub fn with_complete_time(mut self, ts: impl Into<String>) -> Self {
        self.process_complete_time = Some(ts.into());
        self
    }

    #[must_use]
    pub const fn with_checking(mut self, checking: bool) -> Self {
        self.checking = Some(checking);
        self
    }
}

/// Handle on the queue file.
#[derive(Clone, Debug)]
pub struct TaskQueueStore {
    path: PathBuf,
    lock: FileLock,
    notifier: QueueNotifier,
}

impl TaskQueueStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, notifier: QueueNotifier) -> Self {
        let path = path.into();
        let lock = FileLock::for_file(&path);
        Self {
            path,
            lock,
            notifier,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn notifier(&self) -> &QueueNotifier {
        &self.notifier
    }

    /// Snapshot of the whole queue.
    pub fn load(&self) -> Result<Vec<TaskRecord>, StoreError> {
        let _guard = self.lock.acquire_read()?;
        read_json_unlocked(&self.path, Vec::new)
    }

    /// Reset the queue to an empty array (scheduler boot).
    pub fn reset(&self) -> Result<(), StoreError> {
        let _guard = self.lock.acquire_write()?;
        write_json_unlocked(&self.path, &Vec::<TaskRecord>::new())?;
        self.notifier.notify_change();
        Ok(())
    }

    /// Initialize the file to `[]` when missing, empty, or unreadable.
    pub fn ensure_initialized(&self) -> Result<(), StoreError> {
        let _guard = self.lock.acquire_write()?;
        let current: Result<Vec<TaskRecord>, StoreError> =
            read_json_unlocked(&self.path, Vec::new);
        match current {
            Ok(_) if self.path.exists() => Ok(()),
            _ => {
                tracing::warn!(path = %self.path.display(), "initializing queue file to []");
                write_json_unlocked(&self.path, &Vec::<TaskRecord>::new())
            }
        }
    }

    /// Read-modify-write under a single write lock. The closure's result
    /// is returned; long-poll waiters are notified afterwards.
    pub fn with_queue<R>(
        &self,
        mutate: impl FnOnce(&mut Vec<TaskRecord>) -> R,
    ) -> Result<R, StoreError> {
        let _guard = self.lock.acquire_write()?;
        let mut tasks: Vec<TaskRecord> = read_json_unlocked(&self.path, Vec::new)?;
        let result = mutate(&mut tasks);
        write_json_unlocked(&self.path, &tasks)?;
        drop(_guard);
        self.notifier.notify_change();
        Ok(result)
    }

    /// Apply a status patch to one task. Returns `false` when the uuid is
    /// not in the queue.
    pub fn update_status(&self, uuid: &str, patch: &StatusPatch) -> Result<bool, StoreError> {
        self.with_queue(|tasks| {
            let Some(task) = tasks.iter_mut().find(|t| t.uuid == uuid) else {
                tracing::warn!(uuid, "status update for unknown task");
                return false;
            };
            if let Some(status) = patch.status {
                tracing::info!(uuid, status = status.as_str(), "updating task status");
                task.status = status;
            }
            if let Some(reason) = &patch.error_reason {
                task.error_reason = Some(reason.clone());
            }
            if let Some(log) = &patch.error_log {
                task.error_log = Some(log.clone());
            }
            if let Some(ts) = &patch.process_start_time {
                task.process_start_time = Some(ts.clone());
            }
            if let Some(ts) = &patch.process_complete_time {
                task.process_complete_time = Some(ts.clone());
            }
            task.checking = patch.checking;
            true
        })
    }

    /// Merge a track patch into the track with `song_id` inside task
    /// `uuid`. Returns `false` when the task or track is missing.
    pub fn update_track_by_song_id(
        &self,
        uuid: &str,
        song_id: &str,
        patch: &TrackPatch,
    ) -> Result<bool, StoreError> {
        self.with_queue(|tasks| {
            let Some(task) = tasks.iter_mut().find(|t| t.uuid == uuid) else {
                tracing::warn!(uuid, song_id, "track update for unknown task");
                return false;
            };
            let Some(tracks) = task.metadata.as_mut().and_then(|m| m.tracks.as_mut()) else {
                tracing::warn!(uuid, song_id, "track update but task has no track list");
                return false;
            };
            let Some(track) = tracks
                .iter_mut()
                .find(|t| t.song_id.as_deref() == Some(song_id))
            else {
                tracing::warn!(uuid, song_id, "track update for unknown song id");
                return false;
            };
            patch.apply(track);
            true
        })
    }

    /// Merge a patch into the track at 1-based position `global` within
    /// the disc-then-track ordering - the verification pass's addressing
    /// scheme. When `mark_fully_complete` is set, the track is stamped
    /// with full success state and 100% progress instead.
    pub fn update_track_by_global_number(
        &self,
        uuid: &str,
        global: u32,
        patch: &TrackPatch,
        mark_fully_complete: bool,
    ) -> Result<bool, StoreError> {
        if global == 0 {
            return Ok(false);
        }
        self.with_queue(|tasks| {
            let Some(task) = tasks.iter_mut().find(|t| t.uuid == uuid) else {
                tracing::warn!(uuid, global, "global-number update for unknown task");
                return false;
            };
            let Some(tracks) = task.metadata.as_mut().and_then(|m| m.tracks.as_mut()) else {
                return false;
            };
            // Locate via the sorted view without reordering the stored
            // array - the wire order stays as the resolver wrote it.
            let mut order: Vec<usize> = (0..tracks.len()).collect();
            order.sort_by_key(|&i| track_sort_key(&tracks[i]));
            let Some(&index) = order.get(global as usize - 1) else {
                tracing::warn!(uuid, global, "global track number out of range");
                return false;
            };
            let track = &mut tracks[index];
            if mark_fully_complete {
                let total = track
                    .download_progress
                    .as_ref()
                    .map_or(1, |p| p.total.max(1));
                track.check_success = Some(true);
                track.download_status = Some(TrackState::Success);
                track.decryption_status = Some(TrackState::Success);
                track.connection_status = Some(TrackState::Success);
                track.download_progress = Some(TrackProgress::from_bytes(total, total));
            } else {
                patch.apply(track);
            }
            true
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use downbeat_core::link::{LinkInfo, LinkKind};
    use downbeat_core::task::{TaskMetadata, Track};

    fn store() -> (tempfile::TempDir, TaskQueueStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskQueueStore::new(dir.path().join("task_queue.json"), QueueNotifier::new());
        (dir, store)
    }

    fn task_with_tracks(uuid: &str, tracks: Vec<Track>) -> TaskRecord {
        let mut task = TaskRecord::placeholder(
            "alice",
            "https://music.apple.com/us/album/x/1",
            LinkInfo {
                kind: LinkKind::Album,
                storefront: "us".to_string(),
                id: "1".to_string(),
            },
            "2026-01-01T00:00:00",
            0,
            false,
        );
        task.uuid = uuid.to_string();
        task.metadata = Some(TaskMetadata {
            name: "X".to_string(),
            id: "1".to_string(),
            tracks: Some(tracks),
            ..TaskMetadata::default()
        });
        task
    }

    fn track(num: u32, song_id: &str) -> Track {
        Track {
            track_number: num,
            name: format!("t{num}"),
            song_id: Some(song_id.to_string()),
            ..Track::default()
        }
    }

    #[test]
    fn with_queue_persists_and_reloads() {
        let (_dir, store) = store();
        store
            .with_queue(|tasks| tasks.push(task_with_tracks("u-1", vec![])))
            .unwrap();
        let tasks = store.load().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].uuid, "u-1");
    }

    #[test]
    fn status_patch_sets_and_clears_checking() {
        let (_dir, store) = store();
        store
            .with_queue(|tasks| tasks.push(task_with_tracks("u-1", vec![])))
            .unwrap();

        let patch = StatusPatch::to_status(TaskStatus::Running).with_checking(true);
        assert!(store.update_status("u-1", &patch).unwrap());
        assert_eq!(store.load().unwrap()[0].checking, Some(true));

        let patch = StatusPatch::to_status(TaskStatus::Running);
        assert!(store.update_status("u-1", &patch).unwrap());
        let reloaded = store.load().unwrap();
        assert_eq!(reloaded[0].checking, None);
        assert_eq!(reloaded[0].status, TaskStatus::Running);
    }

    #[test]
    fn unknown_uuid_reports_false() {
        let (_dir, store) = store();
        store.ensure_initialized().unwrap();
        let patch = StatusPatch::to_status(TaskStatus::Error);
        assert!(!store.update_status("nope", &patch).unwrap());
    }

    #[test]
    fn track_patch_by_song_id() {
        let (_dir, store) = store();
        store
            .with_queue(|tasks| {
                tasks.push(task_with_tracks("u-1", vec![track(1, "s1"), track(2, "s2")]));
            })
            .unwrap();

        let patch = TrackPatch {
            download_progress: Some(TrackProgress::from_bytes(10, 100)),
            ..TrackPatch::default()
        };
        assert!(store.update_track_by_song_id("u-1", "s2", &patch).unwrap());
        let tasks = store.load().unwrap();
        let t2 = &tasks[0].tracks()[1];
        assert_eq!(t2.download_progress.as_ref().unwrap().current, 10);
        assert!(tasks[0].tracks()[0].download_progress.is_none());
    }

    #[test]
    fn global_number_targets_disc_sorted_position() {
        let (_dir, store) = store();
        let mut t1 = track(1, "s1");
        t1.disc_number = Some(2);
        let mut t2 = track(1, "s2");
        t2.disc_number = Some(1);
        store
            .with_queue(|tasks| tasks.push(task_with_tracks("u-1", vec![t1, t2])))
            .unwrap();

        // global #2 is disc 2 track 1 after sorting, i.e. song s1
        assert!(store
            .update_track_by_global_number("u-1", 2, &TrackPatch::default(), true)
            .unwrap());
        let tasks = store.load().unwrap();
        let hit = tasks[0]
            .tracks()
            .iter()
            .find(|t| t.song_id.as_deref() == Some("s1"))
            .unwrap();
        assert_eq!(hit.check_success, Some(true));
        assert_eq!(hit.download_progress.as_ref().unwrap().percent, 100.0);
    }

    #[test]
    fn global_number_out_of_range_is_false() {
        let (_dir, store) = store();
        store
            .with_queue(|tasks| tasks.push(task_with_tracks("u-1", vec![track(1, "s1")])))
            .unwrap();
        assert!(!store
            .update_track_by_global_number("u-1", 5, &TrackPatch::default(), false)
            .unwrap());
        assert!(!store
            .update_track_by_global_number("u-1", 0, &TrackPatch::default(), false)
            .unwrap());
    }

    #[tokio::test]
    async fn write_notifies_waiters() {
        let (_dir, store) = store();
        let notifier = store.notifier().clone();
        let waiter = tokio::spawn(async move {
            notifier
                .wait_for_change(std::time::Duration::from_secs(5))
                .await
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let store_clone = store.clone();
        tokio::task::spawn_blocking(move || store_clone.with_queue(|_| ()).unwrap())
            .await
            .unwrap();
        assert!(waiter.await.unwrap());
    }
}
