//! Album verification pass plumbing.
//!
//! The verification subprocess re-walks the whole album and reports
//! per-track results against `Track N of M` context lines. N is a global
//! track number counted over the disc-then-track ordering - that exact
//! tie-break is load-bearing for multi-disc albums and must not be
//! replaced by `song_id` addressing.

use crate::context::SchedulerContext;
use crate::parser::{parse_line, should_log_line, OutputEvent};
use downbeat_core::events::ProgressEvent;
use downbeat_core::task::{sort_tracks_in_place, Track, TrackPatch, TrackProgress};

/// Line-handler state for one verification subprocess.
#[derive(Debug)]
pub struct VerifyState {
    /// song ids in global-track-number order (index = number - 1).
    ordered_song_ids: Vec<Option<String>>,
    /// Last `Track N of` context seen.
    last_global: Option<u32>,
}

impl VerifyState {
    #[must_use]
    pub fn new(tracks: &[Track]) -> Self {
        let mut sorted = tracks.to_vec();
        sort_tracks_in_place(&mut sorted);
        Self {
            ordered_song_ids: sorted.into_iter().map(|t| t.song_id).collect(),
            last_global: None,
        }
    }

    fn song_id_for(&self, global: u32) -> Option<&str> {
        self.ordered_song_ids
            .get(global as usize - 1)
            .and_then(Option::as_deref)
    }
}

/// Does this event confirm the current context track as verified?
const fn confirms_track(event: &OutputEvent) -> bool {
    matches!(
        event,
        OutputEvent::TrackExists
            | OutputEvent::Downloaded
            | OutputEvent::Decrypted
            | OutputEvent::Connected
    )
}

/// Handle one verification stdout line: track context lines update the
/// state, confirmation sentinels stamp the context track as verified in
/// the queue file and push a 100% progress frame.
pub fn handle_check_line(ctx: &SchedulerContext, uuid: &str, state: &mut VerifyState, line: &str) {
    let event = parse_line(line);

    if let Some(OutputEvent::GlobalTrackContext(number)) = event {
        tracing::info!(uuid, global_track = number, "verification track context");
        state.last_global = Some(number);
        return;
    }
    if should_log_line(line) {
        tracing::info!(target: "downloader", uuid, "[check] {}", line.trim_end());
    }

    let Some(event) = event else {
        return;
    };
    let Some(global) = state.last_global else {
        return;
    };
    if !confirms_track(&event) {
        return;
    }

    // Addressed by global number over the sorted order, never by song_id.
    if let Err(e) =
        ctx.queue
            .update_track_by_global_number(uuid, global, &TrackPatch::default(), true)
    {
        tracing::error!(uuid, global, error = %e, "verification state write failed");
    }
    if let Some(song_id) = state.song_id_for(global) {
        ctx.bus.publish_progress(
            uuid,
            &ProgressEvent {
                song_id: song_id.to_string(),
                progress: TrackProgress::complete(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(disc: Option<u32>, num: u32, song_id: &str) -> Track {
        Track {
            track_number: num,
            name: format!("t{num}"),
            song_id: Some(song_id.to_string()),
            disc_number: disc,
            ..Track::default()
        }
    }

    #[test]
    fn state_orders_song_ids_by_disc_then_track() {
        // deliberately shuffled input
        let tracks = vec![
            track(Some(2), 1, "d2t1"),
            track(Some(1), 2, "d1t2"),
            track(Some(1), 1, "d1t1"),
        ];
        let state = VerifyState::new(&tracks);
        assert_eq!(state.song_id_for(1), Some("d1t1"));
        assert_eq!(state.song_id_for(2), Some("d1t2"));
        assert_eq!(state.song_id_for(3), Some("d2t1"));
        assert_eq!(state.song_id_for(4), None);
    }

    #[test]
    fn confirmation_events() {
        assert!(confirms_track(&OutputEvent::TrackExists));
        assert!(confirms_track(&OutputEvent::Downloaded));
        assert!(confirms_track(&OutputEvent::Decrypted));
        assert!(confirms_track(&OutputEvent::Connected));
        assert!(!confirms_track(&OutputEvent::LyricsFailed));
        assert!(!confirms_track(&OutputEvent::Progress {
            current: 1,
            total: 2
        }));
    }

    #[test]
    fn context_parsing_updates_state() {
        let tracks = vec![track(None, 1, "s1"), track(None, 2, "s2")];
        let mut state = VerifyState::new(&tracks);
        assert_eq!(state.last_global, None);
        if let Some(OutputEvent::GlobalTrackContext(n)) = parse_line("Track 2 of 2:") {
            state.last_global = Some(n);
        }
        assert_eq!(state.last_global, Some(2));
        assert_eq!(state.song_id_for(2), Some("s2"));
    }
}
