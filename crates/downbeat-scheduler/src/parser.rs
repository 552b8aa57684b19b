//! Downloader stdout parsing.
//!
//! The downloader's line-oriented stdout is a stable ABI: each sentinel
//! below maps to a typed event, and a whole-run analysis decides whether
//! an invocation succeeded. The sentinels must match the binary exactly.

use downbeat_core::task::{TrackPatch, TrackProgress, TrackState};
use regex::Regex;
use std::sync::LazyLock;

/// Sentinel that asks the supervisor to kill and retry the subprocess.
pub const RETRY_SENTINEL: &str = "Error detected, press Enter to try again...";
/// Whole-run failure sentinel emitted on token rejection.
pub const TOKEN_FAILURE_SENTINEL: &str = "Detected token failure";

static PROGRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^DL_PROGRESS:(\d+)/(\d+)$").expect("progress regex"));
static AUDIO_QUALITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(\d+)-bit / (\d+)\s+Hz\s*$").expect("quality regex"));
static DOWNLOADED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*Downloaded\s*$").expect("downloaded regex"));
static DECRYPTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*Decrypted\s*$").expect("decrypted regex"));
static TRACK_EXISTS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*Track already exists locally\.\s*$").expect("exists regex")
});
static LYRICS_FAILURE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*Failed to get lyrics\s*$").expect("lyrics regex"));
static CONNECT_ERROR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*Error connecting to device:").expect("connect regex"));
static GLOBAL_TRACK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Track (\d+) of").expect("global track regex"));
static WARNING_COUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"W:(\d+)").expect("warning count regex"));
static ERROR_COUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"E:(\d+)").expect("error count regex"));
static GET_EOF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Get .*? EOF").expect("get-eof regex"));

/// Raw progress/noise patterns that are not worth logging.
static LOG_FILTER_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)Downloading").expect("filter regex"),
        Regex::new(r"(?i)Decrypting").expect("filter regex"),
        Regex::new(r"\d+(\.\d+)?%.*of.*\d+(\.\d+)?.B").expect("filter regex"),
        Regex::new(r"SPECIFIC_LYRICS_FAILURE:.*$").expect("filter regex"),
    ]
});

/// One parsed stdout line.
#[derive(Clone, Debug, PartialEq)]
pub enum OutputEvent {
    /// `DL_PROGRESS:<cur>/<tot>`
    Progress { current: u64, total: u64 },
    /// `Track N of M` - verification-pass track context.
    GlobalTrackContext(u32),
    /// `Error connecting to device:`
    ConnectionFailed,
    /// A line containing `connected`.
    Connected,
    /// `<bits>-bit / <rate> Hz`
    AudioQuality { bit_depth: u32, sample_rate: u32 },
    /// Bare `Downloaded` line.
    Downloaded,
    /// Bare `Decrypted` line.
    Decrypted,
    /// `Track already exists locally.`
    TrackExists,
    /// `Failed to get lyrics` (logged, no state change).
    LyricsFailed,
    /// `SPECIFIC_LYRICS_FAILURE:` prefix.
    SpecificLyricsFailure,
    /// The auto-retry sentinel.
    RetrySignal,
}

/// Parse one stdout line into its event, if it carries one.
#[must_use]
pub fn parse_line(line: &str) -> Option<OutputEvent> {
    if line.contains(RETRY_SENTINEL) {
        return Some(OutputEvent::RetrySignal);
    }
    let stripped = line.trim();
    if let Some(caps) = PROGRESS_RE.captures(stripped) {
        let current = caps[1].parse().ok()?;
        let total = caps[2].parse().ok()?;
        return Some(OutputEvent::Progress { current, total });
    }
    if CONNECT_ERROR_RE.is_match(stripped) {
        return Some(OutputEvent::ConnectionFailed);
    }
    if stripped.starts_with("SPECIFIC_LYRICS_FAILURE:") {
        return Some(OutputEvent::SpecificLyricsFailure);
    }
    if let Some(caps) = GLOBAL_TRACK_RE.captures(stripped) {
        if let Ok(number) = caps[1].parse() {
            return Some(OutputEvent::GlobalTrackContext(number));
        }
    }
    if stripped.to_lowercase().contains("connected") {
        return Some(OutputEvent::Connected);
    }
    if let Some(caps) = AUDIO_QUALITY_RE.captures(stripped) {
        let bit_depth = caps[1].parse().ok()?;
        let sample_rate = caps[2].parse().ok()?;
        return Some(OutputEvent::AudioQuality {
            bit_depth,
            sample_rate,
        });
    }
    if DOWNLOADED_RE.is_match(stripped) {
        return Some(OutputEvent::Downloaded);
    }
    if DECRYPTED_RE.is_match(stripped) {
        return Some(OutputEvent::Decrypted);
    }
    if TRACK_EXISTS_RE.is_match(stripped) {
        return Some(OutputEvent::TrackExists);
    }
    if LYRICS_FAILURE_RE.is_match(stripped) {
        return Some(OutputEvent::LyricsFailed);
    }
    None
}

/// The track-state patch an event implies, `None` for events that only
/// matter to supervision or logging.
#[must_use]
pub fn patch_for(event: &OutputEvent) -> Option<TrackPatch> {
    let patch = match event {
        OutputEvent::Progress { current, total } => TrackPatch {
            download_progress: Some(TrackProgress::from_bytes(*current, *total)),
            ..TrackPatch::default()
        },
        OutputEvent::ConnectionFailed => TrackPatch {
            connection_status: Some(TrackState::Failed),
            ..TrackPatch::default()
        },
        OutputEvent::SpecificLyricsFailure => TrackPatch {
            lyrics_status: Some(TrackState::Failed),
            connection_status: Some(TrackState::Success),
            ..TrackPatch::default()
        },
        OutputEvent::Connected => TrackPatch {
            connection_status: Some(TrackState::Success),
            ..TrackPatch::default()
        },
        OutputEvent::AudioQuality {
            bit_depth,
            sample_rate,
        } => TrackPatch {
            bit_depth: Some(*bit_depth),
            sample_rate: Some(*sample_rate),
            connection_status: Some(TrackState::Success),
            ..TrackPatch::default()
        },
        OutputEvent::Downloaded => TrackPatch {
            download_status: Some(TrackState::Success),
            connection_status: Some(TrackState::Success),
            ..TrackPatch::default()
        },
        OutputEvent::Decrypted => TrackPatch {
            decryption_status: Some(TrackState::Success),
            connection_status: Some(TrackState::Success),
            ..TrackPatch::default()
        },
        OutputEvent::TrackExists => TrackPatch {
            download_status: Some(TrackState::Exists),
            decryption_status: Some(TrackState::Exists),
            connection_status: Some(TrackState::Success),
            ..TrackPatch::default()
        },
        OutputEvent::LyricsFailed
        | OutputEvent::GlobalTrackContext(_)
        | OutputEvent::RetrySignal => return None,
    };
    Some(patch)
}

/// Whole-run analysis of a finished subprocess.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OutputAnalysis {
    pub warnings: u32,
    pub errors: u32,
    pub token_failure: bool,
    pub get_eof_failure: bool,
}

impl OutputAnalysis {
    /// Scan the collected output for cumulative counts and failure
    /// sentinels.
    #[must_use]
    pub fn scan(output: &str) -> Self {
        let mut analysis = Self::default();
        for line in output.lines() {
            let stripped = line.trim();
            if stripped.is_empty() {
                continue;
            }
            if let Some(caps) = WARNING_COUNT_RE.captures(stripped) {
                if let Ok(count) = caps[1].parse() {
                    analysis.warnings = analysis.warnings.max(count);
                }
            }
            if let Some(caps) = ERROR_COUNT_RE.captures(stripped) {
                if let Ok(count) = caps[1].parse() {
                    analysis.errors = analysis.errors.max(count);
                }
            }
            if stripped.contains(TOKEN_FAILURE_SENTINEL) {
                analysis.token_failure = true;
            }
            if GET_EOF_RE.is_match(stripped) {
                analysis.get_eof_failure = true;
            }
        }
        analysis
    }

    /// Success requires exit 0, zero errors, and no failure sentinels.
    #[must_use]
    pub fn verdict(&self, exit_code: Option<i32>) -> Result<(), String> {
        let clean_exit = exit_code == Some(0);
        if clean_exit && self.errors == 0 && !self.token_failure && !self.get_eof_failure {
            return Ok(());
        }

        let mut reasons = Vec::new();
        if !clean_exit {
            reasons.push(format!(
                "返回码 {} 非零",
                exit_code.map_or_else(|| "无".to_string(), |c| c.to_string())
            ));
        }
        if self.errors > 0 {
            reasons.push(format!("检测到 {} 个错误 (E:{})", self.errors, self.errors));
        }
        if self.token_failure {
            reasons.push(format!("检测到令牌失败 ('{TOKEN_FAILURE_SENTINEL}')"));
        }
        if self.get_eof_failure {
            reasons.push("检测到网络错误 (Get/EOF)".to_string());
        }
        if reasons.is_empty() {
            reasons.push("未知失败原因".to_string());
        }
        Err(reasons.join(", "))
    }
}

/// Whether a raw output line is worth writing to the service log.
/// Progress spam, stage chatter, and blank lines are dropped.
#[must_use]
pub fn should_log_line(line: &str) -> bool {
    if line.trim().is_empty() || line.trim().starts_with("DL_PROGRESS:") {
        return false;
    }
    // Completion markers stay loggable even though they share a prefix
    // with the filtered "Downloading"/"Decrypting" chatter.
    if DOWNLOADED_RE.is_match(line) || DECRYPTED_RE.is_match(line) {
        return true;
    }
    !LOG_FILTER_RES.iter().any(|re| re.is_match(line))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_progress() {
        assert_eq!(
            parse_line("DL_PROGRESS:1024/2048"),
            Some(OutputEvent::Progress {
                current: 1024,
                total: 2048
            })
        );
        assert_eq!(parse_line("DL_PROGRESS:x/y"), None);
    }

    #[test]
    fn parses_stage_sentinels() {
        assert_eq!(parse_line("  Downloaded  "), Some(OutputEvent::Downloaded));
        assert_eq!(parse_line("decrypted"), Some(OutputEvent::Decrypted));
        assert_eq!(
            parse_line("Track already exists locally."),
            Some(OutputEvent::TrackExists)
        );
        assert_eq!(
            parse_line("Failed to get lyrics"),
            Some(OutputEvent::LyricsFailed)
        );
        assert_eq!(
            parse_line("SPECIFIC_LYRICS_FAILURE: no lyrics for 123"),
            Some(OutputEvent::SpecificLyricsFailure)
        );
    }

    #[test]
    fn parses_connection_states() {
        assert_eq!(
            parse_line("Error connecting to device: refused"),
            Some(OutputEvent::ConnectionFailed)
        );
        assert_eq!(parse_line("device Connected"), Some(OutputEvent::Connected));
        assert_eq!(
            parse_line("24-bit / 96000 Hz"),
            Some(OutputEvent::AudioQuality {
                bit_depth: 24,
                sample_rate: 96000
            })
        );
    }

    #[test]
    fn connection_error_is_not_mistaken_for_connected() {
        // "connecting" must not match the `connected` substring check
        assert_eq!(
            parse_line("Error connecting to device: timeout"),
            Some(OutputEvent::ConnectionFailed)
        );
    }

    #[test]
    fn parses_retry_and_context() {
        assert_eq!(
            parse_line("Error detected, press Enter to try again..."),
            Some(OutputEvent::RetrySignal)
        );
        assert_eq!(
            parse_line("Track 7 of 12:"),
            Some(OutputEvent::GlobalTrackContext(7))
        );
    }

    #[test]
    fn patch_mapping() {
        let patch = patch_for(&OutputEvent::TrackExists).unwrap();
        assert_eq!(patch.download_status, Some(TrackState::Exists));
        assert_eq!(patch.decryption_status, Some(TrackState::Exists));
        assert_eq!(patch.connection_status, Some(TrackState::Success));

        let patch = patch_for(&OutputEvent::AudioQuality {
            bit_depth: 16,
            sample_rate: 44100,
        })
        .unwrap();
        assert_eq!(patch.bit_depth, Some(16));
        assert_eq!(patch.sample_rate, Some(44100));

        // pure supervision events carry no patch
        assert!(patch_for(&OutputEvent::RetrySignal).is_none());
        assert!(patch_for(&OutputEvent::LyricsFailed).is_none());
        assert!(patch_for(&OutputEvent::GlobalTrackContext(3)).is_none());
    }

    #[test]
    fn analysis_counts_are_cumulative_maxima() {
        let output = "W:1\nE:2\nsomething\nW:3 E:5\n";
        let analysis = OutputAnalysis::scan(output);
        assert_eq!(analysis.warnings, 3);
        assert_eq!(analysis.errors, 5);
    }

    #[test]
    fn verdict_success_needs_clean_exit_and_no_sentinels() {
        let clean = OutputAnalysis::scan("Downloaded\nDecrypted\n");
        assert!(clean.verdict(Some(0)).is_ok());
        assert!(clean.verdict(Some(1)).unwrap_err().contains("返回码 1 非零"));
        assert!(clean.verdict(None).is_err());

        let errors = OutputAnalysis::scan("E:3\n");
        let reason = errors.verdict(Some(0)).unwrap_err();
        assert!(reason.contains("检测到 3 个错误"));

        let token = OutputAnalysis::scan("Detected token failure\n");
        assert!(token.verdict(Some(0)).unwrap_err().contains("令牌失败"));

        let eof = OutputAnalysis::scan("Get https://x/stream EOF\n");
        assert!(eof.verdict(Some(0)).unwrap_err().contains("Get/EOF"));
    }

    #[test]
    fn log_filter_drops_noise_and_keeps_completions() {
        assert!(!should_log_line("DL_PROGRESS:1/2"));
        assert!(!should_log_line("Downloading track 5"));
        assert!(!should_log_line("Decrypting ..."));
        assert!(!should_log_line("  12.5% of 40.0 MB"));
        assert!(!should_log_line("   "));
        assert!(!should_log_line("SPECIFIC_LYRICS_FAILURE: x"));
        assert!(should_log_line("Downloaded"));
        assert!(should_log_line("Decrypted"));
        assert!(should_log_line("some other output"));
    }
}
