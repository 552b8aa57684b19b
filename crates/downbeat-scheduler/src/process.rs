//! Downloader subprocess supervision.
//!
//! One invocation per track: the rendered source config is fed on stdin
//! (which must then be closed or the binary blocks), stdout and stderr are
//! read by dedicated tasks that enqueue lines onto a channel, and the
//! supervising task drains that channel - parsing, logging, and applying
//! state mutations one at a time. The auto-retry sentinel kills the child
//! and reports the attempt as consumed.

use crate::error::SchedulerError;
use crate::parser::{should_log_line, RETRY_SENTINEL};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

/// Which stream a line came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamSource {
    Stdout,
    Stderr,
}

/// How to invoke the downloader for one track.
#[derive(Clone, Debug)]
pub struct SpawnSpec {
    pub binary: PathBuf,
    pub url: String,
    /// Pass `--song` (every invocation except the verification pass).
    pub song_flag: bool,
    /// Pass `--skip-check` (never on the verification pass).
    pub skip_check: bool,
    /// Rendered source config, written to stdin.
    pub stdin_yaml: String,
}

/// Result of one finished (or killed) invocation.
#[derive(Debug)]
pub struct ProcessOutcome {
    pub exit_code: Option<i32>,
    /// All stdout+stderr lines, newline-joined, for analysis and error logs.
    pub output: String,
    /// The auto-retry sentinel fired and the child was killed.
    pub retry_signal: bool,
}

fn spawn_line_reader(
    stream: impl AsyncRead + Unpin + Send + 'static,
    source: StreamSource,
    tx: mpsc::UnboundedSender<(StreamSource, String)>,
) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf: Vec<u8> = Vec::with_capacity(1024);
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if buf.last() == Some(&b'\n') {
                        buf.pop();
                        if buf.last() == Some(&b'\r') {
                            buf.pop();
                        }
                    }
                    // Lossy decode: the binary can emit non-UTF8 bytes and
                    // that must not kill the reader.
                    let line = String::from_utf8_lossy(&buf).to_string();
                    if tx.send((source, line)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(?source, error = %e, "stream reader exiting on read error");
                    break;
                }
            }
        }
    });
}

/// Run the downloader to completion (or retry-kill), invoking `on_line`
/// for every stdout line in arrival order.
pub async fn run_downloader<F>(
    spec: &SpawnSpec,
    mut on_line: F,
) -> Result<ProcessOutcome, SchedulerError>
where
    F: FnMut(&str),
{
    let mut command = Command::new(&spec.binary);
    command.arg(&spec.url);
    if spec.song_flag {
        command.arg("--song");
    }
    if spec.skip_check {
        command.arg("--skip-check");
    }
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(SchedulerError::Spawn)?;

    // stdin must be closed after the config or the binary waits forever.
    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(spec.stdin_yaml.as_bytes()).await {
            tracing::warn!(error = %e, "writing source config to downloader stdin failed");
        }
        drop(stdin);
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        spawn_line_reader(stdout, StreamSource::Stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_line_reader(stderr, StreamSource::Stderr, tx.clone());
    }
    drop(tx);

    let mut output = String::new();
    let mut retry_signal = false;

    // Drain until both readers hit EOF. Killing the child on the retry
    // sentinel closes the pipes and ends this loop naturally.
    while let Some((source, line)) = rx.recv().await {
        output.push_str(&line);
        output.push('\n');

        if !retry_signal && line.contains(RETRY_SENTINEL) {
            tracing::warn!("downloader requested interactive retry, killing subprocess");
            retry_signal = true;
            let _ = child.start_kill();
            continue;
        }
        if source == StreamSource::Stdout {
            on_line(&line);
        } else if should_log_line(&line) {
            tracing::info!(target: "downloader", "{}", line.trim_end());
        }
    }

    let exit_code = match child.wait().await {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::error!(error = %e, "waiting on downloader failed");
            None
        }
    };

    Ok(ProcessOutcome {
        exit_code,
        output,
        retry_signal,
    })
}
