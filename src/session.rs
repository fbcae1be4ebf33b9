//! One downloader invocation and its fanned-out event stream.
//!
//! A [`DownloadSession`] spawns the external downloader for a single URL,
//! merges its stdout/stderr line streams, decodes every line through
//! [`crate::events::parse_line`] and publishes the results on a broadcast
//! channel. The channel never blocks the producer; subscribers that fall too
//! far behind skip ahead rather than stalling the download.
//!
//! The process lifetime is owned by the caller through a [`DownloadScope`]:
//! dropping the scope before [`DownloadScope::release`] kills the process.

use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use url::Url;

use crate::events::{DownloadEvent, parse_line};

/// Substring of the informational line the downloader prints when the target
/// resource does not exist.
const UNAVAILABLE_MARKER: &str = "Video unavailable";

/// Templated progress line requested from the downloader. The leading
/// `download:` token is what keys the parser's progress branch.
const PROGRESS_TEMPLATE: &str = concat!(
    "download:",
    "{ \"downloaded_bytes\": %(progress.downloaded_bytes)s,",
    " \"total_bytes\": %(progress.total_bytes|null)s,",
    " \"eta\": %(progress.eta|null)s,",
    " \"speed\": %(progress.speed|null)s,",
    " \"elapsed\": %(progress.elapsed|null)s,",
    " \"id\": \"%(info.id|)s\" }",
);

/// Per-session broadcast capacity. A laggard subscriber past this many
/// buffered events skips ahead instead of blocking the process pump.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Items carried on a session's channel. `Event` entries repeat; `Failed`
/// and `Closed` are terminal and always the last item a subscriber sees.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Event(DownloadEvent),
    Failed(SessionFailure),
    Closed,
}

/// Irrecoverable session outcomes, surfaced on the stream itself.
#[derive(Debug, Clone, Error)]
pub enum SessionFailure {
    /// The downloader reported the target resource as unavailable.
    #[error("video not found")]
    VideoNotFound,
    /// The downloader process could not be managed (distinct from the
    /// process merely exiting non-zero, which ends the stream normally).
    #[error("download command failed: {0}")]
    Command(String),
}

/// Cancel-on-drop ownership of one download's process lifetime.
///
/// The initiating caller holds the scope while it waits for metadata; any
/// early exit drops it and terminates the process. Once the download is
/// committed the caller calls [`release`](Self::release) and the process
/// runs to completion on its own.
pub struct DownloadScope {
    token: CancellationToken,
    armed: bool,
}

impl DownloadScope {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            armed: true,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Decouples the session from this scope.
    pub fn release(mut self) {
        self.armed = false;
    }
}

impl Default for DownloadScope {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DownloadScope {
    fn drop(&mut self) {
        if self.armed {
            self.token.cancel();
        }
    }
}

/// Cloneable handle to a session's event channel. Outlives the session in
/// the registry so late progress subscribers can still attach.
#[derive(Clone)]
pub struct SessionStream {
    events: broadcast::Sender<SessionEvent>,
    closed: Arc<AtomicBool>,
}

impl SessionStream {
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// True once the terminal event has been published. Checked after
    /// subscribing: if still false, the terminal event is guaranteed to
    /// reach the new subscriber.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether both handles point at the same underlying session.
    pub fn same_session(&self, other: &SessionStream) -> bool {
        Arc::ptr_eq(&self.closed, &other.closed)
    }
}

/// One running downloader invocation.
pub struct DownloadSession {
    stream: SessionStream,
}

impl DownloadSession {
    /// Spawns the downloader for `url` with `videos_dir` as its working
    /// directory and starts pumping its output into the event channel.
    ///
    /// The returned receiver was subscribed before the pump started, so it
    /// observes the complete event sequence. A spawn failure is the
    /// "command could not start" case and is reported directly instead of
    /// on the stream.
    pub fn spawn(
        downloader: &Path,
        url: &Url,
        videos_dir: &Path,
        cancel: CancellationToken,
    ) -> io::Result<(Self, broadcast::Receiver<SessionEvent>)> {
        let mut child = Command::new(downloader)
            .arg(url.as_str())
            .arg("--newline")
            .arg("--progress")
            .arg("--progress-template")
            .arg(PROGRESS_TEMPLATE)
            .arg("--dump-json")
            .arg("--no-quiet")
            .arg("--no-simulate")
            .arg("--restrict-filenames")
            .current_dir(videos_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let Some(stdout) = child.stdout.take() else {
            return Err(io::Error::other("downloader stdout was not captured"));
        };
        let Some(stderr) = child.stderr.take() else {
            return Err(io::Error::other("downloader stderr was not captured"));
        };

        let (events, receiver) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let stream = SessionStream {
            events,
            closed: Arc::new(AtomicBool::new(false)),
        };

        let pump_stream = stream.clone();
        tokio::spawn(async move {
            pump(child, stdout, stderr, pump_stream, cancel).await;
        });

        Ok((Self { stream }, receiver))
    }

    pub fn stream(&self) -> SessionStream {
        self.stream.clone()
    }
}

/// Publishes a terminal event, flagging the stream closed first so that
/// `subscribe`-then-`is_closed` checks never miss the terminal.
fn finish(stream: &SessionStream, terminal: SessionEvent) {
    stream.closed.store(true, Ordering::Release);
    let _ = stream.events.send(terminal);
}

async fn pump(
    mut child: Child,
    stdout: tokio::process::ChildStdout,
    stderr: tokio::process::ChildStderr,
    stream: SessionStream,
    cancel: CancellationToken,
) {
    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();
    let mut stdout_open = true;
    let mut stderr_open = true;

    while stdout_open || stderr_open {
        let line = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("download scope cancelled, terminating process");
                if let Err(err) = child.kill().await {
                    warn!(%err, "failed to kill cancelled downloader process");
                }
                finish(&stream, SessionEvent::Closed);
                return;
            }
            line = stdout_lines.next_line(), if stdout_open => match line {
                Ok(Some(line)) => Some(line),
                Ok(None) => {
                    stdout_open = false;
                    None
                }
                Err(err) => {
                    warn!(%err, "error reading downloader stdout");
                    stdout_open = false;
                    None
                }
            },
            line = stderr_lines.next_line(), if stderr_open => match line {
                Ok(Some(line)) => Some(line),
                Ok(None) => {
                    stderr_open = false;
                    None
                }
                Err(err) => {
                    warn!(%err, "error reading downloader stderr");
                    stderr_open = false;
                    None
                }
            },
        };

        let Some(line) = line else { continue };
        if line.trim().is_empty() {
            continue;
        }

        let event = parse_line(&line);
        let unavailable = matches!(&event, DownloadEvent::Message(message)
            if message.text.contains(UNAVAILABLE_MARKER));

        // Publish the event untouched even when it carries the failure
        // marker; the typed failure follows it on the stream.
        let _ = stream.events.send(SessionEvent::Event(event));

        if unavailable {
            if let Err(err) = child.kill().await {
                warn!(%err, "failed to kill downloader after unavailable marker");
            }
            finish(&stream, SessionEvent::Failed(SessionFailure::VideoNotFound));
            return;
        }
    }

    match child.wait().await {
        Ok(status) => {
            if !status.success() {
                warn!(%status, "downloader exited with non-zero status");
            }
            finish(&stream, SessionEvent::Closed);
        }
        Err(err) => {
            error!(%err, "error waiting for downloader process");
            finish(
                &stream,
                SessionEvent::Failed(SessionFailure::Command(err.to_string())),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    /// Writes an executable shell script standing in for the downloader.
    /// The script receives the URL plus the fixed flag set and is free to
    /// ignore them.
    fn stub_downloader(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("fake-downloader");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn test_url() -> Url {
        Url::parse("https://example.test/watch?v=abc123").unwrap()
    }

    async fn collect(mut receiver: broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut seen = Vec::new();
        loop {
            let event = timeout(Duration::from_secs(5), receiver.recv())
                .await
                .expect("session stream did not terminate")
                .expect("channel closed without terminal event");
            let terminal = matches!(event, SessionEvent::Failed(_) | SessionEvent::Closed);
            seen.push(event);
            if terminal {
                return seen;
            }
        }
    }

    #[tokio::test]
    async fn decodes_and_terminates_on_process_exit() {
        let dir = TempDir::new().unwrap();
        let downloader = stub_downloader(
            &dir,
            r#"echo '{"id": "abc123", "title": "A video", "filename": "A_video.mp4"}'
echo 'download:{ "downloaded_bytes": 10, "total_bytes": 100, "eta": null, "speed": null, "elapsed": null, "id": "abc123" }'
echo '[info] done'"#,
        );

        let (_session, receiver) =
            DownloadSession::spawn(&downloader, &test_url(), dir.path(), CancellationToken::new())
                .unwrap();
        let seen = collect(receiver).await;

        assert!(matches!(
            seen[0],
            SessionEvent::Event(DownloadEvent::Metadata(_))
        ));
        assert!(matches!(
            seen[1],
            SessionEvent::Event(DownloadEvent::Progress(_))
        ));
        assert!(matches!(
            seen[2],
            SessionEvent::Event(DownloadEvent::Message(_))
        ));
        assert!(matches!(seen.last(), Some(SessionEvent::Closed)));
    }

    #[tokio::test]
    async fn unavailable_marker_fails_the_stream_and_kills_the_process() {
        let dir = TempDir::new().unwrap();
        // The sleep would hold the session open for a minute if the pump
        // did not kill the process on the marker.
        let downloader = stub_downloader(
            &dir,
            r#"echo 'ERROR: [youtube] abc123: Video unavailable'
sleep 60
echo '{"id": "abc123", "title": "late", "filename": "late.mp4"}'"#,
        );

        let (session, receiver) =
            DownloadSession::spawn(&downloader, &test_url(), dir.path(), CancellationToken::new())
                .unwrap();
        let seen = collect(receiver).await;

        assert!(matches!(
            seen.last(),
            Some(SessionEvent::Failed(SessionFailure::VideoNotFound))
        ));
        // The marker line itself is still delivered, unaltered.
        assert!(seen.iter().any(|event| matches!(
            event,
            SessionEvent::Event(DownloadEvent::Message(message))
                if message.text.contains("Video unavailable")
        )));
        assert!(session.stream().is_closed());
    }

    #[tokio::test]
    async fn cancellation_terminates_the_session() {
        let dir = TempDir::new().unwrap();
        let downloader = stub_downloader(&dir, "sleep 60");

        let scope = DownloadScope::new();
        let (_session, receiver) =
            DownloadSession::spawn(&downloader, &test_url(), dir.path(), scope.token()).unwrap();
        drop(scope);

        let seen = collect(receiver).await;
        assert!(matches!(seen.last(), Some(SessionEvent::Closed)));
    }

    #[tokio::test]
    async fn released_scope_lets_the_session_finish() {
        let dir = TempDir::new().unwrap();
        let downloader = stub_downloader(
            &dir,
            r#"echo '{"id": "abc123", "title": "t", "filename": "t.mp4"}'"#,
        );

        let scope = DownloadScope::new();
        let (_session, receiver) =
            DownloadSession::spawn(&downloader, &test_url(), dir.path(), scope.token()).unwrap();
        scope.release();

        let seen = collect(receiver).await;
        assert!(matches!(
            seen.first(),
            Some(SessionEvent::Event(DownloadEvent::Metadata(_)))
        ));
        assert!(matches!(seen.last(), Some(SessionEvent::Closed)));
    }

    #[tokio::test]
    async fn subscribers_observe_identical_ordered_sequences() {
        let dir = TempDir::new().unwrap();
        // Give the second subscriber time to attach before output starts.
        let downloader = stub_downloader(
            &dir,
            r#"sleep 0.3
echo '{"id": "abc123", "title": "t", "filename": "t.mp4"}'
echo 'download:{ "downloaded_bytes": 1, "total_bytes": null, "eta": null, "speed": null, "elapsed": null, "id": "abc123" }'
echo 'download:{ "downloaded_bytes": 2, "total_bytes": null, "eta": null, "speed": null, "elapsed": null, "id": "abc123" }'
echo '[info] finished'"#,
        );

        let (session, first) =
            DownloadSession::spawn(&downloader, &test_url(), dir.path(), CancellationToken::new())
                .unwrap();
        let second = session.stream().subscribe();

        let first_seen = collect(first).await;
        let second_seen = collect(second).await;

        let digest = |events: &[SessionEvent]| {
            events
                .iter()
                .map(|event| match event {
                    SessionEvent::Event(DownloadEvent::Metadata(metadata)) => {
                        format!("meta:{}", metadata.id)
                    }
                    SessionEvent::Event(DownloadEvent::Progress(progress)) => {
                        format!("progress:{}", progress.downloaded_bytes)
                    }
                    SessionEvent::Event(DownloadEvent::Message(message)) => {
                        format!("message:{}", message.text)
                    }
                    SessionEvent::Failed(failure) => format!("failed:{failure}"),
                    SessionEvent::Closed => "closed".to_owned(),
                })
                .collect::<Vec<_>>()
        };

        assert_eq!(digest(&first_seen), digest(&second_seen));
        assert_eq!(
            digest(&first_seen),
            vec![
                "meta:abc123",
                "progress:1",
                "progress:2",
                "message:[info] finished",
                "closed",
            ]
        );
    }

    #[test]
    fn progress_template_matches_parser_prefix() {
        assert!(PROGRESS_TEMPLATE.starts_with(crate::events::PROGRESS_PREFIX));
    }
}
