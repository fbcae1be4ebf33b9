//! Orchestration of one user-initiated download.
//!
//! `initiate_download` drives the session through its synchronous window:
//! spawn the downloader under a fresh scope, wait for the metadata event,
//! persist the record, register the live stream, then hand the rest of the
//! download to a background task and return. Failures before persistence
//! abort the session (the scope guard kills the process); afterwards the
//! download is committed and survives the caller disconnecting.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::events::DownloadEvent;
use crate::metadata::{MetadataStore, VideoRecord, VideoStatus, VideoWithStatus};
use crate::registry::SessionRegistry;
use crate::session::{DownloadScope, DownloadSession, SessionEvent, SessionFailure};

/// Messages carried by [`DownloadInitiationError`]; the backend maps
/// [`ERR_VIDEO_NOT_FOUND`] to a 404.
pub const ERR_COMMAND: &str = "Error within download command";
pub const ERR_VIDEO_NOT_FOUND: &str = "Video not found";
pub const ERR_NO_METADATA: &str = "Video info not found in stream";
pub const ERR_SAVE: &str = "Error saving video info";

/// How long a finished session stays in the registry so late progress
/// subscribers can still observe its (ended) stream.
const REGISTRY_LINGER: Duration = Duration::from_secs(60);

/// Failure of the synchronous initiation window, reported to the caller
/// with a human-readable message.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DownloadInitiationError {
    pub message: String,
}

impl DownloadInitiationError {
    fn new(message: &str) -> Self {
        Self {
            message: message.to_owned(),
        }
    }
}

/// Failure to delete a stored video. Details are logged server-side; the
/// message is intentionally opaque.
#[derive(Debug, Error)]
#[error("video deletion failed")]
pub struct VideoDeletionError;

#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    store: MetadataStore,
    registry: SessionRegistry,
    videos_dir: PathBuf,
    downloader: PathBuf,
}

impl DownloadManager {
    pub fn new(
        store: MetadataStore,
        registry: SessionRegistry,
        videos_dir: PathBuf,
        downloader: PathBuf,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                store,
                registry,
                videos_dir,
                downloader,
            }),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    /// Starts a download and blocks until its metadata is known and
    /// persisted. On success the video is guaranteed to be visible to an
    /// immediately-following list call, and its progress stream is already
    /// registered. The download then completes in the background.
    pub async fn initiate_download(
        &self,
        url: &Url,
    ) -> Result<VideoRecord, DownloadInitiationError> {
        // Dropping the scope on any early exit (including the caller's
        // request future being dropped) terminates the process.
        let scope = DownloadScope::new();
        let (session, mut events) = DownloadSession::spawn(
            &self.inner.downloader,
            url,
            &self.inner.videos_dir,
            scope.token(),
        )
        .map_err(|err| {
            error!(%err, %url, "failed to start download command");
            DownloadInitiationError::new(ERR_COMMAND)
        })?;

        let metadata = loop {
            match events.recv().await {
                Ok(SessionEvent::Event(DownloadEvent::Metadata(metadata))) => break metadata,
                Ok(SessionEvent::Event(_)) => {}
                Ok(SessionEvent::Failed(SessionFailure::VideoNotFound)) => {
                    return Err(DownloadInitiationError::new(ERR_VIDEO_NOT_FOUND));
                }
                Ok(SessionEvent::Failed(SessionFailure::Command(detail))) => {
                    error!(%detail, %url, "download command failed before metadata");
                    return Err(DownloadInitiationError::new(ERR_COMMAND));
                }
                Ok(SessionEvent::Closed) | Err(RecvError::Closed) => {
                    return Err(DownloadInitiationError::new(ERR_NO_METADATA));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "initiation reader lagged behind session events");
                }
            }
        };

        let record = VideoRecord::from(metadata);
        self.inner.store.upsert_video(&record).await.map_err(|err| {
            error!(%err, video_id = %record.id, "failed to persist video metadata");
            DownloadInitiationError::new(ERR_SAVE)
        })?;

        // Register before returning so a progress subscription issued right
        // after the response cannot miss the entry.
        let stream = session.stream();
        self.inner.registry.register(&record.id, stream.clone());

        // From here on the download is committed: the already-subscribed
        // receiver keeps draining in the background until the process exits.
        let registry = self.inner.registry.clone();
        let video_id = record.id.clone();
        tokio::spawn(async move {
            drain_session(&mut events, &video_id).await;
            tokio::time::sleep(REGISTRY_LINGER).await;
            registry.remove_expired(&video_id, &stream);
        });

        scope.release();
        info!(video_id = %record.id, %url, "download committed");
        Ok(record)
    }

    /// All stored videos annotated with their derived status.
    pub async fn list_videos(&self) -> Result<Vec<VideoWithStatus>> {
        let records = self.inner.store.list_videos().await?;
        let mut annotated = Vec::with_capacity(records.len());
        for record in records {
            let status = self.video_status(&record).await;
            annotated.push(VideoWithStatus {
                info: record,
                status,
            });
        }
        Ok(annotated)
    }

    pub async fn get_video(&self, id: &str) -> Result<Option<VideoWithStatus>> {
        let Some(record) = self.inner.store.get_video(id).await? else {
            return Ok(None);
        };
        let status = self.video_status(&record).await;
        Ok(Some(VideoWithStatus {
            info: record,
            status,
        }))
    }

    /// Removes the stored record (cascading to its playback position).
    /// Returns false when no such video exists.
    pub async fn delete_video(&self, id: &str) -> Result<bool, VideoDeletionError> {
        match self.inner.store.delete_video(id).await {
            Ok(deleted) => Ok(deleted),
            Err(err) => {
                error!(%err, video_id = %id, "failed to delete video record");
                Err(VideoDeletionError)
            }
        }
    }

    /// A file on disk means the download finished; a registered session
    /// means it is still running; neither means it went wrong.
    async fn video_status(&self, record: &VideoRecord) -> VideoStatus {
        let path = self.inner.videos_dir.join(&record.filename);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            VideoStatus::Complete
        } else if self.inner.registry.contains(&record.id) {
            VideoStatus::Downloading
        } else {
            VideoStatus::Error
        }
    }
}

/// Consumes the shared stream until its terminal event so the session runs
/// to completion even after the initiating caller is gone. Failures here
/// are logged only; the caller already has its response.
async fn drain_session(events: &mut broadcast::Receiver<SessionEvent>, video_id: &str) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Event(_)) => {}
            Ok(SessionEvent::Failed(failure)) => {
                error!(%failure, video_id, "download session failed after commitment");
                return;
            }
            Ok(SessionEvent::Closed) => {
                debug!(video_id, "download session completed");
                return;
            }
            Err(RecvError::Closed) => return,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, video_id, "background drain lagged behind session events");
            }
        }
    }
}
