//! Decoded output of the external downloader.
//!
//! The downloader writes one event per line: a single JSON metadata dump once
//! the video is resolved, periodic progress lines keyed by the `download:`
//! token, and free-text status chatter everywhere else. `parse_line` turns
//! any line into exactly one [`DownloadEvent`]; the free-text fallback means
//! it cannot fail.

use serde::{Deserialize, Serialize};

/// Token prefixing every templated progress line.
pub const PROGRESS_PREFIX: &str = "download:";

/// Final descriptor the downloader emits exactly once per successful run.
///
/// Only `id`, `title` and `filename` are guaranteed; everything else depends
/// on what the source site exposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploader: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webpage_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_date: Option<String>,
    #[serde(alias = "_filename")]
    pub filename: String,
}

/// One templated progress line. Every field except `downloaded_bytes` may be
/// missing while the downloader is still estimating.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub downloaded_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// A line that matched neither structured shape, kept verbatim so consumers
/// can inspect it (e.g. for the "Video unavailable" marker).
#[derive(Debug, Clone)]
pub struct DownloadMessage {
    pub text: String,
}

/// One decoded line of downloader output.
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    Progress(ProgressUpdate),
    Metadata(VideoMetadata),
    Message(DownloadMessage),
}

/// Decodes a single line of downloader output.
///
/// Attempts, in order: the metadata JSON dump, a `download:`-prefixed
/// progress line, and finally the catch-all message variant.
pub fn parse_line(line: &str) -> DownloadEvent {
    if let Ok(metadata) = serde_json::from_str::<VideoMetadata>(line) {
        return DownloadEvent::Metadata(metadata);
    }

    if let Some(payload) = line.strip_prefix(PROGRESS_PREFIX)
        && let Ok(progress) = serde_json::from_str::<ProgressUpdate>(payload)
    {
        return DownloadEvent::Progress(progress);
    }

    DownloadEvent::Message(DownloadMessage {
        text: line.to_owned(),
    })
}
