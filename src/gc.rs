//! Startup reconciliation of the videos directory against the metadata
//! store: files no record references (leftovers of deleted or crashed
//! downloads) are removed. Failures are logged, never fatal.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{info, warn};

use crate::metadata::MetadataStore;

/// Deletes unreferenced files in `videos_dir` and returns their paths.
pub async fn collect_orphans(store: &MetadataStore, videos_dir: &Path) -> Result<Vec<PathBuf>> {
    let videos = store.list_videos().await?;
    let referenced: HashSet<&str> = videos.iter().map(|video| video.filename.as_str()).collect();

    let mut removed = Vec::new();
    let mut entries = tokio::fs::read_dir(videos_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if referenced.contains(name) {
            continue;
        }
        tokio::fs::remove_file(entry.path()).await?;
        removed.push(entry.path());
    }
    Ok(removed)
}

/// Runs the reconciliation once in the background.
pub fn spawn(store: MetadataStore, videos_dir: PathBuf) {
    tokio::spawn(async move {
        match collect_orphans(&store, &videos_dir).await {
            Ok(removed) if !removed.is_empty() => {
                info!(?removed, "removed orphaned video files");
            }
            Ok(_) => {}
            Err(err) => {
                warn!(%err, "video directory reconciliation failed");
            }
        }
    });
}
