//! Metadata persistence layer for the video archive.
//!
//! One row per declared download plus an optional resume position. The
//! structs here mirror both the SQLite schema and the JSON the API exposes.

use std::path::Path;

use anyhow::{Context, Result};
use libsql::{Builder, Connection, Row, params};
use serde::{Deserialize, Serialize};

use crate::events::VideoMetadata;

/// Row stored in the `videos` table. Most fields are optional because the
/// downloader only reports what the source site exposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoRecord {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploader: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webpage_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_date: Option<String>,
    pub filename: String,
}

impl From<VideoMetadata> for VideoRecord {
    fn from(metadata: VideoMetadata) -> Self {
        Self {
            id: metadata.id,
            title: metadata.title,
            description: metadata.description,
            uploader: metadata.uploader,
            duration: metadata.duration,
            webpage_url: metadata.webpage_url,
            thumbnail: metadata.thumbnail,
            upload_date: metadata.upload_date,
            filename: metadata.filename,
        }
    }
}

/// Derived state of a stored video, computed by cross-referencing the file
/// on disk and the session registry. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoStatus {
    Downloading,
    Complete,
    Error,
}

/// A stored video together with its derived status.
#[derive(Debug, Clone, Serialize)]
pub struct VideoWithStatus {
    pub info: VideoRecord,
    pub status: VideoStatus,
}

/// Resume position for a video, kept in a dependent table that cascades on
/// video deletion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PlaybackPosition {
    pub time: f64,
    pub updated_at: i64,
}

async fn configure_connection(conn: &Connection) -> Result<()> {
    // `journal_mode` returns the resulting mode as a row, which
    // `execute_batch` rejects ("Execute returned rows"); run it via `query`.
    conn.query("PRAGMA journal_mode=WAL;", ()).await?;
    conn.execute_batch(
        r#"
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS videos (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT,
            uploader TEXT,
            duration REAL,
            webpage_url TEXT,
            thumbnail TEXT,
            upload_date TEXT,
            filename TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS playback_positions (
            video_id TEXT PRIMARY KEY REFERENCES videos(id) ON DELETE CASCADE,
            time REAL NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL
        );
        "#,
    )
    .await?;
    Ok(())
}

/// Wrapper around the SQLite-compatible connection performing all metadata
/// reads and writes.
#[derive(Clone)]
pub struct MetadataStore {
    conn: Connection,
}

impl MetadataStore {
    /// Opens (and if necessary creates) the database and ensures the
    /// expected schema exists.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating metadata directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening metadata DB {}", path.display()))?;

        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn })
    }

    /// Inserts or updates a video row. Re-downloading an id refreshes the
    /// stored metadata instead of failing.
    pub async fn upsert_video(&self, record: &VideoRecord) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT INTO videos (
                    id, title, description, uploader, duration,
                    webpage_url, thumbnail, upload_date, filename
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(id) DO UPDATE SET
                    title = excluded.title,
                    description = excluded.description,
                    uploader = excluded.uploader,
                    duration = excluded.duration,
                    webpage_url = excluded.webpage_url,
                    thumbnail = excluded.thumbnail,
                    upload_date = excluded.upload_date,
                    filename = excluded.filename
                "#,
                params![
                    record.id.as_str(),
                    record.title.as_str(),
                    record.description.as_deref(),
                    record.uploader.as_deref(),
                    record.duration,
                    record.webpage_url.as_deref(),
                    record.thumbnail.as_deref(),
                    record.upload_date.as_deref(),
                    record.filename.as_str(),
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn list_videos(&self) -> Result<Vec<VideoRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
                SELECT id, title, description, uploader, duration,
                       webpage_url, thumbnail, upload_date, filename
                FROM videos
                ORDER BY upload_date DESC, rowid DESC
                "#,
            )
            .await?;

        let mut rows = stmt.query(params![]).await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(row_to_video_record(&row)?);
        }
        Ok(records)
    }

    pub async fn get_video(&self, id: &str) -> Result<Option<VideoRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
                SELECT id, title, description, uploader, duration,
                       webpage_url, thumbnail, upload_date, filename
                FROM videos
                WHERE id = ?1
                "#,
            )
            .await?;

        let mut rows = stmt.query([id]).await?;
        if let Some(row) = rows.next().await? {
            Ok(Some(row_to_video_record(&row)?))
        } else {
            Ok(None)
        }
    }

    /// Deletes a video row, cascading to its playback position. Returns
    /// whether a row existed.
    pub async fn delete_video(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM videos WHERE id = ?1", params![id])
            .await?;
        Ok(affected > 0)
    }

    pub async fn upsert_playback(&self, video_id: &str, position: &PlaybackPosition) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT INTO playback_positions (video_id, time, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(video_id) DO UPDATE SET
                    time = excluded.time,
                    updated_at = excluded.updated_at
                "#,
                params![video_id, position.time, position.updated_at],
            )
            .await?;
        Ok(())
    }

    pub async fn get_playback(&self, video_id: &str) -> Result<Option<PlaybackPosition>> {
        let mut stmt = self
            .conn
            .prepare("SELECT time, updated_at FROM playback_positions WHERE video_id = ?1")
            .await?;

        let mut rows = stmt.query([video_id]).await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        Ok(Some(PlaybackPosition {
            time: row.get(0)?,
            updated_at: row.get(1)?,
        }))
    }
}

/// Converts a SQL row into a `VideoRecord`.
fn row_to_video_record(row: &Row) -> Result<VideoRecord> {
    // Column order must match the SELECT statements above.
    Ok(VideoRecord {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        uploader: row.get(3)?,
        duration: row.get(4)?,
        webpage_url: row.get(5)?,
        thumbnail: row.get(6)?,
        upload_date: row.get(7)?,
        filename: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    /// Utility builder so every test can produce a populated row without
    /// repeating every assignment.
    fn sample_video(id: &str) -> VideoRecord {
        VideoRecord {
            id: id.to_owned(),
            title: format!("Video {id}"),
            description: Some("desc".into()),
            uploader: Some("uploader".into()),
            duration: Some(120.0),
            webpage_url: Some(format!("https://example.test/watch?v={id}")),
            thumbnail: Some(format!("https://example.test/{id}.jpg")),
            upload_date: Some("20240101".into()),
            filename: format!("Video_{id}.mp4"),
        }
    }

    async fn create_store() -> Result<(tempfile::TempDir, MetadataStore)> {
        let dir = tempdir()?;
        let store = MetadataStore::open(&dir.path().join("videos.db")).await?;
        Ok((dir, store))
    }

    #[tokio::test]
    async fn opens_store_and_creates_schema() -> Result<()> {
        let (dir, _store) = create_store().await?;
        assert!(dir.path().join("videos.db").exists());

        let db = Builder::new_local(dir.path().join("videos.db")).build().await?;
        let conn = db.connect()?;
        for table in ["videos", "playback_positions"] {
            let mut rows = conn
                .query(
                    "SELECT name FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                )
                .await?;
            let exists: Option<String> = rows
                .next()
                .await?
                .map(|row| row.get::<String>(0))
                .transpose()?;
            assert_eq!(exists.as_deref(), Some(table));
        }
        Ok(())
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips() -> Result<()> {
        let (_dir, store) = create_store().await?;
        store.upsert_video(&sample_video("abc")).await?;

        let stored = store.get_video("abc").await?.expect("stored video");
        assert_eq!(stored.title, "Video abc");
        assert_eq!(stored.filename, "Video_abc.mp4");
        assert_eq!(stored.duration, Some(120.0));

        assert!(store.get_video("ghost").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn upsert_refreshes_existing_row() -> Result<()> {
        let (_dir, store) = create_store().await?;
        store.upsert_video(&sample_video("abc")).await?;

        let mut updated = sample_video("abc");
        updated.title = "Renamed".into();
        updated.description = None;
        store.upsert_video(&updated).await?;

        let stored = store.get_video("abc").await?.expect("stored video");
        assert_eq!(stored.title, "Renamed");
        assert!(stored.description.is_none());
        assert_eq!(store.list_videos().await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn list_orders_newest_first() -> Result<()> {
        let (_dir, store) = create_store().await?;
        let mut older = sample_video("old");
        older.upload_date = Some("20230101".into());
        let mut newer = sample_video("new");
        newer.upload_date = Some("20240601".into());
        store.upsert_video(&older).await?;
        store.upsert_video(&newer).await?;

        let listed = store.list_videos().await?;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, "new");
        assert_eq!(listed[1].id, "old");
        Ok(())
    }

    #[tokio::test]
    async fn delete_reports_whether_a_row_existed() -> Result<()> {
        let (_dir, store) = create_store().await?;
        store.upsert_video(&sample_video("abc")).await?;

        assert!(store.delete_video("abc").await?);
        assert!(!store.delete_video("abc").await?);
        assert!(store.get_video("abc").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn playback_position_round_trips_and_updates() -> Result<()> {
        let (_dir, store) = create_store().await?;
        store.upsert_video(&sample_video("abc")).await?;

        assert!(store.get_playback("abc").await?.is_none());

        store
            .upsert_playback(
                "abc",
                &PlaybackPosition {
                    time: 12.5,
                    updated_at: 1_700_000_000_000,
                },
            )
            .await?;
        store
            .upsert_playback(
                "abc",
                &PlaybackPosition {
                    time: 42.0,
                    updated_at: 1_700_000_100_000,
                },
            )
            .await?;

        let position = store.get_playback("abc").await?.expect("stored position");
        assert_eq!(position.time, 42.0);
        assert_eq!(position.updated_at, 1_700_000_100_000);
        Ok(())
    }

    #[tokio::test]
    async fn deleting_a_video_cascades_to_its_playback_position() -> Result<()> {
        let (_dir, store) = create_store().await?;
        store.upsert_video(&sample_video("abc")).await?;
        store
            .upsert_playback(
                "abc",
                &PlaybackPosition {
                    time: 5.0,
                    updated_at: 1_700_000_000_000,
                },
            )
            .await?;

        assert!(store.delete_video("abc").await?);
        assert!(store.get_playback("abc").await?.is_none());
        Ok(())
    }
}
