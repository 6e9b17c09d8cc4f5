//! Cache store implementation
//!
//! Payload files live under the cache directory, named from the sanitized
//! track id; the index database maps track id → file path plus the metadata
//! probed at cache time (duration, sample rate, channels), so repeated plays
//! skip both the download and the probe.

use super::CacheState;
use crate::error::Result;
use crate::playlist::TrackId;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Metadata probed from a cached audio file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioMetadata {
    pub duration_ms: u64,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioMetadata {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// A cached, decodable track
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub track_id: TrackId,
    pub path: PathBuf,
    pub metadata: AudioMetadata,
}

/// Persistent track cache
pub struct CacheStore {
    pool: Pool<Sqlite>,
    audio_dir: PathBuf,
    /// Runtime-only states (Downloading, Unavailable); Cached lives in the index
    marks: Mutex<HashMap<TrackId, CacheState>>,
}

impl CacheStore {
    /// Open (or create) the cache at the given directory
    ///
    /// Creates the payload directory, sweeps staging files left behind by
    /// cancelled downloads, and initializes the index schema.
    pub async fn open(cache_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(cache_dir)?;
        sweep_stale_staging(cache_dir)?;

        let options = SqliteConnectOptions::new()
            .filename(cache_dir.join("index.db"))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                track_id TEXT PRIMARY KEY,
                file_path TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                sample_rate INTEGER NOT NULL,
                channels INTEGER NOT NULL,
                size_bytes INTEGER,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&pool)
        .await?;

        info!("Cache store open at {}", cache_dir.display());

        Ok(Self {
            pool,
            audio_dir: cache_dir.to_path_buf(),
            marks: Mutex::new(HashMap::new()),
        })
    }

    /// Look up a cached track
    ///
    /// An index row whose payload file has vanished is repaired (row
    /// removed) and reported as a miss.
    pub async fn get(&self, track_id: &TrackId) -> Result<Option<CacheEntry>> {
        let row: Option<(String, i64, i64, i64)> = sqlx::query_as(
            "SELECT file_path, duration_ms, sample_rate, channels
             FROM cache_entries WHERE track_id = ?",
        )
        .bind(track_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some((file_path, duration_ms, sample_rate, channels)) = row else {
            return Ok(None);
        };

        let path = PathBuf::from(file_path);
        if !path.exists() {
            warn!(
                "Cache index row for '{}' points at missing file {}, repairing",
                track_id,
                path.display()
            );
            self.evict(track_id).await?;
            return Ok(None);
        }

        Ok(Some(CacheEntry {
            track_id: track_id.clone(),
            path,
            metadata: AudioMetadata {
                duration_ms: duration_ms as u64,
                sample_rate: sample_rate as u32,
                channels: channels as u16,
            },
        }))
    }

    /// Persist a freshly downloaded payload
    ///
    /// Renames the staging file to its final name and writes the index row
    /// in one pass; callers stage under [`CacheStore::staging_path`] so the
    /// rename stays on one filesystem.
    pub async fn put(
        &self,
        track_id: &TrackId,
        staged: &Path,
        metadata: AudioMetadata,
    ) -> Result<CacheEntry> {
        let final_path = self.audio_path(track_id);
        std::fs::rename(staged, &final_path)?;

        let size = std::fs::metadata(&final_path).map(|m| m.len()).unwrap_or(0);
        self.insert_row(track_id, &final_path, metadata, size).await?;

        debug!("Cached '{}' at {}", track_id, final_path.display());
        self.clear_mark(track_id);

        Ok(CacheEntry {
            track_id: track_id.clone(),
            path: final_path,
            metadata,
        })
    }

    /// Register a local-file source without copying the payload
    pub async fn register(
        &self,
        track_id: &TrackId,
        path: &Path,
        metadata: AudioMetadata,
    ) -> Result<CacheEntry> {
        let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        self.insert_row(track_id, path, metadata, size).await?;
        self.clear_mark(track_id);

        Ok(CacheEntry {
            track_id: track_id.clone(),
            path: path.to_path_buf(),
            metadata,
        })
    }

    /// Remove a track from the index (payload file is left alone)
    pub async fn evict(&self, track_id: &TrackId) -> Result<()> {
        sqlx::query("DELETE FROM cache_entries WHERE track_id = ?")
            .bind(track_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Current cache state of a track
    pub async fn state(&self, track_id: &TrackId) -> Result<CacheState> {
        if let Some(mark) = self.marks.lock().unwrap().get(track_id) {
            return Ok(*mark);
        }
        Ok(if self.get(track_id).await?.is_some() {
            CacheState::Cached
        } else {
            CacheState::Uncached
        })
    }

    /// Mark a track as having an in-flight download
    pub fn mark_downloading(&self, track_id: &TrackId) {
        self.marks
            .lock()
            .unwrap()
            .insert(track_id.clone(), CacheState::Downloading);
    }

    /// Mark a track as permanently unavailable
    pub fn mark_unavailable(&self, track_id: &TrackId) {
        self.marks
            .lock()
            .unwrap()
            .insert(track_id.clone(), CacheState::Unavailable);
    }

    /// Whether a track has been marked unavailable
    pub fn is_unavailable(&self, track_id: &TrackId) -> bool {
        self.marks.lock().unwrap().get(track_id) == Some(&CacheState::Unavailable)
    }

    /// Drop a runtime mark (download finished, one way or the other)
    pub fn clear_mark(&self, track_id: &TrackId) {
        let mut marks = self.marks.lock().unwrap();
        if marks.get(track_id) != Some(&CacheState::Unavailable) {
            marks.remove(track_id);
        }
    }

    /// Final payload path for a track
    pub fn audio_path(&self, track_id: &TrackId) -> PathBuf {
        self.audio_dir
            .join(format!("{}.audio", sanitize_filename(track_id.as_str())))
    }

    /// Staging path used while a download is in flight
    pub fn staging_path(&self, track_id: &TrackId) -> PathBuf {
        self.audio_dir
            .join(format!("{}.part", sanitize_filename(track_id.as_str())))
    }

    async fn insert_row(
        &self,
        track_id: &TrackId,
        path: &Path,
        metadata: AudioMetadata,
        size: u64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO cache_entries
                (track_id, file_path, duration_ms, sample_rate, channels, size_bytes)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(track_id.as_str())
        .bind(path.to_string_lossy().to_string())
        .bind(metadata.duration_ms as i64)
        .bind(metadata.sample_rate as i64)
        .bind(metadata.channels as i64)
        .bind(size as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Remove staging files abandoned by a previous session
fn sweep_stale_staging(cache_dir: &Path) -> Result<()> {
    for entry in std::fs::read_dir(cache_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().map(|e| e == "part").unwrap_or(false) {
            warn!("Removing stale staging file {}", path.display());
            let _ = std::fs::remove_file(&path);
        }
    }
    Ok(())
}

/// Sanitize a track id for use as a filename
///
/// Non-ASCII is dropped and filesystem-hostile characters become
/// underscores, matching what most filesystems accept.
fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .filter(|c| c.is_ascii())
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' | '.' => '_',
            c if c.is_ascii_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        "track".to_string()
    } else {
        sanitized
    }
}
