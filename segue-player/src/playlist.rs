//! Playlist input boundary
//!
//! The playlist collaborator hands the pipeline an ordered list of track
//! descriptors (JSON file). The list is read-only input: loaded at session
//! start, re-derived only on explicit reload. Play order is the sequencer's
//! concern, not the playlist's.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Opaque track identifier supplied by the playlist collaborator
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(pub String);

impl TrackId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TrackId {
    fn from(s: &str) -> Self {
        TrackId(s.to_string())
    }
}

/// Where a track's audio comes from
///
/// Closed set; the clip processor consumes the cached result of either
/// variant uniformly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackSource {
    /// Fetched over HTTP and persisted into the cache
    RemoteUrl(String),
    /// Already on local disk; registered in the cache index without copying
    LocalFile(PathBuf),
}

/// A single track as supplied by the playlist collaborator
#[derive(Debug, Clone)]
pub struct Track {
    pub id: TrackId,
    pub title: String,
    pub source: TrackSource,
    /// Advisory duration from the descriptor; cached probe metadata is
    /// authoritative once the track has been fetched
    pub duration_ms: Option<u64>,
}

impl Track {
    pub fn duration(&self) -> Option<Duration> {
        self.duration_ms.map(Duration::from_millis)
    }
}

/// A track plus its position in the supplied order
#[derive(Debug, Clone)]
pub struct PlaylistEntry {
    pub track: Arc<Track>,
    pub position: usize,
}

/// Ordered, read-only collection of tracks for one session
#[derive(Debug, Clone)]
pub struct Playlist {
    entries: Vec<PlaylistEntry>,
}

/// On-disk descriptor format (one JSON array of these)
#[derive(Debug, Deserialize)]
struct TrackDescriptor {
    id: String,
    title: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    file: Option<PathBuf>,
    /// Duration in seconds, if the collaborator knows it
    #[serde(default)]
    duration: Option<f64>,
}

impl Playlist {
    /// Load a playlist from a JSON descriptor file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Playlist(format!("cannot read {}: {}", path.display(), e)))?;
        let descriptors: Vec<TrackDescriptor> = serde_json::from_str(&content)
            .map_err(|e| Error::Playlist(format!("cannot parse {}: {}", path.display(), e)))?;

        let playlist = Self::from_descriptors(descriptors)?;
        info!(
            "Loaded playlist: {} tracks from {}",
            playlist.len(),
            path.display()
        );
        Ok(playlist)
    }

    fn from_descriptors(descriptors: Vec<TrackDescriptor>) -> Result<Self> {
        if descriptors.is_empty() {
            return Err(Error::Playlist("playlist is empty".into()));
        }

        let mut entries = Vec::with_capacity(descriptors.len());
        let mut seen = std::collections::HashSet::new();

        for (position, desc) in descriptors.into_iter().enumerate() {
            if !seen.insert(desc.id.clone()) {
                warn!("Duplicate track id '{}' in playlist, skipping", desc.id);
                continue;
            }

            let source = match (desc.url, desc.file) {
                (Some(url), None) => TrackSource::RemoteUrl(url),
                (None, Some(file)) => TrackSource::LocalFile(file),
                (Some(_), Some(_)) => {
                    return Err(Error::Playlist(format!(
                        "track '{}' has both url and file",
                        desc.id
                    )))
                }
                (None, None) => {
                    return Err(Error::Playlist(format!(
                        "track '{}' has neither url nor file",
                        desc.id
                    )))
                }
            };

            let track = Track {
                id: TrackId(desc.id),
                title: desc.title,
                source,
                duration_ms: desc.duration.map(|s| (s * 1000.0) as u64),
            };

            entries.push(PlaylistEntry {
                track: Arc::new(track),
                position,
            });
        }

        if entries.is_empty() {
            return Err(Error::Playlist("playlist has no usable tracks".into()));
        }

        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[PlaylistEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<Playlist> {
        let descriptors: Vec<TrackDescriptor> = serde_json::from_str(json).unwrap();
        Playlist::from_descriptors(descriptors)
    }

    #[test]
    fn test_load_remote_and_local() {
        let playlist = parse(
            r#"[
                {"id": "a1", "title": "First", "url": "https://example.com/a1.mp3", "duration": 200.0},
                {"id": "b2", "title": "Second", "file": "/music/b2.flac"}
            ]"#,
        )
        .unwrap();

        assert_eq!(playlist.len(), 2);
        let first = &playlist.entries()[0];
        assert_eq!(first.track.id.as_str(), "a1");
        assert_eq!(first.track.duration_ms, Some(200_000));
        assert!(matches!(first.track.source, TrackSource::RemoteUrl(_)));
        assert!(matches!(
            playlist.entries()[1].track.source,
            TrackSource::LocalFile(_)
        ));
    }

    #[test]
    fn test_empty_playlist_rejected() {
        assert!(parse("[]").is_err());
    }

    #[test]
    fn test_track_without_source_rejected() {
        let result = parse(r#"[{"id": "a", "title": "No source"}]"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_track_with_both_sources_rejected() {
        let result = parse(r#"[{"id": "a", "title": "Both", "url": "http://x", "file": "/y"}]"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_duplicate_ids_deduplicated() {
        let playlist = parse(
            r#"[
                {"id": "a", "title": "One", "url": "http://x/1"},
                {"id": "a", "title": "Copy", "url": "http://x/2"},
                {"id": "b", "title": "Two", "url": "http://x/3"}
            ]"#,
        )
        .unwrap();

        assert_eq!(playlist.len(), 2);
    }

    #[test]
    fn test_positions_follow_supplied_order() {
        let playlist = parse(
            r#"[
                {"id": "a", "title": "One", "url": "http://x/1"},
                {"id": "b", "title": "Two", "url": "http://x/2"}
            ]"#,
        )
        .unwrap();

        assert_eq!(playlist.entries()[0].position, 0);
        assert_eq!(playlist.entries()[1].position, 1);
    }
}
