//! Track downloader
//!
//! Fetches source audio into the cache store. Safe to call concurrently for
//! many tracks and idempotent per track: callers that arrive while a
//! download is in flight await the same outcome instead of starting a
//! second transfer.
//!
//! Remote payloads stage to `<name>.part` and only rename into place after
//! the metadata probe succeeds, so a cancelled or failed transfer never
//! leaves a half-written cache entry. The staging file is cleaned up by a
//! drop guard, which also runs when the owning task is aborted.

use crate::audio::decoder::probe_metadata;
use crate::audio::AudioSource;
use crate::cache::{AudioMetadata, CacheEntry, CacheStore};
use crate::error::{Error, Result};
use crate::playlist::{Track, TrackId, TrackSource};
use segue_common::{EventBus, PlayerEvent};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Cloneable failure kind shared between coalesced callers
#[derive(Debug, Clone, thiserror::Error)]
pub enum DownloadFailure {
    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited by source")]
    RateLimited,

    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("downloaded audio not decodable: {0}")]
    Decode(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DownloadFailure {
    fn is_retryable(&self) -> bool {
        matches!(self, DownloadFailure::Network(_) | DownloadFailure::RateLimited)
    }
}

impl From<DownloadFailure> for Error {
    fn from(failure: DownloadFailure) -> Self {
        match failure {
            DownloadFailure::Network(msg) => Error::Network(msg),
            DownloadFailure::RateLimited => Error::RateLimited,
            DownloadFailure::Unavailable(msg) => Error::Unavailable(msg),
            DownloadFailure::Decode(msg) => Error::Decode(msg),
            DownloadFailure::Internal(msg) => Error::Internal(msg),
        }
    }
}

type DownloadOutcome = std::result::Result<CacheEntry, DownloadFailure>;

/// Failed `ensure_cached` calls tolerated per track before it is marked
/// unavailable (each call already retries transient errors internally)
const FAILURES_BEFORE_UNAVAILABLE: u32 = 3;

/// Downloads and caches track audio
pub struct Downloader {
    client: reqwest::Client,
    cache: Arc<CacheStore>,
    events: EventBus,
    timeout: Duration,
    retries: u32,
    /// One broadcast sender per in-flight track; followers subscribe
    in_flight: Mutex<HashMap<TrackId, broadcast::Sender<DownloadOutcome>>>,
    /// Failed calls per track, for the unavailable threshold
    failures: Mutex<HashMap<TrackId, u32>>,
}

impl Downloader {
    pub fn new(
        cache: Arc<CacheStore>,
        events: EventBus,
        timeout: Duration,
        retries: u32,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            cache,
            events,
            timeout,
            retries: retries.max(1),
            in_flight: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Ensure a track's audio is cached, downloading it if necessary
    ///
    /// Concurrent calls for the same track coalesce onto one transfer.
    pub async fn ensure_cached(&self, track: &Track) -> Result<CacheEntry> {
        let track_id = &track.id;

        if self.cache.is_unavailable(track_id) {
            return Err(Error::Unavailable(format!(
                "track {} marked unavailable",
                track_id
            )));
        }

        if let Some(entry) = self.cache.get(track_id).await? {
            return Ok(entry);
        }

        // Either join an in-flight download or become its leader
        let receiver = {
            let mut in_flight = self.in_flight.lock().unwrap();
            match in_flight.get(track_id) {
                Some(tx) => Some(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    in_flight.insert(track_id.clone(), tx);
                    None
                }
            }
        };

        if let Some(mut rx) = receiver {
            debug!("Joining in-flight download for {}", track_id);
            return match rx.recv().await {
                Ok(outcome) => outcome.map_err(Into::into),
                // Channel closed without a message: either the leader was
                // cancelled, or it finished between our subscribe and its
                // send. The cache settles which.
                Err(_) => match self.cache.get(track_id).await? {
                    Some(entry) => Ok(entry),
                    None => Err(Error::Network(format!(
                        "download of {} was cancelled",
                        track_id
                    ))),
                },
            };
        }

        // Leader path: the guard unregisters the in-flight entry on every
        // exit, including abort, which wakes followers with a closed channel
        let _leader = InFlightGuard {
            downloader: self,
            track_id: track_id.clone(),
        };

        self.cache.mark_downloading(track_id);
        let outcome = self.fetch_and_store(track).await;
        self.cache.clear_mark(track_id);

        let outcome = self.apply_failure_policy(track_id, outcome);

        // Publish to followers (if any), then unregister via the guard
        if let Some(tx) = self.in_flight.lock().unwrap().get(track_id) {
            let _ = tx.send(outcome.clone());
        }

        outcome.map_err(Into::into)
    }

    /// Track the per-track failure count and escalate to Unavailable
    fn apply_failure_policy(&self, track_id: &TrackId, outcome: DownloadOutcome) -> DownloadOutcome {
        match &outcome {
            Ok(_) => {
                self.failures.lock().unwrap().remove(track_id);
                outcome
            }
            Err(DownloadFailure::Unavailable(reason)) => {
                self.mark_unavailable(track_id, reason);
                outcome
            }
            Err(failure) => {
                let count = {
                    let mut failures = self.failures.lock().unwrap();
                    let count = failures.entry(track_id.clone()).or_insert(0);
                    *count += 1;
                    *count
                };

                if count >= FAILURES_BEFORE_UNAVAILABLE {
                    let reason = format!("{} consecutive failed downloads: {}", count, failure);
                    self.mark_unavailable(track_id, &reason);
                    Err(DownloadFailure::Unavailable(reason))
                } else {
                    outcome
                }
            }
        }
    }

    fn mark_unavailable(&self, track_id: &TrackId, reason: &str) {
        warn!("Marking track {} unavailable: {}", track_id, reason);
        self.cache.mark_unavailable(track_id);
        self.events.emit(PlayerEvent::TrackUnavailable {
            track_id: track_id.to_string(),
            reason: reason.to_string(),
            timestamp: chrono::Utc::now(),
        });
    }

    async fn fetch_and_store(&self, track: &Track) -> DownloadOutcome {
        match &track.source {
            TrackSource::LocalFile(path) => self.register_local(track, path).await,
            TrackSource::RemoteUrl(url) => self.download_remote(track, url).await,
        }
    }

    /// Local sources are probed and indexed in place, never copied
    async fn register_local(&self, track: &Track, path: &Path) -> DownloadOutcome {
        if !path.exists() {
            return Err(DownloadFailure::Unavailable(format!(
                "local file {} does not exist",
                path.display()
            )));
        }

        let metadata = probe_file(path.to_path_buf()).await?;
        self.cache
            .register(&track.id, path, metadata)
            .await
            .map_err(|e| DownloadFailure::Internal(e.to_string()))
    }

    async fn download_remote(&self, track: &Track, url: &str) -> DownloadOutcome {
        let staging = self.cache.staging_path(&track.id);
        let _guard = StagingGuard::new(staging.clone());

        let mut attempt = 1;
        loop {
            match self.fetch_once(track, url, &staging).await {
                Ok(()) => break,
                Err(failure) if failure.is_retryable() && attempt < self.retries => {
                    let backoff = backoff_for(&failure, attempt);
                    warn!(
                        "Download attempt {}/{} for {} failed ({}), retrying in {:?}",
                        attempt, self.retries, track.id, failure, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(failure) => return Err(failure),
            }
        }

        // Probe before committing: an undecodable payload must not poison
        // the cache
        let metadata = probe_file(staging.clone()).await?;

        let entry = self
            .cache
            .put(&track.id, &staging, metadata)
            .await
            .map_err(|e| DownloadFailure::Internal(e.to_string()))?;

        info!(
            "Cached track {} ({} ms at {} Hz)",
            track.id, metadata.duration_ms, metadata.sample_rate
        );
        Ok(entry)
    }

    /// One transfer attempt: GET, stream to the staging file
    async fn fetch_once(&self, track: &Track, url: &str, staging: &Path) -> std::result::Result<(), DownloadFailure> {
        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }

        let total = response.content_length();
        let mut file = tokio::fs::File::create(staging)
            .await
            .map_err(|e| DownloadFailure::Internal(format!("cannot create staging file: {}", e)))?;

        let mut response = response;
        let mut downloaded: u64 = 0;
        let mut last_percent: u8 = 0;

        loop {
            let chunk = match response.chunk().await.map_err(classify_request_error)? {
                Some(chunk) => chunk,
                None => break,
            };

            file.write_all(&chunk)
                .await
                .map_err(|e| DownloadFailure::Internal(format!("staging write failed: {}", e)))?;
            downloaded += chunk.len() as u64;

            // Report every ~10% when the source declares a length
            if let Some(total) = total {
                let percent = ((downloaded * 100) / total.max(1)) as u8;
                if percent >= last_percent + 10 {
                    last_percent = percent;
                    self.events.emit(PlayerEvent::DownloadProgress {
                        track_id: track.id.to_string(),
                        percent: Some(percent.min(100)),
                        bytes: downloaded,
                        timestamp: chrono::Utc::now(),
                    });
                }
            }
        }

        file.flush()
            .await
            .map_err(|e| DownloadFailure::Internal(format!("staging flush failed: {}", e)))?;

        if downloaded == 0 {
            return Err(DownloadFailure::Network("empty response body".into()));
        }

        self.events.emit(PlayerEvent::DownloadProgress {
            track_id: track.id.to_string(),
            percent: total.map(|_| 100),
            bytes: downloaded,
            timestamp: chrono::Utc::now(),
        });

        Ok(())
    }
}

/// Unregisters a leader's in-flight entry on every exit path
struct InFlightGuard<'a> {
    downloader: &'a Downloader,
    track_id: TrackId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.downloader
            .in_flight
            .lock()
            .unwrap()
            .remove(&self.track_id);
    }
}

/// Removes the staging file unless it was renamed away by a successful put
struct StagingGuard {
    path: PathBuf,
}

impl StagingGuard {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if self.path.exists() {
            debug!("Removing staging file {}", self.path.display());
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Probe a staged file off the async runtime
async fn probe_file(path: PathBuf) -> std::result::Result<AudioMetadata, DownloadFailure> {
    let result = tokio::task::spawn_blocking(move || probe_metadata(&AudioSource::LocalFile(path)))
        .await
        .map_err(|e| DownloadFailure::Internal(format!("probe task failed: {}", e)))?;

    result.map_err(|e| DownloadFailure::Decode(e.to_string()))
}

fn classify_request_error(error: reqwest::Error) -> DownloadFailure {
    if error.is_timeout() {
        DownloadFailure::Network("request timed out".into())
    } else {
        DownloadFailure::Network(error.to_string())
    }
}

fn classify_status(status: reqwest::StatusCode) -> DownloadFailure {
    use reqwest::StatusCode;
    match status {
        StatusCode::TOO_MANY_REQUESTS => DownloadFailure::RateLimited,
        StatusCode::NOT_FOUND | StatusCode::GONE | StatusCode::FORBIDDEN => {
            DownloadFailure::Unavailable(format!("HTTP {}", status))
        }
        status => DownloadFailure::Network(format!("HTTP {}", status)),
    }
}

/// Backoff schedule: exponential for network errors, longer for throttling
fn backoff_for(failure: &DownloadFailure, attempt: u32) -> Duration {
    match failure {
        DownloadFailure::RateLimited => Duration::from_secs(5 * attempt as u64),
        _ => Duration::from_millis(500 * 2u64.pow(attempt.min(6))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playlist::TrackSource;

    fn write_wav(path: &Path, frames: usize) {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 44100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..frames {
            let value = ((i as f32 * 0.02).sin() * 10000.0) as i16;
            writer.write_sample(value).unwrap();
            writer.write_sample(value).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn local_track(id: &str, path: &Path) -> Track {
        Track {
            id: TrackId::from(id),
            title: format!("Track {}", id),
            source: TrackSource::LocalFile(path.to_path_buf()),
            duration_ms: None,
        }
    }

    async fn downloader(dir: &Path) -> (Arc<CacheStore>, Downloader) {
        let cache = Arc::new(CacheStore::open(dir).await.unwrap());
        let dl = Downloader::new(
            Arc::clone(&cache),
            EventBus::new(16),
            Duration::from_secs(5),
            3,
        );
        (cache, dl)
    }

    #[tokio::test]
    async fn test_local_file_registered_and_probed() {
        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("song.wav");
        write_wav(&audio, 44100);

        let (cache, dl) = downloader(dir.path()).await;
        let track = local_track("t1", &audio);

        let entry = dl.ensure_cached(&track).await.unwrap();
        assert_eq!(entry.path, audio);
        assert!((entry.metadata.duration_ms as i64 - 1000).abs() <= 1);

        // Second call hits the cache
        let again = dl.ensure_cached(&track).await.unwrap();
        assert_eq!(again.path, entry.path);
        assert!(cache.get(&track.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_missing_local_file_marked_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, dl) = downloader(dir.path()).await;
        let track = local_track("gone", &dir.path().join("missing.wav"));

        let err = dl.ensure_cached(&track).await.unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
        assert!(cache.is_unavailable(&track.id));

        // Marked tracks fail fast
        let err = dl.ensure_cached(&track).await.unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_undecodable_local_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let junk = dir.path().join("junk.wav");
        std::fs::write(&junk, b"this is not audio").unwrap();

        let (_cache, dl) = downloader(dir.path()).await;
        let err = dl.ensure_cached(&local_track("junk", &junk)).await.unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[tokio::test]
    async fn test_concurrent_calls_coalesce() {
        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("song.wav");
        write_wav(&audio, 22050);

        let (_cache, dl) = downloader(dir.path()).await;
        let dl = Arc::new(dl);
        let track = Arc::new(local_track("t1", &audio));

        let a = {
            let dl = Arc::clone(&dl);
            let track = Arc::clone(&track);
            tokio::spawn(async move { dl.ensure_cached(&track).await })
        };
        let b = {
            let dl = Arc::clone(&dl);
            let track = Arc::clone(&track);
            tokio::spawn(async move { dl.ensure_cached(&track).await })
        };

        let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        assert_eq!(a.path, b.path);
        assert_eq!(a.metadata, b.metadata);
    }

    #[test]
    fn test_status_classification() {
        use reqwest::StatusCode;
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            DownloadFailure::RateLimited
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND),
            DownloadFailure::Unavailable(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::GONE),
            DownloadFailure::Unavailable(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            DownloadFailure::Network(_)
        ));
    }

    #[test]
    fn test_backoff_schedule() {
        let network = DownloadFailure::Network("x".into());
        assert!(backoff_for(&network, 1) < backoff_for(&network, 2));
        assert!(backoff_for(&DownloadFailure::RateLimited, 1) >= Duration::from_secs(5));
    }

    #[test]
    fn test_staging_guard_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join("x.part");
        std::fs::write(&staged, b"partial").unwrap();

        drop(StagingGuard::new(staged.clone()));
        assert!(!staged.exists());
    }
}
