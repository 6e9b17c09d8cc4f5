//! Prebuffer manager
//!
//! Orchestrates background preparation of upcoming clips: asks the
//! sequencer for the next track, drives download → clip selection → clip
//! processing on a bounded worker pool, and publishes finished clips into
//! the ready queue in sequencer order.
//!
//! The fill loop enforces the buffering contract both ways: while prepared
//! plus in-flight audio sits below the prebuffer threshold it schedules more
//! work; at or above it suspends until the scheduler consumes
//! (backpressure). A failed preparation never blocks the queue: the slot
//! is skipped and the loop moves straight to the next track. Only when a
//! bounded run of consecutive failures shows that nothing in the playlist
//! can be prepared does it raise starvation, exactly once per fill
//! generation.

use crate::audio::AudioSource;
use crate::clip::{ClipProcessor, ClipSelector};
use crate::download::Downloader;
use crate::error::{Error, Result};
use crate::playback::{ReadyQueue, Sequencer};
use crate::playlist::Track;
use segue_common::{EventBus, PlayerEvent, Settings};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Floor for the starvation threshold, so tiny playlists still get a few
/// attempts before the pipeline gives up
const MIN_STARVATION_ATTEMPTS: u32 = 3;

/// An outstanding preparation task
struct InFlightPrep {
    abort: AbortHandle,
    /// Rough duration estimate, counted toward the threshold so the loop
    /// does not over-schedule while work is still in flight
    est_secs: f64,
}

/// Background clip preparation orchestrator
pub struct PrebufferManager {
    settings: Arc<RwLock<Settings>>,
    sequencer: Arc<Mutex<Sequencer>>,
    downloader: Arc<Downloader>,
    queue: Arc<ReadyQueue>,
    events: EventBus,
    processor: Arc<ClipProcessor>,
    selector: Mutex<ClipSelector>,

    /// Fill generation; bumped by flush so aborted stragglers cannot touch
    /// the queue
    generation: AtomicU64,
    in_flight: Mutex<BTreeMap<u64, InFlightPrep>>,

    consecutive_failures: AtomicU32,
    starved: AtomicBool,
    exhausted: AtomicBool,
    running: AtomicBool,
    /// Fill gate; the scheduler closes it while stopped and around
    /// skip-back resequencing
    suspended: AtomicBool,

    /// Wakes the fill loop (consumption, skip, flush, config change)
    wake: Notify,

    playlist_len: usize,
}

impl PrebufferManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Arc<RwLock<Settings>>,
        sequencer: Arc<Mutex<Sequencer>>,
        downloader: Arc<Downloader>,
        queue: Arc<ReadyQueue>,
        events: EventBus,
        processor: ClipProcessor,
        selector: ClipSelector,
        playlist_len: usize,
    ) -> Self {
        Self {
            settings,
            sequencer,
            downloader,
            queue,
            events,
            processor: Arc::new(processor),
            selector: Mutex::new(selector),
            generation: AtomicU64::new(0),
            in_flight: Mutex::new(BTreeMap::new()),
            consecutive_failures: AtomicU32::new(0),
            starved: AtomicBool::new(false),
            exhausted: AtomicBool::new(false),
            running: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            wake: Notify::new(),
            playlist_len,
        }
    }

    pub fn is_starved(&self) -> bool {
        self.starved.load(Ordering::Relaxed)
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Relaxed)
    }

    /// Wake the fill loop to re-evaluate (e.g. after a settings change)
    pub fn wake(&self) {
        self.wake.notify_waiters();
    }

    /// Open or close the fill gate
    ///
    /// Closed while stopped, and momentarily around skip-back so the
    /// sequencer can be rewound without racing a fresh spawn.
    pub fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::Relaxed);
        self.wake.notify_waiters();
    }

    /// Run the fill loop until shutdown
    pub async fn run(self: Arc<Self>) {
        self.running.store(true, Ordering::Relaxed);
        info!("Prebuffer manager started");

        while self.running.load(Ordering::Relaxed) {
            if self.is_starved() || self.suspended.load(Ordering::Relaxed) {
                // Starvation requires intervention (skip, flush, reload);
                // suspension lifts when the scheduler reopens the gate.
                // The timeout covers a notification racing past the check.
                tokio::select! {
                    _ = self.wake.notified() => {}
                    _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                }
                continue;
            }

            let (threshold_secs, max_workers) = {
                let settings = self.settings.read().await;
                (settings.prebuffer_secs, settings.max_workers)
            };

            let ready_secs = self.queue.ready_seconds();
            let (filling, in_flight_secs) = {
                let in_flight = self.in_flight.lock().unwrap();
                (
                    in_flight.len(),
                    in_flight.values().map(|p| p.est_secs).sum::<f64>(),
                )
            };

            let saturated = ready_secs + in_flight_secs >= threshold_secs
                || filling >= max_workers
                || self.is_exhausted();

            if saturated {
                // Backpressure: hold until the consumer frees capacity.
                // The timeout re-polls in case a notification raced past.
                tokio::select! {
                    _ = self.queue.wait_space() => {}
                    _ = self.wake.notified() => {}
                    _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                }
                continue;
            }

            let next = self.sequencer.lock().unwrap().next();
            let Some(track) = next else {
                if !self.exhausted.swap(true, Ordering::Relaxed) {
                    info!("Playlist exhausted (no-repeat)");
                    self.events.emit(PlayerEvent::PlaylistExhausted {
                        timestamp: chrono::Utc::now(),
                    });
                }
                continue;
            };

            Arc::clone(&self).spawn_preparation(track).await;
        }

        debug!("Prebuffer fill loop stopped");
    }

    /// Spawn one preparation task and register its slot
    async fn spawn_preparation(self: Arc<Self>, track: Arc<Track>) {
        let generation = self.generation.load(Ordering::Relaxed);
        let seq = self.queue.allocate_seq(track.id.as_str(), &track.title);

        let est_secs = {
            let settings = self.settings.read().await;
            match settings.clip_length() {
                Some(length) => length.as_secs_f64(),
                None => track
                    .duration()
                    .map(|d| d.as_secs_f64())
                    .unwrap_or(180.0),
            }
        };

        debug!("Slot {} filling with track {}", seq, track.id);

        // Register the slot while holding the lock, so a task that finishes
        // instantly blocks in complete() until its entry exists
        let mut in_flight = self.in_flight.lock().unwrap();

        let manager = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let result = manager.prepare_one(&track).await;
            manager.complete(generation, seq, &track, result);
        });

        in_flight.insert(
            seq,
            InFlightPrep {
                abort: handle.abort_handle(),
                est_secs,
            },
        );
    }

    /// Download → select → process for one track
    async fn prepare_one(&self, track: &Arc<Track>) -> Result<crate::clip::PreparedClip> {
        let entry = self.downloader.ensure_cached(track).await?;

        let settings = self.settings.read().await.clone();
        let spec = {
            let mut selector = self.selector.lock().unwrap();
            selector.select(&track.id, entry.metadata.duration(), &settings)
        };

        let processor = Arc::clone(&self.processor);
        let source = AudioSource::LocalFile(entry.path.clone());
        let title = track.title.clone();
        let gain = settings.gain_factor();

        // Decode is CPU-bound; keep it off the async workers
        tokio::task::spawn_blocking(move || processor.prepare(&source, &spec, &title, gain))
            .await
            .map_err(|e| Error::Internal(format!("prepare task failed: {}", e)))?
    }

    /// Handle a finished preparation task
    fn complete(
        &self,
        generation: u64,
        seq: u64,
        track: &Arc<Track>,
        result: Result<crate::clip::PreparedClip>,
    ) {
        self.in_flight.lock().unwrap().remove(&seq);

        if self.generation.load(Ordering::Relaxed) != generation {
            // Flushed while we ran; the queue already stepped past this seq
            debug!("Dropping stale preparation for {} (seq {})", track.id, seq);
            return;
        }

        match result {
            Ok(clip) => {
                debug!(
                    "Slot {} ready: {} ({:.1}s prepared)",
                    seq,
                    track.id,
                    clip.duration().as_secs_f64()
                );
                self.queue.insert(seq, clip);
                self.consecutive_failures.store(0, Ordering::Relaxed);
            }
            Err(error) => {
                warn!("Preparation of {} failed: {}", track.id, error);
                self.queue.mark_skipped(seq);
                self.events.emit(PlayerEvent::TrackSkipped {
                    track_id: track.id.to_string(),
                    reason: error.to_string(),
                    timestamp: chrono::Utc::now(),
                });

                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                let threshold = (self.playlist_len as u32).max(MIN_STARVATION_ATTEMPTS);
                if failures >= threshold && !self.starved.swap(true, Ordering::Relaxed) {
                    warn!(
                        "Pipeline starved: {} consecutive preparation failures",
                        failures
                    );
                    self.events.emit(PlayerEvent::PipelineStarved {
                        consecutive_failures: failures,
                        timestamp: chrono::Utc::now(),
                    });
                }
            }
        }

        self.wake.notify_waiters();
    }

    /// Abort the earliest outstanding preparation (superseded by a skip)
    ///
    /// The aborted slot is marked skipped so the release gate steps over
    /// it; the rest of the queue is untouched. Clears starvation, since a skip
    /// is exactly the intervention it waits for.
    pub fn cancel_front(&self) {
        let front = {
            let mut in_flight = self.in_flight.lock().unwrap();
            in_flight.pop_first()
        };

        if let Some((seq, prep)) = front {
            debug!("Cancelling in-flight preparation for slot {}", seq);
            prep.abort.abort();
            self.queue.mark_skipped(seq);
        }

        self.clear_starvation();
        self.wake.notify_waiters();
    }

    /// Abort everything and clear the ready queue
    ///
    /// Used by skip-back and stop. Bumps the fill generation so stragglers
    /// that outran the abort cannot publish stale clips.
    pub fn flush(&self) {
        self.generation.fetch_add(1, Ordering::Relaxed);

        let drained: Vec<(u64, InFlightPrep)> = {
            let mut in_flight = self.in_flight.lock().unwrap();
            std::mem::take(&mut *in_flight).into_iter().collect()
        };
        for (seq, prep) in &drained {
            debug!("Aborting in-flight preparation for slot {}", seq);
            prep.abort.abort();
        }

        self.queue.clear();
        self.exhausted.store(false, Ordering::Relaxed);
        self.clear_starvation();
        self.wake.notify_waiters();
    }

    fn clear_starvation(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.starved.store(false, Ordering::Relaxed);
    }

    /// Stop the fill loop and abandon outstanding work
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.flush();
    }
}
