//! Playback scheduler
//!
//! Drives the output timeline. A render task pulls mixed blocks from the
//! crossfade mixer into the playout ring buffer; the audio device callback
//! drains the other end. Transport moves through
//! `Stopped → Loading → Playing ⇄ Paused → Stopped`.
//!
//! Buffer underruns while Playing become an internal stalled sub-state:
//! audible output pauses (silence), a diagnostic event goes out, and
//! playback resumes by itself once a clip is ready. The user-visible state
//! never flips to Paused.

use crate::playback::{CrossfadeMixer, PrebufferManager, ReadyQueue, Sequencer};
use crate::playback::mixer::MixEvent;
use crate::error::{Error, Result};
use crate::state::{CurrentClip, SharedState, StatusSnapshot};
use ringbuf::traits::{Observer, Producer};
use ringbuf::HeapProd;
use segue_common::{PlayerEvent, Settings, TransportState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::RwLock;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info};

/// Render tick period; at 44.1kHz one tick spans ~880 frames
const TICK: Duration = Duration::from_millis(20);

/// Progress events are emitted every this many ticks (~1s)
const PROGRESS_EVERY_TICKS: u32 = 50;

/// Playback scheduler
pub struct PlaybackScheduler {
    state: Arc<SharedState>,
    settings: Arc<RwLock<Settings>>,
    queue: Arc<ReadyQueue>,
    prebuffer: Arc<PrebufferManager>,
    sequencer: Arc<Mutex<Sequencer>>,
    mixer: tokio::sync::Mutex<CrossfadeMixer>,
    running: AtomicBool,
    stall_started: Mutex<Option<Instant>>,
}

impl PlaybackScheduler {
    pub fn new(
        state: Arc<SharedState>,
        settings: Arc<RwLock<Settings>>,
        queue: Arc<ReadyQueue>,
        prebuffer: Arc<PrebufferManager>,
        sequencer: Arc<Mutex<Sequencer>>,
        channels: u16,
    ) -> Self {
        Self {
            state,
            settings,
            queue,
            prebuffer,
            sequencer,
            mixer: tokio::sync::Mutex::new(CrossfadeMixer::new(channels)),
            running: AtomicBool::new(false),
            stall_started: Mutex::new(None),
        }
    }

    /// Start or resume playback
    pub async fn play(&self) -> Result<()> {
        match self.state.transport().await {
            TransportState::Stopped => {
                info!("Play: starting session");
                self.prebuffer.set_suspended(false);
                self.state.set_transport(TransportState::Loading).await;
            }
            TransportState::Paused => {
                info!("Play: resuming");
                self.state.set_transport(TransportState::Playing).await;
            }
            TransportState::Loading | TransportState::Playing => {}
        }
        Ok(())
    }

    /// Pause audible output; preparation keeps running
    pub async fn pause(&self) -> Result<()> {
        match self.state.transport().await {
            TransportState::Playing | TransportState::Loading => {
                info!("Pause");
                self.state.set_transport(TransportState::Paused).await;
                Ok(())
            }
            state => Err(Error::InvalidState(format!("cannot pause while {}", state))),
        }
    }

    /// Stop playback, cancel outstanding preparation, drop prepared clips
    pub async fn stop(&self) {
        info!("Stop");
        self.prebuffer.set_suspended(true);
        self.prebuffer.flush();

        let events = {
            let mut mixer = self.mixer.lock().await;
            mixer.clear(&self.queue)
        };
        self.apply_mix_events(events).await;

        self.state.set_transport(TransportState::Stopped).await;
        self.state.set_current_clip(None).await;
        self.state.leave_stall();
    }

    /// Skip to the next clip
    ///
    /// Drops the active clip. If nothing is ready yet, the in-flight
    /// preparation at the front of the pipeline is superseded and
    /// cancelled, so a stuck download cannot pin the skip.
    pub async fn skip_next(&self) {
        debug!("Skip next");
        let events = {
            let mut mixer = self.mixer.lock().await;
            mixer.drop_active(&self.queue)
        };
        self.apply_mix_events(events).await;

        if !self.queue.front_available() {
            self.prebuffer.cancel_front();
        }
    }

    /// Skip back to the previously played track
    ///
    /// Unwinds the prefetched lookahead: in-flight work is cancelled, the
    /// ready queue flushed, and the sequencer rewound before the fill gate
    /// reopens.
    pub async fn skip_back(&self) {
        debug!("Skip back");

        let (current, events) = {
            let mut mixer = self.mixer.lock().await;
            let current = mixer.active_info().map(|(track_id, ..)| track_id);
            let events = mixer.clear(&self.queue);
            (current, events)
        };

        self.prebuffer.set_suspended(true);
        self.prebuffer.flush();
        if let Some(track_id) = current {
            self.sequencer.lock().unwrap().rewind_for_back(&track_id);
        }
        if self.state.transport().await != TransportState::Stopped {
            self.prebuffer.set_suspended(false);
        }

        self.apply_mix_events(events).await;
    }

    /// Seek within the active clip, clamped to its bounds
    pub async fn seek(&self, position_secs: f64) -> Result<()> {
        if position_secs < 0.0 || !position_secs.is_finite() {
            return Err(Error::InvalidState("seek position must be non-negative".into()));
        }

        let mut mixer = self.mixer.lock().await;
        match mixer.active_info() {
            Some((_, _, _, _, sample_rate)) => {
                let frame = (position_secs * sample_rate as f64) as usize;
                mixer.seek_to(frame);
                Ok(())
            }
            None => Err(Error::InvalidState("nothing is playing".into())),
        }
    }

    /// Read-only snapshot for the control surface
    pub async fn status(&self) -> StatusSnapshot {
        let current = {
            let mixer = self.mixer.lock().await;
            mixer.active_info().map(
                |(track_id, title, cursor, frames, sample_rate)| CurrentClip {
                    track_id: track_id.to_string(),
                    title,
                    position_ms: cursor as u64 * 1000 / sample_rate as u64,
                    clip_duration_ms: frames as u64 * 1000 / sample_rate as u64,
                },
            )
        };

        StatusSnapshot {
            transport: self.state.transport().await,
            current,
            elapsed_ms: self.state.elapsed_ms(),
            stalled: self.state.is_stalled(),
            starved: self.prebuffer.is_starved(),
            exhausted: self.prebuffer.is_exhausted(),
            ready_seconds: self.queue.ready_seconds(),
            ready_clips: self.queue.ready_clips(),
            volume: self.state.volume(),
            stall_count: self.state.stall_count(),
        }
    }

    /// Stop the render loop
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Render task: mixer → playout ring buffer
    ///
    /// Anything other than steady Playing writes silence, so the device
    /// stream stays continuous through pause, stall, and stop.
    pub async fn render_loop(self: Arc<Self>, mut producer: HeapProd<f32>) {
        self.running.store(true, Ordering::Relaxed);

        let (sample_rate, channels) = {
            let settings = self.settings.read().await;
            (settings.sample_rate, settings.channels as usize)
        };

        let capacity = producer.capacity().get();
        let mut scratch = vec![0.0f32; capacity];
        let silence = vec![0.0f32; capacity];
        let mut ticks: u32 = 0;

        let mut tick = interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Render loop started ({} Hz, {} ch)", sample_rate, channels);

        while self.running.load(Ordering::Relaxed) {
            tick.tick().await;
            ticks = ticks.wrapping_add(1);

            let transport = self.state.transport().await;

            match transport {
                TransportState::Stopped | TransportState::Paused => {
                    push_silence(&mut producer, &silence);
                    continue;
                }
                TransportState::Loading => {
                    if self.queue.front_available() {
                        info!("Initial fill complete, playback starting");
                        self.state.set_transport(TransportState::Playing).await;
                    } else {
                        if self.prebuffer.is_exhausted() && self.queue.ready_clips() == 0 {
                            // Nothing will ever arrive
                            self.state.set_transport(TransportState::Stopped).await;
                        }
                        push_silence(&mut producer, &silence);
                        continue;
                    }
                }
                TransportState::Playing => {}
            }

            let space = producer.vacant_len();
            let space_frames = space / channels;
            if space_frames == 0 {
                continue;
            }

            let (frames, events) = {
                let mut mixer = self.mixer.lock().await;
                mixer.next_block(&mut scratch[..space_frames * channels], &self.queue)
            };
            self.apply_mix_events(events).await;

            if frames > 0 {
                producer.push_slice(&scratch[..frames * channels]);
                self.state
                    .add_elapsed_ms(frames as u64 * 1000 / sample_rate as u64);

                if self.state.leave_stall() {
                    let stalled_ms = self
                        .stall_started
                        .lock()
                        .unwrap()
                        .take()
                        .map(|t| t.elapsed().as_millis() as u64)
                        .unwrap_or(0);
                    info!("Buffer recovered after {} ms stall", stalled_ms);
                    self.state.events().emit(PlayerEvent::BufferRecovered {
                        stalled_ms,
                        timestamp: chrono::Utc::now(),
                    });
                }
            } else {
                let mixer_idle = {
                    let mixer = self.mixer.lock().await;
                    !mixer.has_active()
                };

                if mixer_idle && self.prebuffer.is_exhausted() && self.queue.ready_clips() == 0 {
                    // End of playlist under no-repeat: finish cleanly
                    info!("Playback complete");
                    self.state.set_transport(TransportState::Stopped).await;
                    self.state.set_current_clip(None).await;
                } else if self.state.enter_stall() {
                    // Recoverable underrun, not an error and not Paused
                    *self.stall_started.lock().unwrap() = Some(Instant::now());
                    self.state.events().emit(PlayerEvent::BufferStalled {
                        ready_seconds: self.queue.ready_seconds(),
                        timestamp: chrono::Utc::now(),
                    });
                }
                push_silence(&mut producer, &silence);
            }

            if ticks % PROGRESS_EVERY_TICKS == 0 {
                self.publish_progress().await;
            }
        }

        debug!("Render loop stopped");
    }

    /// Push mixer boundary events out as player events
    async fn apply_mix_events(&self, events: Vec<MixEvent>) {
        for event in events {
            match event {
                MixEvent::Started {
                    track_id,
                    title,
                    clip_duration_ms,
                } => {
                    debug!("Now playing: {} ({})", title, track_id);
                    self.state
                        .set_current_clip(Some(CurrentClip {
                            track_id: track_id.to_string(),
                            title: title.clone(),
                            position_ms: 0,
                            clip_duration_ms,
                        }))
                        .await;
                    self.state.events().emit(PlayerEvent::TrackStarted {
                        track_id: track_id.to_string(),
                        title,
                        clip_duration_ms,
                        timestamp: chrono::Utc::now(),
                    });
                }
                MixEvent::Finished {
                    track_id,
                    completed,
                } => {
                    self.state.events().emit(PlayerEvent::TrackCompleted {
                        track_id: track_id.to_string(),
                        completed,
                        timestamp: chrono::Utc::now(),
                    });
                }
            }
        }
    }

    /// Refresh the shared position snapshot and emit a progress event
    async fn publish_progress(&self) {
        let info = {
            let mixer = self.mixer.lock().await;
            mixer.active_info()
        };

        if let Some((track_id, title, cursor, frames, sample_rate)) = info {
            let current = CurrentClip {
                track_id: track_id.to_string(),
                title,
                position_ms: cursor as u64 * 1000 / sample_rate as u64,
                clip_duration_ms: frames as u64 * 1000 / sample_rate as u64,
            };
            self.state.events().emit(PlayerEvent::PlaybackProgress {
                track_id: current.track_id.clone(),
                position_ms: current.position_ms,
                clip_duration_ms: current.clip_duration_ms,
                elapsed_ms: self.state.elapsed_ms(),
                timestamp: chrono::Utc::now(),
            });
            self.state.set_current_clip(Some(current)).await;
        }
    }
}

/// Top the ring buffer up with silence
fn push_silence(producer: &mut HeapProd<f32>, silence: &[f32]) {
    let space = producer.vacant_len().min(silence.len());
    if space > 0 {
        producer.push_slice(&silence[..space]);
    }
}
