//! Shared playback state
//!
//! Thread-safe state shared between the scheduler, the prebuffer manager,
//! and the control surface. Mutation happens inside the pipeline; everything
//! else reads immutable snapshots, so there is no global mutable
//! "now playing" to race on.

use segue_common::{EventBus, PlayerEvent, TransportState};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

/// Currently audible clip
#[derive(Debug, Clone, Serialize)]
pub struct CurrentClip {
    pub track_id: String,
    pub title: String,
    pub position_ms: u64,
    pub clip_duration_ms: u64,
}

/// Read-only snapshot served to the control surface
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub transport: TransportState,
    pub current: Option<CurrentClip>,
    /// Total audible time this session, in milliseconds
    pub elapsed_ms: u64,
    pub stalled: bool,
    pub starved: bool,
    pub exhausted: bool,
    /// Prepared lookahead waiting in the ready queue
    pub ready_seconds: f64,
    pub ready_clips: usize,
    pub volume: f32,
    /// Times the cursor caught up with prepared audio
    pub stall_count: u64,
}

/// Shared state accessible by all components
pub struct SharedState {
    /// Current transport state
    transport: RwLock<TransportState>,

    /// Currently audible clip (None when nothing is active)
    current: RwLock<Option<CurrentClip>>,

    /// Master volume (0.0-1.0); plain mutex because the audio callback
    /// reads it
    volume: Arc<Mutex<f32>>,

    /// Event broadcaster
    events: EventBus,

    /// Internal stalled sub-state (only meaningful while Playing)
    stalled: AtomicBool,

    /// Total audible milliseconds this session
    elapsed_ms: AtomicU64,

    /// Stall occurrences this session
    stall_count: AtomicU64,
}

impl SharedState {
    pub fn new(events: EventBus) -> Self {
        Self {
            transport: RwLock::new(TransportState::Stopped),
            current: RwLock::new(None),
            volume: Arc::new(Mutex::new(1.0)),
            events,
            stalled: AtomicBool::new(false),
            elapsed_ms: AtomicU64::new(0),
            stall_count: AtomicU64::new(0),
        }
    }

    /// Event bus handle
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Subscribe to the event stream (SSE)
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    pub async fn transport(&self) -> TransportState {
        *self.transport.read().await
    }

    /// Set transport state, emitting a TransportChanged event on change
    pub async fn set_transport(&self, new_state: TransportState) {
        let old_state = {
            let mut transport = self.transport.write().await;
            let old = *transport;
            *transport = new_state;
            old
        };

        if old_state != new_state {
            self.events.emit(PlayerEvent::TransportChanged {
                old_state,
                new_state,
                timestamp: chrono::Utc::now(),
            });
        }
    }

    pub async fn current_clip(&self) -> Option<CurrentClip> {
        self.current.read().await.clone()
    }

    pub async fn set_current_clip(&self, clip: Option<CurrentClip>) {
        *self.current.write().await = clip;
    }

    /// Shared volume Arc, handed to the audio output callback
    pub fn volume_arc(&self) -> Arc<Mutex<f32>> {
        Arc::clone(&self.volume)
    }

    pub fn volume(&self) -> f32 {
        *self.volume.lock().unwrap()
    }

    pub fn set_volume(&self, volume: f32) {
        let clamped = volume.clamp(0.0, 1.0);
        *self.volume.lock().unwrap() = clamped;
        self.events.emit(PlayerEvent::VolumeChanged {
            volume: clamped,
            timestamp: chrono::Utc::now(),
        });
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::Relaxed)
    }

    /// Enter the stalled sub-state; returns false if already stalled
    pub fn enter_stall(&self) -> bool {
        let was = self.stalled.swap(true, Ordering::Relaxed);
        if !was {
            self.stall_count.fetch_add(1, Ordering::Relaxed);
        }
        !was
    }

    /// Leave the stalled sub-state; returns true if a stall was active
    pub fn leave_stall(&self) -> bool {
        self.stalled.swap(false, Ordering::Relaxed)
    }

    pub fn stall_count(&self) -> u64 {
        self.stall_count.load(Ordering::Relaxed)
    }

    pub fn add_elapsed_ms(&self, ms: u64) {
        self.elapsed_ms.fetch_add(ms, Ordering::Relaxed);
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use segue_common::EventBus;

    #[tokio::test]
    async fn test_transport_emits_on_change() {
        let state = SharedState::new(EventBus::new(16));
        let mut rx = state.subscribe_events();

        state.set_transport(TransportState::Playing).await;
        assert_eq!(state.transport().await, TransportState::Playing);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.type_str(), "TransportChanged");
    }

    #[tokio::test]
    async fn test_transport_no_emit_without_change() {
        let state = SharedState::new(EventBus::new(16));
        let mut rx = state.subscribe_events();

        state.set_transport(TransportState::Stopped).await; // already Stopped
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_volume_clamped() {
        let state = SharedState::new(EventBus::new(16));
        state.set_volume(1.5);
        assert_eq!(state.volume(), 1.0);
        state.set_volume(-0.2);
        assert_eq!(state.volume(), 0.0);
    }

    #[test]
    fn test_stall_transitions_count_once() {
        let state = SharedState::new(EventBus::new(16));

        assert!(state.enter_stall());
        assert!(!state.enter_stall()); // already stalled
        assert_eq!(state.stall_count(), 1);

        assert!(state.leave_stall());
        assert!(!state.leave_stall());

        assert!(state.enter_stall());
        assert_eq!(state.stall_count(), 2);
    }

    #[tokio::test]
    async fn test_current_clip_round_trip() {
        let state = SharedState::new(EventBus::new(16));
        assert!(state.current_clip().await.is_none());

        state
            .set_current_clip(Some(CurrentClip {
                track_id: "t1".into(),
                title: "Title".into(),
                position_ms: 1500,
                clip_duration_ms: 30000,
            }))
            .await;

        let clip = state.current_clip().await.unwrap();
        assert_eq!(clip.track_id, "t1");
        assert_eq!(clip.position_ms, 1500);
    }
}
