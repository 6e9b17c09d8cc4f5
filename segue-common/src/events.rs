//! Event system for the Segue pipeline
//!
//! The pipeline uses hybrid communication:
//! - **EventBus** (tokio::broadcast): one-to-many event broadcasting
//! - **Shared state** (Arc<RwLock<T>>): read-heavy snapshot access
//!
//! Events cross the boundary to the control surface (SSE) and therefore
//! serialize; track identifiers are carried as plain strings.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Transport state of the playback scheduler
///
/// `Stopped → Loading → Playing ⇄ Paused → Stopped`. Buffer stalls are an
/// internal sub-state of `Playing` and are reported through
/// [`PlayerEvent::BufferStalled`], never as `Paused`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Stopped,
    Loading,
    Playing,
    Paused,
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportState::Stopped => write!(f, "stopped"),
            TransportState::Loading => write!(f, "loading"),
            TransportState::Playing => write!(f, "playing"),
            TransportState::Paused => write!(f, "paused"),
        }
    }
}

/// Segue event types
///
/// Broadcast via [`EventBus`] and serialized for SSE transmission. All
/// components publish through the same bus; subscribers filter by variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PlayerEvent {
    /// Transport state changed (play/pause/stop/loading transitions)
    TransportChanged {
        old_state: TransportState,
        new_state: TransportState,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A clip began audible playback
    TrackStarted {
        track_id: String,
        title: String,
        /// Clip duration in milliseconds (not the full track duration)
        clip_duration_ms: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A clip finished or was skipped out of the active slot
    TrackCompleted {
        track_id: String,
        /// false if the clip was cut short by skip/stop
        completed: bool,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Periodic position report for the active clip
    PlaybackProgress {
        track_id: String,
        position_ms: u64,
        clip_duration_ms: u64,
        /// Total audible time across the session, in milliseconds
        elapsed_ms: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Download progress for a track being fetched into the cache
    DownloadProgress {
        track_id: String,
        /// 0-100; None when the source reports no content length
        percent: Option<u8>,
        bytes: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Preparation of a track failed and the pipeline moved on
    TrackSkipped {
        track_id: String,
        reason: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A track was marked permanently unavailable
    TrackUnavailable {
        track_id: String,
        reason: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The playback cursor caught up with prepared audio (diagnostic)
    BufferStalled {
        ready_seconds: f64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Playback resumed after a stall (diagnostic)
    BufferRecovered {
        stalled_ms: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// No track in the remaining playlist could be prepared
    ///
    /// Raised at most once per fill generation; requires intervention
    /// (skip, reload, or configuration change).
    PipelineStarved {
        consecutive_failures: u32,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Every track has played once under a no-repeat policy
    PlaylistExhausted {
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Master volume changed
    VolumeChanged {
        volume: f32,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl PlayerEvent {
    /// Event type string, used as the SSE `event:` field
    pub fn type_str(&self) -> &'static str {
        match self {
            PlayerEvent::TransportChanged { .. } => "TransportChanged",
            PlayerEvent::TrackStarted { .. } => "TrackStarted",
            PlayerEvent::TrackCompleted { .. } => "TrackCompleted",
            PlayerEvent::PlaybackProgress { .. } => "PlaybackProgress",
            PlayerEvent::DownloadProgress { .. } => "DownloadProgress",
            PlayerEvent::TrackSkipped { .. } => "TrackSkipped",
            PlayerEvent::TrackUnavailable { .. } => "TrackUnavailable",
            PlayerEvent::BufferStalled { .. } => "BufferStalled",
            PlayerEvent::BufferRecovered { .. } => "BufferRecovered",
            PlayerEvent::PipelineStarved { .. } => "PipelineStarved",
            PlayerEvent::PlaylistExhausted { .. } => "PlaylistExhausted",
            PlayerEvent::VolumeChanged { .. } => "VolumeChanged",
        }
    }
}

/// One-to-many event broadcaster
///
/// Thin wrapper over `tokio::sync::broadcast` so emitters do not have to
/// care whether anyone is listening.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PlayerEvent>,
    capacity: usize,
}

impl EventBus {
    /// Create a new bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring the no-subscriber case
    ///
    /// Playback must not fail because nothing is watching it.
    pub fn emit(&self, event: PlayerEvent) {
        let _ = self.tx.send(event);
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eventbus_new() {
        let bus = EventBus::new(100);
        assert_eq!(bus.capacity(), 100);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new(16);
        bus.emit(PlayerEvent::PlaylistExhausted {
            timestamp: chrono::Utc::now(),
        });
    }

    #[tokio::test]
    async fn test_emit_with_subscriber() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(PlayerEvent::TransportChanged {
            old_state: TransportState::Stopped,
            new_state: TransportState::Playing,
            timestamp: chrono::Utc::now(),
        });

        let received = rx.recv().await.unwrap();
        match received {
            PlayerEvent::TransportChanged {
                old_state,
                new_state,
                ..
            } => {
                assert_eq!(old_state, TransportState::Stopped);
                assert_eq!(new_state, TransportState::Playing);
            }
            other => panic!("wrong event: {:?}", other),
        }
    }

    #[test]
    fn test_event_serialization_tags_type() {
        let event = PlayerEvent::TrackSkipped {
            track_id: "abc123".into(),
            reason: "network error".into(),
            timestamp: chrono::Utc::now(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"TrackSkipped\""));
        assert!(json.contains("abc123"));

        let back: PlayerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.type_str(), "TrackSkipped");
    }

    #[test]
    fn test_transport_state_display() {
        assert_eq!(TransportState::Playing.to_string(), "playing");
        assert_eq!(TransportState::Stopped.to_string(), "stopped");
    }
}
