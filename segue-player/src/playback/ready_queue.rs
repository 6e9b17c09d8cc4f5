//! Ready queue: the hand-off point between preparation and playback
//!
//! The only structure shared between the background workers and the
//! real-time consumer. Workers finish out of order; sequence numbers
//! allocated at spawn time gate release so the consumer always sees clips
//! in sequencer order. A failed preparation marks its sequence skipped and
//! the gate steps over it.
//!
//! Each sequence number doubles as a pipeline slot, tracked through
//! `Idle → Filling → Ready → Draining → Idle` (Idle at both ends means the
//! slot record does not exist).

use crate::clip::PreparedClip;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use tokio::sync::Notify;

/// Observable state of a pipeline slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    /// Preparation task running (download/decode/process)
    Filling,
    /// Prepared clip waiting in the queue
    Ready,
    /// Clip handed to the scheduler and being output
    Draining,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotInfo {
    pub seq: u64,
    pub track_id: String,
    pub title: String,
    pub state: SlotState,
}

#[derive(Default)]
struct Inner {
    /// Next sequence number to allocate to a producer
    next_seq: u64,
    /// Sequence number the consumer receives next
    next_emit: u64,
    /// Completed clips not yet consumed, keyed by sequence
    pending: BTreeMap<u64, PreparedClip>,
    /// Failed sequences the release gate steps over
    skipped: BTreeSet<u64>,
    /// Slot lifecycle records for diagnostics
    slots: BTreeMap<u64, SlotInfo>,
}

/// Ordered queue of prepared clips
pub struct ReadyQueue {
    inner: Mutex<Inner>,
    /// Signalled when the front of the queue may have become available
    ready: Notify,
    /// Signalled when the consumer popped (capacity freed)
    space: Notify,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            ready: Notify::new(),
            space: Notify::new(),
        }
    }

    /// Allocate the next sequence number and open its slot as Filling
    pub fn allocate_seq(&self, track_id: &str, title: &str) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.slots.insert(
            seq,
            SlotInfo {
                seq,
                track_id: track_id.to_string(),
                title: title.to_string(),
                state: SlotState::Filling,
            },
        );
        seq
    }

    /// Publish a completed clip under its sequence number
    ///
    /// Sequences already behind the emit cursor (a `clear` happened while
    /// the producer ran) are dropped silently.
    pub fn insert(&self, seq: u64, clip: PreparedClip) {
        let mut inner = self.inner.lock().unwrap();
        if seq < inner.next_emit {
            return;
        }
        if let Some(slot) = inner.slots.get_mut(&seq) {
            slot.state = SlotState::Ready;
        }
        inner.pending.insert(seq, clip);
        drop(inner);
        self.ready.notify_waiters();
    }

    /// Mark a sequence as failed; the release gate steps over it
    pub fn mark_skipped(&self, seq: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.slots.remove(&seq);
        inner.pending.remove(&seq);
        inner.skipped.insert(seq);
        drop(inner);
        // The front may have just become available behind the skip
        self.ready.notify_waiters();
    }

    /// Take the next clip in order, if it is ready
    ///
    /// Returns the clip with its sequence number; callers report the clip
    /// drained via [`ReadyQueue::finish`] once it has been fully output.
    pub fn pop_front(&self) -> Option<(u64, PreparedClip)> {
        let mut inner = self.inner.lock().unwrap();

        loop {
            let emit = inner.next_emit;
            if inner.skipped.remove(&emit) {
                inner.next_emit += 1;
                continue;
            }
            break;
        }

        let emit = inner.next_emit;
        let clip = inner.pending.remove(&emit)?;
        inner.next_emit += 1;
        if let Some(slot) = inner.slots.get_mut(&emit) {
            slot.state = SlotState::Draining;
        }
        drop(inner);
        self.space.notify_waiters();
        Some((emit, clip))
    }

    /// Close a slot once its clip has been fully consumed or discarded
    pub fn finish(&self, seq: u64) {
        self.inner.lock().unwrap().slots.remove(&seq);
    }

    /// Whether the in-order front is ready to pop
    pub fn front_available(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        loop {
            let emit = inner.next_emit;
            if inner.skipped.remove(&emit) {
                inner.next_emit += 1;
                continue;
            }
            break;
        }
        let emit = inner.next_emit;
        inner.pending.contains_key(&emit)
    }

    /// Total prepared audio waiting in the queue, in seconds
    ///
    /// Counts all completed clips, including ones still gated behind an
    /// in-flight predecessor; they are prepared lookahead either way.
    pub fn ready_seconds(&self) -> f64 {
        let inner = self.inner.lock().unwrap();
        inner
            .pending
            .values()
            .map(|clip| clip.duration().as_secs_f64())
            .sum()
    }

    /// Number of completed clips waiting
    pub fn ready_clips(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    /// Discard everything: pending clips, skip marks, slot records
    ///
    /// Sequence allocation continues from where it was; outstanding
    /// producers from before the clear hold sequences below the new emit
    /// point and can never be released.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.clear();
        inner.skipped.clear();
        inner.slots.clear();
        inner.next_emit = inner.next_seq;
        drop(inner);
        self.space.notify_waiters();
    }

    /// Snapshot of live slots in sequence order
    pub fn slots_snapshot(&self) -> Vec<SlotInfo> {
        self.inner.lock().unwrap().slots.values().cloned().collect()
    }

    /// Wait until the front may have changed
    pub async fn wait_ready(&self) {
        self.ready.notified().await;
    }

    /// Wait until the consumer frees capacity
    pub async fn wait_space(&self) {
        self.space.notified().await;
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::ClipSpec;
    use crate::playlist::TrackId;
    use segue_common::FadeCurve;
    use std::time::Duration;
    use uuid::Uuid;

    fn clip(track: &str, secs: f64) -> PreparedClip {
        let sample_rate = 1000; // small synthetic rate keeps buffers tiny
        let frames = (secs * sample_rate as f64) as usize;
        PreparedClip {
            clip_id: Uuid::new_v4(),
            track_id: TrackId::from(track),
            title: track.to_string(),
            spec: ClipSpec {
                track_id: TrackId::from(track),
                start: Duration::ZERO,
                length: Duration::from_secs_f64(secs),
                fade_in: Duration::ZERO,
                fade_out: Duration::ZERO,
                curve: FadeCurve::EqualPower,
            },
            samples: vec![0.0; frames * 2],
            sample_rate,
            channels: 2,
            fade_in_frames: 0,
            fade_out_frames: 0,
        }
    }

    #[test]
    fn test_in_order_release() {
        let queue = ReadyQueue::new();
        let s0 = queue.allocate_seq("a", "a");
        let s1 = queue.allocate_seq("b", "b");

        // Out-of-order completion: b first
        queue.insert(s1, clip("b", 1.0));
        assert!(!queue.front_available());
        assert!(queue.pop_front().is_none());

        queue.insert(s0, clip("a", 1.0));
        assert!(queue.front_available());

        let (seq, first) = queue.pop_front().unwrap();
        assert_eq!(seq, s0);
        assert_eq!(first.track_id.as_str(), "a");
        let (_, second) = queue.pop_front().unwrap();
        assert_eq!(second.track_id.as_str(), "b");
    }

    #[test]
    fn test_skipped_sequence_unblocks_successor() {
        let queue = ReadyQueue::new();
        let s0 = queue.allocate_seq("a", "a");
        let s1 = queue.allocate_seq("b", "b");

        queue.insert(s1, clip("b", 1.0));
        queue.mark_skipped(s0);

        let (seq, released) = queue.pop_front().unwrap();
        assert_eq!(seq, s1);
        assert_eq!(released.track_id.as_str(), "b");
    }

    #[test]
    fn test_ready_seconds_counts_all_pending() {
        let queue = ReadyQueue::new();
        let s0 = queue.allocate_seq("a", "a");
        let s1 = queue.allocate_seq("b", "b");

        queue.insert(s1, clip("b", 2.0));
        assert!((queue.ready_seconds() - 2.0).abs() < 0.01);

        queue.insert(s0, clip("a", 3.0));
        assert!((queue.ready_seconds() - 5.0).abs() < 0.01);
        assert_eq!(queue.ready_clips(), 2);

        queue.pop_front().unwrap();
        assert!((queue.ready_seconds() - 2.0).abs() < 0.01);
    }

    #[test]
    fn test_slot_lifecycle() {
        let queue = ReadyQueue::new();
        let seq = queue.allocate_seq("a", "Track A");

        assert_eq!(queue.slots_snapshot()[0].state, SlotState::Filling);

        queue.insert(seq, clip("a", 1.0));
        assert_eq!(queue.slots_snapshot()[0].state, SlotState::Ready);

        let (seq, _clip) = queue.pop_front().unwrap();
        assert_eq!(queue.slots_snapshot()[0].state, SlotState::Draining);

        queue.finish(seq);
        assert!(queue.slots_snapshot().is_empty());
    }

    #[test]
    fn test_clear_invalidates_stragglers() {
        let queue = ReadyQueue::new();
        let s0 = queue.allocate_seq("a", "a");
        let _s1 = queue.allocate_seq("b", "b");

        queue.insert(s0, clip("a", 1.0));
        queue.clear();

        assert_eq!(queue.ready_clips(), 0);
        assert!(queue.slots_snapshot().is_empty());

        // A straggler finishing after the clear lands behind the emit
        // cursor and is never released
        queue.insert(s0, clip("a", 1.0));
        assert!(!queue.front_available());

        // New allocations flow normally
        let s2 = queue.allocate_seq("c", "c");
        queue.insert(s2, clip("c", 1.0));
        let (seq, released) = queue.pop_front().unwrap();
        assert_eq!(seq, s2);
        assert_eq!(released.track_id.as_str(), "c");
    }

    #[test]
    fn test_consecutive_skips_collapse() {
        let queue = ReadyQueue::new();
        let s0 = queue.allocate_seq("a", "a");
        let s1 = queue.allocate_seq("b", "b");
        let s2 = queue.allocate_seq("c", "c");

        queue.mark_skipped(s0);
        queue.mark_skipped(s1);
        queue.insert(s2, clip("c", 1.0));

        let (seq, released) = queue.pop_front().unwrap();
        assert_eq!(seq, s2);
        assert_eq!(released.track_id.as_str(), "c");
    }
}
