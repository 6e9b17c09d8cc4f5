//! Crossfade mixer
//!
//! Clips arrive pre-faded: the clip processor applied the fade envelopes
//! before buffering, so mixing an overlap is plain summation; no envelope
//! math on the real-time path.
//!
//! The overlap between two consecutive clips is
//! `min(outgoing fade-out frames, incoming fade-in frames)`; both are
//! already clamped to half their clip's length, so the overlap never
//! reaches beyond what either clip can supply. The final clip of a
//! non-repeating session simply plays its faded tail with nothing to sum
//! against.

use crate::clip::PreparedClip;
use crate::playback::ReadyQueue;
use crate::playlist::TrackId;

/// Boundary events surfaced while mixing
#[derive(Debug, Clone, PartialEq)]
pub enum MixEvent {
    /// A clip entered the active slot
    Started {
        track_id: TrackId,
        title: String,
        clip_duration_ms: u64,
    },
    /// A clip left the active slot
    Finished {
        track_id: TrackId,
        /// false when cut short by skip/stop
        completed: bool,
    },
}

/// A clip being output, with its read cursor
struct ActiveClip {
    seq: u64,
    clip: PreparedClip,
    cursor: usize,
}

impl ActiveClip {
    fn frames(&self) -> usize {
        self.clip.frames()
    }

    fn remaining(&self) -> usize {
        self.frames().saturating_sub(self.cursor)
    }
}

/// An incoming clip waiting for (or inside) the overlap window
struct IncomingClip {
    active: ActiveClip,
    /// Outgoing-clip cursor position at which this clip starts sounding
    start_at: usize,
}

/// Sums pre-faded clips into a continuous output stream
pub struct CrossfadeMixer {
    channels: usize,
    active: Option<ActiveClip>,
    incoming: Option<IncomingClip>,
}

impl CrossfadeMixer {
    pub fn new(channels: u16) -> Self {
        Self {
            channels: channels as usize,
            active: None,
            incoming: None,
        }
    }

    /// Whether a clip currently occupies the active slot
    pub fn has_active(&self) -> bool {
        self.active.is_some()
    }

    /// Active clip's identity and position, for snapshots
    pub fn active_info(&self) -> Option<(TrackId, String, usize, usize, u32)> {
        self.active.as_ref().map(|active| {
            (
                active.clip.track_id.clone(),
                active.clip.title.clone(),
                active.cursor,
                active.frames(),
                active.clip.sample_rate,
            )
        })
    }

    /// Fill `out` with mixed samples, pulling clips from the queue as needed
    ///
    /// Returns the number of audio frames written (the rest of `out` is
    /// zeroed) plus any boundary events. Writing less than requested means
    /// the queue ran dry mid-block.
    pub fn next_block(&mut self, out: &mut [f32], queue: &ReadyQueue) -> (usize, Vec<MixEvent>) {
        out.fill(0.0);
        let mut events = Vec::new();
        let total_frames = out.len() / self.channels;
        let mut written = 0;

        while written < total_frames {
            // Ensure something occupies the active slot
            if self.active.is_none() {
                // A clip that was mid-crossfade when its predecessor was
                // dropped gets promoted; otherwise pull fresh
                if let Some(incoming) = self.incoming.take() {
                    self.active = Some(incoming.active);
                } else if let Some((seq, clip)) = queue.pop_front() {
                    events.push(MixEvent::Started {
                        track_id: clip.track_id.clone(),
                        title: clip.title.clone(),
                        clip_duration_ms: clip.duration().as_millis() as u64,
                    });
                    self.active = Some(ActiveClip { seq, clip, cursor: 0 });
                } else {
                    break;
                }
            }

            // Begin the next crossfade once the cursor is inside the
            // outgoing clip's fade-out window
            if self.incoming.is_none() {
                let (remaining, fade_out, frames) = {
                    let active = self.active.as_ref().unwrap();
                    (
                        active.remaining(),
                        active.clip.fade_out_frames,
                        active.frames(),
                    )
                };
                if remaining <= fade_out && fade_out > 0 {
                    if let Some((seq, clip)) = queue.pop_front() {
                        // Overlap clamps to what both clips can supply
                        let overlap = fade_out.min(clip.fade_in_frames).min(clip.frames());
                        events.push(MixEvent::Started {
                            track_id: clip.track_id.clone(),
                            title: clip.title.clone(),
                            clip_duration_ms: clip.duration().as_millis() as u64,
                        });
                        self.incoming = Some(IncomingClip {
                            active: ActiveClip { seq, clip, cursor: 0 },
                            start_at: frames - overlap,
                        });
                    }
                }
            }

            let active = self.active.as_mut().unwrap();

            // Span until the block ends, the active clip ends, or the
            // overlap begins, whichever comes first
            let mut span = (total_frames - written).min(active.remaining());
            if let Some(incoming) = &self.incoming {
                if active.cursor < incoming.start_at {
                    span = span.min(incoming.start_at - active.cursor);
                }
            }
            let in_overlap = self
                .incoming
                .as_ref()
                .map(|incoming| active.cursor >= incoming.start_at)
                .unwrap_or(false);

            let offset = written * self.channels;
            let from = active.cursor * self.channels;
            for i in 0..span * self.channels {
                out[offset + i] = active.clip.samples[from + i];
            }
            active.cursor += span;

            if in_overlap {
                let incoming = self.incoming.as_mut().unwrap();
                let from = incoming.active.cursor * self.channels;
                let available = incoming.active.remaining().min(span);
                for i in 0..available * self.channels {
                    out[offset + i] += incoming.active.clip.samples[from + i];
                }
                incoming.active.cursor += available;
            }

            written += span;

            // Outgoing clip done: the incoming one (if any) takes the slot
            if self.active.as_ref().unwrap().remaining() == 0 {
                let finished = self.active.take().unwrap();
                queue.finish(finished.seq);
                events.push(MixEvent::Finished {
                    track_id: finished.clip.track_id,
                    completed: true,
                });
                if let Some(incoming) = self.incoming.take() {
                    self.active = Some(incoming.active);
                }
            }
        }

        (written, events)
    }

    /// Discard the active clip (skip)
    ///
    /// An incoming clip mid-crossfade is promoted and keeps playing; the
    /// ready queue is untouched.
    pub fn drop_active(&mut self, queue: &ReadyQueue) -> Vec<MixEvent> {
        let mut events = Vec::new();
        if let Some(active) = self.active.take() {
            queue.finish(active.seq);
            events.push(MixEvent::Finished {
                track_id: active.clip.track_id,
                completed: false,
            });
        }
        if let Some(incoming) = self.incoming.take() {
            self.active = Some(incoming.active);
        }
        events
    }

    /// Discard everything (stop / full flush)
    pub fn clear(&mut self, queue: &ReadyQueue) -> Vec<MixEvent> {
        let mut events = self.drop_active(queue);
        events.extend(self.drop_active(queue));
        events
    }

    /// Reposition the cursor within the active clip, in frames
    ///
    /// Clamped to the clip bounds. Seeking backward out of an overlap is
    /// not supported; the incoming clip simply continues from where it is.
    pub fn seek_to(&mut self, frame: usize) {
        if let Some(active) = self.active.as_mut() {
            active.cursor = frame.min(active.frames().saturating_sub(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::ClipSpec;
    use segue_common::FadeCurve;
    use std::time::Duration;
    use uuid::Uuid;

    const RATE: u32 = 1000;

    /// Build a pre-faded clip the way the processor would: body at 1.0,
    /// equal-power ramps over the fade windows
    fn faded_clip(track: &str, frames: usize, fade_frames: usize) -> PreparedClip {
        let curve = FadeCurve::EqualPower;
        let mut samples = vec![1.0f32; frames * 2];
        for frame in 0..fade_frames.min(frames) {
            let m = curve.fade_in(frame as f32 / fade_frames as f32);
            samples[frame * 2] *= m;
            samples[frame * 2 + 1] *= m;
        }
        let fade_start = frames.saturating_sub(fade_frames);
        for frame in fade_start..frames {
            let m = curve.fade_out((frame - fade_start) as f32 / fade_frames as f32);
            samples[frame * 2] *= m;
            samples[frame * 2 + 1] *= m;
        }

        PreparedClip {
            clip_id: Uuid::new_v4(),
            track_id: TrackId::from(track),
            title: track.to_string(),
            spec: ClipSpec {
                track_id: TrackId::from(track),
                start: Duration::ZERO,
                length: Duration::from_secs_f64(frames as f64 / RATE as f64),
                fade_in: Duration::from_secs_f64(fade_frames as f64 / RATE as f64),
                fade_out: Duration::from_secs_f64(fade_frames as f64 / RATE as f64),
                curve,
            },
            samples,
            sample_rate: RATE,
            channels: 2,
            fade_in_frames: fade_frames,
            fade_out_frames: fade_frames,
        }
    }

    fn drain(mixer: &mut CrossfadeMixer, queue: &ReadyQueue, block_frames: usize) -> (Vec<f32>, Vec<MixEvent>) {
        let mut output = Vec::new();
        let mut events = Vec::new();
        let mut buf = vec![0.0f32; block_frames * 2];
        loop {
            let (written, mut block_events) = mixer.next_block(&mut buf, queue);
            events.append(&mut block_events);
            if written == 0 {
                break;
            }
            output.extend_from_slice(&buf[..written * 2]);
        }
        (output, events)
    }

    fn enqueue(queue: &ReadyQueue, clip: PreparedClip) {
        let seq = queue.allocate_seq(clip.track_id.as_str(), &clip.title);
        queue.insert(seq, clip);
    }

    #[test]
    fn test_two_clips_overlap_by_fade_length() {
        let queue = ReadyQueue::new();
        enqueue(&queue, faded_clip("a", 500, 100));
        enqueue(&queue, faded_clip("b", 400, 100));

        let mut mixer = CrossfadeMixer::new(2);
        let (output, events) = drain(&mut mixer, &queue, 64);

        // Total length: a + b - overlap
        assert_eq!(output.len() / 2, 500 + 400 - 100);

        let started: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, MixEvent::Started { .. }))
            .collect();
        assert_eq!(started.len(), 2);
    }

    #[test]
    fn test_overlap_sums_complementary_envelopes() {
        let queue = ReadyQueue::new();
        enqueue(&queue, faded_clip("a", 500, 100));
        enqueue(&queue, faded_clip("b", 500, 100));

        let mut mixer = CrossfadeMixer::new(2);
        let (output, _) = drain(&mut mixer, &queue, 50);

        // Overlap covers outgoing frames [400, 500); with unit bodies the
        // mixed sample equals fade_out(t) + fade_in(t) exactly
        let curve = FadeCurve::EqualPower;
        for i in 0..100 {
            let t = i as f32 / 100.0;
            let expected = curve.fade_out(t) + curve.fade_in(t);
            let got = output[(400 + i) * 2];
            assert!(
                (got - expected).abs() < 1e-4,
                "overlap frame {}: got {}, expected {}",
                i,
                got,
                expected
            );
            // Complementary powers never dip below unity there
            let power = curve.fade_out(t).powi(2) + curve.fade_in(t).powi(2);
            assert!((power - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_overlap_clamps_to_shorter_incoming_fade() {
        let queue = ReadyQueue::new();
        enqueue(&queue, faded_clip("a", 500, 100));
        // Incoming fade-in is only 30 frames: overlap clamps to 30
        enqueue(&queue, faded_clip("b", 200, 30));

        let mut mixer = CrossfadeMixer::new(2);
        let (output, _) = drain(&mut mixer, &queue, 64);

        assert_eq!(output.len() / 2, 500 + 200 - 30);
    }

    #[test]
    fn test_final_clip_fades_out_alone() {
        let queue = ReadyQueue::new();
        enqueue(&queue, faded_clip("only", 300, 50));

        let mut mixer = CrossfadeMixer::new(2);
        let (output, events) = drain(&mut mixer, &queue, 64);

        assert_eq!(output.len() / 2, 300);
        // Tail ramps to silence
        assert!(output[output.len() - 2].abs() < 0.05);
        assert!(events.contains(&MixEvent::Finished {
            track_id: TrackId::from("only"),
            completed: true,
        }));
    }

    #[test]
    fn test_underrun_reports_partial_block() {
        let queue = ReadyQueue::new();
        enqueue(&queue, faded_clip("a", 100, 0));

        let mut mixer = CrossfadeMixer::new(2);
        let mut buf = vec![0.0f32; 150 * 2];
        let (written, _) = mixer.next_block(&mut buf, &queue);

        assert_eq!(written, 100);
        // Unwritten region is silence
        assert!(buf[100 * 2..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_drop_active_promotes_incoming() {
        let queue = ReadyQueue::new();
        enqueue(&queue, faded_clip("a", 500, 100));
        enqueue(&queue, faded_clip("b", 500, 100));

        let mut mixer = CrossfadeMixer::new(2);
        // Play into the overlap so the incoming clip is live
        let mut buf = vec![0.0f32; 450 * 2];
        let (written, _) = mixer.next_block(&mut buf, &queue);
        assert_eq!(written, 450);

        let events = mixer.drop_active(&queue);
        assert!(events.contains(&MixEvent::Finished {
            track_id: TrackId::from("a"),
            completed: false,
        }));

        // The promoted incoming clip keeps playing
        let (_, title, _, _, _) = mixer.active_info().unwrap();
        assert_eq!(title, "b");
    }

    #[test]
    fn test_seek_clamps_to_clip() {
        let queue = ReadyQueue::new();
        enqueue(&queue, faded_clip("a", 200, 0));

        let mut mixer = CrossfadeMixer::new(2);
        let mut buf = vec![0.0f32; 10 * 2];
        mixer.next_block(&mut buf, &queue);

        mixer.seek_to(5000);
        let (_, _, cursor, frames, _) = mixer.active_info().unwrap();
        assert_eq!(cursor, frames - 1);

        mixer.seek_to(50);
        let (_, _, cursor, _, _) = mixer.active_info().unwrap();
        assert_eq!(cursor, 50);
    }

    #[test]
    fn test_zero_fade_clips_play_back_to_back() {
        let queue = ReadyQueue::new();
        enqueue(&queue, faded_clip("a", 100, 0));
        enqueue(&queue, faded_clip("b", 100, 0));

        let mut mixer = CrossfadeMixer::new(2);
        let (output, _) = drain(&mut mixer, &queue, 32);

        // No overlap without fade windows
        assert_eq!(output.len() / 2, 200);
    }
}
