//! Clip preparation
//!
//! Turns a [`ClipSpec`] plus a cached audio source into a self-contained,
//! pre-faded sample buffer. The envelope is applied here, before buffering;
//! the crossfade mixer only sums overlapping samples at playback time.
//!
//! Pipeline per clip: decode (native rate, stereo) → trim to the spec's
//! range → resample to the output rate → channel conversion → gain trim →
//! fade envelope.

use crate::audio::decoder::AudioDecoder;
use crate::audio::{resampler, AudioSource};
use crate::clip::ClipSpec;
use crate::error::{Error, Result};
use crate::playlist::TrackId;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// A decoded, faded clip ready for mixing
///
/// Owned by the prebuffer manager's ready queue until the scheduler takes
/// it into the active slot; never shared between the two.
#[derive(Debug, Clone)]
pub struct PreparedClip {
    /// Unique id for this prepared instance (a track prepared twice gets
    /// two ids; useful in logs and diagnostics)
    pub clip_id: Uuid,
    pub track_id: TrackId,
    pub title: String,
    /// The spec actually honored; may be shorter than requested when the
    /// source audio ran out early
    pub spec: ClipSpec,
    /// Interleaved, pre-faded samples at `sample_rate`/`channels`
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Envelope extents in output frames
    pub fade_in_frames: usize,
    pub fade_out_frames: usize,
}

impl PreparedClip {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate as f64)
    }
}

/// Renders clips against a fixed output format
pub struct ClipProcessor {
    sample_rate: u32,
    channels: u16,
}

impl ClipProcessor {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Prepare a clip from cached audio
    ///
    /// Independent of playback timing; safe to run on any worker. If the
    /// audio turns out shorter than the spec promised (bad upstream
    /// metadata), the clip shrinks and its fades re-clamp instead of
    /// failing the track.
    pub fn prepare(
        &self,
        source: &AudioSource,
        spec: &ClipSpec,
        title: &str,
        gain: f32,
    ) -> Result<PreparedClip> {
        let mut decoder = AudioDecoder::open(source)?;
        let native_rate = decoder.sample_rate();

        let start_frame = (spec.start.as_secs_f64() * native_rate as f64) as u64;
        let wanted_frames = (spec.length.as_secs_f64() * native_rate as f64) as u64;
        let end_frame = start_frame + wanted_frames;

        // Decode-and-discard up to the start offset, collect the range.
        // TODO: switch to FormatReader::seek for the skip once coarse-seek
        // accuracy is validated against VBR mp3 sources.
        let mut collected: Vec<f32> = Vec::new();
        let mut cursor: u64 = 0;

        while cursor < end_frame {
            let Some(chunk) = decoder.decode_chunk()? else {
                break;
            };
            let chunk_frames = chunk.frames() as u64;
            let chunk_start = cursor;
            let chunk_end = cursor + chunk_frames;
            cursor = chunk_end;

            if chunk_end <= start_frame {
                continue;
            }

            let from = start_frame.saturating_sub(chunk_start) as usize;
            let to = (chunk_end.min(end_frame) - chunk_start) as usize;
            collected.extend_from_slice(&chunk.samples[from * 2..to * 2]);
        }

        if collected.is_empty() {
            return Err(Error::Decode(format!(
                "no audio in range {:?}..{:?} of track {}",
                spec.start,
                spec.end(),
                spec.track_id
            )));
        }

        let got_frames = collected.len() as u64 / 2;
        if got_frames < wanted_frames {
            warn!(
                "Track {} ran short: wanted {} frames from {:?}, got {}",
                spec.track_id, wanted_frames, spec.start, got_frames
            );
        }

        // Native stereo -> output rate
        let resampled = resampler::resample(&collected, native_rate, self.sample_rate, 2)?;

        // Channel conversion after resampling (resampler works planar-stereo)
        let mut samples = match self.channels {
            1 => resampled
                .chunks_exact(2)
                .map(|lr| (lr[0] + lr[1]) * 0.5)
                .collect(),
            _ => resampled,
        };

        if (gain - 1.0).abs() > f32::EPSILON {
            for sample in samples.iter_mut() {
                *sample *= gain;
            }
        }

        // Actual length after decode + resample; fades re-clamp against it
        let frames = samples.len() / self.channels as usize;
        let actual_length = Duration::from_secs_f64(frames as f64 / self.sample_rate as f64);

        let clamp = |fade: Duration| -> usize {
            let fade = fade.min(actual_length / 2);
            (fade.as_secs_f64() * self.sample_rate as f64) as usize
        };
        let fade_in_frames = clamp(spec.fade_in);
        let fade_out_frames = clamp(spec.fade_out);

        apply_envelope(
            &mut samples,
            self.channels as usize,
            fade_in_frames,
            fade_out_frames,
            spec.curve,
        );

        let effective_spec = ClipSpec {
            length: actual_length.min(spec.length),
            fade_in: Duration::from_secs_f64(fade_in_frames as f64 / self.sample_rate as f64),
            fade_out: Duration::from_secs_f64(fade_out_frames as f64 / self.sample_rate as f64),
            ..spec.clone()
        };

        debug!(
            "Prepared clip for {}: {} frames, fades {}/{}",
            spec.track_id, frames, fade_in_frames, fade_out_frames
        );

        Ok(PreparedClip {
            clip_id: Uuid::new_v4(),
            track_id: spec.track_id.clone(),
            title: title.to_string(),
            spec: effective_spec,
            samples,
            sample_rate: self.sample_rate,
            channels: self.channels,
            fade_in_frames,
            fade_out_frames,
        })
    }
}

/// Apply the amplitude envelope in place: ramp up, flat body, ramp down
fn apply_envelope(
    samples: &mut [f32],
    channels: usize,
    fade_in_frames: usize,
    fade_out_frames: usize,
    curve: segue_common::FadeCurve,
) {
    let frames = samples.len() / channels;

    if fade_in_frames > 0 {
        for frame in 0..fade_in_frames.min(frames) {
            let position = frame as f32 / fade_in_frames as f32;
            let multiplier = curve.fade_in(position);
            for channel in 0..channels {
                samples[frame * channels + channel] *= multiplier;
            }
        }
    }

    if fade_out_frames > 0 {
        let fade_start = frames.saturating_sub(fade_out_frames);
        for frame in fade_start..frames {
            let position = (frame - fade_start) as f32 / fade_out_frames as f32;
            let multiplier = curve.fade_out(position);
            for channel in 0..channels {
                samples[frame * channels + channel] *= multiplier;
            }
        }
    }
}
