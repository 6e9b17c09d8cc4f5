//! Audio resampling using rubato
//!
//! Every prepared clip is normalized to the configured output rate before
//! it reaches the ready queue, so the mixer and the device stream never see
//! mixed rates.

use crate::error::{Error, Result};
use rubato::{FastFixedIn, PolynomialDegree, Resampler as RubatoResampler};
use tracing::debug;

/// Resample an interleaved buffer to the target rate
///
/// Returns the input unchanged when the rates already match. The whole clip
/// is converted in one pass; clips are bounded by the configured clip
/// length, so the working set stays small.
pub fn resample(input: &[f32], input_rate: u32, output_rate: u32, channels: u16) -> Result<Vec<f32>> {
    if input_rate == output_rate || input.is_empty() {
        return Ok(input.to_vec());
    }

    debug!(
        "Resampling {} frames: {}Hz -> {}Hz",
        input.len() / channels as usize,
        input_rate,
        output_rate
    );

    let planar_input = deinterleave(input, channels);
    let input_frames = planar_input[0].len();

    let mut resampler = FastFixedIn::<f32>::new(
        output_rate as f64 / input_rate as f64,
        1.0,
        PolynomialDegree::Septic,
        input_frames,
        channels as usize,
    )
    .map_err(|e| Error::Decode(format!("failed to create resampler: {}", e)))?;

    let planar_output = resampler
        .process(&planar_input, None)
        .map_err(|e| Error::Decode(format!("resampling failed: {}", e)))?;

    Ok(interleave(&planar_output))
}

/// Convert interleaved samples to planar format
///
/// `[L, R, L, R, ...]` becomes `[[L, L, ...], [R, R, ...]]`.
fn deinterleave(samples: &[f32], channels: u16) -> Vec<Vec<f32>> {
    let num_channels = channels as usize;
    let num_frames = samples.len() / num_channels;

    let mut planar = vec![Vec::with_capacity(num_frames); num_channels];
    for frame in samples.chunks_exact(num_channels) {
        for (channel, &sample) in frame.iter().enumerate() {
            planar[channel].push(sample);
        }
    }
    planar
}

/// Convert planar samples back to interleaved format
fn interleave(planar: &[Vec<f32>]) -> Vec<f32> {
    let num_channels = planar.len();
    let num_frames = planar.first().map(|c| c.len()).unwrap_or(0);

    let mut interleaved = Vec::with_capacity(num_frames * num_channels);
    for frame in 0..num_frames {
        for channel in planar {
            interleaved.push(channel[frame]);
        }
    }
    interleaved
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_rate_passthrough() {
        let input = vec![0.1, 0.2, 0.3, 0.4];
        let output = resample(&input, 44100, 44100, 2).unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn test_empty_input() {
        let output = resample(&[], 48000, 44100, 2).unwrap();
        assert!(output.is_empty());
    }

    #[test]
    fn test_upsample_roughly_doubles_frames() {
        // 1000 stereo frames of a low-frequency ramp at 22050 Hz
        let mut input = Vec::with_capacity(2000);
        for i in 0..1000 {
            let v = (i as f32 / 1000.0) - 0.5;
            input.push(v);
            input.push(-v);
        }

        let output = resample(&input, 22050, 44100, 2).unwrap();
        let out_frames = output.len() / 2;
        assert!(
            (out_frames as i64 - 2000).unsigned_abs() < 32,
            "expected ~2000 frames, got {}",
            out_frames
        );
    }

    #[test]
    fn test_deinterleave_interleave_round_trip() {
        let input = vec![0.1, -0.1, 0.2, -0.2, 0.3, -0.3];
        let planar = deinterleave(&input, 2);
        assert_eq!(planar[0], vec![0.1, 0.2, 0.3]);
        assert_eq!(planar[1], vec![-0.1, -0.2, -0.3]);
        assert_eq!(interleave(&planar), input);
    }
}
