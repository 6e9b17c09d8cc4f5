//! Audio decoding using symphonia
//!
//! Decodes any cached payload to interleaved stereo f32, regardless of the
//! source codec (mp3, flac, aac, mp4/m4a, vorbis, wav). Mono input is
//! duplicated to stereo; multichannel input is downmixed.
//!
//! Sources form a closed set: a file on disk or an in-memory handle to
//! bytes that have not been persisted. Both are consumed through the same
//! symphonia probe path.

use crate::cache::AudioMetadata;
use crate::error::{Error, Result};
use std::fs::File;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::warn;

/// Shared immutable byte buffer usable as a symphonia media source
#[derive(Debug, Clone)]
pub struct SharedBytes(pub Arc<Vec<u8>>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

/// Where decodable audio comes from
///
/// Closed set consumed uniformly by the clip processor.
#[derive(Debug, Clone)]
pub enum AudioSource {
    /// Cached payload on disk
    LocalFile(PathBuf),
    /// Downloaded bytes that have not been (or will not be) persisted
    StreamingHandle(SharedBytes),
}

impl AudioSource {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        AudioSource::StreamingHandle(SharedBytes(Arc::new(bytes)))
    }

    fn open_stream(&self) -> Result<MediaSourceStream> {
        let source: Box<dyn MediaSource> = match self {
            AudioSource::LocalFile(path) => {
                let file = File::open(path).map_err(|e| {
                    Error::Decode(format!("cannot open {}: {}", path.display(), e))
                })?;
                Box::new(file)
            }
            AudioSource::StreamingHandle(bytes) => Box::new(Cursor::new(bytes.clone())),
        };
        Ok(MediaSourceStream::new(source, Default::default()))
    }

    fn hint(&self) -> Hint {
        let mut hint = Hint::new();
        if let AudioSource::LocalFile(path) = self {
            if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
                hint.with_extension(ext);
            }
        }
        hint
    }

    fn describe(&self) -> String {
        match self {
            AudioSource::LocalFile(path) => path.display().to_string(),
            AudioSource::StreamingHandle(bytes) => {
                format!("<{} in-memory bytes>", bytes.0.len())
            }
        }
    }
}

/// Decoded audio chunk: interleaved stereo f32 at the file's native rate
#[derive(Debug)]
pub struct DecodedChunk {
    /// Interleaved stereo samples [L, R, L, R, ...]
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedChunk {
    pub fn frames(&self) -> usize {
        self.samples.len() / 2
    }
}

/// Streaming decoder over an [`AudioSource`]
pub struct AudioDecoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    native_sample_rate: u32,
    native_channels: usize,
    sample_buf: Option<SampleBuffer<f32>>,
}

impl AudioDecoder {
    /// Probe the source and set up a decoder for its default audio track
    pub fn open(source: &AudioSource) -> Result<Self> {
        let mss = source.open_stream()?;

        let probed = symphonia::default::get_probe()
            .format(
                &source.hint(),
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| {
                Error::Decode(format!("unsupported format in {}: {}", source.describe(), e))
            })?;

        let format = probed.format;

        let track = format.default_track().ok_or_else(|| {
            Error::Decode(format!("no audio track in {}", source.describe()))
        })?;

        let track_id = track.id;
        let codec_params = track.codec_params.clone();
        let native_sample_rate = codec_params.sample_rate.unwrap_or(44100);
        let native_channels = codec_params.channels.map(|c| c.count()).unwrap_or(2);

        let decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| {
                Error::Decode(format!("unsupported codec in {}: {}", source.describe(), e))
            })?;

        Ok(Self {
            format,
            decoder,
            track_id,
            native_sample_rate,
            native_channels,
            sample_buf: None,
        })
    }

    /// Decode the next chunk, or `None` at end of stream
    ///
    /// Malformed packets are skipped rather than failing the whole clip, as
    /// symphonia recommends for lossy streams.
    pub fn decode_chunk(&mut self) -> Result<Option<DecodedChunk>> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => return Ok(None),
                Err(e) => return Err(Error::Decode(format!("packet read failed: {}", e))),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(e)) => {
                    warn!("Skipping malformed packet: {}", e);
                    continue;
                }
                Err(e) => return Err(Error::Decode(format!("decode failed: {}", e))),
            };

            let spec = *decoded.spec();
            let capacity = decoded.capacity() as u64;

            let needs_new = match &self.sample_buf {
                Some(buf) => buf.capacity() < capacity as usize * spec.channels.count(),
                None => true,
            };
            if needs_new {
                self.sample_buf = Some(SampleBuffer::new(capacity, spec));
            }

            let buf = self.sample_buf.as_mut().unwrap();
            buf.copy_interleaved_ref(decoded);

            let channels = spec.channels.count();
            let samples = stereo_from_interleaved(buf.samples(), channels);

            return Ok(Some(DecodedChunk {
                samples,
                sample_rate: self.native_sample_rate,
            }));
        }
    }

    /// Native sample rate of the source
    pub fn sample_rate(&self) -> u32 {
        self.native_sample_rate
    }

    /// Native channel count of the source
    pub fn channels(&self) -> usize {
        self.native_channels
    }
}

/// Probe metadata without keeping a decoder around
///
/// Uses the container's frame count when it is declared; otherwise decodes
/// through the stream once and counts. Runs at cache time so playback never
/// pays for the counting path twice.
pub fn probe_metadata(source: &AudioSource) -> Result<AudioMetadata> {
    let mut decoder = AudioDecoder::open(source)?;

    let sample_rate = decoder.sample_rate();
    let channels = decoder.channels().min(2) as u16;

    let declared_frames = decoder
        .format
        .default_track()
        .and_then(|t| t.codec_params.n_frames);

    let total_frames = match declared_frames {
        Some(frames) => frames,
        None => {
            let mut counted = 0u64;
            while let Some(chunk) = decoder.decode_chunk()? {
                counted += chunk.frames() as u64;
            }
            counted
        }
    };

    if total_frames == 0 {
        return Err(Error::Decode("stream contains no audio frames".into()));
    }

    Ok(AudioMetadata {
        duration_ms: total_frames * 1000 / sample_rate as u64,
        sample_rate,
        channels,
    })
}

/// Normalize interleaved samples of any channel count to stereo
///
/// Mono duplicates; > 2 channels downmix by averaging alternating channels
/// into left/right.
fn stereo_from_interleaved(samples: &[f32], channels: usize) -> Vec<f32> {
    match channels {
        2 => samples.to_vec(),
        1 => {
            let mut stereo = Vec::with_capacity(samples.len() * 2);
            for &sample in samples {
                stereo.push(sample);
                stereo.push(sample);
            }
            stereo
        }
        n => {
            let frames = samples.len() / n;
            let mut stereo = Vec::with_capacity(frames * 2);
            let half = (n as f32 / 2.0).max(1.0);
            for frame in samples.chunks_exact(n) {
                let mut left = 0.0f32;
                let mut right = 0.0f32;
                for (i, &sample) in frame.iter().enumerate() {
                    if i % 2 == 0 {
                        left += sample;
                    } else {
                        right += sample;
                    }
                }
                stereo.push(left / half);
                stereo.push(right / half);
            }
            stereo
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_nonexistent_file() {
        let source = AudioSource::LocalFile(PathBuf::from("/nonexistent/file.mp3"));
        assert!(AudioDecoder::open(&source).is_err());
    }

    #[test]
    fn test_open_garbage_bytes() {
        let source = AudioSource::from_bytes(vec![0u8; 128]);
        assert!(AudioDecoder::open(&source).is_err());
    }

    #[test]
    fn test_stereo_from_mono() {
        let stereo = stereo_from_interleaved(&[0.5, -0.5], 1);
        assert_eq!(stereo, vec![0.5, 0.5, -0.5, -0.5]);
    }

    #[test]
    fn test_stereo_passthrough() {
        let samples = vec![0.1, 0.2, 0.3, 0.4];
        assert_eq!(stereo_from_interleaved(&samples, 2), samples);
    }

    #[test]
    fn test_downmix_quad() {
        // One frame of 4 channels: evens -> left, odds -> right, /2
        let stereo = stereo_from_interleaved(&[1.0, 0.5, 1.0, 0.5], 4);
        assert_eq!(stereo.len(), 2);
        assert!((stereo[0] - 1.0).abs() < 1e-6);
        assert!((stereo[1] - 0.5).abs() < 1e-6);
    }

    fn wav_bytes(frames: usize, sample_rate: u32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for i in 0..frames {
                let value = ((i as f32 * 0.01).sin() * 8000.0) as i16;
                writer.write_sample(value).unwrap();
                writer.write_sample(value).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn test_decode_generated_wav() {
        let source = AudioSource::from_bytes(wav_bytes(4410, 44100));
        let mut decoder = AudioDecoder::open(&source).unwrap();
        assert_eq!(decoder.sample_rate(), 44100);

        let mut frames = 0;
        while let Some(chunk) = decoder.decode_chunk().unwrap() {
            frames += chunk.frames();
        }
        assert_eq!(frames, 4410);
    }

    #[test]
    fn test_probe_metadata_from_wav() {
        let source = AudioSource::from_bytes(wav_bytes(44100, 44100));
        let metadata = probe_metadata(&source).unwrap();

        assert_eq!(metadata.sample_rate, 44100);
        assert_eq!(metadata.channels, 2);
        // One second of audio
        assert!((metadata.duration_ms as i64 - 1000).abs() <= 1);
    }
}
