//! Audio I/O: decode, resample, device output

pub mod decoder;
pub mod output;
pub mod resampler;

pub use decoder::{AudioDecoder, AudioSource, DecodedChunk};
pub use output::AudioOutput;
