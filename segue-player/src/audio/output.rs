//! Audio device output using cpal
//!
//! The device callback drains the playout ring buffer filled by the
//! scheduler's render task, applies master volume and the peak limiter, and
//! counts underruns. The pipeline itself never blocks on the device: if the
//! ring buffer runs dry the callback emits silence and the scheduler's
//! stall handling takes over.
//!
//! `cpal::Stream` is not `Send`, so the output lives on the thread that
//! created it (the binary's main thread); everything it shares with the
//! pipeline is behind `Arc`.

use crate::error::{Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SampleRate, Stream, StreamConfig};
use ringbuf::traits::Consumer;
use ringbuf::HeapCons;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Prevents clipping by scaling whole blocks whose peak exceeds the threshold
///
/// If a block peaks above the threshold, the entire block is scaled so the
/// peak lands exactly on it; relative levels within the block are preserved.
pub struct PeakLimiter {
    threshold: f32,
}

impl PeakLimiter {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold: threshold.clamp(f32::EPSILON, 1.0),
        }
    }

    /// Apply gain reduction in place
    pub fn apply(&self, block: &mut [f32]) {
        let peak = block.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
        if peak > self.threshold {
            let gain = self.threshold / peak;
            for sample in block.iter_mut() {
                *sample *= gain;
            }
        }
    }
}

/// Audio output device wrapper
pub struct AudioOutput {
    device: Device,
    config: StreamConfig,
    stream: Option<Stream>,
    volume: Arc<Mutex<f32>>,
    underruns: Arc<AtomicU64>,
}

impl AudioOutput {
    /// List available output device names
    pub fn list_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices: Vec<String> = host
            .output_devices()
            .map_err(|e| Error::AudioOutput(format!("failed to enumerate devices: {}", e)))?
            .filter_map(|device| device.name().ok())
            .collect();

        debug!("Found {} output devices", devices.len());
        Ok(devices)
    }

    /// Open an output device
    ///
    /// A named device that cannot be found falls back to the default device
    /// rather than failing the session.
    pub fn open(
        device_name: Option<&str>,
        sample_rate: u32,
        channels: u16,
        volume: Arc<Mutex<f32>>,
    ) -> Result<Self> {
        let host = cpal::default_host();

        let device = match device_name {
            Some(name) => {
                let mut devices = host.output_devices().map_err(|e| {
                    Error::AudioOutput(format!("failed to enumerate devices: {}", e))
                })?;

                match devices.find(|d| d.name().ok().as_deref() == Some(name)) {
                    Some(dev) => {
                        info!("Using requested audio device: {}", name);
                        dev
                    }
                    None => {
                        warn!("Device '{}' not found, falling back to default", name);
                        host.default_output_device().ok_or_else(|| {
                            Error::AudioOutput("no default output device".into())
                        })?
                    }
                }
            }
            None => host
                .default_output_device()
                .ok_or_else(|| Error::AudioOutput("no default output device".into()))?,
        };

        let default_config = device
            .default_output_config()
            .map_err(|e| Error::AudioOutput(format!("no output config: {}", e)))?;

        if default_config.sample_format() != SampleFormat::F32 {
            return Err(Error::AudioOutput(format!(
                "device sample format {:?} not supported (need f32)",
                default_config.sample_format()
            )));
        }

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        Ok(Self {
            device,
            config,
            stream: None,
            volume,
            underruns: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Start the device stream, draining the given ring buffer consumer
    pub fn start(&mut self, mut consumer: HeapCons<f32>, limiter_threshold: f32) -> Result<()> {
        info!(
            "Starting audio stream: {} Hz, {} channels",
            self.config.sample_rate.0, self.config.channels
        );

        let volume = Arc::clone(&self.volume);
        let underruns = Arc::clone(&self.underruns);
        let limiter = PeakLimiter::new(limiter_threshold);

        let stream = self
            .device
            .build_output_stream(
                &self.config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let popped = consumer.pop_slice(data);
                    if popped < data.len() {
                        // Ring buffer ran dry: pad with silence, count once
                        data[popped..].fill(0.0);
                        if popped == 0 {
                            underruns.fetch_add(1, Ordering::Relaxed);
                        }
                    }

                    let current_volume = *volume.lock().unwrap();
                    if (current_volume - 1.0).abs() > f32::EPSILON {
                        for sample in data[..popped].iter_mut() {
                            *sample *= current_volume;
                        }
                    }

                    limiter.apply(&mut data[..popped]);

                    for sample in data.iter_mut() {
                        *sample = sample.clamp(-1.0, 1.0);
                    }
                },
                move |err| {
                    warn!("Audio stream error: {}", err);
                },
                None,
            )
            .map_err(|e| Error::AudioOutput(format!("failed to build stream: {}", e)))?;

        stream
            .play()
            .map_err(|e| Error::AudioOutput(format!("failed to start stream: {}", e)))?;

        self.stream = Some(stream);
        Ok(())
    }

    /// Stop and drop the device stream
    pub fn stop(&mut self) {
        if self.stream.take().is_some() {
            info!("Audio stream stopped");
        }
    }

    /// Device-level underrun count (callback found an empty ring buffer)
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }
}
