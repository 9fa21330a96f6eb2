//! Microphone capture using CPAL
//!
//! Opens the default input at its native format, mixes to mono, downsamples to the agent
//! rate and emits fixed-length chunks for the conversation uplink.

use crate::config::CaptureConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::pcm::{downsample, to_mono, AGENT_SAMPLE_RATE};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Audio chunk sent from the capture thread
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Mono samples at 16 kHz (f32, normalized to -1.0 to 1.0)
    pub samples: Vec<f32>,

    /// Timestamp when captured
    pub timestamp: Instant,
}

/// Switch between the capture callback and whoever consumes its chunks. Closed gates drop
/// audio at the source.
#[derive(Debug, Clone, Default)]
pub struct CaptureGate(Arc<AtomicBool>);

impl CaptureGate {
    pub fn open(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn close(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Accumulates native-rate mono audio and cuts it into agent-rate chunks.
struct ChunkAssembler {
    native_rate: u32,
    native_chunk_len: usize,
    pending: Vec<f32>,
}

impl ChunkAssembler {
    fn new(native_rate: u32, chunk_ms: u64) -> Self {
        let native_chunk_len = ((native_rate as u64 * chunk_ms) / 1000).max(1) as usize;
        Self {
            native_rate,
            native_chunk_len,
            pending: Vec::with_capacity(native_chunk_len * 2),
        }
    }

    fn push(&mut self, mono: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend_from_slice(mono);
        let mut out = Vec::new();
        while self.pending.len() >= self.native_chunk_len {
            let chunk: Vec<f32> = self.pending.drain(..self.native_chunk_len).collect();
            out.push(downsample(&chunk, self.native_rate, AGENT_SAMPLE_RATE));
        }
        out
    }

    fn reset(&mut self) {
        self.pending.clear();
    }
}

/// Audio capture system using CPAL
pub struct AudioCapture {
    config: CaptureConfig,
    device: Device,
    stream_config: StreamConfig,
    sample_format: SampleFormat,
}

impl AudioCapture {
    /// Open the default input device at its native configuration.
    pub fn new(config: CaptureConfig) -> VoiceResult<Self> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| VoiceError::AudioDevice("No input device available".to_string()))?;

        info!(
            device = %device.name().unwrap_or_else(|_| "Unknown".to_string()),
            "Using input device"
        );

        let default_config = device.default_input_config()?;
        let sample_format = default_config.sample_format();
        let stream_config: StreamConfig = default_config.into();
        info!(
            rate = stream_config.sample_rate.0,
            channels = stream_config.channels,
            format = ?sample_format,
            chunk_ms = config.chunk_ms,
            "Microphone capture configured"
        );

        Ok(Self {
            config,
            device,
            stream_config,
            sample_format,
        })
    }

    /// Start capturing. Chunks are sent while `gate` is open. Keep the returned stream alive
    /// for as long as capture should run.
    pub fn start_capture(
        self,
        chunk_tx: mpsc::UnboundedSender<AudioChunk>,
        gate: CaptureGate,
    ) -> VoiceResult<Stream> {
        let channels = self.stream_config.channels as usize;
        let mut assembler = ChunkAssembler::new(self.stream_config.sample_rate.0, self.config.chunk_ms);

        let mut deliver = move |mono: Vec<f32>| {
            if !gate.is_open() {
                assembler.reset();
                return;
            }
            for samples in assembler.push(&mono) {
                let chunk = AudioChunk {
                    samples,
                    timestamp: Instant::now(),
                };
                if chunk_tx.send(chunk).is_err() {
                    // Consumer is gone; stop producing until the gate is reopened.
                    gate.close();
                    assembler.reset();
                    return;
                }
            }
        };

        let err_fn = |err: cpal::StreamError| warn!("Audio stream error: {}", err);
        let stream = match self.sample_format {
            SampleFormat::F32 => self.device.build_input_stream(
                &self.stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| deliver(to_mono(data, channels)),
                err_fn,
                None,
            )?,
            SampleFormat::I16 => self.device.build_input_stream(
                &self.stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let samples: Vec<f32> = data.iter().map(|&s| s as f32 / 32768.0).collect();
                    deliver(to_mono(&samples, channels))
                },
                err_fn,
                None,
            )?,
            other => {
                return Err(VoiceError::AudioDevice(format!(
                    "Unsupported sample format {:?} (need F32 or I16)",
                    other
                )))
            }
        };

        stream.play()?;
        info!("Audio capture started");
        Ok(stream)
    }

    /// List available input devices
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let devices = cpal::default_host().input_devices()?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembler_cuts_fixed_chunks_at_agent_rate() {
        // 48 kHz native, 250 ms chunks -> 12000 native samples -> 4000 at 16 kHz.
        let mut asm = ChunkAssembler::new(48000, 250);
        assert!(asm.push(&vec![0.1; 10000]).is_empty());
        let chunks = asm.push(&vec![0.1; 15000]);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.len() == 4000));
        assert_eq!(asm.pending.len(), 1000);
    }

    #[test]
    fn assembler_passes_agent_rate_through() {
        let mut asm = ChunkAssembler::new(16000, 100);
        let chunks = asm.push(&vec![0.5; 1600]);
        assert_eq!(chunks, vec![vec![0.5; 1600]]);
    }

    #[test]
    fn gate_defaults_closed() {
        let gate = CaptureGate::default();
        assert!(!gate.is_open());
        gate.open();
        assert!(gate.clone().is_open());
        gate.close();
        assert!(!gate.is_open());
    }

    #[test]
    #[ignore] // Requires an audio input device
    fn lists_input_devices() {
        let devices = AudioCapture::list_input_devices().unwrap();
        println!("Available input devices: {:?}", devices);
    }
}
