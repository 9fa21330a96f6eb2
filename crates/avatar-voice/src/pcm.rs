//! PCM16 codec helpers shared by the playback engine, the microphone uplink and the
//! file-based annotators.
//!
//! The agent speaks and listens in 16 kHz mono signed 16-bit little-endian PCM, carried as
//! base64 inside JSON frames.

use crate::error::{VoiceError, VoiceResult};
use base64::{engine::general_purpose, Engine as _};
use std::io::Cursor;

/// Sample rate of every buffer exchanged with the agent.
pub const AGENT_SAMPLE_RATE: u32 = 16000;

/// Decoded mono audio at a fixed rate.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    /// Samples normalized to -1.0..1.0
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PcmBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Decode a base64 PCM16 payload at the agent rate.
    pub fn from_base64(payload: &str) -> VoiceResult<Self> {
        Ok(Self::new(decode_base64_pcm16(payload)?, AGENT_SAMPLE_RATE))
    }

    /// `sample_count / sample_rate`, in seconds.
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Decode little-endian signed 16-bit samples to f32 (`s16 / 32768.0`).
/// A trailing odd byte is ignored.
pub fn pcm16_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect()
}

/// Decode a base64 PCM16 payload into normalized samples.
pub fn decode_base64_pcm16(payload: &str) -> VoiceResult<Vec<f32>> {
    let bytes = general_purpose::STANDARD.decode(payload.trim())?;
    Ok(pcm16_to_f32(&bytes))
}

/// Quantize one sample to i16 with the same 32768 scale the decoder divides by, so a
/// round trip stays within one quantization step. +1.0 saturates at 0x7FFF.
fn quantize(sample: f32) -> i16 {
    let scaled = (sample.clamp(-1.0, 1.0) * 32768.0).round();
    scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Encode f32 samples as PCM16 little-endian bytes.
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        bytes.extend_from_slice(&quantize(s).to_le_bytes());
    }
    bytes
}

/// Encode f32 samples as a base64 PCM16 payload (the `user_audio_chunk` format).
pub fn encode_pcm16_base64(samples: &[f32]) -> String {
    general_purpose::STANDARD.encode(f32_to_pcm16(samples))
}

/// Mix interleaved multi-channel samples down to mono.
pub fn to_mono(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Downsample by averaging each output window of `from_rate / to_rate` input samples.
/// Upsampling is not supported; the input is returned unchanged when `to_rate >= from_rate`.
pub fn downsample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if to_rate == 0 || from_rate <= to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = (samples.len() as f64 / ratio).round() as usize;
    let mut out = Vec::with_capacity(out_len);
    let mut offset = 0usize;
    for i in 0..out_len {
        let next = (((i + 1) as f64) * ratio).round() as usize;
        let end = next.min(samples.len());
        if offset >= end {
            // Rounding can leave the last window empty; repeat the previous value.
            out.push(out.last().copied().unwrap_or(0.0));
        } else {
            let window = &samples[offset..end];
            out.push(window.iter().sum::<f32>() / window.len() as f32);
        }
        offset = next;
    }
    out
}

/// Encode mono samples as a 16-bit PCM WAV file (for CLI annotators).
pub fn wav_bytes(samples: &[f32], sample_rate: u32) -> VoiceResult<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| VoiceError::Decode(format!("WAV writer: {}", e)))?;
        for &s in samples {
            writer
                .write_sample(quantize(s))
                .map_err(|e| VoiceError::Decode(format!("WAV write: {}", e)))?;
        }
        writer
            .finalize()
            .map_err(|e| VoiceError::Decode(format!("WAV finalize: {}", e)))?;
    }
    Ok(cursor.into_inner())
}
