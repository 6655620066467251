//! PCM frames and wire format descriptors.

use crate::audio::buffer::FrameBuffer;
use crate::error::{BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};

/// Sample encodings that appear on either side of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioEncoding {
    /// G.711 μ-law, one byte per sample (telephony wire)
    #[serde(rename = "audio/x-mulaw")]
    MuLaw,
    /// Signed 16-bit linear PCM (room tracks)
    #[serde(rename = "audio/l16")]
    LinearPcm16,
}

impl AudioEncoding {
    /// Parse the MIME-style encoding name used in `start` signals.
    pub fn from_mime(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "audio/x-mulaw" | "audio/mulaw" | "audio/pcmu" => Some(AudioEncoding::MuLaw),
            "audio/l16" | "audio/pcm" => Some(AudioEncoding::LinearPcm16),
            _ => None,
        }
    }
}

/// Format of the audio carried on the duplex wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireFormat {
    pub encoding: AudioEncoding,
    pub sample_rate: u32,
    pub channels: u16,
    pub chunk_ms: u32,
}

impl WireFormat {
    /// Telephony default: μ-law, 8kHz, mono, 20ms chunks.
    pub fn telephony(sample_rate: u32, chunk_ms: u32) -> Self {
        Self {
            encoding: AudioEncoding::MuLaw,
            sample_rate,
            channels: 1,
            chunk_ms,
        }
    }

    /// Samples in one fixed-duration wire chunk (160 for 8kHz / 20ms).
    pub fn samples_per_chunk(&self) -> usize {
        (self.sample_rate as usize * self.chunk_ms as usize) / 1000
    }
}

/// One frame of linear PCM audio, interleaved when `channels > 1`.
#[derive(Debug, Clone)]
pub struct PcmFrame {
    pub samples: FrameBuffer,
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmFrame {
    /// Build a frame from a plain vector (not pooled).
    pub fn new(samples: Vec<i16>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples: FrameBuffer::detached(samples),
            sample_rate,
            channels,
        }
    }

    /// Build a frame around a pooled buffer.
    pub fn from_buffer(samples: FrameBuffer, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    pub fn samples_per_channel(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    /// Duration of the frame in milliseconds.
    pub fn duration_ms(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples_per_channel() as f64 * 1000.0 / self.sample_rate as f64
    }

    /// Reject frames the egress pipeline cannot make sense of.
    pub fn validate(&self) -> BridgeResult<()> {
        if self.sample_rate == 0 {
            return Err(BridgeError::Decode("frame has a sample rate of 0".to_string()));
        }
        if self.channels == 0 || self.channels > 2 {
            return Err(BridgeError::Decode(format!(
                "unsupported channel count {}",
                self.channels
            )));
        }
        if self.samples.is_empty() {
            return Err(BridgeError::Decode("frame has no samples".to_string()));
        }
        if self.samples.len() % self.channels as usize != 0 {
            return Err(BridgeError::Decode(format!(
                "{} samples do not divide into {} channels",
                self.samples.len(),
                self.channels
            )));
        }
        Ok(())
    }
}
