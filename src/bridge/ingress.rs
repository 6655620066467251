//! # Ingress Pipeline (caller → room)
//!
//! base64 payload → μ-law bytes → linear PCM at the wire rate → (resample to
//! the track's rate) → (widen to the track's channel count) → `submit_frame`.
//!
//! Submission never waits. A full track queue surfaces as
//! [`SubmitOutcome::Dropped`] and the caller counts it.

use crate::audio::buffer::FramePool;
use crate::audio::codec;
use crate::audio::frame::{PcmFrame, WireFormat};
use crate::audio::resample::ResampleState;
use crate::error::{BridgeError, BridgeResult};
use crate::room::{SubmitOutcome, SyntheticTrack};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::sync::Arc;

/// Turns wire payloads into frames on the caller's synthetic track.
pub struct IngressPipeline {
    track: Arc<dyn SyntheticTrack>,
    pool: FramePool,
    /// Present only when the track's rate differs from the wire rate
    resample: Option<ResampleState>,
    bytes: Vec<u8>,
    decoded: Vec<i16>,
}

impl IngressPipeline {
    pub fn new(track: Arc<dyn SyntheticTrack>, pool: FramePool, wire: WireFormat) -> Self {
        let resample = (track.sample_rate() != wire.sample_rate)
            .then(|| ResampleState::new(wire.sample_rate, track.sample_rate()));

        Self {
            track,
            pool,
            resample,
            bytes: Vec::with_capacity(wire.samples_per_chunk()),
            decoded: Vec::with_capacity(wire.samples_per_chunk()),
        }
    }

    /// Decode one `media` payload and hand it to the synthetic track.
    ///
    /// ## Returns:
    /// - `Ok(Some(outcome))`: a frame was submitted
    /// - `Ok(None)`: the resampler is still filling and produced no output
    /// - `Err(Decode)`: the payload was not valid base64 or was empty
    pub fn forward(&mut self, payload: &str) -> BridgeResult<Option<SubmitOutcome>> {
        self.bytes.clear();
        STANDARD.decode_vec(payload.trim(), &mut self.bytes)?;
        if self.bytes.is_empty() {
            return Err(BridgeError::Decode("media payload is empty".to_string()));
        }

        let mut buffer = self.pool.acquire();
        match self.resample.as_mut() {
            Some(state) => {
                self.decoded.clear();
                codec::decompand_into(&self.bytes, &mut self.decoded);
                state.process(&self.decoded, buffer.as_mut_vec());
            }
            None => codec::decompand_into(&self.bytes, buffer.as_mut_vec()),
        }

        if buffer.is_empty() {
            return Ok(None);
        }

        let channels = self.track.channels().max(1);
        if channels > 1 {
            widen_in_place(buffer.as_mut_vec(), channels as usize);
        }

        let frame = PcmFrame::from_buffer(buffer, self.track.sample_rate(), channels);
        Ok(Some(self.track.submit_frame(frame)))
    }
}

/// Duplicate each mono sample across `channels`, back to front so nothing
/// is overwritten before it is read.
fn widen_in_place(samples: &mut Vec<i16>, channels: usize) {
    let frames = samples.len();
    samples.resize(frames * channels, 0);
    for index in (0..frames).rev() {
        let sample = samples[index];
        samples[index * channels..(index + 1) * channels].fill(sample);
    }
}
