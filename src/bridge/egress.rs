//! # Egress Relay (room → caller)
//!
//! One relay runs per subscribed remote audio track. For every frame it:
//! 1. folds stereo to mono by averaging
//! 2. resamples to the wire rate with its own carried [`ResampleState`]
//! 3. re-chunks into exact wire chunks (160 samples for 8kHz / 20ms)
//! 4. compands to μ-law, base64-encodes and tags the chunk with the stream id
//!
//! A frame that cannot be converted, or a chunk that cannot be written, is
//! skipped. Nothing a single frame does ends the relay; only the end of the
//! subscription or the session's cancellation token does.

use super::stats::SessionStats;
use super::wire::OutboundSignal;
use crate::audio::codec;
use crate::audio::frame::{PcmFrame, WireFormat};
use crate::audio::resample::{fold_to_mono, ResampleState};
use crate::error::BridgeResult;
use crate::room::PcmFrameStream;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Converter state for one subscribed track.
pub struct EgressRelay {
    track_sid: String,
    stream_sid: String,
    wire: WireFormat,
    resample: Option<ResampleState>,
    mono: Vec<i16>,
    /// Wire-rate samples not yet filling a whole chunk
    pending: Vec<i16>,
    companded: Vec<u8>,
}

impl EgressRelay {
    pub fn new(track_sid: impl Into<String>, stream_sid: impl Into<String>, wire: WireFormat) -> Self {
        let chunk = wire.samples_per_chunk();
        Self {
            track_sid: track_sid.into(),
            stream_sid: stream_sid.into(),
            wire,
            resample: None,
            mono: Vec::new(),
            pending: Vec::with_capacity(chunk * 2),
            companded: Vec::with_capacity(chunk),
        }
    }

    /// Turn one room frame into zero or more complete wire chunks.
    pub fn convert(&mut self, frame: &PcmFrame) -> BridgeResult<Vec<OutboundSignal>> {
        frame.validate()?;

        let wire_rate = self.wire.sample_rate;
        if let Some(old) = &self.resample {
            if !old.matches(frame.sample_rate, wire_rate) {
                debug!(
                    track = %self.track_sid,
                    from = old.from_rate(),
                    to = frame.sample_rate,
                    "Remote track changed sample rate, resetting resampler"
                );
                self.resample = None;
            }
        }
        let state = self
            .resample
            .get_or_insert_with(|| ResampleState::new(frame.sample_rate, wire_rate));

        self.mono.clear();
        fold_to_mono(&frame.samples, frame.channels, &mut self.mono);
        state.process(&self.mono, &mut self.pending);

        let chunk = self.wire.samples_per_chunk();
        let mut signals = Vec::with_capacity(self.pending.len() / chunk);
        let mut consumed = 0;
        while self.pending.len() - consumed >= chunk {
            self.companded.clear();
            codec::compand_into(&self.pending[consumed..consumed + chunk], &mut self.companded);
            signals.push(OutboundSignal::media(
                self.stream_sid.clone(),
                STANDARD.encode(&self.companded),
            ));
            consumed += chunk;
        }
        self.pending.drain(..consumed);

        Ok(signals)
    }

    /// Relay frames until the subscription ends or `cancel` fires.
    pub async fn run(
        mut self,
        mut frames: PcmFrameStream,
        outbound: mpsc::Sender<OutboundSignal>,
        cancel: CancellationToken,
        stats: Arc<SessionStats>,
    ) {
        info!(track = %self.track_sid, stream_sid = %self.stream_sid, "Egress relay started");

        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                frame = frames.next() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            let signals = match self.convert(&frame) {
                Ok(signals) => signals,
                Err(err) => {
                    SessionStats::bump(&stats.egress_skipped);
                    warn!(track = %self.track_sid, error = %err, "Skipping room frame");
                    continue;
                }
            };

            for signal in signals {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    sent = outbound.send(signal) => match sent {
                        Ok(()) => SessionStats::bump(&stats.egress_sent),
                        Err(_) => {
                            SessionStats::bump(&stats.egress_skipped);
                            debug!(track = %self.track_sid, "Duplex stream gone, chunk skipped");
                        }
                    },
                }
            }
        }

        info!(track = %self.track_sid, stream_sid = %self.stream_sid, "Egress relay stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::wire::OutboundMedia;
    use tokio_stream::wrappers::ReceiverStream;

    fn relay() -> EgressRelay {
        EgressRelay::new("TR_1", "MZ123", WireFormat::telephony(8000, 20))
    }

    fn tone(len: usize, channels: u16, rate: u32) -> PcmFrame {
        let samples = (0..len)
            .map(|i| ((i as f64 * 0.05).sin() * 8000.0) as i16)
            .flat_map(|s| std::iter::repeat(s).take(channels as usize))
            .collect();
        PcmFrame::new(samples, rate, channels)
    }

    fn payload_len(signal: &OutboundSignal) -> usize {
        let OutboundSignal::Media { media: OutboundMedia { payload }, .. } = signal;
        STANDARD.decode(payload).unwrap().len()
    }

    #[test]
    fn test_20ms_room_frame_becomes_one_wire_chunk() {
        let mut relay = relay();
        for _ in 0..5 {
            let signals = relay.convert(&tone(960, 1, 48000)).unwrap();
            assert_eq!(signals.len(), 1);
            assert_eq!(payload_len(&signals[0]), 160);
            let OutboundSignal::Media { stream_sid, .. } = &signals[0];
            assert_eq!(stream_sid, "MZ123");
        }
    }

    #[test]
    fn test_stereo_and_odd_sized_frames_are_rechunked() {
        let mut relay = relay();
        let mut chunks = 0;
        // 10ms stereo frames: two of them make one wire chunk
        for _ in 0..10 {
            let signals = relay.convert(&tone(480, 2, 48000)).unwrap();
            assert!(signals.iter().all(|s| payload_len(s) == 160));
            chunks += signals.len();
        }
        assert_eq!(chunks, 5);
    }

    #[test]
    fn test_rate_change_resets_state() {
        let mut relay = relay();
        relay.convert(&tone(960, 1, 48000)).unwrap();

        let mut chunks = 0;
        for _ in 0..4 {
            chunks += relay.convert(&tone(320, 1, 16000)).unwrap().len();
        }
        assert!((3..=4).contains(&chunks), "{}", chunks);
    }

    #[test]
    fn test_malformed_frame_is_an_error_and_relay_continues() {
        let mut relay = relay();
        assert!(relay.convert(&PcmFrame::new(vec![0; 961], 48000, 2)).is_err());
        assert!(relay.convert(&PcmFrame::new(vec![0; 960], 0, 1)).is_err());
        assert_eq!(relay.convert(&tone(960, 1, 48000)).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (frame_tx, frame_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let stats = Arc::new(SessionStats::default());

        let task = tokio::spawn(relay().run(
            ReceiverStream::new(frame_rx).boxed(),
            out_tx,
            cancel.clone(),
            stats.clone(),
        ));

        frame_tx.send(tone(960, 1, 48000)).await.unwrap();
        frame_tx.send(PcmFrame::new(vec![], 48000, 1)).await.unwrap();
        frame_tx.send(tone(960, 1, 48000)).await.unwrap();

        assert!(out_rx.recv().await.is_some());
        assert!(out_rx.recv().await.is_some());

        cancel.cancel();
        task.await.unwrap();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.egress_sent, 2);
        assert_eq!(snapshot.egress_skipped, 1);
    }

    #[tokio::test]
    async fn test_closed_duplex_skips_chunks_without_ending_relay() {
        let (frame_tx, frame_rx) = mpsc::channel(8);
        let (out_tx, out_rx) = mpsc::channel(8);
        drop(out_rx);
        let stats = Arc::new(SessionStats::default());

        let task = tokio::spawn(relay().run(
            ReceiverStream::new(frame_rx).boxed(),
            out_tx,
            CancellationToken::new(),
            stats.clone(),
        ));

        for _ in 0..3 {
            frame_tx.send(tone(960, 1, 48000)).await.unwrap();
        }
        drop(frame_tx);
        task.await.unwrap();

        assert_eq!(stats.snapshot().egress_skipped, 3);
        assert_eq!(stats.snapshot().egress_sent, 0);
    }
}
