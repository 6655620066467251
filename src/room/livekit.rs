//! # LiveKit Room
//!
//! [`RoomAudioPort`] backed by a LiveKit server.
//!
//! ## Mapping:
//! - **connect**: `Room::connect` with the participant's signed token. A task
//!   per connection drains the room's event channel and turns every
//!   `TrackSubscribed` into a [`RemoteTrack`]
//! - **publish**: a `NativeAudioSource` wrapped in a `LocalAudioTrack`,
//!   published as a microphone. Submitted frames go through a bounded queue
//!   to a pump task that awaits `capture_frame`
//! - **subscribe**: a `NativeAudioStream` over the remote track, resampled by
//!   LiveKit to `room_sample_rate`, mono
//! - **disconnect**: cancels the connection token, which ends every stream
//!   and pump, then closes the room

use super::{
    PcmFrameStream, RemoteAudioTrack, RemoteTrack, RoomAudioPort, RoomConnection,
    RoomCredentials, SubmitOutcome, SubscriptionSlot, SyntheticTrack, TrackOptions, TrackSource,
    TrackSubscribedHandler,
};
use crate::audio::frame::PcmFrame;
use crate::config::AppConfig;
use crate::error::{BridgeError, BridgeResult};
use async_trait::async_trait;
use futures_util::StreamExt;
use livekit::options::TrackPublishOptions;
use livekit::prelude::{LocalAudioTrack, LocalTrack, Room, RoomEvent, RoomOptions};
use livekit::track::TrackSource as LiveKitTrackSource;
use livekit::webrtc::audio_frame::AudioFrame;
use livekit::webrtc::audio_source::native::NativeAudioSource;
use livekit::webrtc::audio_source::{AudioSourceOptions, RtcAudioSource};
use livekit::webrtc::audio_stream::native::NativeAudioStream;
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Remote tracks are always received as mono.
const REMOTE_CHANNELS: u16 = 1;

/// Audio LiveKit's native source buffers ahead of the encoder.
const SOURCE_QUEUE_MS: u32 = 100;

/// Joins LiveKit rooms at one server URL.
#[derive(Debug, Clone)]
pub struct LiveKitRoomPort {
    url: String,
    /// Rate remote tracks are delivered at
    remote_sample_rate: u32,
    submit_queue_depth: usize,
}

impl LiveKitRoomPort {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            url: config.room.url.clone(),
            remote_sample_rate: config.bridge.room_sample_rate,
            submit_queue_depth: config.room.submit_queue_depth.max(1),
        }
    }
}

#[async_trait]
impl RoomAudioPort for LiveKitRoomPort {
    async fn connect(
        &self,
        room_name: &str,
        credentials: &RoomCredentials,
    ) -> BridgeResult<Arc<dyn RoomConnection>> {
        if !credentials.permits_join(room_name) {
            return Err(BridgeError::RoomConnect(format!(
                "credentials for {} do not permit joining {}",
                credentials.identity, room_name
            )));
        }

        let (room, events) = Room::connect(&self.url, &credentials.token, RoomOptions::default())
            .await
            .map_err(|e| BridgeError::RoomConnect(format!("{} at {}: {}", room_name, self.url, e)))?;

        let connection = Arc::new(LiveKitConnection {
            room_name: room_name.to_string(),
            identity: credentials.identity.clone(),
            room,
            subscriptions: Arc::new(SubscriptionSlot::default()),
            closed: CancellationToken::new(),
            left: AtomicBool::new(false),
            submit_queue_depth: self.submit_queue_depth,
        });

        tokio::spawn(dispatch_events(
            events,
            connection.room_name.clone(),
            connection.subscriptions.clone(),
            connection.closed.clone(),
            self.remote_sample_rate,
        ));

        info!(
            room = %room_name,
            identity = %credentials.identity,
            name = %credentials.display_name,
            url = %self.url,
            "Participant joined LiveKit room"
        );
        Ok(connection)
    }
}

/// Forward subscriptions until the room goes away or the connection closes.
async fn dispatch_events(
    mut events: mpsc::UnboundedReceiver<RoomEvent>,
    room_name: String,
    subscriptions: Arc<SubscriptionSlot>,
    closed: CancellationToken,
    remote_sample_rate: u32,
) {
    loop {
        let event = tokio::select! {
            _ = closed.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            RoomEvent::TrackSubscribed {
                track, participant, ..
            } => {
                let participant_identity = String::from(participant.identity());
                let track = remote_track(track, participant_identity, remote_sample_rate, &closed);
                debug!(room = %room_name, track = track.sid(), "Delivering subscribed track");
                subscriptions.deliver(track);
            }
            RoomEvent::Disconnected { reason } => {
                warn!(room = %room_name, reason = ?reason, "LiveKit room disconnected");
                break;
            }
            _ => {}
        }
    }
}

fn remote_track(
    track: livekit::prelude::RemoteTrack,
    participant_identity: String,
    sample_rate: u32,
    closed: &CancellationToken,
) -> RemoteTrack {
    match track {
        livekit::prelude::RemoteTrack::Audio(audio) => {
            let sid = String::from(audio.sid());
            let frames: PcmFrameStream = NativeAudioStream::new(
                audio.rtc_track(),
                sample_rate as i32,
                REMOTE_CHANNELS as i32,
            )
            .map(|frame| pcm_frame(&frame))
            .take_until(closed.clone().cancelled_owned())
            .boxed();

            RemoteTrack::Audio(RemoteAudioTrack::new(sid, participant_identity, frames))
        }
        livekit::prelude::RemoteTrack::Video(video) => RemoteTrack::Other {
            sid: String::from(video.sid()),
            kind: "video".to_string(),
        },
    }
}

fn pcm_frame(frame: &AudioFrame<'_>) -> PcmFrame {
    PcmFrame::new(frame.data.to_vec(), frame.sample_rate, frame.num_channels as u16)
}

fn audio_frame(frame: &PcmFrame) -> AudioFrame<'_> {
    let channels = frame.channels.max(1) as u32;
    AudioFrame {
        data: Cow::Borrowed(&*frame.samples),
        sample_rate: frame.sample_rate,
        num_channels: channels,
        samples_per_channel: frame.samples.len() as u32 / channels,
    }
}

fn publish_source(source: TrackSource) -> LiveKitTrackSource {
    match source {
        TrackSource::Microphone => LiveKitTrackSource::Microphone,
        TrackSource::Unknown => LiveKitTrackSource::Unknown,
    }
}

/// One participant's connection to a LiveKit room.
pub struct LiveKitConnection {
    room_name: String,
    identity: String,
    room: Room,
    subscriptions: Arc<SubscriptionSlot>,
    closed: CancellationToken,
    left: AtomicBool,
    submit_queue_depth: usize,
}

#[async_trait]
impl RoomConnection for LiveKitConnection {
    fn room_name(&self) -> &str {
        &self.room_name
    }

    async fn publish_synthetic_track(
        &self,
        options: TrackOptions,
    ) -> BridgeResult<Arc<dyn SyntheticTrack>> {
        if self.closed.is_cancelled() {
            return Err(BridgeError::Publish("connection is closed".to_string()));
        }

        if options.sample_rate == 0 || options.channels == 0 {
            return Err(BridgeError::Publish(format!(
                "invalid track format {}Hz x{}",
                options.sample_rate, options.channels
            )));
        }

        let source = NativeAudioSource::new(
            AudioSourceOptions::default(),
            options.sample_rate,
            options.channels as u32,
            SOURCE_QUEUE_MS,
        );
        let local = LocalAudioTrack::create_audio_track(
            &options.name,
            RtcAudioSource::Native(source.clone()),
        );

        self.room
            .local_participant()
            .publish_track(
                LocalTrack::Audio(local),
                TrackPublishOptions {
                    source: publish_source(options.source),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| {
                BridgeError::Publish(format!("room {} refused track {}: {}", self.room_name, options.name, e))
            })?;

        let (queue, frames) = mpsc::channel(self.submit_queue_depth);
        tokio::spawn(pump_frames(source, frames, self.closed.clone(), options.name.clone()));

        info!(
            room = %self.room_name,
            track = %options.name,
            sample_rate = options.sample_rate,
            "Published synthetic track"
        );

        Ok(Arc::new(LiveKitTrack {
            sample_rate: options.sample_rate,
            channels: options.channels,
            queue,
            closed: self.closed.clone(),
        }))
    }

    fn on_track_subscribed(&self, handler: TrackSubscribedHandler) {
        if self.closed.is_cancelled() {
            return;
        }
        self.subscriptions.register(handler);
    }

    async fn disconnect(&self) {
        if self.left.swap(true, Ordering::AcqRel) {
            return;
        }

        self.closed.cancel();
        self.subscriptions.clear();

        if let Err(err) = self.room.close().await {
            warn!(room = %self.room_name, identity = %self.identity, error = %err, "LiveKit room did not close cleanly");
        }
        info!(room = %self.room_name, identity = %self.identity, "Participant left LiveKit room");
    }
}

/// Feed queued frames into the native source, one at a time.
async fn pump_frames(
    source: NativeAudioSource,
    mut frames: mpsc::Receiver<PcmFrame>,
    closed: CancellationToken,
    track_name: String,
) {
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        if let Err(err) = source.capture_frame(&audio_frame(&frame)).await {
            debug!(track = %track_name, error = %err, "LiveKit source rejected frame");
        }
    }
    debug!(track = %track_name, "Synthetic track pump stopped");
}

/// Synthetic track published into a LiveKit room.
pub struct LiveKitTrack {
    sample_rate: u32,
    channels: u16,
    queue: mpsc::Sender<PcmFrame>,
    closed: CancellationToken,
}

impl SyntheticTrack for LiveKitTrack {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn submit_frame(&self, frame: PcmFrame) -> SubmitOutcome {
        if self.closed.is_cancelled() {
            return SubmitOutcome::Dropped;
        }

        match self.queue.try_send(frame) {
            Ok(()) => SubmitOutcome::Accepted,
            Err(_) => SubmitOutcome::Dropped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(depth: usize) -> (LiveKitTrack, mpsc::Receiver<PcmFrame>) {
        let (queue, frames) = mpsc::channel(depth);
        let track = LiveKitTrack {
            sample_rate: 8000,
            channels: 1,
            queue,
            closed: CancellationToken::new(),
        };
        (track, frames)
    }

    #[test]
    fn test_port_subscribes_at_room_rate() {
        let mut config = AppConfig::default();
        config.bridge.room_sample_rate = 16000;
        config.room.url = "wss://rooms.example.com".to_string();

        let port = LiveKitRoomPort::from_config(&config);
        assert_eq!(port.remote_sample_rate, 16000);
        assert_eq!(port.url, "wss://rooms.example.com");
        assert_eq!(port.submit_queue_depth, config.room.submit_queue_depth);
    }

    #[test]
    fn test_stereo_frame_reports_samples_per_channel() {
        let frame = PcmFrame::new(vec![1, -1, 2, -2, 3, -3], 48000, 2);
        let audio = audio_frame(&frame);

        assert_eq!(audio.num_channels, 2);
        assert_eq!(audio.samples_per_channel, 3);
        assert_eq!(audio.sample_rate, 48000);
        assert_eq!(&audio.data[..], &[1, -1, 2, -2, 3, -3]);

        let back = pcm_frame(&audio);
        assert_eq!(back.channels, 2);
        assert_eq!(&back.samples[..], &frame.samples[..]);
    }

    #[test]
    fn test_track_source_mapping() {
        assert!(matches!(
            publish_source(TrackSource::Microphone),
            LiveKitTrackSource::Microphone
        ));
        assert!(matches!(
            publish_source(TrackSource::Unknown),
            LiveKitTrackSource::Unknown
        ));
    }

    #[tokio::test]
    async fn test_submit_drops_when_pump_is_behind() {
        let (track, mut frames) = track(2);
        let frame = || PcmFrame::new(vec![0; 160], 8000, 1);

        assert_eq!(track.submit_frame(frame()), SubmitOutcome::Accepted);
        assert_eq!(track.submit_frame(frame()), SubmitOutcome::Accepted);
        assert_eq!(track.submit_frame(frame()), SubmitOutcome::Dropped);

        assert_eq!(frames.recv().await.unwrap().samples.len(), 160);
        assert_eq!(track.submit_frame(frame()), SubmitOutcome::Accepted);
    }

    #[test]
    fn test_closed_track_drops_everything() {
        let (track, _frames) = track(4);
        track.closed.cancel();
        assert_eq!(
            track.submit_frame(PcmFrame::new(vec![0; 160], 8000, 1)),
            SubmitOutcome::Dropped
        );
    }
}
