//! # Room Audio Port
//!
//! The bridge never talks to a media-room server directly. Everything it
//! needs from the room side goes through the traits in this module:
//!
//! | Operation              | Where                                       |
//! |------------------------|---------------------------------------------|
//! | connect                | [`RoomAudioPort::connect`]                  |
//! | publish synthetic track| [`RoomConnection::publish_synthetic_track`] |
//! | submit frame           | [`SyntheticTrack::submit_frame`]            |
//! | on track subscribed    | [`RoomConnection::on_track_subscribed`]     |
//! | subscribe              | [`RemoteAudioTrack::subscribe`]             |
//! | disconnect             | [`RoomConnection::disconnect`]              |
//!
//! `submit_frame` is synchronous and never waits: implementations queue the
//! frame or report [`SubmitOutcome::Dropped`]. `disconnect` is idempotent and
//! ends every frame stream handed out by the connection.
//!
//! ## Backends:
//! - **livekit**: a LiveKit server, the production backend
//! - **memory**: rooms kept in-process, for local runs and tests

pub mod credentials;
pub mod livekit;
pub mod memory;

use crate::audio::frame::PcmFrame;
use crate::error::BridgeResult;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::fmt;
use std::sync::{Arc, Mutex};

pub use credentials::{ConfiguredCredentialIssuer, CredentialIssuer, RoomCredentials};
pub use livekit::LiveKitRoomPort;
pub use memory::MemoryRoomHub;

/// Entry point to a media-room service.
#[async_trait]
pub trait RoomAudioPort: Send + Sync {
    /// Join `room_name` with the given credentials. Failures are final.
    async fn connect(
        &self,
        room_name: &str,
        credentials: &RoomCredentials,
    ) -> BridgeResult<Arc<dyn RoomConnection>>;
}

/// A live connection to one room.
#[async_trait]
pub trait RoomConnection: Send + Sync {
    fn room_name(&self) -> &str;

    /// Create and publish a local audio track fed by [`SyntheticTrack::submit_frame`].
    async fn publish_synthetic_track(
        &self,
        options: TrackOptions,
    ) -> BridgeResult<Arc<dyn SyntheticTrack>>;

    /// Register the callback invoked once per newly subscribed remote track.
    /// Replaces any previously registered callback.
    fn on_track_subscribed(&self, handler: TrackSubscribedHandler);

    /// Leave the room, unpublishing local tracks and ending all subscriptions.
    async fn disconnect(&self);
}

/// Local audio track whose samples come from the bridge.
pub trait SyntheticTrack: Send + Sync {
    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;

    /// Queue one frame without waiting.
    fn submit_frame(&self, frame: PcmFrame) -> SubmitOutcome;
}

/// Result of handing a frame to a synthetic track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    /// Queue full or track gone; the frame was discarded
    Dropped,
}

/// Where a published track claims its audio comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    Microphone,
    Unknown,
}

/// Options for publishing the synthetic caller track.
#[derive(Debug, Clone)]
pub struct TrackOptions {
    pub name: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub source: TrackSource,
}

/// Callback run for every remote track the connection subscribes to.
pub type TrackSubscribedHandler = Box<dyn Fn(RemoteTrack) + Send + Sync>;

/// Lazy, ordered sequence of frames from one remote track.
pub type PcmFrameStream = BoxStream<'static, PcmFrame>;

/// A track published by another room participant.
pub enum RemoteTrack {
    Audio(RemoteAudioTrack),
    /// Video, data or anything else the bridge does not relay
    Other { sid: String, kind: String },
}

impl RemoteTrack {
    pub fn sid(&self) -> &str {
        match self {
            RemoteTrack::Audio(track) => &track.sid,
            RemoteTrack::Other { sid, .. } => sid,
        }
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteTrack::Audio(track) => f
                .debug_struct("Audio")
                .field("sid", &track.sid)
                .field("participant", &track.participant_identity)
                .finish(),
            RemoteTrack::Other { sid, kind } => f
                .debug_struct("Other")
                .field("sid", sid)
                .field("kind", kind)
                .finish(),
        }
    }
}

/// Remote audio track handed to the subscription callback.
pub struct RemoteAudioTrack {
    pub sid: String,
    pub participant_identity: String,
    frames: PcmFrameStream,
}

impl RemoteAudioTrack {
    pub fn new(
        sid: impl Into<String>,
        participant_identity: impl Into<String>,
        frames: PcmFrameStream,
    ) -> Self {
        Self {
            sid: sid.into(),
            participant_identity: participant_identity.into(),
            frames,
        }
    }

    /// Consume the track and start receiving its frames.
    pub fn subscribe(self) -> PcmFrameStream {
        self.frames
    }
}

type SharedHandler = Arc<dyn Fn(RemoteTrack) + Send + Sync>;

/// The subscription callback of one connection, plus the tracks that were
/// subscribed before any callback was registered.
#[derive(Default)]
pub struct SubscriptionSlot {
    handler: Mutex<Option<SharedHandler>>,
    pending: Mutex<Vec<RemoteTrack>>,
}

impl SubscriptionSlot {
    /// Install `handler` and replay every pending track through it.
    pub fn register(&self, handler: TrackSubscribedHandler) {
        let handler: SharedHandler = Arc::from(handler);
        let pending = {
            let mut guard = self.handler.lock().unwrap();
            *guard = Some(handler.clone());
            std::mem::take(&mut *self.pending.lock().unwrap())
        };

        for track in pending {
            handler(track);
        }
    }

    /// Hand `track` to the handler, or hold it until one is registered.
    /// The handler runs without any lock held.
    pub fn deliver(&self, track: RemoteTrack) {
        let handler = {
            let guard = self.handler.lock().unwrap();
            match guard.as_ref() {
                Some(handler) => handler.clone(),
                None => {
                    self.pending.lock().unwrap().push(track);
                    return;
                }
            }
        };

        handler(track);
    }

    /// Forget the handler and any held tracks.
    pub fn clear(&self) {
        self.handler.lock().unwrap().take();
        self.pending.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn video(sid: &str) -> RemoteTrack {
        RemoteTrack::Other {
            sid: sid.to_string(),
            kind: "video".to_string(),
        }
    }

    #[test]
    fn test_slot_replays_pending_tracks_in_order() {
        let slot = SubscriptionSlot::default();
        slot.deliver(video("TR_1"));
        slot.deliver(video("TR_2"));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        slot.register(Box::new(move |track| sink.lock().unwrap().push(track.sid().to_string())));
        slot.deliver(video("TR_3"));

        assert_eq!(*seen.lock().unwrap(), vec!["TR_1", "TR_2", "TR_3"]);
    }

    #[test]
    fn test_cleared_slot_holds_tracks_again() {
        let slot = SubscriptionSlot::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        slot.register(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        slot.deliver(video("TR_1"));
        slot.clear();
        slot.deliver(video("TR_2"));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(slot.pending.lock().unwrap().len(), 1);
    }
}
