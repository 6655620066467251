//! # In-Process Room
//!
//! A [`RoomAudioPort`] that keeps rooms, participants and tracks in memory.
//! Selected with `room.backend = "memory"` for local runs without a room
//! server, and used by the bridge tests as their room double.
//!
//! ## Key Features:
//! - **Bounded submit queues**: a synthetic track holds at most
//!   `submit_queue_depth` frames, further submissions report `Dropped`
//! - **Remote feeds**: tests play the part of another participant (the
//!   agent) publishing into a room
//! - **Failure injection**: tests can make rooms refuse connections or
//!   publications
//! - **Loopback**: optionally mirrors each published track back into the room

use super::{
    PcmFrameStream, RemoteAudioTrack, RemoteTrack, RoomAudioPort, RoomConnection,
    RoomCredentials, SubmitOutcome, SubscriptionSlot, SyntheticTrack, TrackOptions, TrackSource,
    TrackSubscribedHandler,
};
use crate::audio::frame::PcmFrame;
use crate::config::RoomConfig;
use crate::error::{BridgeError, BridgeResult};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Frames buffered between a remote feed and the subscriber's stream.
const REMOTE_FEED_DEPTH: usize = 64;

/// Shared handle to the in-process room service.
#[derive(Clone)]
pub struct MemoryRoomHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    rooms: RwLock<HashMap<String, Vec<Arc<MemoryRoomConnection>>>>,
    refuse_connect: RwLock<HashSet<String>>,
    refuse_publish: RwLock<HashSet<String>>,
    submit_queue_depth: usize,
    loopback: bool,
    next_sid: AtomicU64,
}

impl HubInner {
    fn next_sid(&self, prefix: &str) -> String {
        format!("{}_{}", prefix, self.next_sid.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn connections(&self, room_name: &str) -> Vec<Arc<MemoryRoomConnection>> {
        self.rooms
            .read()
            .unwrap()
            .get(room_name)
            .cloned()
            .unwrap_or_default()
    }

    fn remote_audio_feed(&self, room_name: &str, participant: &str) -> RemoteAudioFeed {
        let sid = self.next_sid("TR_AUDIO");
        let senders = self
            .connections(room_name)
            .iter()
            .filter_map(|connection| connection.attach_audio(&sid, participant))
            .collect();

        RemoteAudioFeed { senders }
    }
}

impl MemoryRoomHub {
    pub fn from_config(config: &RoomConfig) -> Self {
        Self::build(config.submit_queue_depth, config.loopback)
    }

    fn build(submit_queue_depth: usize, loopback: bool) -> Self {
        Self {
            inner: Arc::new(HubInner {
                rooms: RwLock::new(HashMap::new()),
                refuse_connect: RwLock::new(HashSet::new()),
                refuse_publish: RwLock::new(HashSet::new()),
                submit_queue_depth: submit_queue_depth.max(1),
                loopback,
                next_sid: AtomicU64::new(0),
            }),
        }
    }
}

#[cfg(test)]
impl MemoryRoomHub {
    pub fn new(submit_queue_depth: usize) -> Self {
        Self::build(submit_queue_depth, false)
    }

    /// Make every future `connect` to `room_name` fail.
    pub fn refuse_connections_to(&self, room_name: &str) {
        self.inner.refuse_connect.write().unwrap().insert(room_name.to_string());
    }

    /// Make every future track publication in `room_name` fail.
    pub fn refuse_publications_in(&self, room_name: &str) {
        self.inner.refuse_publish.write().unwrap().insert(room_name.to_string());
    }

    /// Connections currently joined to `room_name`.
    pub fn connections(&self, room_name: &str) -> Vec<Arc<MemoryRoomConnection>> {
        self.inner.connections(room_name)
    }

    pub fn room_count(&self) -> usize {
        self.inner.rooms.read().unwrap().len()
    }

    /// Publish a new audio track into `room_name` on behalf of `participant`.
    ///
    /// Every connection currently in the room gets its own subscription;
    /// frames sent through the returned feed reach all of them in order.
    pub fn publish_remote_audio(&self, room_name: &str, participant: &str) -> RemoteAudioFeed {
        self.inner.remote_audio_feed(room_name, participant)
    }

    /// Publish a non-audio track (video, data) into `room_name`.
    pub fn publish_remote_track(&self, room_name: &str, kind: &str) -> String {
        let sid = self.inner.next_sid("TR_OTHER");
        for connection in self.inner.connections(room_name) {
            connection.deliver(RemoteTrack::Other {
                sid: sid.clone(),
                kind: kind.to_string(),
            });
        }
        sid
    }
}

#[async_trait]
impl RoomAudioPort for MemoryRoomHub {
    async fn connect(
        &self,
        room_name: &str,
        credentials: &RoomCredentials,
    ) -> BridgeResult<Arc<dyn RoomConnection>> {
        if self.inner.refuse_connect.read().unwrap().contains(room_name) {
            return Err(BridgeError::RoomConnect(format!(
                "room {} refused the connection",
                room_name
            )));
        }

        if !credentials.permits_join(room_name) {
            return Err(BridgeError::RoomConnect(format!(
                "credentials for {} do not permit joining {}",
                credentials.identity, room_name
            )));
        }

        let connection = Arc::new(MemoryRoomConnection {
            room_name: room_name.to_string(),
            identity: credentials.identity.clone(),
            hub: Arc::downgrade(&self.inner),
            subscriptions: SubscriptionSlot::default(),
            tracks: Mutex::new(Vec::new()),
            closed: CancellationToken::new(),
            left: AtomicBool::new(false),
            disconnect_calls: AtomicUsize::new(0),
        });

        self.inner
            .rooms
            .write()
            .unwrap()
            .entry(room_name.to_string())
            .or_default()
            .push(connection.clone());

        info!(
            room = %room_name,
            identity = %credentials.identity,
            name = %credentials.display_name,
            "Participant joined in-process room"
        );
        Ok(connection)
    }
}

/// One participant's connection to an in-process room.
pub struct MemoryRoomConnection {
    room_name: String,
    identity: String,
    hub: Weak<HubInner>,
    subscriptions: SubscriptionSlot,
    tracks: Mutex<Vec<Arc<MemoryTrack>>>,
    closed: CancellationToken,
    left: AtomicBool,
    disconnect_calls: AtomicUsize,
}

#[cfg(test)]
impl MemoryRoomConnection {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Tracks this participant has published, including unpublished ones.
    pub fn published_tracks(&self) -> Vec<Arc<MemoryTrack>> {
        self.tracks.lock().unwrap().clone()
    }

    pub fn is_disconnected(&self) -> bool {
        self.left.load(Ordering::Acquire)
    }

    /// How many times `disconnect` was called, including no-op repeats.
    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::Acquire)
    }
}

impl MemoryRoomConnection {
    fn attach_audio(&self, sid: &str, participant: &str) -> Option<mpsc::Sender<PcmFrame>> {
        if self.closed.is_cancelled() {
            return None;
        }

        let (tx, rx) = mpsc::channel(REMOTE_FEED_DEPTH);
        let frames: PcmFrameStream = ReceiverStream::new(rx)
            .take_until(self.closed.clone().cancelled_owned())
            .boxed();

        self.deliver(RemoteTrack::Audio(RemoteAudioTrack::new(sid, participant, frames)));
        Some(tx)
    }

    fn deliver(&self, track: RemoteTrack) {
        if self.closed.is_cancelled() {
            return;
        }

        debug!(room = %self.room_name, track = track.sid(), "Delivering subscribed track");
        self.subscriptions.deliver(track);
    }

    fn start_loopback(&self, hub: &HubInner, track: &MemoryTrack) {
        let Some(mut frames) = track.take_frames() else {
            return;
        };
        let feed = hub.remote_audio_feed(&self.room_name, &format!("{}-loopback", self.identity));
        let closed = self.closed.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    frame = frames.recv() => match frame {
                        Some(frame) => {
                            if feed.send(frame).await == 0 && feed.is_closed() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });
    }
}

#[async_trait]
impl RoomConnection for MemoryRoomConnection {
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

        let hub = self
            .hub
            .upgrade()
            .ok_or_else(|| BridgeError::Publish("room service has shut down".to_string()))?;

        if hub.refuse_publish.read().unwrap().contains(&self.room_name) {
            return Err(BridgeError::Publish(format!(
                "room {} refused track {}",
                self.room_name, options.name
            )));
        }

        let (queue, frames) = mpsc::channel(hub.submit_queue_depth);
        let track = Arc::new(MemoryTrack {
            sid: hub.next_sid("TR_LOCAL"),
            name: options.name,
            sample_rate: options.sample_rate,
            channels: options.channels,
            source: options.source,
            queue,
            frames: Mutex::new(Some(frames)),
            published: AtomicBool::new(true),
            accepted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        self.tracks.lock().unwrap().push(track.clone());
        info!(
            room = %self.room_name,
            track = %track.name,
            sid = %track.sid,
            source = ?track.source,
            sample_rate = track.sample_rate,
            "Published synthetic track"
        );

        if hub.loopback {
            self.start_loopback(&hub, &track);
        }

        Ok(track)
    }

    fn on_track_subscribed(&self, handler: TrackSubscribedHandler) {
        if self.closed.is_cancelled() {
            return;
        }
        self.subscriptions.register(handler);
    }

    async fn disconnect(&self) {
        self.disconnect_calls.fetch_add(1, Ordering::AcqRel);
        if self.left.swap(true, Ordering::AcqRel) {
            return;
        }

        self.closed.cancel();
        for track in self.tracks.lock().unwrap().iter() {
            track.unpublish();
        }
        self.subscriptions.clear();

        if let Some(hub) = self.hub.upgrade() {
            let mut rooms = hub.rooms.write().unwrap();
            if let Some(members) = rooms.get_mut(&self.room_name) {
                members.retain(|member| !std::ptr::eq(member.as_ref(), self));
                if members.is_empty() {
                    rooms.remove(&self.room_name);
                }
            }
        }

        info!(room = %self.room_name, identity = %self.identity, "Participant left in-process room");
    }
}

/// Synthetic track published into an in-process room.
pub struct MemoryTrack {
    sid: String,
    name: String,
    sample_rate: u32,
    channels: u16,
    source: TrackSource,
    queue: mpsc::Sender<PcmFrame>,
    frames: Mutex<Option<mpsc::Receiver<PcmFrame>>>,
    published: AtomicBool,
    accepted: AtomicU64,
    dropped: AtomicU64,
}

#[cfg(test)]
impl MemoryTrack {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> TrackSource {
        self.source
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl MemoryTrack {
    pub fn is_published(&self) -> bool {
        self.published.load(Ordering::Acquire)
    }

    /// Take the receiving end of the submit queue. Only the first call
    /// gets it; until then queued frames simply accumulate.
    pub fn take_frames(&self) -> Option<mpsc::Receiver<PcmFrame>> {
        self.frames.lock().unwrap().take()
    }

    fn unpublish(&self) {
        self.published.store(false, Ordering::Release);
    }
}

impl SyntheticTrack for MemoryTrack {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn submit_frame(&self, frame: PcmFrame) -> SubmitOutcome {
        if !self.is_published() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return SubmitOutcome::Dropped;
        }

        match self.queue.try_send(frame) {
            Ok(()) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                SubmitOutcome::Accepted
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                SubmitOutcome::Dropped
            }
        }
    }
}

/// Sending side of a remote participant's audio track.
pub struct RemoteAudioFeed {
    senders: Vec<mpsc::Sender<PcmFrame>>,
}

impl RemoteAudioFeed {
    /// Send one frame to every live subscriber, returning how many took it.
    pub async fn send(&self, frame: PcmFrame) -> usize {
        let mut delivered = 0;
        for sender in &self.senders {
            if sender.send(frame.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Whether every subscriber has gone away.
    pub fn is_closed(&self) -> bool {
        self.senders.iter().all(|sender| sender.is_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::room::{ConfiguredCredentialIssuer, CredentialIssuer};

    fn credentials(room: &str) -> RoomCredentials {
        ConfiguredCredentialIssuer::new(&AppConfig::default().room)
            .issue(room, "phone-+15550100", "Phone Caller")
            .unwrap()
    }

    fn caller_track() -> TrackOptions {
        TrackOptions {
            name: "phone-audio".to_string(),
            sample_rate: 8000,
            channels: 1,
            source: TrackSource::Microphone,
        }
    }

    #[tokio::test]
    async fn test_connect_checks_credentials_and_refusals() {
        let hub = MemoryRoomHub::new(4);

        assert!(hub.connect("call-CA2", &credentials("call-CA1")).await.is_err());

        hub.refuse_connections_to("call-CA1");
        let err = hub.connect("call-CA1", &credentials("call-CA1")).await.err().unwrap();
        assert_eq!(err.kind(), "room_connect_error");
        assert_eq!(hub.room_count(), 0);
    }

    #[tokio::test]
    async fn test_submit_drops_when_queue_is_full() {
        let hub = MemoryRoomHub::new(2);
        let connection = hub.connect("call-CA1", &credentials("call-CA1")).await.unwrap();
        let track = connection.publish_synthetic_track(caller_track()).await.unwrap();

        let frame = || PcmFrame::new(vec![0; 160], 8000, 1);
        assert_eq!(track.submit_frame(frame()), SubmitOutcome::Accepted);
        assert_eq!(track.submit_frame(frame()), SubmitOutcome::Accepted);
        assert_eq!(track.submit_frame(frame()), SubmitOutcome::Dropped);

        let member = hub.connections("call-CA1").remove(0);
        let published = member.published_tracks().remove(0);
        let mut frames = published.take_frames().unwrap();
        assert_eq!(frames.recv().await.unwrap().samples.len(), 160);
        assert_eq!(track.submit_frame(frame()), SubmitOutcome::Accepted);
        assert_eq!(published.dropped(), 1);
        assert_eq!(published.source(), TrackSource::Microphone);
    }

    #[tokio::test]
    async fn test_tracks_wait_for_a_handler() {
        let hub = MemoryRoomHub::new(4);
        let connection = hub.connect("call-CA1", &credentials("call-CA1")).await.unwrap();
        let feed = hub.publish_remote_audio("call-CA1", "agent");
        hub.publish_remote_track("call-CA1", "video");

        let (tx, mut rx) = mpsc::unbounded_channel();
        connection.on_track_subscribed(Box::new(move |track| {
            let _ = tx.send(track);
        }));

        let audio = match rx.recv().await.unwrap() {
            RemoteTrack::Audio(track) => track,
            other => panic!("expected audio, got {:?}", other),
        };
        assert_eq!(audio.participant_identity, "agent");
        assert!(matches!(rx.recv().await.unwrap(), RemoteTrack::Other { .. }));

        let mut frames = audio.subscribe();
        assert_eq!(feed.send(PcmFrame::new(vec![7; 480], 48000, 1)).await, 1);
        assert_eq!(frames.next().await.unwrap().samples[0], 7);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_ends_streams() {
        let hub = MemoryRoomHub::new(4);
        let connection = hub.connect("call-CA1", &credentials("call-CA1")).await.unwrap();
        let track = connection.publish_synthetic_track(caller_track()).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        connection.on_track_subscribed(Box::new(move |track| {
            let _ = tx.send(track);
        }));
        let _feed = hub.publish_remote_audio("call-CA1", "agent");
        let mut frames = match rx.recv().await.unwrap() {
            RemoteTrack::Audio(track) => track.subscribe(),
            other => panic!("expected audio, got {:?}", other),
        };

        let member = hub.connections("call-CA1")[0].clone();
        connection.disconnect().await;
        connection.disconnect().await;

        assert!(frames.next().await.is_none());
        assert!(member.is_disconnected());
        assert_eq!(member.disconnect_calls(), 2);
        assert_eq!(hub.room_count(), 0);
        assert_eq!(
            track.submit_frame(PcmFrame::new(vec![0; 160], 8000, 1)),
            SubmitOutcome::Dropped
        );
    }

    #[tokio::test]
    async fn test_loopback_mirrors_published_audio() {
        let mut config = AppConfig::default().room;
        config.loopback = true;
        let hub = MemoryRoomHub::from_config(&config);
        let connection = hub.connect("call-CA1", &credentials("call-CA1")).await.unwrap();
        let track = connection.publish_synthetic_track(caller_track()).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        connection.on_track_subscribed(Box::new(move |track| {
            let _ = tx.send(track);
        }));

        let mut frames = match rx.recv().await.unwrap() {
            RemoteTrack::Audio(track) => {
                assert_eq!(track.participant_identity, "phone-+15550100-loopback");
                track.subscribe()
            }
            other => panic!("expected audio, got {:?}", other),
        };

        track.submit_frame(PcmFrame::new(vec![42; 160], 8000, 1));
        let echoed = frames.next().await.unwrap();
        assert_eq!(echoed.samples.len(), 160);
        assert_eq!(echoed.samples[0], 42);
    }
}
