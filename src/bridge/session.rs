//! # Call Bridge Session
//!
//! One session per inbound duplex connection. It owns the room connection,
//! the synthetic caller track and every egress relay for that call.
//!
//! ## Session Lifecycle:
//! 1. **AwaitingStart**: only a `start` signal does anything
//! 2. **Bridging**: `media` flows caller → room, relays flow room → caller
//! 3. **Stopping**: `stop`, duplex close or shutdown was seen; tearing down
//! 4. **Closed**: room released, relays finished, registry entry removed
//!
//! A failed start (credentials, connect, publish) goes straight from
//! AwaitingStart to Closed.
//!
//! ## Concurrency:
//! The receive loop handles one signal at a time, in arrival order, from an
//! [`InboundReceiver`](super::inbound::InboundReceiver). Relays run
//! as separate tokio tasks and share nothing with the loop except the stats
//! counters and the cancellation token. Teardown may be triggered from the
//! loop, from a [`SessionHandle`] or from both at once; a compare-and-swap
//! guard makes its side effects happen exactly once.

use super::egress::EgressRelay;
use super::inbound::{inbound_queue, DuplexEvent, InboundReceiver, InboundSender};
use super::ingress::IngressPipeline;
use super::registry::{CallPresence, SessionRegistry};
use super::stats::{SessionStats, SessionStatsSnapshot};
use super::wire::{self, CallMetadata, InboundSignal, OutboundSignal, SequenceNumber, StartInfo};
use crate::audio::buffer::FramePool;
use crate::audio::frame::WireFormat;
use crate::config::AppConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::room::{
    CredentialIssuer, RemoteTrack, RoomAudioPort, RoomConnection, SubmitOutcome, TrackOptions,
    TrackSource,
};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Everything a session needs from the rest of the process.
#[derive(Clone)]
pub struct BridgeContext {
    pub config: Arc<AppConfig>,
    pub registry: SessionRegistry,
    pub room_port: Arc<dyn RoomAudioPort>,
    pub credentials: Arc<dyn CredentialIssuer>,
    pub frame_pool: FramePool,
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
    AwaitingStart,
    Bridging,
    Stopping,
    Closed,
}

impl BridgeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeState::AwaitingStart => "awaiting_start",
            BridgeState::Bridging => "bridging",
            BridgeState::Stopping => "stopping",
            BridgeState::Closed => "closed",
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

struct SessionShared {
    connection_id: String,
    state: watch::Sender<BridgeState>,
    call: RwLock<Option<CallMetadata>>,
    wire: WireFormat,
    torn_down: AtomicBool,
    registered: AtomicBool,
    aborted: AtomicBool,
    cancel: CancellationToken,
    room: Mutex<Option<Arc<dyn RoomConnection>>>,
    outbound: Mutex<Option<mpsc::Sender<OutboundSignal>>>,
    /// Egress relays by remote track sid
    relays: Mutex<HashMap<String, JoinHandle<()>>>,
    stats: Arc<SessionStats>,
    registry: SessionRegistry,
}

impl SessionShared {
    fn status(&self) -> BridgeState {
        *self.state.borrow()
    }

    fn set_status(&self, status: BridgeState) {
        self.state.send_replace(status);
    }

    fn call(&self) -> Option<CallMetadata> {
        self.call.read().unwrap().clone()
    }

    /// Move from `from` to `to` if the session is still in `from`.
    fn transition(&self, from: BridgeState, to: BridgeState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// AwaitingStart → Bridging, unless teardown has already begun.
    fn enter_bridging(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == BridgeState::AwaitingStart && !self.torn_down.load(Ordering::SeqCst) {
                *state = BridgeState::Bridging;
                true
            } else {
                false
            }
        })
    }

    /// Keep the room connection for teardown, unless teardown already began.
    fn adopt_room(&self, room: Arc<dyn RoomConnection>) -> bool {
        let mut slot = self.room.lock().unwrap();
        if self.torn_down.load(Ordering::SeqCst) {
            return false;
        }
        *slot = Some(room);
        true
    }

    fn on_remote_track(&self, track: RemoteTrack, runtime: &Handle) {
        let audio = match track {
            RemoteTrack::Audio(audio) => audio,
            RemoteTrack::Other { sid, kind } => {
                debug!(connection = %self.connection_id, track = %sid, kind = %kind, "Ignoring non-audio track");
                return;
            }
        };

        let Some(call) = self.call() else {
            return;
        };
        let Some(outbound) = self.outbound.lock().unwrap().clone() else {
            return;
        };

        let mut relays = self.relays.lock().unwrap();
        if self.cancel.is_cancelled() || relays.contains_key(&audio.sid) {
            return;
        }

        info!(
            call_sid = %call.call_sid,
            track = %audio.sid,
            participant = %audio.participant_identity,
            "Subscribed to remote audio track"
        );
        SessionStats::bump(&self.stats.relays_started);

        let sid = audio.sid.clone();
        let relay = EgressRelay::new(sid.clone(), call.stream_sid, self.wire);
        let task = runtime.spawn(relay.run(
            audio.subscribe(),
            outbound,
            self.cancel.clone(),
            self.stats.clone(),
        ));
        relays.insert(sid, task);
    }

    /// Release everything the session holds. Runs its side effects once.
    async fn teardown(&self, reason: &str) {
        if self
            .torn_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        self.transition(BridgeState::Bridging, BridgeState::Stopping);

        self.cancel.cancel();
        self.outbound.lock().unwrap().take();

        let room = self.room.lock().unwrap().take();
        if let Some(room) = room {
            room.disconnect().await;
        }

        let relays: Vec<(String, JoinHandle<()>)> = self.relays.lock().unwrap().drain().collect();
        for (sid, relay) in relays {
            if let Err(err) = relay.await {
                warn!(connection = %self.connection_id, track = %sid, error = %err, "Egress relay ended abnormally");
            }
        }

        let call = self.call();
        if self.registered.load(Ordering::SeqCst) {
            if let Some(call) = &call {
                self.registry.remove(&call.call_sid);
            }
        }

        let snapshot = self.stats.snapshot();
        let totals = self.registry.totals();
        snapshot.fold_into(totals);
        if self.aborted.load(Ordering::SeqCst) {
            totals.calls_failed.fetch_add(1, Ordering::Relaxed);
        } else if self.registered.load(Ordering::SeqCst) {
            totals.calls_completed.fetch_add(1, Ordering::Relaxed);
        }

        self.set_status(BridgeState::Closed);

        info!(
            connection = %self.connection_id,
            call_sid = call.as_ref().map(|c| c.call_sid.as_str()).unwrap_or("-"),
            reason = %reason,
            media_received = snapshot.media_received,
            ingress_submitted = snapshot.ingress_submitted,
            ingress_dropped = snapshot.ingress_dropped,
            decode_errors = snapshot.decode_errors,
            sequence_gaps = snapshot.sequence_gaps,
            protocol_errors = snapshot.protocol_errors,
            egress_sent = snapshot.egress_sent,
            egress_skipped = snapshot.egress_skipped,
            "Call bridge session closed"
        );
    }
}

/// The per-call state machine. Consumed by [`CallBridgeSession::run`].
pub struct CallBridgeSession {
    ctx: BridgeContext,
    shared: Arc<SessionShared>,
    inbound: InboundReceiver,
    ingress: Option<IngressPipeline>,
    /// Last media sequence number seen, for gap detection
    last_sequence: Option<u64>,
}

impl CallBridgeSession {
    /// Create a session that writes outbound signals to `outbound`. Events
    /// for its receive loop go through the returned [`InboundSender`].
    pub fn new(
        ctx: BridgeContext,
        outbound: mpsc::Sender<OutboundSignal>,
    ) -> (Self, SessionHandle, InboundSender) {
        let stats = Arc::new(SessionStats::default());
        let (inbound_tx, inbound) =
            inbound_queue(ctx.config.performance.inbound_queue_depth, stats.clone());
        let (state, _) = watch::channel(BridgeState::AwaitingStart);
        let shared = Arc::new(SessionShared {
            connection_id: Uuid::new_v4().to_string(),
            state,
            call: RwLock::new(None),
            wire: ctx.config.wire_format(),
            torn_down: AtomicBool::new(false),
            registered: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            room: Mutex::new(None),
            outbound: Mutex::new(Some(outbound)),
            relays: Mutex::new(HashMap::new()),
            stats,
            registry: ctx.registry.clone(),
        });

        let handle = SessionHandle {
            shared: shared.clone(),
        };
        let session = Self {
            ctx,
            shared,
            inbound,
            ingress: None,
            last_sequence: None,
        };
        (session, handle, inbound_tx)
    }

    /// Process duplex events until the call ends, then tear down.
    pub async fn run(mut self) {
        debug!(connection = %self.shared.connection_id, "Call bridge session waiting for start");

        let reason = loop {
            let event = tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => break "shutdown",
                event = self.inbound.recv() => event,
            };

            match event {
                None | Some(DuplexEvent::Closed) => break "duplex closed",
                Some(DuplexEvent::Failed(err)) => {
                    warn!(connection = %self.shared.connection_id, error = %err, "Duplex transport failed");
                    break "duplex failed";
                }
                Some(DuplexEvent::Malformed(err)) => {
                    SessionStats::bump(&self.shared.stats.protocol_errors);
                    warn!(connection = %self.shared.connection_id, error = %err, "Ignoring malformed signal");
                }
                Some(DuplexEvent::Signal(signal)) => {
                    if let Flow::Stop = self.handle_signal(signal).await {
                        break if self.shared.aborted.load(Ordering::SeqCst) {
                            "start failed"
                        } else {
                            "stop"
                        };
                    }
                }
            }
        };

        self.ingress = None;
        self.shared.teardown(reason).await;
    }

    async fn handle_signal(&mut self, signal: InboundSignal) -> Flow {
        match (self.shared.status(), signal) {
            (BridgeState::AwaitingStart, InboundSignal::Start { stream_sid, start }) => {
                self.handle_start(stream_sid.as_deref(), &start).await
            }
            (BridgeState::Bridging, InboundSignal::Media { sequence_number, media }) => {
                self.track_sequence(sequence_number.as_ref());
                self.handle_media(&media.payload);
                Flow::Continue
            }
            (BridgeState::Bridging, InboundSignal::Stop) => {
                info!(connection = %self.shared.connection_id, "Stop received");
                self.shared.transition(BridgeState::Bridging, BridgeState::Stopping);
                Flow::Stop
            }
            (state, signal) => {
                debug!(
                    connection = %self.shared.connection_id,
                    state = state.as_str(),
                    event = signal.name(),
                    "Ignoring signal"
                );
                Flow::Continue
            }
        }
    }

    async fn handle_start(&mut self, stream_sid: Option<&str>, start: &StartInfo) -> Flow {
        let call = match wire::resolve_call(stream_sid, start, &self.ctx.config.bridge) {
            Ok(call) => call,
            Err(err) => {
                SessionStats::bump(&self.shared.stats.protocol_errors);
                warn!(connection = %self.shared.connection_id, error = %err, "Ignoring unusable start signal");
                return Flow::Continue;
            }
        };

        *self.shared.call.write().unwrap() = Some(call.clone());
        info!(
            call_sid = %call.call_sid,
            stream_sid = %call.stream_sid,
            room = %call.room_name,
            identity = %call.identity,
            "Call stream started"
        );

        match self.open_bridge(&call, start).await {
            Ok(ingress) => {
                if !self.shared.enter_bridging() {
                    debug!(call_sid = %call.call_sid, "Session closed while bridging, not starting ingress");
                    return Flow::Stop;
                }
                self.ingress = Some(ingress);
                info!(call_sid = %call.call_sid, room = %call.room_name, "Call bridged to room");
                Flow::Continue
            }
            Err(err) => {
                self.shared.aborted.store(true, Ordering::SeqCst);
                error!(
                    call_sid = %call.call_sid,
                    room = %call.room_name,
                    error_type = err.kind(),
                    error = %err,
                    "Could not bridge call, closing session"
                );
                Flow::Stop
            }
        }
    }

    /// Connect, publish, subscribe and register. Anything acquired before a
    /// failure is released by teardown.
    async fn open_bridge(&self, call: &CallMetadata, start: &StartInfo) -> BridgeResult<IngressPipeline> {
        let wire = self.shared.wire;
        if let Some(format) = &start.media_format {
            if !format.matches(&wire) {
                return Err(BridgeError::Protocol(format!(
                    "unsupported media format {} {}Hz x{}",
                    format.encoding, format.sample_rate, format.channels
                )));
            }
        }

        let credentials = self
            .ctx
            .credentials
            .issue(&call.room_name, &call.identity, &call.display_name)?;

        let room = self.ctx.room_port.connect(&call.room_name, &credentials).await?;
        if !self.shared.adopt_room(room.clone()) {
            room.disconnect().await;
            return Err(BridgeError::Transport(
                "session closed while connecting to room".to_string(),
            ));
        }

        let bridge = &self.ctx.config.bridge;
        let track = room
            .publish_synthetic_track(TrackOptions {
                name: bridge.track_name.clone(),
                sample_rate: bridge.publish_sample_rate,
                channels: bridge.publish_channels,
                source: TrackSource::Microphone,
            })
            .await?;

        let shared = Arc::downgrade(&self.shared);
        let runtime = Handle::current();
        room.on_track_subscribed(Box::new(move |track| {
            if let Some(shared) = shared.upgrade() {
                shared.on_remote_track(track, &runtime);
            }
        }));

        let presence = CallPresence {
            call_sid: call.call_sid.clone(),
            room_name: call.room_name.clone(),
            stream_sid: call.stream_sid.clone(),
            started_at: Utc::now(),
        };
        if !self.ctx.registry.insert(presence) {
            return Err(BridgeError::Protocol(format!(
                "call {} is already being bridged",
                call.call_sid
            )));
        }
        self.shared.registered.store(true, Ordering::SeqCst);
        if self.shared.torn_down.load(Ordering::SeqCst) {
            self.ctx.registry.remove(&call.call_sid);
            return Err(BridgeError::Transport(
                "session closed while starting".to_string(),
            ));
        }

        Ok(IngressPipeline::new(track, self.ctx.frame_pool.clone(), wire))
    }

    /// Count and log media sequence numbers that skip ahead or go back.
    fn track_sequence(&mut self, sequence_number: Option<&SequenceNumber>) {
        let Some(current) = sequence_number.and_then(SequenceNumber::value) else {
            return;
        };

        if let Some(last) = self.last_sequence {
            if current != last + 1 {
                SessionStats::bump(&self.shared.stats.sequence_gaps);
                debug!(
                    connection = %self.shared.connection_id,
                    expected = last + 1,
                    received = current,
                    "Media sequence gap"
                );
            }
        }
        self.last_sequence = Some(current);
    }

    fn handle_media(&mut self, payload: &str) {
        let stats = &self.shared.stats;
        SessionStats::bump(&stats.media_received);

        let Some(ingress) = self.ingress.as_mut() else {
            return;
        };

        match ingress.forward(payload) {
            Ok(Some(SubmitOutcome::Accepted)) => SessionStats::bump(&stats.ingress_submitted),
            Ok(Some(SubmitOutcome::Dropped)) => {
                SessionStats::bump(&stats.ingress_dropped);
                debug!(connection = %self.shared.connection_id, "Synthetic track queue full, frame dropped");
            }
            Ok(None) => {}
            Err(err) => {
                SessionStats::bump(&stats.decode_errors);
                warn!(connection = %self.shared.connection_id, error = %err, "Dropping undecodable media");
            }
        }
    }
}

/// Cheap, cloneable view of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    pub fn connection_id(&self) -> &str {
        &self.shared.connection_id
    }

    pub fn status(&self) -> BridgeState {
        self.shared.status()
    }

    pub fn call(&self) -> Option<CallMetadata> {
        self.shared.call()
    }

    pub fn stats(&self) -> SessionStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Tear the session down from outside and wait until it is closed.
    pub async fn shutdown(&self, reason: &str) {
        self.shared.teardown(reason).await;
        self.closed().await;
    }

    /// Wait until the session reaches [`BridgeState::Closed`].
    pub async fn closed(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|state| *state == BridgeState::Closed).await;
    }
}

/// One entry of [`LiveSessions::snapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct LiveSessionView {
    pub connection_id: String,
    pub status: BridgeState,
    pub call_sid: Option<String>,
    pub stats: SessionStatsSnapshot,
}

/// Handles of sessions whose receive loop is still running, by connection id.
#[derive(Clone, Default)]
pub struct LiveSessions {
    sessions: Arc<Mutex<HashMap<String, SessionHandle>>>,
}

impl LiveSessions {
    pub fn track(&self, handle: SessionHandle) {
        self.sessions
            .lock()
            .unwrap()
            .insert(handle.connection_id().to_string(), handle);
    }

    pub fn forget(&self, connection_id: &str) {
        self.sessions.lock().unwrap().remove(connection_id);
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Status and counters of every live session, by connection id.
    pub fn snapshot(&self) -> Vec<LiveSessionView> {
        let mut views: Vec<LiveSessionView> = self
            .sessions
            .lock()
            .unwrap()
            .values()
            .map(|handle| LiveSessionView {
                connection_id: handle.connection_id().to_string(),
                status: handle.status(),
                call_sid: handle.call().map(|call| call.call_sid),
                stats: handle.stats(),
            })
            .collect();
        views.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
        views
    }

    /// Tear down every live session, e.g. on process shutdown.
    pub async fn shutdown_all(&self, reason: &str) {
        if self.is_empty() {
            return;
        }
        let handles: Vec<SessionHandle> = self.sessions.lock().unwrap().values().cloned().collect();

        info!(sessions = handles.len(), "Closing live call sessions");
        futures_util::future::join_all(handles.iter().map(|handle| handle.shutdown(reason))).await;
    }
}
