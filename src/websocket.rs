//! # Media Stream WebSocket Handler
//!
//! The telephony provider connects to `/media-stream` and keeps one WebSocket
//! open for the whole call. Each connection is an actix actor paired with one
//! [`CallBridgeSession`] running as a tokio task.
//!
//! ## Message Flow:
//! ```text
//!  provider ──text──▶ MediaStreamSocket ──DuplexEvent──▶ CallBridgeSession
//!  provider ◀──text── MediaStreamSocket ◀─OutboundSignal── egress relays
//! ```
//!
//! ## Channels:
//! The actor owns the socket and never waits on the room. Text frames are
//! parsed here and handed to the session's inbound queue, which may drop
//! `media` when the session falls behind but always delivers control
//! signals. The session owns the room and sees signals in arrival order.
//! When either side goes away the other sees its channel close and winds
//! down.

use crate::bridge::inbound::{Delivery, DuplexEvent, InboundSender};
use crate::bridge::{CallBridgeSession, OutboundSignal};
use crate::error::BridgeError;
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// How often a ping is sent to the provider.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Connection is considered dead after this long without any frame.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// WebSocket actor for one telephony media stream.
///
/// ## Actor Model:
/// Each connection is an independent actor. Incoming frames arrive through
/// `StreamHandler<ws::Message>`; outgoing audio arrives through a second
/// `StreamHandler<OutboundSignal>` attached in `started`.
pub struct MediaStreamSocket {
    /// Matches the session's connection id in logs
    connection_id: String,

    /// Feeds the session's receive loop; `None` once the session is gone
    inbound: Option<InboundSender>,

    /// Taken in `started` and attached to the actor context
    outbound: Option<mpsc::Receiver<OutboundSignal>>,

    last_heartbeat: Instant,
}

impl MediaStreamSocket {
    pub fn new(
        connection_id: String,
        inbound: InboundSender,
        outbound: mpsc::Receiver<OutboundSignal>,
    ) -> Self {
        Self {
            connection_id,
            inbound: Some(inbound),
            outbound: Some(outbound),
            last_heartbeat: Instant::now(),
        }
    }

    /// Hand an event to the session without ever blocking the actor.
    fn forward(&mut self, event: DuplexEvent, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(inbound) = &self.inbound else {
            return;
        };

        match inbound.send(event) {
            Delivery::Queued => {}
            Delivery::Dropped => {
                debug!(connection = %self.connection_id, "Session is behind, media dropped");
            }
            Delivery::Closed => {
                debug!(connection = %self.connection_id, "Session already ended, closing socket");
                self.inbound = None;
                ctx.close(Some(ws::CloseCode::Normal.into()));
                ctx.stop();
            }
        }
    }
}

impl Actor for MediaStreamSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(connection = %self.connection_id, "Media stream connected");

        if let Some(outbound) = self.outbound.take() {
            ctx.add_stream(ReceiverStream::new(outbound));
        }

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(connection = %act.connection_id, "Media stream heartbeat timeout, closing connection");
                act.forward(DuplexEvent::Failed("heartbeat timeout".to_string()), ctx);
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(connection = %self.connection_id, "Media stream disconnected");

        if let Some(inbound) = self.inbound.take() {
            inbound.send(DuplexEvent::Closed);
        }
    }
}

/// Handle frames from the provider.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for MediaStreamSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.forward(DuplexEvent::from_text(&text), ctx);
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                debug!(connection = %self.connection_id, bytes = data.len(), "Ignoring binary frame");
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(connection = %self.connection_id, reason = ?reason, "Provider closed media stream");
                self.forward(DuplexEvent::Closed, ctx);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(connection = %self.connection_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!(connection = %self.connection_id, error = %err, "Media stream protocol error");
                self.forward(DuplexEvent::Failed(err.to_string()), ctx);
                ctx.stop();
            }
        }
    }
}

/// Handle audio produced by the session's egress relays.
impl StreamHandler<OutboundSignal> for MediaStreamSocket {
    fn handle(&mut self, signal: OutboundSignal, ctx: &mut Self::Context) {
        match signal.to_json() {
            Ok(json) => ctx.text(json),
            Err(err) => warn!(connection = %self.connection_id, error = %err, "Could not encode outbound signal"),
        }
    }

    /// The session released its sender: the call is over on the room side.
    fn finished(&mut self, ctx: &mut Self::Context) {
        debug!(connection = %self.connection_id, "Session finished, closing media stream");
        ctx.close(Some(ws::CloseCode::Normal.into()));
        ctx.stop();
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Refuses the upgrade with 503 when the process is at `max_concurrent_calls`.
/// Otherwise the socket actor starts and its session is spawned; the session
/// stays in the live set until its receive loop returns.
pub async fn media_stream(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let peer = req.connection_info().peer_addr().map(str::to_string);

    if !app_state.has_capacity() {
        let max = app_state.config.performance.max_concurrent_calls;
        warn!(peer = ?peer, max_concurrent_calls = max, "Refusing media stream, at capacity");
        return Err(BridgeError::Capacity(format!("{} calls already active", max)).into());
    }

    let (outbound_tx, outbound_rx) = mpsc::channel(app_state.config.performance.outbound_queue_depth);
    let (session, handle, inbound_tx) = CallBridgeSession::new(app_state.bridge_context(), outbound_tx);
    let connection_id = handle.connection_id().to_string();
    let socket = MediaStreamSocket::new(connection_id.clone(), inbound_tx, outbound_rx);

    let response = ws::start(socket, &req, stream)?;
    info!(connection = %connection_id, peer = ?peer, "Media stream upgrade accepted");

    let sessions = app_state.sessions.clone();
    sessions.track(handle);
    tokio::spawn(async move {
        session.run().await;
        sessions.forget(&connection_id);
    });

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::registry::CallPresence;
    use crate::config::{AppConfig, RoomBackend};
    use actix_web::{http::StatusCode, test, App};
    use chrono::Utc;

    fn app_state(max_concurrent_calls: usize) -> AppState {
        let mut config = AppConfig::default();
        config.room.backend = RoomBackend::Memory;
        config.performance.max_concurrent_calls = max_concurrent_calls;
        AppState::new(config)
    }

    #[actix_web::test]
    async fn test_upgrade_refused_at_capacity() {
        let state = app_state(1);
        state.registry.insert(CallPresence {
            call_sid: "CA1".to_string(),
            room_name: "call-CA1".to_string(),
            stream_sid: "MZ1".to_string(),
            started_at: Utc::now(),
        });

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/media-stream", web::get().to(media_stream)),
        )
        .await;

        let req = test::TestRequest::get().uri("/media-stream").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(state.sessions.is_empty());
    }

    #[actix_web::test]
    async fn test_plain_get_is_not_an_upgrade() {
        let state = app_state(10);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/media-stream", web::get().to(media_stream)),
        )
        .await;

        let req = test::TestRequest::get().uri("/media-stream").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(state.sessions.is_empty());
    }
}
