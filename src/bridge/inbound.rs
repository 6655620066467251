//! # Inbound Queue (socket → receive loop)
//!
//! Carries [`DuplexEvent`]s from the socket actor to the session in arrival
//! order. Sending never waits, so the actor is never held up by the room.
//!
//! Only `media` is ever discarded: at most `media_depth` media signals may
//! wait in the queue, and a media signal arriving beyond that is dropped and
//! counted in `ingress_dropped`. `start`, `stop`, every other signal and the
//! close/failure notifications are always queued.

use super::stats::SessionStats;
use super::wire::{self, InboundSignal};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// What the duplex transport reports to the receive loop.
#[derive(Debug, Clone)]
pub enum DuplexEvent {
    /// One parsed text frame
    Signal(InboundSignal),
    /// A text frame that is not a valid signal, with the parse error
    Malformed(String),
    /// The peer closed the connection
    Closed,
    /// The transport failed
    Failed(String),
}

impl DuplexEvent {
    /// Parse one text frame from the wire.
    pub fn from_text(text: &str) -> Self {
        match wire::parse_signal(text) {
            Ok(signal) => DuplexEvent::Signal(signal),
            Err(err) => DuplexEvent::Malformed(err.to_string()),
        }
    }

    fn is_media(&self) -> bool {
        matches!(self, DuplexEvent::Signal(InboundSignal::Media { .. }))
    }
}

/// Outcome of [`InboundSender::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Media queue full; the signal was discarded and counted
    Dropped,
    /// The receive loop has ended
    Closed,
}

/// Create a queue that holds at most `media_depth` media signals.
pub fn inbound_queue(media_depth: usize, stats: Arc<SessionStats>) -> (InboundSender, InboundReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let media_queued = Arc::new(AtomicUsize::new(0));

    let sender = InboundSender {
        tx,
        media_queued: media_queued.clone(),
        media_depth: media_depth.max(1),
        stats,
    };
    (sender, InboundReceiver { rx, media_queued })
}

/// Socket side of the queue.
pub struct InboundSender {
    tx: mpsc::UnboundedSender<DuplexEvent>,
    media_queued: Arc<AtomicUsize>,
    media_depth: usize,
    stats: Arc<SessionStats>,
}

impl InboundSender {
    pub fn send(&self, event: DuplexEvent) -> Delivery {
        let media = event.is_media();
        if media && self.media_queued.fetch_add(1, Ordering::AcqRel) >= self.media_depth {
            self.media_queued.fetch_sub(1, Ordering::AcqRel);
            SessionStats::bump(&self.stats.media_received);
            SessionStats::bump(&self.stats.ingress_dropped);
            return Delivery::Dropped;
        }

        match self.tx.send(event) {
            Ok(()) => Delivery::Queued,
            Err(_) => {
                if media {
                    self.media_queued.fetch_sub(1, Ordering::AcqRel);
                }
                Delivery::Closed
            }
        }
    }
}

/// Session side of the queue.
pub struct InboundReceiver {
    rx: mpsc::UnboundedReceiver<DuplexEvent>,
    media_queued: Arc<AtomicUsize>,
}

impl InboundReceiver {
    pub async fn recv(&mut self) -> Option<DuplexEvent> {
        let event = self.rx.recv().await?;
        if event.is_media() {
            self.media_queued.fetch_sub(1, Ordering::AcqRel);
        }
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media() -> DuplexEvent {
        DuplexEvent::from_text(r#"{"event":"media","media":{"payload":"//8="}}"#)
    }

    fn name(event: &DuplexEvent) -> &'static str {
        match event {
            DuplexEvent::Signal(signal) => signal.name(),
            DuplexEvent::Malformed(_) => "malformed",
            DuplexEvent::Closed => "closed",
            DuplexEvent::Failed(_) => "failed",
        }
    }

    #[tokio::test]
    async fn test_full_queue_drops_media_but_never_control() {
        let stats = Arc::new(SessionStats::default());
        let (sender, mut receiver) = inbound_queue(2, stats.clone());

        assert_eq!(sender.send(DuplexEvent::from_text(r#"{"event":"start","start":{}}"#)), Delivery::Queued);
        let outcomes: Vec<Delivery> = (0..5).map(|_| sender.send(media())).collect();
        assert_eq!(
            outcomes,
            vec![Delivery::Queued, Delivery::Queued, Delivery::Dropped, Delivery::Dropped, Delivery::Dropped]
        );
        assert_eq!(sender.send(DuplexEvent::from_text(r#"{"event":"stop"}"#)), Delivery::Queued);
        assert_eq!(sender.send(DuplexEvent::Failed("reset".to_string())), Delivery::Queued);
        assert_eq!(sender.send(DuplexEvent::Closed), Delivery::Queued);
        drop(sender);

        let mut seen = Vec::new();
        while let Some(event) = receiver.recv().await {
            seen.push(name(&event));
        }
        assert_eq!(seen, vec!["start", "media", "media", "stop", "failed", "closed"]);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.ingress_dropped, 3);
        assert_eq!(snapshot.media_received, 3);
    }

    #[tokio::test]
    async fn test_media_room_frees_up_as_the_loop_catches_up() {
        let stats = Arc::new(SessionStats::default());
        let (sender, mut receiver) = inbound_queue(1, stats.clone());

        assert_eq!(sender.send(media()), Delivery::Queued);
        assert_eq!(sender.send(media()), Delivery::Dropped);
        assert!(receiver.recv().await.is_some());
        assert_eq!(sender.send(media()), Delivery::Queued);
        assert_eq!(stats.snapshot().ingress_dropped, 1);
    }

    #[tokio::test]
    async fn test_send_after_loop_ended_reports_closed() {
        let (sender, receiver) = inbound_queue(4, Arc::new(SessionStats::default()));
        drop(receiver);

        assert_eq!(sender.send(media()), Delivery::Closed);
        assert_eq!(sender.send(DuplexEvent::Closed), Delivery::Closed);
        assert_eq!(sender.media_queued.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_malformed_text_is_kept_as_an_event() {
        assert!(matches!(DuplexEvent::from_text("{ not json"), DuplexEvent::Malformed(_)));
        assert!(matches!(
            DuplexEvent::from_text(r#"{"event":"connected"}"#),
            DuplexEvent::Signal(InboundSignal::Connected)
        ));
    }
}
