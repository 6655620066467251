//! Per-call counters, shared by the receive loop and the egress relays.

use super::registry::BridgeTotals;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct SessionStats {
    pub media_received: AtomicU64,
    pub ingress_submitted: AtomicU64,
    pub ingress_dropped: AtomicU64,
    pub decode_errors: AtomicU64,
    /// Media sequence numbers that did not follow the previous one
    pub sequence_gaps: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub egress_sent: AtomicU64,
    pub egress_skipped: AtomicU64,
    pub relays_started: AtomicU64,
}

/// Plain copy of [`SessionStats`] for logs and assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStatsSnapshot {
    pub media_received: u64,
    pub ingress_submitted: u64,
    pub ingress_dropped: u64,
    pub decode_errors: u64,
    pub sequence_gaps: u64,
    pub protocol_errors: u64,
    pub egress_sent: u64,
    pub egress_skipped: u64,
    pub relays_started: u64,
}

impl SessionStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SessionStatsSnapshot {
        SessionStatsSnapshot {
            media_received: self.media_received.load(Ordering::Relaxed),
            ingress_submitted: self.ingress_submitted.load(Ordering::Relaxed),
            ingress_dropped: self.ingress_dropped.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            sequence_gaps: self.sequence_gaps.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            egress_sent: self.egress_sent.load(Ordering::Relaxed),
            egress_skipped: self.egress_skipped.load(Ordering::Relaxed),
            relays_started: self.relays_started.load(Ordering::Relaxed),
        }
    }
}

impl SessionStatsSnapshot {
    /// Add this call's counters to the process totals.
    pub fn fold_into(&self, totals: &BridgeTotals) {
        totals.media_received.fetch_add(self.media_received, Ordering::Relaxed);
        totals.ingress_submitted.fetch_add(self.ingress_submitted, Ordering::Relaxed);
        totals.ingress_dropped.fetch_add(self.ingress_dropped, Ordering::Relaxed);
        totals.egress_sent.fetch_add(self.egress_sent, Ordering::Relaxed);
        totals.egress_skipped.fetch_add(self.egress_skipped, Ordering::Relaxed);
    }
}
