//! # Session Registry
//!
//! Process-wide table of calls that are currently bridging, keyed by call id.
//! Sessions insert themselves when `start` succeeds and remove themselves during
//! teardown; the health and metrics endpoints only read it.
//!
//! ## Thread Safety:
//! Uses `Arc<RwLock<HashMap>>` so many readers (metrics scrapes) and the
//! occasional writer (a session transition) never race. Clones share the map.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// What the registry knows about one active call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallPresence {
    pub call_sid: String,
    pub room_name: String,
    pub stream_sid: String,
    pub started_at: DateTime<Utc>,
}

/// Counters accumulated from every session that has ended.
#[derive(Debug, Default)]
pub struct BridgeTotals {
    pub calls_completed: AtomicU64,
    pub calls_failed: AtomicU64,
    pub media_received: AtomicU64,
    pub ingress_submitted: AtomicU64,
    pub ingress_dropped: AtomicU64,
    pub egress_sent: AtomicU64,
    pub egress_skipped: AtomicU64,
}

/// Serializable copy of [`BridgeTotals`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BridgeTotalsSnapshot {
    pub calls_completed: u64,
    pub calls_failed: u64,
    pub media_received: u64,
    pub ingress_submitted: u64,
    pub ingress_dropped: u64,
    pub egress_sent: u64,
    pub egress_skipped: u64,
}

impl BridgeTotals {
    pub fn snapshot(&self) -> BridgeTotalsSnapshot {
        BridgeTotalsSnapshot {
            calls_completed: self.calls_completed.load(Ordering::Relaxed),
            calls_failed: self.calls_failed.load(Ordering::Relaxed),
            media_received: self.media_received.load(Ordering::Relaxed),
            ingress_submitted: self.ingress_submitted.load(Ordering::Relaxed),
            ingress_dropped: self.ingress_dropped.load(Ordering::Relaxed),
            egress_sent: self.egress_sent.load(Ordering::Relaxed),
            egress_skipped: self.egress_skipped.load(Ordering::Relaxed),
        }
    }
}

/// Tracks active calls and the totals of finished ones.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    calls: Arc<RwLock<HashMap<String, CallPresence>>>,
    totals: Arc<BridgeTotals>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a call as bridging. Returns `false` if the id is already present,
    /// in which case the existing entry is left alone.
    pub fn insert(&self, presence: CallPresence) -> bool {
        let mut calls = self.calls.write().unwrap();
        if calls.contains_key(&presence.call_sid) {
            return false;
        }
        calls.insert(presence.call_sid.clone(), presence);
        true
    }

    /// Remove a call (teardown). Returns whether it was present.
    pub fn remove(&self, call_sid: &str) -> bool {
        self.calls.write().unwrap().remove(call_sid).is_some()
    }

    /// Number of active calls.
    pub fn len(&self) -> usize {
        self.calls.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All active calls, oldest first.
    pub fn snapshot(&self) -> Vec<CallPresence> {
        let mut calls: Vec<CallPresence> = self.calls.read().unwrap().values().cloned().collect();
        calls.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.call_sid.cmp(&b.call_sid)));
        calls
    }

    pub fn totals(&self) -> &BridgeTotals {
        &self.totals
    }
}

#[cfg(test)]
impl SessionRegistry {
    pub fn contains(&self, call_sid: &str) -> bool {
        self.calls.read().unwrap().contains_key(call_sid)
    }

    pub fn get(&self, call_sid: &str) -> Option<CallPresence> {
        self.calls.read().unwrap().get(call_sid).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn presence(call_sid: &str) -> CallPresence {
        CallPresence {
            call_sid: call_sid.to_string(),
            room_name: format!("call-{}", call_sid),
            stream_sid: format!("MZ-{}", call_sid),
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_insert_and_remove() {
        let registry = SessionRegistry::new();
        assert!(registry.insert(presence("CA1")));
        assert!(!registry.insert(presence("CA1")));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("CA1").unwrap().room_name, "call-CA1");

        assert!(registry.remove("CA1"));
        assert!(!registry.remove("CA1"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_writers() {
        let registry = SessionRegistry::new();
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let registry = registry.clone();
                thread::spawn(move || {
                    for i in 0..50 {
                        let sid = format!("CA{}-{}", worker, i);
                        registry.insert(presence(&sid));
                        if i % 2 == 0 {
                            registry.remove(&sid);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.len(), 8 * 25);
        assert_eq!(registry.snapshot().len(), 8 * 25);
    }
}
