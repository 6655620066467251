//! # Call Bridge
//!
//! Per-call plumbing between the telephony duplex stream and a media room:
//!
//! - **wire**: JSON signals exchanged with the telephony provider
//! - **inbound**: socket → session queue that only ever drops media
//! - **session**: the per-call state machine and its teardown
//! - **ingress**: caller audio → synthetic room track
//! - **egress**: remote room tracks → caller audio
//! - **registry**: active calls and aggregate counters
//! - **stats**: per-call counters

pub mod egress;
pub mod inbound;
pub mod ingress;
pub mod registry;
pub mod session;
pub mod stats;
pub mod wire;

pub use registry::SessionRegistry;
pub use session::{BridgeContext, CallBridgeSession, LiveSessions};
pub use wire::OutboundSignal;
