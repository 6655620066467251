//! # Application State Management
//!
//! This module manages state shared by every HTTP handler and every call
//! session running in the process.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Lets actix worker threads and session tasks share ownership
//! - **Memory safety**: The data is freed when the last clone is dropped
//!
//! ### Arc<dyn Trait>
//! - **Purpose**: The room service and the credential service are chosen at
//!   startup; everything else only sees the trait
//! - **Send + Sync**: Both traits require it, so handles can cross threads
//!
//! ### RwLock for metrics
//! - **Purpose**: Many readers (`/metrics` scrapes) or one writer (the
//!   metrics middleware after each request)

use crate::audio::buffer::FramePool;
use crate::bridge::{BridgeContext, LiveSessions, SessionRegistry};
use crate::config::{AppConfig, RoomBackend};
use crate::room::{
    ConfiguredCredentialIssuer, CredentialIssuer, LiveKitRoomPort, MemoryRoomHub, RoomAudioPort,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// The main application state shared across HTTP handlers and call sessions.
///
/// ## Rust Concepts:
/// - **#[derive(Clone)]**: Cloning copies a handful of `Arc`s, not the data
/// - **Arc<dyn RoomAudioPort>**: Trait object, so tests and deployments can
///   plug in different room backends
#[derive(Clone)]
pub struct AppState {
    /// Configuration is read-only once the server is running
    pub config: Arc<AppConfig>,

    /// Calls that are currently bridging (liveness accounting)
    pub registry: SessionRegistry,

    /// Every session whose receive loop is running, bridged or not
    pub sessions: LiveSessions,

    pub room_port: Arc<dyn RoomAudioPort>,

    pub credentials: Arc<dyn CredentialIssuer>,

    /// Sample buffers shared by all ingress pipelines
    pub frame_pool: FramePool,

    /// HTTP request metrics (updated by the metrics middleware)
    pub metrics: Arc<RwLock<HttpMetrics>>,

    /// When the server started (never changes, so no lock needed)
    pub start_time: Instant,
}

/// HTTP request counters collected by [`crate::middleware::MetricsMiddleware`].
#[derive(Debug, Default, Clone)]
pub struct HttpMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Key: endpoint (e.g. "GET /health")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Performance metrics for a specific endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Create state backed by the room service `room.backend` names.
    pub fn new(config: AppConfig) -> Self {
        let room_port: Arc<dyn RoomAudioPort> = match config.room.backend {
            RoomBackend::LiveKit => Arc::new(LiveKitRoomPort::from_config(&config)),
            RoomBackend::Memory => Arc::new(MemoryRoomHub::from_config(&config.room)),
        };
        let credentials = Arc::new(ConfiguredCredentialIssuer::new(&config.room));
        Self::with_services(config, room_port, credentials)
    }

    /// Create state around explicit room and credential services.
    pub fn with_services(
        config: AppConfig,
        room_port: Arc<dyn RoomAudioPort>,
        credentials: Arc<dyn CredentialIssuer>,
    ) -> Self {
        let frame_pool = FramePool::new(config.frame_pool_config());
        Self {
            config: Arc::new(config),
            registry: SessionRegistry::new(),
            sessions: LiveSessions::default(),
            room_port,
            credentials,
            frame_pool,
            metrics: Arc::new(RwLock::new(HttpMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Everything a new call session needs.
    pub fn bridge_context(&self) -> BridgeContext {
        BridgeContext {
            config: self.config.clone(),
            registry: self.registry.clone(),
            room_port: self.room_port.clone(),
            credentials: self.credentials.clone(),
            frame_pool: self.frame_pool.clone(),
        }
    }

    /// Calls that completed `start` and have not torn down yet.
    pub fn active_calls(&self) -> usize {
        self.registry.len()
    }

    /// Whether another duplex connection may be accepted.
    ///
    /// Counts every live session, including ones still waiting for `start`,
    /// so a burst of upgrades cannot overshoot the limit.
    pub fn has_capacity(&self) -> bool {
        self.sessions.len().max(self.registry.len()) < self.config.performance.max_concurrent_calls
    }

    pub fn utilization_percent(&self) -> f64 {
        let max = self.config.performance.max_concurrent_calls;
        if max == 0 || self.registry.is_empty() {
            return 0.0;
        }
        self.active_calls() as f64 / max as f64 * 100.0
    }

    /// Record one finished HTTP request.
    pub fn record_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
        if is_error {
            metrics.error_count += 1;
        }

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Copy of the HTTP metrics, so no lock is held while serializing.
    pub fn metrics_snapshot(&self) -> HttpMetrics {
        self.metrics.read().unwrap().clone()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
