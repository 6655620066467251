//! # Configuration Management
//!
//! This module handles loading and managing bridge configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (set by most deployment platforms)
//! 2. Environment variables (APP_SERVER__PORT, APP_ROOM__URL, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use crate::audio::buffer::FramePoolConfig;
use crate::audio::frame::WireFormat;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub bridge: BridgeConfig,
    pub room: RoomConfig,
    pub performance: PerformanceConfig,
}

/// HTTP / WebSocket listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Audio format settings on both sides of the bridge.
///
/// ## Fields:
/// - `wire_sample_rate`: rate of the companded telephony stream (8000)
/// - `chunk_ms`: duration of one wire chunk (20)
/// - `room_sample_rate`: rate remote room tracks are received at (48000);
///   the room backend delivers subscribed audio at this rate
/// - `publish_sample_rate`: rate the synthetic caller track is published at;
///   when it differs from the wire rate, ingress resamples before submitting
/// - `publish_channels`: channel count of the synthetic track
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub wire_sample_rate: u32,
    pub chunk_ms: u32,
    pub room_sample_rate: u32,
    pub publish_sample_rate: u32,
    pub publish_channels: u16,
    pub track_name: String,
    pub identity_prefix: String,
    pub room_prefix: String,
}

/// Which room service calls are bridged into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomBackend {
    /// A LiveKit server at `room.url`
    LiveKit,
    /// Rooms kept inside this process
    Memory,
}

impl RoomBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomBackend::LiveKit => "livekit",
            RoomBackend::Memory => "memory",
        }
    }
}

/// Media room connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomConfig {
    pub backend: RoomBackend,
    pub url: String,
    pub api_key: String,
    pub api_secret: String,
    /// Frames the synthetic track may queue before submissions are dropped
    pub submit_queue_depth: usize,
    /// Credential lifetime in seconds
    pub credential_ttl_secs: u64,
    /// In-process room only: mirror every published track back into its
    /// room as a remote track, so a local call hears itself
    pub loopback: bool,
}

/// Performance tuning configuration.
///
/// ## Fields:
/// - `max_concurrent_calls`: WebSocket upgrades beyond this are refused (503)
/// - `inbound_queue_depth`: `media` signals that may wait between the socket
///   actor and the session's receive loop; control signals never count
/// - `outbound_queue_depth`: egress signals buffered before the socket writes
/// - `frame_pool_capacity`: idle sample buffers kept for reuse
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_calls: usize,
    pub inbound_queue_depth: usize,
    pub outbound_queue_depth: usize,
    pub frame_pool_capacity: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8000,
            },
            bridge: BridgeConfig {
                wire_sample_rate: 8000,         // Narrowband telephony
                chunk_ms: 20,                   // 160 samples per wire chunk
                room_sample_rate: 48000,        // Wideband room audio
                publish_sample_rate: 8000,      // Publish caller audio at wire rate
                publish_channels: 1,
                track_name: "phone-audio".to_string(),
                identity_prefix: "phone-".to_string(),
                room_prefix: "call-".to_string(),
            },
            room: RoomConfig {
                backend: RoomBackend::LiveKit,
                url: "ws://127.0.0.1:7880".to_string(),
                api_key: "devkey".to_string(),
                api_secret: "secret".to_string(),
                submit_queue_depth: 50,         // 1 second of 20ms frames
                credential_ttl_secs: 3600,
                loopback: false,
            },
            performance: PerformanceConfig {
                max_concurrent_calls: 200,
                inbound_queue_depth: 256,
                outbound_queue_depth: 256,
                frame_pool_capacity: 64,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_ROOM__URL=wss://rooms.example.com`: Override room server URL
    /// - `APP_ROOM__BACKEND=memory`: Bridge into in-process rooms
    /// - `PORT=3000`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            // Double underscore keeps multi-word keys intact:
            // APP_ROOM__API_KEY becomes room.api_key
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        let bridge = &self.bridge;
        if bridge.wire_sample_rate == 0 || bridge.room_sample_rate == 0 || bridge.publish_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if bridge.chunk_ms == 0 {
            return Err(anyhow::anyhow!("Chunk duration must be greater than 0"));
        }

        if (bridge.wire_sample_rate as u64 * bridge.chunk_ms as u64) % 1000 != 0 {
            return Err(anyhow::anyhow!(
                "A {}ms chunk at {}Hz is not a whole number of samples",
                bridge.chunk_ms,
                bridge.wire_sample_rate
            ));
        }

        if bridge.publish_channels == 0 || bridge.publish_channels > 2 {
            return Err(anyhow::anyhow!("Published track must be mono or stereo"));
        }

        if self.room.backend == RoomBackend::LiveKit {
            if self.room.url.is_empty() {
                return Err(anyhow::anyhow!("LiveKit backend needs room.url"));
            }
            if self.room.api_key.is_empty() || self.room.api_secret.is_empty() {
                return Err(anyhow::anyhow!("LiveKit backend needs room.api_key and room.api_secret"));
            }
        }

        if self.room.submit_queue_depth == 0 {
            return Err(anyhow::anyhow!("Room submit queue depth must be greater than 0"));
        }

        let perf = &self.performance;
        if perf.max_concurrent_calls == 0 {
            return Err(anyhow::anyhow!("Max concurrent calls must be greater than 0"));
        }

        if perf.inbound_queue_depth == 0 || perf.outbound_queue_depth == 0 {
            return Err(anyhow::anyhow!("Queue depths must be greater than 0"));
        }

        Ok(())
    }

    /// Wire format every call is expected to use.
    pub fn wire_format(&self) -> WireFormat {
        WireFormat::telephony(self.bridge.wire_sample_rate, self.bridge.chunk_ms)
    }

    /// Pool buffers are sized for the largest frame either pipeline handles:
    /// one chunk of stereo audio at the highest configured rate.
    pub fn frame_pool_config(&self) -> FramePoolConfig {
        let top_rate = self
            .bridge
            .room_sample_rate
            .max(self.bridge.publish_sample_rate)
            .max(self.bridge.wire_sample_rate);

        FramePoolConfig {
            frame_samples: (top_rate as usize * self.bridge.chunk_ms as usize / 1000) * 2,
            capacity: self.performance.frame_pool_capacity,
        }
    }
}
