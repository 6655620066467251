//! # Call Media Bridge - Main Application Entry Point
//!
//! Accepts telephony media streams over WebSocket and bridges each call into
//! a media room: caller audio is published as a synthetic room track, and
//! every remote audio track in the room is relayed back to the caller.
//!
//! ## Application Architecture:
//! - **config**: Application configuration (TOML file + environment variables)
//! - **state**: Shared state: registry, live sessions, room services, metrics
//! - **health**: Health check and metrics endpoints
//! - **middleware**: Request logging and per-endpoint HTTP counters
//! - **websocket**: One actor per telephony media stream
//! - **bridge**: Per-call session, ingress, egress and registry
//! - **audio**: μ-law codec, resampling and pooled sample buffers
//! - **room**: Room service traits, credentials, LiveKit and in-process rooms
//! - **error**: Bridge error taxonomy and HTTP error responses

mod audio;
mod bridge;
mod config;
mod error;
mod health;
mod middleware;
mod room;
mod state;
mod websocket;

use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::{AppConfig, RoomBackend};
use state::AppState;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging**
/// 3. **Creates shared application state** (registry, room services)
/// 4. **Configures the HTTP server** with middleware and routes
/// 5. **Handles graceful shutdown**: on SIGINT/SIGTERM every live call is
///    torn down before the server stops
#[actix_web::main]
async fn main() -> Result<()> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(
        wire_sample_rate = config.bridge.wire_sample_rate,
        room_sample_rate = config.bridge.room_sample_rate,
        publish_sample_rate = config.bridge.publish_sample_rate,
        max_concurrent_calls = config.performance.max_concurrent_calls,
        "Configuration loaded"
    );
    match config.room.backend {
        RoomBackend::LiveKit => info!(room_url = %config.room.url, "Bridging calls into LiveKit rooms"),
        RoomBackend::Memory => warn!(
            loopback = config.room.loopback,
            "Bridging calls into in-process rooms, no room server is used"
        ),
    }

    let app_state = AppState::new(config.clone());
    let sessions = app_state.sessions.clone();
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // Middleware executes in reverse order for responses
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/media-stream", web::get().to(websocket::media_stream)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/metrics", web::get().to(health::detailed_metrics))
            .route("/media-stream", web::get().to(websocket::media_stream))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
            }
        }
        signal = shutdown_signal() => {
            match signal {
                Ok(name) => info!(signal = name, "Shutdown signal received, closing calls"),
                Err(e) => warn!(error = %e, "Could not listen for shutdown signals, stopping"),
            }
            sessions.shutdown_all("process shutdown").await;
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize tracing.
///
/// ## Environment Variables:
/// - `RUST_LOG`: e.g. "debug" or "call_media_bridge=debug"
/// - If not set, defaults to "call_media_bridge=info,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "call_media_bridge=info,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Resolve once SIGTERM or SIGINT arrives, with the signal's name.
#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let name = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    Ok(name)
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}
