//! Liveness and metrics endpoints.
//!
//! - `GET /health`: cheap liveness summary for load balancers
//! - `GET /metrics`: active calls, live sessions with their counters,
//!   capacity, aggregate audio counters and per-endpoint HTTP counters

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = &state.config;

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.uptime_seconds(),
        "active_calls": state.active_calls(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "system": load_status(&state)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let uptime_seconds = state.uptime_seconds();
    let totals = state.registry.totals().snapshot();
    let pool = state.frame_pool.stats();
    let http = state.metrics_snapshot();

    let mut endpoint_stats: Vec<_> = http
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "active_calls": state.active_calls(),
        "live_sessions": state.sessions.len(),
        "sessions": state.sessions.snapshot(),
        "max_concurrent_calls": state.config.performance.max_concurrent_calls,
        "utilization_percent": state.utilization_percent(),
        "calls": state.registry.snapshot(),
        "totals": totals,
        "frame_pool": {
            "idle": pool.idle,
            "reused": pool.reused,
            "allocated": pool.allocated
        },
        "http": {
            "total_requests": http.request_count,
            "total_errors": http.error_count,
            "endpoints": endpoint_stats
        },
        "memory": get_memory_info()
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", process::id())) {
            let mut vm_rss = 0;
            let mut vm_size = 0;

            for line in status.lines() {
                let kb = || {
                    line.split_whitespace()
                        .nth(1)
                        .and_then(|kb| kb.parse::<u64>().ok())
                        .unwrap_or(0)
                        * 1024
                };
                if line.starts_with("VmRSS:") {
                    vm_rss = kb();
                } else if line.starts_with("VmSize:") {
                    vm_size = kb();
                }
            }

            return json!({
                "resident_memory_bytes": vm_rss,
                "virtual_memory_bytes": vm_size,
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "pid": process::id()
    })
}

fn load_status(state: &AppState) -> serde_json::Value {
    let usage = state.utilization_percent();
    let status = if usage > 90.0 {
        "high_load"
    } else if usage > 70.0 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "call_usage_percent": usage.round(),
        "max_calls": state.config.performance.max_concurrent_calls,
        "current_calls": state.active_calls()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::registry::CallPresence;
    use crate::config::AppConfig;
    use actix_web::{test, App};
    use chrono::Utc;

    fn presence(call_sid: &str) -> CallPresence {
        CallPresence {
            call_sid: call_sid.to_string(),
            room_name: format!("call-{}", call_sid),
            stream_sid: format!("MZ-{}", call_sid),
            started_at: Utc::now(),
        }
    }

    #[actix_web::test]
    async fn test_health_reports_active_calls() {
        let state = AppState::new(AppConfig::default());
        state.registry.insert(presence("CA1"));

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["active_calls"], 1);
        assert_eq!(body["service"]["name"], "call-media-bridge");
        assert_eq!(body["system"]["status"], "normal");
    }

    #[actix_web::test]
    async fn test_metrics_lists_calls_and_utilization() {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_calls = 4;
        let state = AppState::new(config);
        state.registry.insert(presence("CA1"));
        state.registry.insert(presence("CA2"));

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/metrics").to_request()).await;
        assert_eq!(body["active_calls"], 2);
        assert_eq!(body["max_concurrent_calls"], 4);
        assert_eq!(body["utilization_percent"], 50.0);
        assert_eq!(body["calls"][0]["call_sid"], "CA1");
        assert_eq!(body["calls"][1]["room_name"], "call-CA2");
        assert_eq!(body["totals"]["calls_completed"], 0);
        assert_eq!(body["live_sessions"], 0);
        assert_eq!(body["sessions"], serde_json::json!([]));
    }
}
