//! Request logging.
//!
//! Every request gets a short request id in its log lines. Monitoring traffic
//! (`/health`, `/metrics`) logs at debug. WebSocket upgrades log at info
//! with their 101.

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct RequestLogging;

impl<S, B> Transform<S, ServiceRequest> for RequestLogging
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RequestLoggingMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestLoggingMiddleware { service }))
    }
}

pub struct RequestLoggingMiddleware<S> {
    service: S,
}

fn is_monitoring(path: &str) -> bool {
    path.ends_with("/health") || path.ends_with("/metrics")
}

impl<S, B> Service<ServiceRequest> for RequestLoggingMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let start_time = Instant::now();
        let request_id = Uuid::new_v4().simple().to_string()[..8].to_string();
        let method = req.method().to_string();
        let path = req.path().to_string();
        let remote_addr = req
            .connection_info()
            .realip_remote_addr()
            .unwrap_or("unknown")
            .to_string();
        let monitoring = is_monitoring(&path);

        debug!(
            request_id = %request_id,
            method = %method,
            path = %path,
            remote_addr = %remote_addr,
            "Request started"
        );

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let duration_ms = start_time.elapsed().as_millis() as u64;

            match &result {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if status >= 500 {
                        warn!(request_id = %request_id, method = %method, path = %path, status, duration_ms, "Request failed");
                    } else if monitoring {
                        debug!(request_id = %request_id, method = %method, path = %path, status, duration_ms, "Request completed");
                    } else {
                        info!(
                            request_id = %request_id,
                            method = %method,
                            path = %path,
                            remote_addr = %remote_addr,
                            status,
                            duration_ms,
                            "Request completed"
                        );
                    }
                }
                Err(err) => {
                    warn!(
                        request_id = %request_id,
                        method = %method,
                        path = %path,
                        remote_addr = %remote_addr,
                        duration_ms,
                        error = %err,
                        "Request failed"
                    );
                }
            }

            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitoring_paths() {
        assert!(is_monitoring("/health"));
        assert!(is_monitoring("/api/v1/metrics"));
        assert!(!is_monitoring("/media-stream"));
    }
}
