//! Per-endpoint HTTP counters, reported under `http` in `GET /metrics`.
//!
//! Endpoints are keyed by their route pattern (`GET /api/v1/health`), never by
//! the raw path, so unmatched requests (scanners, typos) collapse into a single `unmatched` entry.

use crate::state::AppState;
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    web, Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};

pub struct MetricsMiddleware;

impl<S, B> Transform<S, ServiceRequest> for MetricsMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = MetricsMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MetricsMiddlewareService { service }))
    }
}

pub struct MetricsMiddlewareService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for MetricsMiddlewareService<S>
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
        let method = req.method().to_string();
        let app_state = req.app_data::<web::Data<AppState>>().cloned();

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let Some(app_state) = app_state else {
                return result;
            };

            let duration_ms = start_time.elapsed().as_millis() as u64;
            let (pattern, is_error) = match &result {
                Ok(response) => {
                    let status = response.status();
                    (
                        response.request().match_pattern(),
                        status.is_client_error() || status.is_server_error(),
                    )
                }
                Err(_) => (None, true),
            };

            let endpoint = format!("{} {}", method, pattern.as_deref().unwrap_or("unmatched"));
            app_state.record_request(&endpoint, duration_ms, is_error);

            result
        })
    }
}
