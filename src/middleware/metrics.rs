//! Request counting middleware. Increments the global request counter on
//! entry, records per-endpoint duration and error counters on exit, and
//! owns the active-job gauge: a transcription request counts as an active
//! job for exactly as long as it is in flight, whether it succeeds,
//! fails, or never reaches the handler.

use crate::state::AppState;
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::Method,
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
        let endpoint = format!("{} {}", req.method(), req.uri().path());
        let is_job_request = req.method() == Method::POST && req.uri().path() == "/transcribe";

        // Capture the state before the call so the exit-side bookkeeping
        // runs even when the handler errors out.
        let app_state = req.app_data::<web::Data<AppState>>().cloned();

        if let Some(state) = &app_state {
            state.increment_request_count();
            if is_job_request {
                state.increment_active_jobs();
            }
        }

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let duration_ms = start_time.elapsed().as_millis() as u64;

            let is_error = match &result {
                Ok(response) => {
                    response.status().is_client_error() || response.status().is_server_error()
                }
                Err(_) => true,
            };

            if let Some(state) = &app_state {
                if is_job_request {
                    state.decrement_active_jobs();
                }
                state.record_endpoint_request(&endpoint, duration_ms, is_error);
                if is_error {
                    state.increment_error_count();
                }
            }

            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::device::DeviceSelection;
    use crate::progress::ProgressStore;
    use crate::transcription::engine::testing::FakeLoader;
    use crate::transcription::engine::EngineCache;
    use actix_web::{test, App, HttpResponse};
    use std::sync::Arc;

    fn test_state() -> AppState {
        AppState::new(
            AppConfig::default(),
            ProgressStore::new(),
            Arc::new(EngineCache::new(Arc::new(FakeLoader::default()))),
            DeviceSelection::cpu(),
        )
    }

    /// Reports the active-job gauge as seen from inside the handler.
    async fn active_jobs_snapshot(app_state: web::Data<AppState>) -> HttpResponse {
        HttpResponse::Ok().json(serde_json::json!({
            "active_jobs": app_state.get_metrics_snapshot().active_jobs,
        }))
    }

    #[actix_web::test]
    async fn test_transcribe_requests_count_as_active_jobs() {
        let state = test_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .wrap(MetricsMiddleware)
                .route("/transcribe", web::post().to(active_jobs_snapshot)),
        )
        .await;

        let req = test::TestRequest::post().uri("/transcribe").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        // Active while the handler ran, released afterwards.
        assert_eq!(body["active_jobs"], 1);
        let snapshot = state.get_metrics_snapshot();
        assert_eq!(snapshot.active_jobs, 0);
        assert_eq!(snapshot.request_count, 1);
        assert!(snapshot.endpoint_metrics.contains_key("POST /transcribe"));
    }

    #[actix_web::test]
    async fn test_non_job_requests_leave_the_gauge_alone() {
        let state = test_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .wrap(MetricsMiddleware)
                .route("/health", web::get().to(active_jobs_snapshot)),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["active_jobs"], 0);
        assert_eq!(state.get_metrics_snapshot().request_count, 1);
    }
}
