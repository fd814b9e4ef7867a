//! # Health Check Endpoint
//!
//! `GET /health` — liveness plus a small operational snapshot: uptime,
//! resident models, the resolved device and the request counters.

use crate::error::AppError;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(app_state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let metrics = app_state.get_metrics_snapshot();
    let models_loaded = app_state.engines.loaded_models().await;

    let endpoints: serde_json::Map<String, serde_json::Value> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            (
                endpoint.clone(),
                json!({
                    "requests": metric.request_count,
                    "errors": metric.error_count,
                    "avg_duration_ms": metric.average_duration_ms(),
                }),
            )
        })
        .collect();

    Ok(HttpResponse::Ok().json(json!({
        "status": "healthy",
        "service": "transcribe-backend",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": app_state.get_uptime_seconds(),
        "models_loaded": models_loaded,
        "device": {
            "class": app_state.default_device.class,
            "description": app_state.default_device.describe(),
            "precision": app_state.default_device.precision,
        },
        "active_jobs": metrics.active_jobs,
        "requests": {
            "total": metrics.request_count,
            "errors": metrics.error_count,
        },
        "endpoints": endpoints,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}
