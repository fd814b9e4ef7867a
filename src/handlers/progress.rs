//! # Progress and Cleanup Endpoints
//!
//! Polling surface over the progress store, plus the manual eviction of
//! finished jobs.

use crate::error::AppError;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

/// `GET /progress/{job_id}` — one job's progress record.
pub async fn get_progress(
    app_state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let job_id = path.into_inner();
    match app_state.progress.get(&job_id) {
        Some(view) => Ok(HttpResponse::Ok().json(view)),
        None => Err(AppError::NotFound(format!("Unknown job: {}", job_id))),
    }
}

/// `GET /progress` — every known job, keyed by id.
pub async fn list_progress(app_state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let jobs = app_state.progress.list();
    Ok(HttpResponse::Ok().json(json!({
        "count": jobs.len(),
        "jobs": jobs,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}

/// Request body for `POST /cleanup`.
#[derive(Debug, Deserialize)]
pub struct CleanupRequest {
    /// Age cutoff in minutes; defaults to 30
    pub older_than_minutes: Option<u64>,
}

/// `POST /cleanup` — evict terminal progress records older than the
/// cutoff. Running jobs are never touched, so the call is idempotent.
pub async fn cleanup(
    app_state: web::Data<AppState>,
    request: Option<web::Json<CleanupRequest>>,
) -> Result<HttpResponse, AppError> {
    let older_than_minutes = request
        .and_then(|r| r.into_inner().older_than_minutes)
        .unwrap_or(30);

    let report = app_state.progress.cleanup(older_than_minutes);
    info!(
        "Cleanup removed {} job(s) older than {} minute(s), {} remaining",
        report.removed_jobs, older_than_minutes, report.remaining_jobs
    );

    Ok(HttpResponse::Ok().json(json!({
        "removed_jobs": report.removed_jobs,
        "removed_job_ids": report.removed_job_ids,
        "remaining_jobs": report.remaining_jobs,
        "older_than_minutes": older_than_minutes,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_request_parsing() {
        let request: CleanupRequest =
            serde_json::from_str(r#"{"older_than_minutes": 5}"#).unwrap();
        assert_eq!(request.older_than_minutes, Some(5));

        let request: CleanupRequest = serde_json::from_str("{}").unwrap();
        assert!(request.older_than_minutes.is_none());
    }
}
