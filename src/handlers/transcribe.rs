//! # Transcription Endpoint
//!
//! `POST /transcribe` runs a whole job synchronously and returns the
//! finished transcript. Pre-job validation failures (missing path,
//! unknown model) are HTTP 400; anything that fails after the job has
//! started comes back as HTTP 200 with `success: false`, because by then
//! the job id exists and its progress record tells the full story.

use crate::error::AppError;
use crate::state::AppState;
use crate::transcription::model::ModelSize;
use crate::transcription::pipeline::{self, JobParams};
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::info;

/// Request body for `POST /transcribe`.
#[derive(Debug, Deserialize)]
pub struct TranscribeRequest {
    /// Path to the audio file on the server's filesystem
    pub file_path: Option<String>,
    /// Model name; falls back to the configured default
    pub model: Option<String>,
    /// Language hint; `None` lets the engine detect
    pub language: Option<String>,
    /// Attach an extractive summary to the result; off unless requested
    pub generate_summary: Option<bool>,
    /// Caller-supplied job id for progress polling; generated if absent
    pub job_id: Option<String>,
}

pub async fn transcribe(
    app_state: web::Data<AppState>,
    request: web::Json<TranscribeRequest>,
) -> Result<HttpResponse, AppError> {
    let request = request.into_inner();

    let file_path = request
        .file_path
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| AppError::BadRequest("file_path is required".to_string()))?;

    let config = app_state.get_config();
    let model: ModelSize = request
        .model
        .as_deref()
        .unwrap_or(&config.models.default_model)
        .parse()
        .map_err(|e| AppError::BadRequest(format!("Invalid model: {}", e)))?;

    let job_id = request
        .job_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| pipeline::derive_job_id(Path::new(&file_path)));

    info!("POST /transcribe: {} as job {}", file_path, job_id);

    let params = JobParams {
        file_path: PathBuf::from(&file_path),
        model,
        language: request.language,
        generate_summary: request.generate_summary.unwrap_or(false),
        job_id: job_id.clone(),
    };

    let result = pipeline::run_job(
        &config,
        &app_state.progress,
        &app_state.engines,
        &app_state.default_device,
        params,
    )
    .await;

    match result {
        Ok(transcript) => Ok(HttpResponse::Ok().json(transcript)),
        // The job exists and its progress record is terminal; report the
        // failure in-band rather than as a transport error.
        Err(e) => {
            if e.is_user_error() {
                tracing::warn!("Job {} rejected: {}", job_id, e);
            } else {
                tracing::error!("Job {} failed: {}", job_id, e);
            }
            Ok(HttpResponse::Ok().json(json!({
                "success": false,
                "error": e.to_string(),
                "job_id": job_id,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            })))
        }
    }
}
