//! # Model Listing Endpoint
//!
//! `GET /models` — the catalog of model variants the service can load,
//! which of them are currently resident, and the configured default.

use crate::error::AppError;
use crate::state::AppState;
use crate::transcription::model::ModelSize;
use actix_web::{web, HttpResponse};
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Serialize)]
pub struct ModelEntry {
    pub name: String,
    pub description: String,
    pub size_mb: u32,
    pub repo: String,
    pub loaded: bool,
}

pub async fn list_models(app_state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = app_state.get_config();
    let loaded = app_state.engines.loaded_models().await;

    let models: Vec<ModelEntry> = ModelSize::all()
        .iter()
        .map(|size| ModelEntry {
            name: size.to_string(),
            description: size.description().to_string(),
            size_mb: size.size_mb(),
            repo: size.repo_name().to_string(),
            loaded: loaded.contains(&size.to_string()),
        })
        .collect();

    Ok(HttpResponse::Ok().json(json!({
        "available_models": models,
        "loaded_models": loaded,
        "default_model": config.models.default_model,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_covers_all_sizes() {
        let names: Vec<String> = ModelSize::all().iter().map(|s| s.to_string()).collect();
        assert_eq!(
            names,
            vec!["tiny", "base", "small", "medium", "large-v1", "large-v2", "large-v3"]
        );
    }

    #[tokio::test]
    async fn test_response_field_names_are_stable() {
        use crate::config::AppConfig;
        use crate::device::DeviceSelection;
        use crate::progress::ProgressStore;
        use crate::transcription::engine::testing::FakeLoader;
        use crate::transcription::engine::EngineCache;
        use std::sync::Arc;

        let state = AppState::new(
            AppConfig::default(),
            ProgressStore::new(),
            Arc::new(EngineCache::new(Arc::new(FakeLoader::default()))),
            DeviceSelection::cpu(),
        );

        let response = list_models(web::Data::new(state)).await.unwrap();
        let bytes = actix_web::body::to_bytes(response.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        // Pollers key off these exact names.
        assert!(json["available_models"].is_array());
        assert!(json["loaded_models"].is_array());
        assert_eq!(json["default_model"], "medium");
    }

    #[test]
    fn test_model_entry_serialization() {
        let entry = ModelEntry {
            name: "medium".to_string(),
            description: ModelSize::Medium.description().to_string(),
            size_mb: 769,
            repo: "openai/whisper-medium".to_string(),
            loaded: false,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("openai/whisper-medium"));
        assert!(json.contains("769"));
    }
}
