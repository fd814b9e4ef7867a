//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! A few legacy environment variables used by the deployment harness are
//! honored without the APP_ prefix: `HOST`, `PORT`, `TRANSCRIPTION_PORT`,
//! `FORCE_CPU` and `ROBUST_MODE`.
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Legacy environment variables
//! 2. APP_-prefixed environment variables
//! 3. Configuration file (config.toml)
//! 4. Default values

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub audio: AudioConfig,
    pub pipeline: PipelineConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Speech-recognition model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Model loaded when a request does not name one
    pub default_model: String,

    /// Language hint passed to the engine when the request has none;
    /// `None` means auto-detect
    pub default_language: Option<String>,

    /// Eagerly load the default model at startup so the first request
    /// does not pay the load cost
    pub preload: bool,
}

/// Input-audio validation and segmentation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Maximum accepted file size in bytes (default 500 MiB, sized for
    /// multi-hour recordings)
    pub max_file_size_bytes: u64,

    /// Accepted file extensions, lowercase with leading dot
    pub supported_extensions: Vec<String>,

    /// Target length of one segment in seconds
    pub segment_duration_secs: f64,

    /// Audio longer than this is split into segments; shorter audio is
    /// transcribed as a single unit
    pub segment_threshold_secs: f64,
}

/// Execution-mode settings for the transcription pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum number of segments transcribed concurrently
    pub worker_count: usize,

    /// Run segment transcription on a worker pool instead of sequentially
    pub parallel: bool,

    /// Conservative parameters and a 2-attempt retry budget; trades quality
    /// for resilience against driver instability
    pub robust_mode: bool,

    /// Skip accelerated devices entirely
    pub force_cpu: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 5000,
            },
            models: ModelsConfig {
                default_model: "medium".to_string(),
                default_language: None,
                preload: true,
            },
            audio: AudioConfig {
                max_file_size_bytes: 500 * 1024 * 1024,
                supported_extensions: vec![
                    ".mp3".to_string(),
                    ".wav".to_string(),
                    ".flac".to_string(),
                    ".m4a".to_string(),
                    ".ogg".to_string(),
                ],
                segment_duration_secs: 600.0,
                segment_threshold_secs: 600.0,
            },
            pipeline: PipelineConfig {
                worker_count: 3,
                parallel: true,
                robust_mode: true,
                force_cpu: false,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, config.toml and the environment.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Legacy variables recognized by the deployment harness.
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }
        if let Ok(port) = env::var("TRANSCRIPTION_PORT") {
            settings = settings.set_override("server.port", port)?;
        }
        if let Ok(force_cpu) = env::var("FORCE_CPU") {
            settings = settings.set_override("pipeline.force_cpu", truthy(&force_cpu))?;
        }
        if let Ok(robust) = env::var("ROBUST_MODE") {
            settings = settings.set_override("pipeline.robust_mode", truthy(&robust))?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.pipeline.worker_count == 0 {
            return Err(anyhow::anyhow!("Worker count must be greater than 0"));
        }

        if self.audio.segment_duration_secs <= 0.0 {
            return Err(anyhow::anyhow!("Segment duration must be positive"));
        }

        if self.audio.segment_threshold_secs < 0.0 {
            return Err(anyhow::anyhow!("Segment threshold cannot be negative"));
        }

        if self.audio.max_file_size_bytes == 0 {
            return Err(anyhow::anyhow!("Max file size must be greater than 0"));
        }

        if self.audio.supported_extensions.is_empty() {
            return Err(anyhow::anyhow!("Supported extension list cannot be empty"));
        }

        self.models
            .default_model
            .parse::<crate::transcription::model::ModelSize>()
            .map_err(|e| anyhow::anyhow!("Invalid default model: {}", e))?;

        Ok(())
    }
}

/// Interpret harness-style boolean strings ("true", "1", "yes").
fn truthy(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes")
}
