//! # Transcription Backend - Entry Point
//!
//! Boots the long-audio transcription service: loads and validates the
//! configuration, initializes tracing, resolves the default compute
//! device, optionally preloads the default model, and serves the HTTP API
//! until a shutdown signal arrives.

mod audio;
mod config;
mod device;
mod error;
mod handlers;
mod health;
mod middleware;
mod progress;
mod state;
mod transcription;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use progress::ProgressStore;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use transcription::engine::EngineCache;
use transcription::model::ModelSize;
use transcription::whisper::WhisperLoader;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global shutdown flag, set by the signal handler task.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting transcribe-backend v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {}:{}, default model {}",
        config.server.host, config.server.port, config.models.default_model
    );

    // Resolve the process-wide default device once; each job copies it.
    let default_device = device::resolve_default_device(
        config.pipeline.force_cpu,
        config.pipeline.robust_mode,
    )
    .await;
    info!("Default compute device: {}", default_device.describe());

    let engines = Arc::new(EngineCache::new(Arc::new(WhisperLoader)));
    let app_state = AppState::new(
        config.clone(),
        ProgressStore::new(),
        engines.clone(),
        default_device.clone(),
    );

    if config.models.preload {
        preload_default_model(&config, &app_state).await;
    }

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .route("/transcribe", web::post().to(handlers::transcribe::transcribe))
            .route("/health", web::get().to(health::health_check))
            .route("/progress", web::get().to(handlers::progress::list_progress))
            .route(
                "/progress/{job_id}",
                web::get().to(handlers::progress::get_progress),
            )
            .route("/models", web::get().to(handlers::models::list_models))
            .route("/cleanup", web::post().to(handlers::progress::cleanup))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Load the configured default model before accepting traffic, so the
/// first request does not pay the multi-second load cost. A failure here
/// is logged but not fatal; the first job will retry the load.
async fn preload_default_model(config: &AppConfig, app_state: &AppState) {
    let model: ModelSize = match config.models.default_model.parse() {
        Ok(model) => model,
        // validate() already checked this; unreachable in practice.
        Err(e) => {
            warn!("Skipping preload, bad default model: {}", e);
            return;
        }
    };

    info!("Preloading default model {}...", model);
    match app_state.engines.get(model, &app_state.default_device).await {
        Ok(_) => info!("Default model {} preloaded", model),
        Err(e) => warn!("Preload of {} failed ({}), will load on first use", model, e),
    }
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "transcribe_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Install SIGTERM/SIGINT handlers that flip the global shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
