//! # Application State
//!
//! Shared state handed to every HTTP handler: configuration, the progress
//! store, the engine cache, the resolved default device and request
//! metrics. Everything mutable sits behind `Arc<RwLock<_>>` so concurrent
//! requests read without blocking each other and writes stay exclusive.

use crate::config::AppConfig;
use crate::device::DeviceSelection;
use crate::progress::ProgressStore;
use crate::transcription::engine::EngineCache;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Shared application state, cloned into each handler by actix.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (updatable at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Per-job progress records
    pub progress: ProgressStore,

    /// Loaded speech engines keyed by (model, device class)
    pub engines: Arc<EngineCache>,

    /// Process-wide default device, resolved once at startup; jobs copy
    /// it into their own per-job state
    pub default_device: Arc<DeviceSelection>,

    /// Request/job counters, updated by middleware and the pipeline
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Server start time for uptime reporting
    pub start_time: Instant,
}

/// Counters collected across all HTTP requests and jobs.
#[derive(Debug, Default)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,

    /// Transcription jobs currently running
    pub active_jobs: u32,

    /// Per-endpoint statistics, keyed by "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Statistics for one endpoint.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        progress: ProgressStore,
        engines: Arc<EngineCache>,
        default_device: DeviceSelection,
    ) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            progress,
            engines,
            default_device: Arc::new(default_device),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Snapshot the configuration; cloning releases the lock immediately.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
    }

    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.error_count += 1;
    }

    /// Record one finished request against its endpoint counters.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();
        let endpoint_metric = metrics
            .endpoint_metrics
            .entry(endpoint.to_string())
            .or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn increment_active_jobs(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.active_jobs += 1;
    }

    pub fn decrement_active_jobs(&self) {
        let mut metrics = self.metrics.write().unwrap();
        // Guard against underflow if a decrement races a crashed job.
        if metrics.active_jobs > 0 {
            metrics.active_jobs -= 1;
        }
    }

    /// Clone out the counters so serialization never holds the lock.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            active_jobs: metrics.active_jobs,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
