//! # Retry Controller
//!
//! Wraps one engine call with the device-fault fallback policy: a failure
//! whose message looks like a driver or accelerator fault downgrades the
//! *job's* device to CPU and retries once with the conservative options.
//! Non-device failures and exhausted budgets propagate to the caller, which
//! decides whether the job dies or the segment gets a placeholder.

use crate::device::{DeviceClass, JobDevice};
use crate::error::AppError;
use crate::transcription::engine::{EngineCache, EngineOutput, TranscribeOptions};
use crate::transcription::model::ModelSize;
use std::path::Path;
use tracing::{error, warn};

/// How many attempts one engine call gets.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Robust mode budgets a second attempt for the CPU fallback;
    /// otherwise a failure is surfaced immediately.
    pub fn from_robust_mode(robust_mode: bool) -> Self {
        Self {
            max_attempts: if robust_mode { 2 } else { 1 },
        }
    }
}

/// Message patterns that indicate the device, not the audio, is at fault.
pub fn is_device_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["cuda", "cudnn", "cublas", "metal", "driver", "out of memory"]
        .iter()
        .any(|pattern| lower.contains(pattern))
}

/// Transcribe one audio file, downgrading the job to CPU on device faults.
///
/// The engine for the job's current device is fetched from the cache on
/// every attempt, so a downgrade picks up (or triggers) the CPU engine.
/// Inference runs on the blocking pool.
pub async fn transcribe_with_fallback(
    cache: &EngineCache,
    job_device: &JobDevice,
    model: ModelSize,
    audio_path: &Path,
    language: Option<String>,
    robust_mode: bool,
    policy: RetryPolicy,
) -> Result<EngineOutput, AppError> {
    let mut attempt = 1;
    loop {
        let selection = job_device.current();
        let options = TranscribeOptions::for_device(selection.class, robust_mode, language.clone());
        let engine = cache.get(model, &selection).await?;

        let path = audio_path.to_path_buf();
        let result = tokio::task::spawn_blocking(move || engine.transcribe(&path, &options))
            .await
            .map_err(|e| AppError::Job(format!("Transcription task panicked: {}", e)))?;

        match result {
            Ok(output) => return Ok(output),
            Err(e) => {
                let message = format!("{:#}", e);
                let device_fault = is_device_error(&message);

                if device_fault
                    && attempt < policy.max_attempts
                    && selection.class == DeviceClass::Accelerated
                {
                    warn!(
                        "Device fault on attempt {} for {} ({}), retrying on CPU",
                        attempt,
                        audio_path.display(),
                        message
                    );
                    job_device.downgrade_to_cpu();
                    attempt += 1;
                    continue;
                }

                error!(
                    "Transcription failed for {} after {} attempt(s): {}",
                    audio_path.display(),
                    attempt,
                    message
                );
                return Err(if device_fault {
                    AppError::Device(message)
                } else {
                    AppError::Job(message)
                });
            }
        }
    }
}
