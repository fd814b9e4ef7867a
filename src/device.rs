//! # Device Selection
//!
//! Resolves the compute device for model inference once at process start:
//! prefer an accelerated device (CUDA, then Metal), confirm driver health
//! with a small synthetic tensor op under a timeout, and fall back to CPU
//! with a more conservative precision when the probe fails or hangs.
//!
//! The resolved selection is the process-wide *default*. Each job copies it
//! into its own [`JobDevice`]; the retry controller downgrades only that
//! copy, so one job's driver fault never degrades concurrent jobs.

use candle_core::{Device, Tensor};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Seconds the synthetic probe may take before the driver is considered
/// unhealthy. Bounds an otherwise-unbounded hang against a bad driver.
const PROBE_TIMEOUT_SECS: u64 = 5;

/// Coarse device family, used as part of the engine-cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    /// CUDA or Metal
    Accelerated,
    /// General-purpose compute fallback
    Cpu,
}

impl std::fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceClass::Accelerated => write!(f, "accelerated"),
            DeviceClass::Cpu => write!(f, "cpu"),
        }
    }
}

/// Numeric precision used for inference; accelerated devices run the
/// faster half precision, the CPU fallback the safer full precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputePrecision {
    Float16,
    Float32,
}

/// A resolved device choice.
#[derive(Debug, Clone)]
pub struct DeviceSelection {
    pub class: DeviceClass,
    pub device: Device,
    pub precision: ComputePrecision,
}

impl DeviceSelection {
    pub fn cpu() -> Self {
        Self {
            class: DeviceClass::Cpu,
            device: Device::Cpu,
            precision: ComputePrecision::Float32,
        }
    }

    pub fn describe(&self) -> String {
        match &self.device {
            Device::Cpu => "CPU".to_string(),
            Device::Cuda(_) => "CUDA GPU".to_string(),
            Device::Metal(_) => "Metal GPU".to_string(),
        }
    }
}

/// Per-job device state. Segment workers of one job share it; a downgrade
/// by the retry controller is visible to the job's remaining segments but
/// to nothing else in the process.
#[derive(Debug, Clone)]
pub struct JobDevice {
    inner: Arc<RwLock<DeviceSelection>>,
}

impl JobDevice {
    pub fn new(selection: DeviceSelection) -> Self {
        Self {
            inner: Arc::new(RwLock::new(selection)),
        }
    }

    pub fn current(&self) -> DeviceSelection {
        self.inner.read().unwrap().clone()
    }

    /// Switch this job to the CPU fallback. Returns false if it already
    /// was there, meaning there is nothing left to downgrade to.
    pub fn downgrade_to_cpu(&self) -> bool {
        let mut selection = self.inner.write().unwrap();
        if selection.class == DeviceClass::Cpu {
            return false;
        }
        warn!("Downgrading job to CPU after device fault");
        *selection = DeviceSelection::cpu();
        true
    }
}

/// Resolve the process-wide default device selection.
///
/// `force_cpu` and `robust_mode` both short-circuit to CPU; robust mode
/// trades throughput for stability on machines with flaky drivers.
pub async fn resolve_default_device(force_cpu: bool, robust_mode: bool) -> DeviceSelection {
    if force_cpu {
        info!("FORCE_CPU set, using CPU");
        return DeviceSelection::cpu();
    }
    if robust_mode {
        info!("Robust mode active: using CPU for maximum stability");
        return DeviceSelection::cpu();
    }

    let candidate = match detect_accelerated() {
        Some(device) => device,
        None => {
            info!("No accelerated device available, using CPU");
            return DeviceSelection::cpu();
        }
    };

    match probe_device(candidate.clone()).await {
        Ok(()) => {
            info!("Device probe succeeded, using {}", describe(&candidate));
            DeviceSelection {
                class: DeviceClass::Accelerated,
                device: candidate,
                precision: ComputePrecision::Float16,
            }
        }
        Err(e) => {
            warn!("Device probe failed ({}), falling back to CPU", e);
            DeviceSelection::cpu()
        }
    }
}

/// Try CUDA first, then Metal.
fn detect_accelerated() -> Option<Device> {
    match Device::new_cuda(0) {
        Ok(device) => {
            debug!("CUDA device 0 available");
            return Some(device);
        }
        Err(e) => debug!("CUDA not available: {}", e),
    }

    match Device::new_metal(0) {
        Ok(device) => {
            debug!("Metal device 0 available");
            Some(device)
        }
        Err(e) => {
            debug!("Metal not available: {}", e);
            None
        }
    }
}

/// Run a tiny matmul on the device under a timeout. A driver that cannot
/// finish this within the budget is not trusted with hour-long inference.
async fn probe_device(device: Device) -> anyhow::Result<()> {
    let op = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let x = Tensor::randn(0f32, 1f32, (8, 8), &device)?;
        let y = x.matmul(&x)?;
        let _ = y.sum_all()?.to_scalar::<f32>()?;
        Ok(())
    });

    match tokio::time::timeout(Duration::from_secs(PROBE_TIMEOUT_SECS), op).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(anyhow::anyhow!("probe task panicked: {}", join_err)),
        Err(_) => Err(anyhow::anyhow!(
            "probe timed out after {}s",
            PROBE_TIMEOUT_SECS
        )),
    }
}

fn describe(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "CPU",
        Device::Cuda(_) => "CUDA GPU",
        Device::Metal(_) => "Metal GPU",
    }
}
