//! # Recognition Engine Interface
//!
//! The speech-recognition engine is an opaque capability behind two small
//! traits: [`EngineLoader`] turns a model name and device into a loaded
//! engine, and [`SpeechEngine`] exposes the synchronous, blocking
//! transcribe call. The pipeline, scheduler and retry controller only see
//! these traits, which is what makes them testable with a deterministic
//! fake engine.
//!
//! ## Engine cache
//! Loading a model takes seconds to minutes, so loaded engines are cached
//! per `(model, device class)`. The load-and-insert sequence holds a
//! mutex: a second job requesting a model that is already loading blocks
//! until the first load finishes instead of loading it twice. Cache hits
//! read the map without touching the load lock.

use crate::device::{DeviceClass, DeviceSelection};
use crate::error::AppError;
use crate::transcription::model::ModelSize;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// One timed span of recognized speech, relative to the start of the
/// audio handed to the engine.
#[derive(Debug, Clone)]
pub struct EngineSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    /// Mean log-probability of the decoded tokens; used as a confidence
    /// proxy downstream
    pub avg_logprob: f64,
}

/// Per-call metadata reported by the engine.
#[derive(Debug, Clone)]
pub struct EngineInfo {
    pub language: String,
    pub language_probability: f64,
}

/// Full result of one transcribe call.
#[derive(Debug, Clone)]
pub struct EngineOutput {
    pub segments: Vec<EngineSegment>,
    pub info: EngineInfo,
}

/// Voice-activity-detection parameters forwarded to the engine.
#[derive(Debug, Clone)]
pub struct VadOptions {
    pub min_silence_duration_ms: u32,
    pub speech_threshold: f32,
    pub min_speech_duration_ms: u32,
}

/// Tuning knobs for one transcribe call.
#[derive(Debug, Clone)]
pub struct TranscribeOptions {
    /// Target language; `None` asks the engine to detect it
    pub language: Option<String>,
    pub beam_size: usize,
    pub best_of: usize,
    pub temperature: f32,
    pub vad: VadOptions,
    /// Reject decoded text whose compression ratio exceeds this ceiling
    pub compression_ratio_threshold: f32,
    /// Drop segments whose mean log-probability falls below this floor
    pub log_prob_threshold: f32,
    /// Treat windows above this no-speech probability as silence
    pub no_speech_threshold: f32,
}

impl TranscribeOptions {
    /// Higher-quality preset for confirmed-stable accelerated devices.
    pub fn quality(language: Option<String>) -> Self {
        Self {
            language,
            beam_size: 3,
            best_of: 3,
            temperature: 0.0,
            vad: VadOptions {
                min_silence_duration_ms: 1000,
                speech_threshold: 0.5,
                min_speech_duration_ms: 250,
            },
            compression_ratio_threshold: 2.4,
            log_prob_threshold: -1.0,
            no_speech_threshold: 0.6,
        }
    }

    /// Conservative preset for CPU and robust mode: smaller search,
    /// looser VAD, same quality thresholds.
    pub fn conservative(language: Option<String>) -> Self {
        Self {
            beam_size: 1,
            best_of: 1,
            vad: VadOptions {
                min_silence_duration_ms: 500,
                speech_threshold: 0.5,
                min_speech_duration_ms: 250,
            },
            ..Self::quality(language)
        }
    }

    /// Preset matching the device a call will actually run on.
    pub fn for_device(class: DeviceClass, robust_mode: bool, language: Option<String>) -> Self {
        if class == DeviceClass::Accelerated && !robust_mode {
            Self::quality(language)
        } else {
            Self::conservative(language)
        }
    }
}

/// A loaded recognition engine.
///
/// `transcribe` blocks its calling thread for the duration of inference;
/// async callers must wrap it in `spawn_blocking`.
pub trait SpeechEngine: Send + Sync {
    fn transcribe(&self, audio_path: &Path, options: &TranscribeOptions)
        -> anyhow::Result<EngineOutput>;

    fn model(&self) -> ModelSize;

    fn device_class(&self) -> DeviceClass;
}

/// Turns `(model, device)` into a loaded [`SpeechEngine`].
#[async_trait]
pub trait EngineLoader: Send + Sync {
    async fn load(
        &self,
        model: ModelSize,
        device: &DeviceSelection,
    ) -> Result<Arc<dyn SpeechEngine>, AppError>;
}

/// Process-wide cache of loaded engines.
pub struct EngineCache {
    engines: RwLock<HashMap<(ModelSize, DeviceClass), Arc<dyn SpeechEngine>>>,
    load_lock: Mutex<()>,
    loader: Arc<dyn EngineLoader>,
}

impl EngineCache {
    pub fn new(loader: Arc<dyn EngineLoader>) -> Self {
        Self {
            engines: RwLock::new(HashMap::new()),
            load_lock: Mutex::new(()),
            loader,
        }
    }

    /// Fetch the engine for `(model, device)`, loading it at most once.
    pub async fn get(
        &self,
        model: ModelSize,
        device: &DeviceSelection,
    ) -> Result<Arc<dyn SpeechEngine>, AppError> {
        let key = (model, device.class);

        if let Some(engine) = self.engines.read().await.get(&key) {
            debug!("Engine cache hit for {} on {}", model, device.class);
            return Ok(engine.clone());
        }

        let _guard = self.load_lock.lock().await;

        // Someone may have finished loading while we waited for the lock.
        if let Some(engine) = self.engines.read().await.get(&key) {
            return Ok(engine.clone());
        }

        info!("Loading model {} on {}", model, device.class);
        let engine = self.loader.load(model, device).await?;
        self.engines.write().await.insert(key, engine.clone());
        info!("Model {} ready on {}", model, device.class);
        Ok(engine)
    }

    /// Distinct model names currently loaded, for `/health` and `/models`.
    pub async fn loaded_models(&self) -> Vec<String> {
        let engines = self.engines.read().await;
        let mut names: Vec<String> = engines.keys().map(|(m, _)| m.to_string()).collect();
        names.sort();
        names.dedup();
        names
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Deterministic engine doubles shared by the retry, scheduler and
    //! pipeline tests.

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Fake engine whose output is derived from the input filename, so
    /// assertions can check ordering without real inference.
    pub struct FakeEngine {
        pub model_size: ModelSize,
        pub class: DeviceClass,
        /// Fail any call whose path contains this marker
        pub fail_matching: Option<String>,
        /// Error message used for injected failures
        pub fail_message: String,
        /// Sleep so that higher segment indexes finish *earlier*,
        /// exercising out-of-order completion in parallel mode
        pub reverse_delays: bool,
        /// Derive text from the audio content (one word per second)
        /// instead of the filename, so segmented and whole-file runs
        /// over the same recording produce equivalent transcripts
        pub words_per_second: bool,
        pub calls: Arc<AtomicUsize>,
    }

    impl FakeEngine {
        pub fn new(class: DeviceClass) -> Self {
            Self {
                model_size: ModelSize::Medium,
                class,
                fail_matching: None,
                fail_message: "synthetic failure".to_string(),
                reverse_delays: false,
                words_per_second: false,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl SpeechEngine for FakeEngine {
        fn transcribe(
            &self,
            audio_path: &Path,
            options: &TranscribeOptions,
        ) -> anyhow::Result<EngineOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            let stem = audio_path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();

            if self.reverse_delays {
                if let Some(index) = parse_segment_index(&stem) {
                    let delay = 10 * (8usize.saturating_sub(index)) as u64;
                    std::thread::sleep(Duration::from_millis(delay));
                }
            }

            if let Some(marker) = &self.fail_matching {
                if stem.contains(marker.as_str()) {
                    anyhow::bail!("{}", self.fail_message);
                }
            }

            let (text, end) = if self.words_per_second {
                let (samples, rate) = crate::audio::preprocess::load_mono_f32(audio_path)?;
                let seconds = (samples.len() as f64 / rate as f64).round().max(1.0);
                (vec!["speech"; seconds as usize].join(" "), seconds)
            } else {
                (format!("<{}>", stem), 1.0)
            };

            Ok(EngineOutput {
                segments: vec![EngineSegment {
                    start: 0.0,
                    end,
                    text,
                    avg_logprob: -0.2,
                }],
                info: EngineInfo {
                    language: options.language.clone().unwrap_or_else(|| "en".to_string()),
                    language_probability: 0.93,
                },
            })
        }

        fn model(&self) -> ModelSize {
            self.model_size
        }

        fn device_class(&self) -> DeviceClass {
            self.class
        }
    }

    fn parse_segment_index(stem: &str) -> Option<usize> {
        stem.rsplit("_seg").next()?.parse().ok()
    }

    /// Loader handing out [`FakeEngine`]s, optionally poisoning the
    /// accelerated variant so retry tests can force a downgrade.
    pub struct FakeLoader {
        pub fail_accelerated_calls: bool,
        pub fail_loading: bool,
        pub fail_matching: Option<String>,
        pub reverse_delays: bool,
        pub words_per_second: bool,
        pub loads: AtomicUsize,
    }

    impl Default for FakeLoader {
        fn default() -> Self {
            Self {
                fail_accelerated_calls: false,
                fail_loading: false,
                fail_matching: None,
                reverse_delays: false,
                words_per_second: false,
                loads: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EngineLoader for FakeLoader {
        async fn load(
            &self,
            model: ModelSize,
            device: &DeviceSelection,
        ) -> Result<Arc<dyn SpeechEngine>, AppError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail_loading {
                return Err(AppError::EngineLoad("loader is broken".to_string()));
            }

            let mut engine = FakeEngine::new(device.class);
            engine.model_size = model;
            engine.reverse_delays = self.reverse_delays;
            engine.words_per_second = self.words_per_second;
            if self.fail_accelerated_calls && device.class == DeviceClass::Accelerated {
                engine.fail_matching = Some(String::new());
                engine.fail_message = "CUDA error: CUBLAS_STATUS_EXECUTION_FAILED".to_string();
            } else if let Some(marker) = &self.fail_matching {
                engine.fail_matching = Some(marker.clone());
                engine.fail_message = "CUDA error: device-side assert triggered".to_string();
            }
            Ok(Arc::new(engine))
        }
    }
}
