//! # Transcription Pipeline
//!
//! Drives one job through its linear stages: validate, preprocess, load
//! model, segment, schedule, assemble. Each stage advances the job's
//! progress record through fixed milestones; every error path funnels
//! into the progress store's `fail`, so a polling client always sees a
//! terminal record instead of a silently vanished job.
//!
//! Each job gets its own temporary arena directory for processed audio,
//! segment files and partial-transcript sidecars. The arena is removed on
//! every exit path when the `TempDir` guard drops.

use crate::audio::{preprocess, probe, segmenter, Segment};
use crate::config::AppConfig;
use crate::device::{DeviceSelection, JobDevice};
use crate::error::{AppError, AppResult};
use crate::progress::ProgressStore;
use crate::transcription::assembler::{assemble, TranscriptResult};
use crate::transcription::engine::EngineCache;
use crate::transcription::model::ModelSize;
use crate::transcription::retry::RetryPolicy;
use crate::transcription::scheduler::{self, ScheduleContext};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Resolved inputs for one job, past HTTP-level validation.
#[derive(Debug, Clone)]
pub struct JobParams {
    pub file_path: PathBuf,
    pub model: ModelSize,
    pub language: Option<String>,
    pub generate_summary: bool,
    pub job_id: String,
}

/// Default job id: `job_{epoch_millis}_{basename}`.
pub fn derive_job_id(file_path: &Path) -> String {
    let basename = file_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "audio".to_string());
    format!(
        "job_{}_{}",
        chrono::Utc::now().timestamp_millis(),
        sanitize(&basename)
    )
}

/// Job ids end up in temp-dir prefixes and log lines; strip anything
/// path-hostile from caller-supplied material.
fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Run one transcription job to a terminal state.
///
/// On success the progress record is completed (percent 100); on failure
/// it is frozen with the error message. The returned error mirrors what
/// was recorded.
pub async fn run_job(
    config: &AppConfig,
    progress: &ProgressStore,
    engines: &Arc<EngineCache>,
    default_device: &DeviceSelection,
    params: JobParams,
) -> AppResult<TranscriptResult> {
    let job_id = params.job_id.clone();
    info!(
        "Job {}: starting for {} (model {})",
        job_id,
        params.file_path.display(),
        params.model
    );

    progress.start(&job_id);

    match drive(config, progress, engines, default_device, &params).await {
        Ok(result) => {
            progress.complete(&job_id);
            info!(
                "Job {}: completed in {:.1}s ({} segments)",
                job_id, result.processing_time, result.segments_count
            );
            Ok(result)
        }
        Err(e) => {
            progress.fail(&job_id, &e.to_string());
            Err(e)
        }
    }
}

async fn drive(
    config: &AppConfig,
    progress: &ProgressStore,
    engines: &Arc<EngineCache>,
    default_device: &DeviceSelection,
    params: &JobParams,
) -> AppResult<TranscriptResult> {
    let started = Instant::now();
    let job_id = &params.job_id;

    progress.set_stage(job_id, "Validating audio file...", 5);
    let descriptor = probe::probe(
        &params.file_path,
        config.audio.max_file_size_bytes,
        &config.audio.supported_extensions,
    )?;
    progress.update(job_id, |p| p.total_duration = descriptor.duration);

    // Arena for processed audio, segment files and sidecars; dropped
    // (and removed) on every exit path of this function.
    let arena = tempfile::Builder::new()
        .prefix(&format!("{}_", sanitize(job_id)))
        .tempdir()
        .map_err(|e| AppError::Job(format!("Could not create job workspace: {}", e)))?;

    progress.set_stage(job_id, "Preprocessing audio...", 10);
    let processed = preprocess::normalize(&params.file_path, arena.path());

    progress.set_stage(job_id, "Loading model...", 20);
    let job_device = JobDevice::new(default_device.clone());
    // Warm the engine up front so load failures kill the job here, not
    // inside every segment worker.
    engines.get(params.model, &job_device.current()).await?;

    progress.set_stage(job_id, "Starting transcription...", 25);
    let segments = plan_segments(config, &processed, descriptor.duration, arena.path());

    let ctx = ScheduleContext {
        cache: engines.clone(),
        job_device,
        model: params.model,
        language: params
            .language
            .clone()
            .or_else(|| config.models.default_language.clone()),
        robust_mode: config.pipeline.robust_mode,
        policy: RetryPolicy::from_robust_mode(config.pipeline.robust_mode),
        progress: progress.clone(),
        job_id: job_id.clone(),
        total_duration: descriptor.duration,
        scratch_dir: arena.path().to_path_buf(),
    };
    let results = scheduler::run(
        &ctx,
        &segments,
        config.pipeline.parallel,
        config.pipeline.worker_count,
    )
    .await;

    progress.set_stage(job_id, "Finalizing...", 95);
    Ok(assemble(
        job_id,
        results,
        params.model,
        descriptor.duration,
        started.elapsed().as_secs_f64(),
        params.generate_summary,
    ))
}

/// Segment only recordings longer than the threshold; everything else is
/// one whole-file unit of work.
fn plan_segments(
    config: &AppConfig,
    audio_path: &Path,
    total_duration: f64,
    arena: &Path,
) -> Vec<Segment> {
    if total_duration > config.audio.segment_threshold_secs {
        segmenter::split(
            audio_path,
            total_duration,
            config.audio.segment_duration_secs,
            arena,
        )
    } else {
        vec![Segment::whole_file(audio_path, total_duration)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::test_support::write_test_wav;
    use crate::progress::JobStatus;
    use crate::transcription::engine::testing::FakeLoader;

    fn test_setup(loader: FakeLoader) -> (AppConfig, ProgressStore, Arc<EngineCache>, DeviceSelection) {
        let mut config = AppConfig::default();
        config.pipeline.robust_mode = false;
        (
            config,
            ProgressStore::new(),
            Arc::new(EngineCache::new(Arc::new(loader))),
            DeviceSelection::cpu(),
        )
    }

    fn params(path: &Path, job_id: &str) -> JobParams {
        JobParams {
            file_path: path.to_path_buf(),
            model: ModelSize::Medium,
            language: None,
            generate_summary: false,
            job_id: job_id.to_string(),
        }
    }

    #[test]
    fn test_derived_job_id_shape() {
        let id = derive_job_id(Path::new("/data/my meeting (1).wav"));
        assert!(id.starts_with("job_"));
        assert!(id.ends_with("my_meeting__1_"));
        assert!(!id.contains('/'));
        assert!(!id.contains(' '));
    }

    #[tokio::test]
    async fn test_short_recording_completes_as_one_segment() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_wav(dir.path(), "short.wav", 16_000, 32_000);
        let (config, progress, engines, device) = test_setup(FakeLoader::default());

        let result = run_job(&config, &progress, &engines, &device, params(&path, "job_short"))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.segments_count, 1);
        assert_eq!(result.model_used, "medium");
        assert!((result.duration - 2.0).abs() < 0.1);

        let p = progress.get("job_short").unwrap();
        assert_eq!(p.progress.status, JobStatus::Completed);
        assert_eq!(p.progress.progress, 100);
    }

    #[tokio::test]
    async fn test_validation_failure_never_reaches_transcribing() {
        let (config, progress, engines, device) = test_setup(FakeLoader::default());

        let result = run_job(
            &config,
            &progress,
            &engines,
            &device,
            params(Path::new("/nowhere/missing.wav"), "job_missing"),
        )
        .await;

        assert!(matches!(result, Err(AppError::NotFound(_))));
        let p = progress.get("job_missing").unwrap();
        assert_eq!(p.progress.status, JobStatus::Error);
        // Frozen at the validation milestone, transcription never started.
        assert!(p.progress.progress <= 5);
        assert!(p.progress.error.is_some());
    }

    #[tokio::test]
    async fn test_engine_load_failure_fails_job() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_wav(dir.path(), "clip.wav", 16_000, 16_000);
        let loader = FakeLoader {
            fail_loading: true,
            ..FakeLoader::default()
        };
        let (config, progress, engines, device) = test_setup(loader);

        let result = run_job(&config, &progress, &engines, &device, params(&path, "job_noload"))
            .await;

        assert!(matches!(result, Err(AppError::EngineLoad(_))));
        let p = progress.get("job_noload").unwrap();
        assert_eq!(p.progress.status, JobStatus::Error);
        assert!(p.progress.progress <= 20);
    }

    #[tokio::test]
    async fn test_failed_segment_leaves_placeholder_and_job_completes() {
        let dir = tempfile::tempdir().unwrap();
        // 5 seconds, segmented into 5 pieces of 1 second.
        let path = write_test_wav(dir.path(), "audio.wav", 16_000, 80_000);
        let loader = FakeLoader {
            fail_matching: Some("seg002".to_string()),
            ..FakeLoader::default()
        };
        let (mut config, progress, engines, device) = test_setup(loader);
        config.audio.segment_threshold_secs = 0.5;
        config.audio.segment_duration_secs = 1.0;

        let result = run_job(&config, &progress, &engines, &device, params(&path, "job_partial"))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.segments_count, 5);
        assert!(result.transcription.contains("[ERROR:"));
        // Exactly one placeholder among the five parts.
        assert_eq!(result.transcription.matches("[ERROR:").count(), 1);
        assert_eq!(
            progress.get("job_partial").unwrap().progress.status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_segmented_and_whole_file_paths_agree() {
        let dir = tempfile::tempdir().unwrap();
        // Same 6-second recording transcribed both ways.
        let path = write_test_wav(dir.path(), "same.wav", 16_000, 96_000);
        let loader = |_: ()| FakeLoader {
            words_per_second: true,
            ..FakeLoader::default()
        };

        let (mut config, progress, engines, device) = test_setup(loader(()));
        config.audio.segment_threshold_secs = 100.0;
        let whole = run_job(&config, &progress, &engines, &device, params(&path, "job_whole"))
            .await
            .unwrap();

        let (mut config, progress, engines, device) = test_setup(loader(()));
        config.audio.segment_threshold_secs = 1.0;
        config.audio.segment_duration_secs = 2.0;
        let split = run_job(&config, &progress, &engines, &device, params(&path, "job_split"))
            .await
            .unwrap();

        assert_eq!(whole.segments_count, 1);
        assert_eq!(split.segments_count, 3);
        let normalize = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ");
        assert_eq!(normalize(&whole.transcription), normalize(&split.transcription));
    }

    #[tokio::test]
    async fn test_summary_requires_sentence_structure() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_wav(dir.path(), "talk.wav", 16_000, 96_000);
        let loader = FakeLoader {
            words_per_second: true,
            ..FakeLoader::default()
        };
        let (config, progress, engines, device) = test_setup(loader);

        let mut p = params(&path, "job_summary");
        p.generate_summary = true;
        let result = run_job(&config, &progress, &engines, &device, p).await.unwrap();

        // One run of repeated words has no sentence structure to sample.
        assert!(result.summary.is_none());
    }

    #[tokio::test]
    async fn test_arena_is_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_wav(dir.path(), "tidy.wav", 16_000, 80_000);
        let (mut config, progress, engines, device) = test_setup(FakeLoader::default());
        config.audio.segment_threshold_secs = 1.0;
        config.audio.segment_duration_secs = 2.0;

        run_job(&config, &progress, &engines, &device, params(&path, "job_tidy"))
            .await
            .unwrap();

        // Segment files lived in a job-scoped temp dir that is gone now.
        let leftovers: Vec<_> = std::fs::read_dir(std::env::temp_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("job_tidy_"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
