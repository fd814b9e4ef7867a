//! # Segment Scheduler
//!
//! Runs the per-segment engine calls, either sequentially or on a bounded
//! pool of parallel workers, and reassembles results in segment order no
//! matter when each worker finishes.
//!
//! A segment failure never kills the job: the failed index gets a
//! placeholder result carrying the error, and the remaining segments keep
//! going. Progress moves through the 25..=90 band as segments complete.

use crate::device::JobDevice;
use crate::progress::{JobStatus, ProgressStore};
use crate::transcription::engine::EngineCache;
use crate::transcription::model::ModelSize;
use crate::transcription::retry::{transcribe_with_fallback, RetryPolicy};
use crate::audio::Segment;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Progress band occupied by segment processing.
const SEGMENT_BAND_START: u8 = 25;
const SEGMENT_BAND_END: u8 = 90;

/// One recognized span with absolute timestamps, already offset into the
/// whole recording's timeline.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TimedSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub confidence: f64,
}

/// Outcome for one scheduled segment, successful or not.
#[derive(Debug, Clone)]
pub struct SegmentResult {
    pub index: usize,
    pub text: String,
    pub language: Option<String>,
    pub language_probability: f64,
    pub duration: f64,
    pub timed: Vec<TimedSegment>,
    pub error: Option<String>,
}

/// Everything a segment worker needs; clones share the caches and stores.
#[derive(Clone)]
pub struct ScheduleContext {
    pub cache: Arc<EngineCache>,
    pub job_device: JobDevice,
    pub model: ModelSize,
    pub language: Option<String>,
    pub robust_mode: bool,
    pub policy: RetryPolicy,
    pub progress: ProgressStore,
    pub job_id: String,
    pub total_duration: f64,
    /// Job-scoped scratch directory for partial-transcript sidecars
    pub scratch_dir: PathBuf,
}

/// Transcribe every segment and return results sorted by segment index.
pub async fn run(
    ctx: &ScheduleContext,
    segments: &[Segment],
    parallel: bool,
    worker_count: usize,
) -> Vec<SegmentResult> {
    let started = Instant::now();
    let total = segments.len();

    ctx.progress.update(&ctx.job_id, |p| {
        p.status = JobStatus::Transcribing;
        p.total_segments = total;
    });

    let mut results = if parallel && total > 1 {
        run_parallel(ctx, segments, worker_count, started).await
    } else {
        run_sequential(ctx, segments, started).await
    };

    results.sort_by_key(|r| r.index);
    let failed = results.iter().filter(|r| r.error.is_some()).count();
    info!(
        "Job {}: {}/{} segments transcribed ({} failed) in {:.1}s",
        ctx.job_id,
        total - failed,
        total,
        failed,
        started.elapsed().as_secs_f64()
    );
    results
}

async fn run_sequential(
    ctx: &ScheduleContext,
    segments: &[Segment],
    started: Instant,
) -> Vec<SegmentResult> {
    let total = segments.len();
    let mut results = Vec::with_capacity(total);

    for segment in segments {
        let result = transcribe_segment(ctx, segment).await;
        // Sequential order means everything up to this segment's end is done.
        report_progress(ctx, started, results.len() + 1, total, segment.end);
        results.push(result);
    }

    results
}

async fn run_parallel(
    ctx: &ScheduleContext,
    segments: &[Segment],
    worker_count: usize,
    started: Instant,
) -> Vec<SegmentResult> {
    let total = segments.len();
    let semaphore = Arc::new(Semaphore::new(worker_count.max(1)));
    let completed = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::with_capacity(total);
    for segment in segments {
        let ctx = ctx.clone();
        let segment = segment.clone();
        let semaphore = semaphore.clone();
        let completed = completed.clone();

        handles.push(tokio::spawn(async move {
            // Closing the semaphore is not part of the protocol, so
            // acquire only fails if the runtime is tearing down.
            let _permit = match semaphore.acquire().await {
                Ok(permit) => permit,
                Err(_) => return placeholder(&segment, "scheduler shut down"),
            };

            let result = transcribe_segment(&ctx, &segment).await;

            let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
            // Workers finish out of order; approximate processed time by
            // the completed fraction of the whole recording.
            let processed = ctx.total_duration * done as f64 / total as f64;
            report_progress(&ctx, started, done, total, processed);

            result
        }));
    }

    let mut results = Vec::with_capacity(total);
    for (i, handle) in handles.into_iter().enumerate() {
        match handle.await {
            Ok(result) => results.push(result),
            Err(e) => {
                warn!("Segment worker {} panicked: {}", i + 1, e);
                results.push(placeholder(&segments[i], "segment worker panicked"));
            }
        }
    }
    results
}

/// Run one segment through the retry controller and fold the outcome into
/// a [`SegmentResult`]. Errors become placeholders, never propagate.
async fn transcribe_segment(ctx: &ScheduleContext, segment: &Segment) -> SegmentResult {
    debug!(
        "Job {}: transcribing segment {} [{:.1}s..{:.1}s]",
        ctx.job_id, segment.index, segment.start, segment.end
    );

    let outcome = transcribe_with_fallback(
        &ctx.cache,
        &ctx.job_device,
        ctx.model,
        &segment.path,
        ctx.language.clone(),
        ctx.robust_mode,
        ctx.policy,
    )
    .await;

    match outcome {
        Ok(output) => {
            let text = output
                .segments
                .iter()
                .map(|s| s.text.trim())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join(" ");

            let timed = output
                .segments
                .iter()
                .map(|s| TimedSegment {
                    start: segment.start + s.start,
                    end: (segment.start + s.end).min(segment.end),
                    text: s.text.clone(),
                    confidence: s.avg_logprob.exp().clamp(0.0, 1.0),
                })
                .collect();

            let result = SegmentResult {
                index: segment.index,
                text,
                language: Some(output.info.language),
                language_probability: output.info.language_probability,
                duration: segment.duration(),
                timed,
                error: None,
            };
            write_sidecar(ctx, segment, &result);
            result
        }
        Err(e) => {
            warn!(
                "Job {}: segment {} failed: {}",
                ctx.job_id, segment.index, e
            );
            placeholder(segment, &e.to_string())
        }
    }
}

fn placeholder(segment: &Segment, error: &str) -> SegmentResult {
    SegmentResult {
        index: segment.index,
        text: format!("[ERROR: {}]", error),
        language: None,
        language_probability: 0.0,
        duration: segment.duration(),
        timed: Vec::new(),
        error: Some(error.to_string()),
    }
}

/// Best-effort partial transcript next to the segment audio, so a crashed
/// job leaves recoverable pieces behind.
fn write_sidecar(ctx: &ScheduleContext, segment: &Segment, result: &SegmentResult) {
    let stem = segment
        .path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| format!("segment_{:03}", result.index));
    let path = ctx.scratch_dir.join(format!("{}.txt", stem));
    if let Err(e) = std::fs::write(&path, &result.text) {
        debug!("Could not write partial transcript {}: {}", path.display(), e);
    }
}

fn report_progress(
    ctx: &ScheduleContext,
    started: Instant,
    done: usize,
    total: usize,
    processed_duration: f64,
) {
    let band = (SEGMENT_BAND_END - SEGMENT_BAND_START) as usize;
    let percent = SEGMENT_BAND_START + (band * done / total.max(1)) as u8;

    let elapsed = started.elapsed().as_secs_f64();
    let estimated_time_remaining = if processed_duration > 0.0 && ctx.total_duration > 0.0 {
        let remaining = (ctx.total_duration - processed_duration).max(0.0);
        Some(elapsed * remaining / processed_duration)
    } else {
        None
    };

    ctx.progress.update(&ctx.job_id, |p| {
        p.progress = percent.min(SEGMENT_BAND_END);
        p.stage = format!(
            "Processing segment {}/{} ({:.1}s/{:.1}s)",
            done, total, processed_duration, ctx.total_duration
        );
        p.current_segment = done;
        p.processed_duration = processed_duration;
        p.estimated_time_remaining = estimated_time_remaining;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceClass, DeviceSelection};
    use crate::transcription::engine::testing::FakeLoader;
    use tempfile::TempDir;

    fn fake_segments(count: usize, seg_len: f64) -> Vec<Segment> {
        (1..=count)
            .map(|i| Segment {
                index: i,
                start: (i - 1) as f64 * seg_len,
                end: i as f64 * seg_len,
                path: PathBuf::from(format!("/tmp/audio_seg{:03}.wav", i)),
            })
            .collect()
    }

    fn test_context(loader: FakeLoader, scratch: &TempDir) -> ScheduleContext {
        let progress = ProgressStore::new();
        progress.start("job_test");
        ScheduleContext {
            cache: Arc::new(EngineCache::new(Arc::new(loader))),
            job_device: JobDevice::new(DeviceSelection::cpu()),
            model: ModelSize::Medium,
            language: None,
            robust_mode: false,
            policy: RetryPolicy::from_robust_mode(false),
            progress,
            job_id: "job_test".to_string(),
            total_duration: 0.0,
            scratch_dir: scratch.path().to_path_buf(),
        }
    }

    #[tokio::test]
    async fn test_parallel_results_stay_in_segment_order() {
        let scratch = tempfile::tempdir().unwrap();
        let loader = FakeLoader {
            // Higher indexes finish first.
            reverse_delays: true,
            ..FakeLoader::default()
        };
        let mut ctx = test_context(loader, &scratch);
        ctx.total_duration = 50.0;

        let segments = fake_segments(5, 10.0);
        let results = run(&ctx, &segments, true, 5).await;

        assert_eq!(results.len(), 5);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.index, i + 1);
            assert_eq!(result.text, format!("<audio_seg{:03}>", i + 1));
            assert!(result.error.is_none());
        }
    }

    #[tokio::test]
    async fn test_failed_segment_gets_placeholder_at_its_index() {
        let scratch = tempfile::tempdir().unwrap();
        let loader = FakeLoader {
            fail_matching: Some("seg002".to_string()),
            ..FakeLoader::default()
        };
        let mut ctx = test_context(loader, &scratch);
        ctx.total_duration = 50.0;

        let segments = fake_segments(5, 10.0);
        let results = run(&ctx, &segments, false, 1).await;

        assert_eq!(results.len(), 5);
        assert!(results[1].error.is_some());
        assert!(results[1].text.starts_with("[ERROR:"));
        for i in [0usize, 2, 3, 4] {
            assert!(results[i].error.is_none(), "segment {} should succeed", i + 1);
        }
    }

    #[tokio::test]
    async fn test_progress_stays_in_segment_band() {
        let scratch = tempfile::tempdir().unwrap();
        let mut ctx = test_context(FakeLoader::default(), &scratch);
        ctx.total_duration = 30.0;

        let segments = fake_segments(3, 10.0);
        run(&ctx, &segments, false, 1).await;

        let p = ctx.progress.get("job_test").unwrap();
        assert_eq!(p.progress.status, JobStatus::Transcribing);
        assert!(p.progress.progress >= SEGMENT_BAND_START);
        assert!(p.progress.progress <= SEGMENT_BAND_END);
        assert_eq!(p.progress.current_segment, 3);
        assert_eq!(p.progress.total_segments, 3);
        assert!((p.progress.processed_duration - 30.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_sidecars_are_written_to_scratch() {
        let scratch = tempfile::tempdir().unwrap();
        let ctx = test_context(FakeLoader::default(), &scratch);

        let segments = fake_segments(2, 5.0);
        run(&ctx, &segments, false, 1).await;

        assert!(scratch.path().join("audio_seg001.txt").exists());
        assert!(scratch.path().join("audio_seg002.txt").exists());
        let text = std::fs::read_to_string(scratch.path().join("audio_seg001.txt")).unwrap();
        assert_eq!(text, "<audio_seg001>");
    }

    #[tokio::test]
    async fn test_timed_spans_are_offset_into_recording() {
        let scratch = tempfile::tempdir().unwrap();
        let ctx = test_context(FakeLoader::default(), &scratch);

        let segments = fake_segments(3, 10.0);
        let results = run(&ctx, &segments, false, 1).await;

        // FakeEngine reports one [0.0, 1.0] span per call; the scheduler
        // shifts it by the segment's start offset.
        assert_eq!(results[2].timed.len(), 1);
        assert!((results[2].timed[0].start - 20.0).abs() < 1e-9);
        assert!((results[2].timed[0].end - 21.0).abs() < 1e-9);
    }
}
