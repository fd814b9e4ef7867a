//! # Audio Segmenter
//!
//! Splits a long recording into fixed-duration chunks, each written as an
//! independent WAV under the job's scratch directory. Chunk intervals are
//! contiguous and together span exactly `[0, total]`; the last chunk is
//! shortened to the remainder, never padded or dropped.
//!
//! Failure policy: segmentation never raises. If anything goes wrong the
//! whole file becomes a single segment, so the pipeline always has at
//! least one unit of work.

use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::audio::preprocess::{load_mono_f32, write_mono_wav};

/// One contiguous time slice of the source audio.
#[derive(Debug, Clone)]
pub struct Segment {
    /// 1-based, contiguous, no gaps
    pub index: usize,
    /// Start offset in seconds
    pub start: f64,
    /// End offset in seconds
    pub end: f64,
    /// Backing audio file; lives in the job's scratch directory, except
    /// for the whole-file fallback which points at the source
    pub path: PathBuf,
}

impl Segment {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// The degenerate single-segment covering of the whole file.
    pub fn whole_file(path: &Path, total_duration: f64) -> Self {
        Self {
            index: 1,
            start: 0.0,
            end: total_duration,
            path: path.to_path_buf(),
        }
    }
}

/// Compute the `(start, end)` boundaries for `ceil(total / segment_len)`
/// contiguous segments.
pub fn segment_boundaries(total_duration: f64, segment_duration: f64) -> Vec<(f64, f64)> {
    let count = (total_duration / segment_duration).ceil().max(1.0) as usize;
    (0..count)
        .map(|i| {
            let start = i as f64 * segment_duration;
            let end = (start + segment_duration).min(total_duration);
            (start, end)
        })
        .collect()
}

/// Split the audio at `path` into segments of at most `segment_duration`
/// seconds each.
///
/// Never fails: any error degrades to a single whole-file segment.
pub fn split(
    path: &Path,
    total_duration: f64,
    segment_duration: f64,
    scratch_dir: &Path,
) -> Vec<Segment> {
    match try_split(path, total_duration, segment_duration, scratch_dir) {
        Ok(segments) => {
            info!(
                "Split {} into {} segments of <= {:.0}s",
                path.display(),
                segments.len(),
                segment_duration
            );
            segments
        }
        Err(e) => {
            warn!(
                "Segmentation failed for {} ({}), transcribing whole file",
                path.display(),
                e
            );
            vec![Segment::whole_file(path, total_duration)]
        }
    }
}

fn try_split(
    path: &Path,
    total_duration: f64,
    segment_duration: f64,
    scratch_dir: &Path,
) -> anyhow::Result<Vec<Segment>> {
    if segment_duration <= 0.0 {
        anyhow::bail!("non-positive segment duration");
    }

    let (samples, rate) = load_mono_f32(path)?;
    if samples.is_empty() {
        anyhow::bail!("no audio samples");
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "audio".to_string());

    let mut segments = Vec::new();
    for (i, (start, end)) in segment_boundaries(total_duration, segment_duration)
        .into_iter()
        .enumerate()
    {
        let index = i + 1;
        let start_sample = ((start * rate as f64).round() as usize).min(samples.len());
        let end_sample = ((end * rate as f64).round() as usize).min(samples.len());
        if start_sample >= end_sample {
            anyhow::bail!("empty sample range for segment {}", index);
        }

        let seg_path = scratch_dir.join(format!("{}_seg{:03}.wav", stem, index));
        write_mono_wav(&seg_path, &samples[start_sample..end_sample], rate)?;

        segments.push(Segment {
            index,
            start,
            end,
            path: seg_path,
        });
    }

    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::test_support::write_test_wav;

    #[test]
    fn test_boundaries_are_contiguous_and_cover_total() {
        for &(total, len) in &[(1205.0, 600.0), (600.0, 600.0), (601.0, 600.0), (59.9, 10.0)] {
            let bounds = segment_boundaries(total, len);
            let expected = (total / len).ceil() as usize;
            assert_eq!(bounds.len(), expected, "count for D={} L={}", total, len);

            assert_eq!(bounds[0].0, 0.0);
            assert!((bounds[bounds.len() - 1].1 - total).abs() < 1e-9);
            for pair in bounds.windows(2) {
                assert!((pair[0].1 - pair[1].0).abs() < 1e-9, "gap/overlap in {:?}", pair);
            }
        }
    }

    #[test]
    fn test_1205s_at_600s_gives_three_segments() {
        let bounds = segment_boundaries(1205.0, 600.0);
        assert_eq!(bounds.len(), 3);
        assert_eq!(bounds[0], (0.0, 600.0));
        assert_eq!(bounds[1], (600.0, 1200.0));
        assert_eq!(bounds[2], (1200.0, 1205.0));
    }

    #[test]
    fn test_split_writes_ordered_files() {
        let dir = tempfile::tempdir().unwrap();
        // 5 seconds at a low rate to keep the test light.
        let path = write_test_wav(dir.path(), "long.wav", 1_000, 5_000);

        let segments = split(&path, 5.0, 2.0, dir.path());
        assert_eq!(segments.len(), 3);
        for (i, seg) in segments.iter().enumerate() {
            assert_eq!(seg.index, i + 1);
            assert!(seg.path.exists());
        }
        assert_eq!(segments[2].start, 4.0);
        assert_eq!(segments[2].end, 5.0);
        assert!(segments[2].duration() < segments[0].duration());

        // Sliced files carry the expected amount of audio.
        let (samples, rate) = load_mono_f32(&segments[0].path).unwrap();
        assert_eq!(rate, 1_000);
        assert_eq!(samples.len(), 2_000);
    }

    #[test]
    fn test_unreadable_input_degrades_to_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opaque.mp3");
        std::fs::write(&path, b"compressed audio the segmenter cannot slice").unwrap();

        let segments = split(&path, 1234.0, 600.0, dir.path());
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].index, 1);
        assert_eq!(segments[0].path, path);
        assert_eq!(segments[0].end, 1234.0);
    }
}
