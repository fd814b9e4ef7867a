//! # Audio Preprocessing
//!
//! Normalizes input audio to the 16kHz mono PCM the recognition engine
//! expects. Normalization is best-effort: a failure logs the degradation
//! and hands the original file through untouched, so a decodable-but-odd
//! input never kills the job at this stage.

use crate::audio::ENGINE_SAMPLE_RATE;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Load a WAV file as mono f32 samples in [-1.0, 1.0].
///
/// Multi-channel audio is downmixed by averaging interleaved frames.
/// Returns the samples together with the file's sample rate.
pub fn load_mono_f32(path: &Path) -> anyhow::Result<(Vec<f32>, u32)> {
    let mut file = File::open(path)?;
    let (header, data) = wav::read(&mut file)?;

    let samples: Vec<f32> = match data {
        wav::BitDepth::Eight(v) => v
            .into_iter()
            .map(|s| (s as f32 - 128.0) / 128.0)
            .collect(),
        wav::BitDepth::Sixteen(v) => v.into_iter().map(|s| s as f32 / 32768.0).collect(),
        wav::BitDepth::TwentyFour(v) => v
            .into_iter()
            .map(|s| s as f32 / 8_388_608.0)
            .collect(),
        wav::BitDepth::ThirtyTwoFloat(v) => v,
        wav::BitDepth::Empty => Vec::new(),
    };

    let channels = header.channel_count.max(1) as usize;
    let mono = if channels == 1 {
        samples
    } else {
        samples
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };

    Ok((mono, header.sampling_rate))
}

/// Write mono f32 samples as 16-bit PCM.
pub fn write_mono_wav(path: &Path, samples: &[f32], sample_rate: u32) -> anyhow::Result<()> {
    let pcm: Vec<i16> = samples
        .iter()
        .map(|&s| (s * 32768.0).clamp(-32768.0, 32767.0) as i16)
        .collect();
    let header = wav::Header::new(wav::header::WAV_FORMAT_PCM, 1, sample_rate, 16);
    let mut file = File::create(path)?;
    wav::write(header, &wav::BitDepth::Sixteen(pcm), &mut file)?;
    Ok(())
}

/// Normalize an input file to 16kHz mono WAV inside the job's scratch
/// directory. Returns the path the rest of the pipeline should use.
///
/// A file that is already 16kHz mono WAV passes through unchanged. Any
/// failure (non-WAV input, unreadable data) degrades to the original path.
pub fn normalize(path: &Path, scratch_dir: &Path) -> PathBuf {
    match try_normalize(path, scratch_dir) {
        Ok(Some(processed)) => {
            info!("Audio preprocessed: {}", processed.display());
            processed
        }
        Ok(None) => path.to_path_buf(),
        Err(e) => {
            warn!(
                "Preprocessing failed for {} ({}), using original file",
                path.display(),
                e
            );
            path.to_path_buf()
        }
    }
}

/// Ok(None) means the file already conforms and needs no copy.
fn try_normalize(path: &Path, scratch_dir: &Path) -> anyhow::Result<Option<PathBuf>> {
    let (samples, rate) = load_mono_f32(path)?;

    let is_wav = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase() == "wav")
        .unwrap_or(false);
    if is_wav && rate == ENGINE_SAMPLE_RATE {
        // load_mono_f32 already downmixed; a mono 16k wav is untouched and
        // a multi-channel one still needs rewriting.
        let mut file = File::open(path)?;
        let (header, _) = wav::read(&mut file)?;
        if header.channel_count == 1 {
            return Ok(None);
        }
    }

    let resampled = if rate == ENGINE_SAMPLE_RATE {
        samples
    } else {
        resample_linear(&samples, rate, ENGINE_SAMPLE_RATE)
    };

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "audio".to_string());
    let out = scratch_dir.join(format!("{}_processed.wav", stem));
    write_mono_wav(&out, &resampled, ENGINE_SAMPLE_RATE)?;
    Ok(Some(out))
}

/// Linear-interpolation resampler. Good enough for speech input; the
/// engine's own front end is tolerant of the interpolation error.
pub fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if input.is_empty() || from_rate == to_rate {
        return input.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((input.len() as f64) / ratio).round() as usize;
    let mut out = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = pos.floor() as usize;
        let frac = (pos - idx as f64) as f32;
        let a = input[idx.min(input.len() - 1)];
        let b = input[(idx + 1).min(input.len() - 1)];
        out.push(a + (b - a) * frac);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::test_support::write_test_wav;

    #[test]
    fn test_conforming_wav_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_wav(dir.path(), "ok.wav", 16_000, 16_000);

        let result = normalize(&path, dir.path());
        assert_eq!(result, path);
    }

    #[test]
    fn test_resampling_writes_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_wav(dir.path(), "hi_rate.wav", 48_000, 48_000);

        let result = normalize(&path, dir.path());
        assert_ne!(result, path);
        assert!(result.to_string_lossy().ends_with("_processed.wav"));

        let (samples, rate) = load_mono_f32(&result).unwrap();
        assert_eq!(rate, 16_000);
        // 1 second of audio stays ~1 second after resampling.
        assert!((samples.len() as i64 - 16_000).abs() < 10);
    }

    #[test]
    fn test_unreadable_input_degrades_to_original() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.mp3");
        std::fs::write(&path, b"not audio").unwrap();

        let result = normalize(&path, dir.path());
        assert_eq!(result, path);
    }

    #[test]
    fn test_resample_halves_length() {
        let input: Vec<f32> = (0..32_000).map(|i| (i as f32 * 0.01).sin()).collect();
        let out = resample_linear(&input, 32_000, 16_000);
        assert!((out.len() as i64 - 16_000).abs() < 4);
    }
}
