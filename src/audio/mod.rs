//! # Audio Input Handling
//!
//! Everything that touches the input file before the recognition engine
//! sees it:
//! - **probe**: existence/size/extension validation plus duration and
//!   sample-rate probing from the WAV header
//! - **preprocess**: best-effort normalization to 16kHz mono PCM, the
//!   format the engine expects
//! - **segmenter**: fixed-duration chunking of long recordings into a
//!   job-scoped scratch directory

pub mod preprocess;
pub mod probe;
pub mod segmenter;

pub use probe::AudioDescriptor;
pub use segmenter::Segment;

/// Sample rate the recognition engine requires.
pub const ENGINE_SAMPLE_RATE: u32 = 16_000;

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::{Path, PathBuf};

    /// Write a mono 16-bit PCM WAV with a low-amplitude sine so probing,
    /// preprocessing and segmentation all have something real to chew on.
    pub fn write_test_wav(
        dir: &Path,
        name: &str,
        sample_rate: u32,
        num_samples: usize,
    ) -> PathBuf {
        let path = dir.join(name);
        let samples: Vec<i16> = (0..num_samples)
            .map(|i| ((i as f32 * 0.05).sin() * 10_000.0) as i16)
            .collect();
        let header = wav::Header::new(wav::header::WAV_FORMAT_PCM, 1, sample_rate, 16);
        let mut file = std::fs::File::create(&path).unwrap();
        wav::write(header, &wav::BitDepth::Sixteen(samples), &mut file).unwrap();
        path
    }
}
