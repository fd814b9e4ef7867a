//! # Audio Probing and Validation
//!
//! First stage of the pipeline: reject files that do not exist, are too
//! large or carry an unsupported extension, then read duration and sample
//! rate from the WAV header.
//!
//! Only the WAV container is parsed in-process; a file with a supported
//! non-WAV extension that turns out to be unreadable surfaces as a
//! `Decode` error, the same class as a corrupt WAV.

use crate::error::{AppError, AppResult};
use byteorder::{LittleEndian, ReadBytesExt};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// Read-only description of a validated input file.
#[derive(Debug, Clone)]
pub struct AudioDescriptor {
    pub path: std::path::PathBuf,
    pub file_size: u64,
    pub duration: f64,
    pub sample_rate: u32,
    pub format: String,
}

/// Validate a file and probe its audio parameters.
pub fn probe(
    path: &Path,
    max_file_size: u64,
    supported_extensions: &[String],
) -> AppResult<AudioDescriptor> {
    if !path.exists() {
        return Err(AppError::NotFound(format!(
            "File not found: {}",
            path.display()
        )));
    }

    let file_size = std::fs::metadata(path)
        .map_err(|e| AppError::Decode(format!("Cannot stat {}: {}", path.display(), e)))?
        .len();
    if file_size > max_file_size {
        return Err(AppError::TooLarge(format!(
            "{:.1}MB exceeds the {:.1}MB limit",
            file_size as f64 / 1024.0 / 1024.0,
            max_file_size as f64 / 1024.0 / 1024.0
        )));
    }

    let extension = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default();
    if !supported_extensions.iter().any(|e| e == &extension) {
        return Err(AppError::UnsupportedFormat(format!(
            "{} (supported: {})",
            if extension.is_empty() { "<none>" } else { &extension },
            supported_extensions.join(", ")
        )));
    }

    let wav = read_wav_params(path)
        .map_err(|e| AppError::Decode(format!("{}: {}", path.display(), e)))?;

    Ok(AudioDescriptor {
        path: path.to_path_buf(),
        file_size,
        duration: wav.duration,
        sample_rate: wav.sample_rate,
        format: extension,
    })
}

struct WavParams {
    sample_rate: u32,
    duration: f64,
}

/// Walk the RIFF chunk list and pull sample rate and data length out of
/// the `fmt ` and `data` chunks. Cheaper than decoding the whole file.
fn read_wav_params(path: &Path) -> anyhow::Result<WavParams> {
    let mut file = File::open(path)?;

    let mut riff = [0u8; 4];
    file.read_exact(&mut riff)?;
    if &riff != b"RIFF" {
        anyhow::bail!("not a RIFF container");
    }
    let _riff_size = file.read_u32::<LittleEndian>()?;
    let mut wave = [0u8; 4];
    file.read_exact(&mut wave)?;
    if &wave != b"WAVE" {
        anyhow::bail!("not a WAVE file");
    }

    let mut sample_rate: Option<u32> = None;
    let mut byte_rate: Option<u32> = None;
    let mut data_len: Option<u32> = None;

    loop {
        let mut chunk_id = [0u8; 4];
        if file.read_exact(&mut chunk_id).is_err() {
            break;
        }
        let chunk_size = file.read_u32::<LittleEndian>()?;

        match &chunk_id {
            b"fmt " => {
                let _audio_format = file.read_u16::<LittleEndian>()?;
                let _channels = file.read_u16::<LittleEndian>()?;
                sample_rate = Some(file.read_u32::<LittleEndian>()?);
                byte_rate = Some(file.read_u32::<LittleEndian>()?);
                // Skip the rest of the fmt chunk (block align, bit depth,
                // optional extensions).
                let consumed = 12u32;
                if chunk_size > consumed {
                    file.seek(SeekFrom::Current((chunk_size - consumed) as i64))?;
                }
            }
            b"data" => {
                data_len = Some(chunk_size);
                file.seek(SeekFrom::Current(chunk_size as i64))?;
            }
            _ => {
                // Chunks are word-aligned; odd sizes carry a pad byte.
                let skip = chunk_size as i64 + (chunk_size % 2) as i64;
                file.seek(SeekFrom::Current(skip))?;
            }
        }

        if sample_rate.is_some() && data_len.is_some() {
            break;
        }
    }

    let sample_rate = sample_rate.ok_or_else(|| anyhow::anyhow!("missing fmt chunk"))?;
    let byte_rate = byte_rate.ok_or_else(|| anyhow::anyhow!("missing byte rate"))?;
    let data_len = data_len.ok_or_else(|| anyhow::anyhow!("missing data chunk"))?;
    if byte_rate == 0 {
        anyhow::bail!("zero byte rate");
    }

    Ok(WavParams {
        sample_rate,
        duration: data_len as f64 / byte_rate as f64,
    })
}
