//! # Model Catalog
//!
//! The set of Whisper model variants the service knows how to load, with
//! their HuggingFace repositories and rough characteristics. Requests name
//! models by string; `ModelSize` is the typed form used as the engine
//! cache key.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Available Whisper model variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    LargeV1,
    LargeV2,
    LargeV3,
}

impl ModelSize {
    /// Every variant, in size order; drives the `/models` listing.
    pub fn all() -> &'static [ModelSize] {
        &[
            ModelSize::Tiny,
            ModelSize::Base,
            ModelSize::Small,
            ModelSize::Medium,
            ModelSize::LargeV1,
            ModelSize::LargeV2,
            ModelSize::LargeV3,
        ]
    }

    /// HuggingFace repository holding the weights.
    pub fn repo_name(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "openai/whisper-tiny",
            ModelSize::Base => "openai/whisper-base",
            ModelSize::Small => "openai/whisper-small",
            ModelSize::Medium => "openai/whisper-medium",
            ModelSize::LargeV1 => "openai/whisper-large",
            ModelSize::LargeV2 => "openai/whisper-large-v2",
            ModelSize::LargeV3 => "openai/whisper-large-v3",
        }
    }

    /// Approximate download size in MB, used for logging and the listing.
    pub fn size_mb(&self) -> u32 {
        match self {
            ModelSize::Tiny => 39,
            ModelSize::Base => 74,
            ModelSize::Small => 244,
            ModelSize::Medium => 769,
            ModelSize::LargeV1 | ModelSize::LargeV2 | ModelSize::LargeV3 => 1550,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "Fastest, basic accuracy",
            ModelSize::Base => "Fast, good for testing",
            ModelSize::Small => "Balanced speed and accuracy",
            ModelSize::Medium => "Good accuracy, handles technical vocabulary",
            ModelSize::LargeV1 => "High accuracy, first large revision",
            ModelSize::LargeV2 => "High accuracy, improved multilingual",
            ModelSize::LargeV3 => "Best accuracy, slowest processing",
        }
    }
}

impl std::str::FromStr for ModelSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tiny" => Ok(ModelSize::Tiny),
            "base" => Ok(ModelSize::Base),
            "small" => Ok(ModelSize::Small),
            "medium" => Ok(ModelSize::Medium),
            "large-v1" => Ok(ModelSize::LargeV1),
            // Bare "large" keeps meaning v2, the revision the service
            // shipped with before v3 existed.
            "large" | "large-v2" => Ok(ModelSize::LargeV2),
            "large-v3" => Ok(ModelSize::LargeV3),
            _ => Err(anyhow!("Unknown model size: {}", s)),
        }
    }
}

impl std::fmt::Display for ModelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Base => "base",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::LargeV1 => "large-v1",
            ModelSize::LargeV2 => "large-v2",
            ModelSize::LargeV3 => "large-v3",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_size_parsing() {
        assert_eq!("medium".parse::<ModelSize>().unwrap(), ModelSize::Medium);
        assert_eq!("LARGE".parse::<ModelSize>().unwrap(), ModelSize::LargeV2);
        assert_eq!("large-v3".parse::<ModelSize>().unwrap(), ModelSize::LargeV3);
        assert!("gigantic".parse::<ModelSize>().is_err());
    }

    #[test]
    fn test_display_round_trips() {
        for &size in ModelSize::all() {
            let name = size.to_string();
            assert_eq!(name.parse::<ModelSize>().unwrap(), size);
        }
    }
}
