//! # Transcript Assembly
//!
//! Folds ordered per-segment results into the final transcript payload:
//! text joined in segment order, a majority vote on the detected language,
//! and an optional extractive summary for long transcripts.

use crate::transcription::scheduler::{SegmentResult, TimedSegment};
use crate::transcription::model::ModelSize;
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

/// Transcripts with fewer sentences than this are not worth summarizing.
const SUMMARY_MIN_SENTENCES: usize = 4;
/// Fraction of sentences the summary keeps.
const SUMMARY_RATIO: f64 = 0.3;

/// Final payload for a completed transcription job.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptResult {
    pub success: bool,
    pub job_id: String,
    pub transcription: String,
    pub segments: Vec<TimedSegment>,
    pub language: String,
    pub language_probability: f64,
    pub duration: f64,
    pub processing_time: f64,
    pub model_used: String,
    pub segments_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Assemble ordered segment results into the final transcript.
///
/// `results` must already be sorted by segment index; the scheduler
/// guarantees that. Placeholder texts for failed segments are kept in
/// place so the reader sees where audio was lost.
pub fn assemble(
    job_id: &str,
    results: Vec<SegmentResult>,
    model: ModelSize,
    total_duration: f64,
    processing_time: f64,
    with_summary: bool,
) -> TranscriptResult {
    let transcription = results
        .iter()
        .map(|r| r.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");

    let segments: Vec<TimedSegment> = results
        .iter()
        .flat_map(|r| r.timed.iter().cloned())
        .collect();

    let (language, language_probability) = vote_language(&results);

    let summary = if with_summary {
        summarize(&transcription)
    } else {
        None
    };

    debug!(
        "Assembled transcript for {}: {} chars, {} timed spans, language {}",
        job_id,
        transcription.len(),
        segments.len(),
        language
    );

    TranscriptResult {
        success: true,
        job_id: job_id.to_string(),
        transcription,
        language,
        language_probability,
        duration: total_duration,
        processing_time,
        model_used: model.to_string(),
        segments_count: results.len(),
        segments,
        summary,
    }
}

/// Majority vote over the languages the successful segments reported.
/// Ties resolve to the earliest segment's language; a job with no
/// successful segment reports unknown.
fn vote_language(results: &[SegmentResult]) -> (String, f64) {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for result in results {
        if let Some(lang) = &result.language {
            *counts.entry(lang.as_str()).or_default() += 1;
        }
    }

    let Some(&max_count) = counts.values().max() else {
        return ("unknown".to_string(), 0.0);
    };

    // First segment (in index order) whose language is among the leaders.
    let winner = results
        .iter()
        .filter_map(|r| r.language.as_deref())
        .find(|lang| counts[lang] == max_count)
        .unwrap_or("unknown")
        .to_string();

    let probabilities: Vec<f64> = results
        .iter()
        .filter(|r| r.language.as_deref() == Some(winner.as_str()))
        .map(|r| r.language_probability)
        .collect();
    let probability = if probabilities.is_empty() {
        0.0
    } else {
        probabilities.iter().sum::<f64>() / probabilities.len() as f64
    };

    (winner, probability)
}

/// Extractive summary: opening sentences, an even sample of the middle,
/// and the closing sentence, capped at roughly a third of the original.
pub fn summarize(text: &str) -> Option<String> {
    let sentences = split_sentences(text);
    if sentences.len() < SUMMARY_MIN_SENTENCES {
        return None;
    }

    let keep = ((sentences.len() as f64 * SUMMARY_RATIO).ceil() as usize).max(3);
    let mut picked: Vec<usize> = vec![0, 1, sentences.len() - 1];

    // Sample the middle evenly for the remaining slots.
    let middle = 2..sentences.len() - 1;
    let slots = keep.saturating_sub(picked.len());
    if slots > 0 && !middle.is_empty() {
        let span = middle.len();
        for i in 0..slots.min(span) {
            picked.push(2 + i * span / slots.min(span));
        }
    }

    picked.sort_unstable();
    picked.dedup();

    let body = picked
        .iter()
        .map(|&i| sentences[i])
        .collect::<Vec<_>>()
        .join(" ");

    let word_count = text.split_whitespace().count();
    Some(format!(
        "{}\n\n[Summary drawn from {} of {} sentences, {} words total]",
        body,
        picked.len(),
        sentences.len(),
        word_count
    ))
}

fn split_sentences(text: &str) -> Vec<&str> {
    text.split_inclusive(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}
