/// Audio chunking module
///
/// Splits long prepared audio into overlapping windows so the backend never
/// sees more than a few minutes at a time, and merges per-chunk results back
/// into one transcript, deduplicating the overlap regions.

use crate::backend::ChunkResult;
use crate::job::{ChunkingOptions, Segment, Transcript};
use crate::prepare::AudioDescriptor;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A trailing chunk shorter than this is absorbed into its predecessor
pub const TAIL_MERGE_SECONDS: f64 = 300.0;

/// Confidence reported when no segments survive the merge
pub const FALLBACK_CONFIDENCE: f32 = 0.5;

#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("Split failed: {0}")]
    SplitFailed(String),

    #[error("Cancelled")]
    Cancelled,
}

/// One contiguous slice of the prepared audio, with absolute boundaries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioChunk {
    /// Path of the chunk file (the original path for a whole-file chunk)
    pub path: PathBuf,

    /// Absolute start offset in the source (seconds)
    pub start_seconds: f64,

    /// Absolute end offset in the source (seconds)
    pub end_seconds: f64,
}

impl AudioChunk {
    pub fn duration_seconds(&self) -> f64 {
        self.end_seconds - self.start_seconds
    }
}

/// Compute chunk intervals for the given duration.
///
/// Returns `[(0, duration)]` when chunking is disabled or the input is short
/// enough. Otherwise consecutive windows of `chunk_seconds`, each starting
/// `overlap_seconds` before the previous window's end; the final window ends
/// exactly at `duration`, and a tail shorter than `TAIL_MERGE_SECONDS` is
/// merged into its predecessor.
pub fn plan_chunks(duration_seconds: f64, opts: &ChunkingOptions) -> Vec<(f64, f64)> {
    if !opts.enabled || duration_seconds <= opts.min_duration_seconds {
        return vec![(0.0, duration_seconds)];
    }

    let mut spans = Vec::new();
    let mut start = 0.0f64;

    loop {
        let end = (start + opts.chunk_seconds).min(duration_seconds);
        spans.push((start, end));

        if end >= duration_seconds {
            break;
        }
        start = end - opts.overlap_seconds;
    }

    if spans.len() > 1 {
        let (tail_start, tail_end) = *spans.last().expect("spans non-empty");
        if tail_end - tail_start < TAIL_MERGE_SECONDS {
            spans.pop();
            spans.last_mut().expect("spans non-empty").1 = duration_seconds;
        }
    }

    spans
}

/// Split prepared audio into chunk files under `out_dir/chunks/`.
///
/// A single-chunk plan returns the original path without copying. Each chunk
/// is a sample-range slice of the prepared WAV; nothing is re-decoded.
pub fn split(
    descriptor: &AudioDescriptor,
    opts: &ChunkingOptions,
    out_dir: &Path,
    cancel: &CancellationToken,
) -> Result<Vec<AudioChunk>, ChunkError> {
    let plan = plan_chunks(descriptor.duration_seconds, opts);

    if plan.len() == 1 {
        let (start, end) = plan[0];
        return Ok(vec![AudioChunk {
            path: descriptor.path.clone(),
            start_seconds: start,
            end_seconds: end,
        }]);
    }

    info!(
        "Splitting {:.1}s of audio into {} chunks",
        descriptor.duration_seconds,
        plan.len()
    );

    let chunks_dir = out_dir.join("chunks");
    std::fs::create_dir_all(&chunks_dir)
        .map_err(|e| ChunkError::SplitFailed(format!("create {}: {}", chunks_dir.display(), e)))?;

    let mut reader = hound::WavReader::open(&descriptor.path)
        .map_err(|e| ChunkError::SplitFailed(format!("{}: {}", descriptor.path.display(), e)))?;
    let spec = reader.spec();
    let rate = spec.sample_rate as f64;

    let mut chunks = Vec::with_capacity(plan.len());

    for (i, &(start, end)) in plan.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(ChunkError::Cancelled);
        }

        let start_sample = (start * rate) as u32;
        let sample_count = ((end - start) * rate) as usize;

        reader
            .seek(start_sample)
            .map_err(|e| ChunkError::SplitFailed(format!("seek to {:.1}s: {}", start, e)))?;

        let chunk_path = chunks_dir.join(format!("chunk_{}.wav", i));
        let mut writer = hound::WavWriter::create(&chunk_path, spec)
            .map_err(|e| ChunkError::SplitFailed(format!("{}: {}", chunk_path.display(), e)))?;

        let mut written = 0usize;
        for sample in reader.samples::<i16>() {
            if written >= sample_count {
                break;
            }
            let s = sample.map_err(|e| ChunkError::SplitFailed(e.to_string()))?;
            writer
                .write_sample(s)
                .map_err(|e| ChunkError::SplitFailed(e.to_string()))?;
            written += 1;
        }

        writer
            .finalize()
            .map_err(|e| ChunkError::SplitFailed(e.to_string()))?;

        debug!(
            "Wrote chunk {}: {:.1}s - {:.1}s ({} samples)",
            i, start, end, written
        );

        chunks.push(AudioChunk {
            path: chunk_path,
            start_seconds: start,
            end_seconds: end,
        });
    }

    Ok(chunks)
}

/// Merge per-chunk backend results into one transcript.
///
/// Local segment times are shifted by their chunk's absolute start. Segments
/// of a later chunk that begin inside the previous chunk's interval repeat
/// content the previous chunk already produced and are dropped. The result's
/// `processing_seconds` and `model_id` are left for the caller to fill.
pub fn merge(chunk_results: &[(AudioChunk, ChunkResult)], _overlap_seconds: f64) -> Transcript {
    let mut segments: Vec<Segment> = Vec::new();
    let mut detected_language = String::from("unknown");
    let mut language_found = false;
    let mut previous_end: Option<f64> = None;

    for (chunk, result) in chunk_results {
        if !language_found && !result.language.is_empty() && result.language != "unknown" {
            detected_language = result.language.clone();
            language_found = true;
        }

        for local in &result.segments {
            let start = local.start_seconds + chunk.start_seconds;
            let end = local.end_seconds + chunk.start_seconds;
            let text = local.text.trim();

            if text.is_empty() || end <= start {
                continue;
            }

            // Content inside the previous chunk's interval was already
            // transcribed by that chunk.
            if let Some(prev_end) = previous_end {
                if start < prev_end {
                    continue;
                }
            }

            segments.push(Segment {
                start_seconds: start,
                end_seconds: end,
                text: text.to_string(),
                confidence: local.confidence.clamp(0.0, 1.0),
            });
        }

        previous_end = Some(chunk.end_seconds);
    }

    segments.sort_by(|a, b| {
        a.start_seconds
            .partial_cmp(&b.start_seconds)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    // Clamp any residual overlap between neighbours
    let mut deduped: Vec<Segment> = Vec::with_capacity(segments.len());
    for mut seg in segments {
        if let Some(last) = deduped.last() {
            if seg.start_seconds < last.end_seconds {
                seg.start_seconds = last.end_seconds;
            }
        }
        if seg.end_seconds > seg.start_seconds {
            deduped.push(seg);
        }
    }

    let text = deduped
        .iter()
        .map(|s| s.text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_string();

    let confidence = if deduped.is_empty() {
        FALLBACK_CONFIDENCE
    } else {
        deduped.iter().map(|s| s.confidence).sum::<f32>() / deduped.len() as f32
    };

    Transcript {
        text,
        detected_language,
        confidence,
        segments: deduped,
        processing_seconds: 0.0,
        model_id: String::new(),
    }
}

/// Delete chunk files created by `split`, never the original input
pub fn cleanup_chunks(chunks: &[AudioChunk]) {
    for chunk in chunks {
        let name = chunk
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();

        if name.starts_with("chunk_") {
            if let Err(e) = std::fs::remove_file(&chunk.path) {
                tracing::warn!("Failed to remove chunk {}: {}", chunk.path.display(), e);
            }
        }
    }
}
