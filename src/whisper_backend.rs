/// Whisper backend adapter
///
/// Implements the `SpeechBackend` capability on top of whisper.cpp via the
/// `whisper-rs` bindings. Only compiled with the `whisper` feature; the mock
/// backend covers every other build.

use crate::backend::{BackendError, BackendInfo, ChunkResult, SpeechBackend, TranscribeRequest};
use crate::job::Segment;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

/// Whisper adapter configuration
#[derive(Debug, Clone)]
pub struct WhisperBackendConfig {
    /// Directory holding ggml model files, `<model_id>.bin` per model
    pub model_dir: PathBuf,

    /// Number of inference threads
    pub num_threads: usize,

    /// Whether the GPU build is available at all
    pub gpu_available: bool,
}

impl Default for WhisperBackendConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("models"),
            num_threads: num_cpus::get(),
            gpu_available: false,
        }
    }
}

struct LoadedModel {
    model_id: String,
    context: Arc<WhisperContext>,
}

/// Whisper.cpp speech backend
pub struct WhisperBackend {
    config: WhisperBackendConfig,
    model: Mutex<Option<LoadedModel>>,
}

impl WhisperBackend {
    pub fn new(config: WhisperBackendConfig) -> Self {
        Self {
            config,
            model: Mutex::new(None),
        }
    }

    fn model_path(&self, model_id: &str) -> PathBuf {
        self.config.model_dir.join(format!("{}.bin", model_id))
    }

    fn read_samples(path: &std::path::Path) -> Result<Vec<f32>, BackendError> {
        let mut reader = hound::WavReader::open(path)
            .map_err(|e| BackendError::InputUnreadable(format!("{}: {}", path.display(), e)))?;

        let samples: Result<Vec<i16>, _> = reader.samples::<i16>().collect();
        let samples = samples.map_err(|e| BackendError::InputUnreadable(e.to_string()))?;

        Ok(samples
            .iter()
            .map(|&s| s as f32 / i16::MAX as f32)
            .collect())
    }

}

#[async_trait]
impl SpeechBackend for WhisperBackend {
    async fn load(&self, model_id: &str) -> Result<(), BackendError> {
        {
            let guard = self.model.lock();
            if let Some(loaded) = guard.as_ref() {
                if loaded.model_id == model_id {
                    debug!("Whisper model {} already loaded", model_id);
                    return Ok(());
                }
            }
        }

        let path = self.model_path(model_id);
        if !path.exists() {
            return Err(BackendError::ModelLoadFailed(format!(
                "model file not found: {}",
                path.display()
            )));
        }

        info!("Loading Whisper model: {}", path.display());

        let use_gpu = self.config.gpu_available;
        let path_string = path.to_string_lossy().to_string();

        let context = tokio::task::spawn_blocking(move || {
            let mut params = WhisperContextParameters::default();
            params.use_gpu(use_gpu);
            WhisperContext::new_with_params(&path_string, params)
        })
        .await
        .map_err(|e| BackendError::Internal(format!("load task panicked: {}", e)))?
        .map_err(|e| BackendError::ModelLoadFailed(e.to_string()))?;

        let mut guard = self.model.lock();
        // A racing loader may have finished first; keep the existing model
        if guard.as_ref().map(|m| m.model_id.as_str()) != Some(model_id) {
            *guard = Some(LoadedModel {
                model_id: model_id.to_string(),
                context: Arc::new(context),
            });
            info!("Whisper model loaded: {}", model_id);
        }

        Ok(())
    }

    async fn unload(&self) -> Result<(), BackendError> {
        let mut guard = self.model.lock();
        if guard.take().is_some() {
            info!("Whisper model unloaded");
        }
        Ok(())
    }

    async fn transcribe(&self, request: TranscribeRequest) -> Result<ChunkResult, BackendError> {
        let (context, model_id) = {
            let guard = self.model.lock();
            match guard.as_ref() {
                Some(loaded) => (loaded.context.clone(), loaded.model_id.clone()),
                None => {
                    return Err(BackendError::ModelLoadFailed(
                        "no model loaded".to_string(),
                    ))
                }
            }
        };

        if request.cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }

        let samples = Self::read_samples(&request.audio_path)?;
        if samples.is_empty() {
            return Err(BackendError::InputUnreadable(format!(
                "empty audio: {}",
                request.audio_path.display()
            )));
        }

        let language = request.language.clone();
        let temperature = request.temperature;
        let num_threads = self.config.num_threads;
        let cancel = request.cancel.clone();

        let result = tokio::task::spawn_blocking(move || -> Result<ChunkResult, BackendError> {
            let mut state = context
                .create_state()
                .map_err(|e| BackendError::Internal(e.to_string()))?;

            let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
            if language != "auto" {
                params.set_language(Some(&language));
            }
            params.set_temperature(temperature);
            params.set_n_threads(num_threads as i32);
            params.set_print_progress(false);
            params.set_print_special(false);
            params.set_print_realtime(false);

            if cancel.is_cancelled() {
                return Err(BackendError::Cancelled);
            }

            state
                .full(params, &samples)
                .map_err(|e| BackendError::Internal(e.to_string()))?;

            let num_segments = state
                .full_n_segments()
                .map_err(|e| BackendError::Internal(e.to_string()))?;

            let mut segments = Vec::with_capacity(num_segments as usize);
            let mut text = String::new();

            for i in 0..num_segments {
                let segment_text = state
                    .full_get_segment_text(i)
                    .map_err(|e| BackendError::Internal(e.to_string()))?;
                // Timestamps are in centiseconds
                let t0 = state
                    .full_get_segment_t0(i)
                    .map_err(|e| BackendError::Internal(e.to_string()))?;
                let t1 = state
                    .full_get_segment_t1(i)
                    .map_err(|e| BackendError::Internal(e.to_string()))?;

                let trimmed = segment_text.trim();
                if trimmed.is_empty() || t1 <= t0 {
                    continue;
                }

                // Mean token probability; whisper_full_get_token_p is
                // already in [0,1]
                let n_tokens = state.full_n_tokens(i).unwrap_or(0);
                let confidence = if n_tokens > 0 {
                    let mut sum = 0.0f32;
                    for t in 0..n_tokens {
                        sum += state.full_get_token_prob(i, t).unwrap_or(0.0);
                    }
                    (sum / n_tokens as f32).clamp(0.0, 1.0)
                } else {
                    0.0
                };

                text.push_str(&segment_text);

                segments.push(Segment {
                    start_seconds: t0 as f64 / 100.0,
                    end_seconds: t1 as f64 / 100.0,
                    text: trimmed.to_string(),
                    confidence,
                });
            }

            let confidence = if segments.is_empty() {
                None
            } else {
                Some(segments.iter().map(|s| s.confidence).sum::<f32>() / segments.len() as f32)
            };

            Ok(ChunkResult {
                text: text.trim().to_string(),
                language: if language.is_empty() {
                    "auto".to_string()
                } else {
                    language
                },
                segments,
                confidence,
            })
        })
        .await
        .map_err(|e| BackendError::Internal(format!("inference task panicked: {}", e)))??;

        debug!(
            "Whisper transcribed {} with {} ({} segments)",
            request.audio_path.display(),
            model_id,
            result.segments.len()
        );

        Ok(result)
    }

    fn describe(&self) -> BackendInfo {
        let model_id = self
            .model
            .lock()
            .as_ref()
            .map(|m| m.model_id.clone())
            .unwrap_or_else(|| "ggml-base".to_string());

        BackendInfo {
            model_id,
            supported_languages: vec![
                "auto".to_string(),
                "en".to_string(),
                "zh".to_string(),
                "ja".to_string(),
                "ko".to_string(),
            ],
            needs_accelerator: self.config.gpu_available,
            approximate_memory_mb: 1024,
            // whisper.cpp serializes on one context state per call; each call
            // creates its own state so concurrent calls are safe
            thread_safe: true,
        }
    }
}
