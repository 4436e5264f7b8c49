/// Speech backend capability
///
/// The contract the scheduler drives inference through. The engine itself is
/// pluggable (local CPU, local GPU, remote RPC); the scheduler only depends
/// on this surface and on the error taxonomy below.

use crate::job::{Device, Segment};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Model loading failed: {0}")]
    ModelLoadFailed(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Input unreadable: {0}")]
    InputUnreadable(String),

    #[error("Transient backend failure: {0}")]
    Transient(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Internal backend error: {0}")]
    Internal(String),
}

impl BackendError {
    /// Transient faults and OOM are retry-eligible; everything else is fatal
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Transient(_) | BackendError::OutOfMemory(_))
    }
}

/// Result of transcribing one audio segment. Segment times are local to the
/// transcribed file; the chunker shifts them to absolute source time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkResult {
    /// Full text of the segment
    pub text: String,

    /// Detected (or requested) language tag, may be empty when unknown
    pub language: String,

    /// Segments with local time offsets
    pub segments: Vec<Segment>,

    /// Overall confidence if the backend computes one
    pub confidence: Option<f32>,
}

/// Static facts about a backend instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendInfo {
    pub model_id: String,
    pub supported_languages: Vec<String>,
    pub needs_accelerator: bool,
    pub approximate_memory_mb: u64,

    /// Whether `transcribe` may be called concurrently; when false the
    /// scheduler pins inner-pool concurrency to 1
    pub thread_safe: bool,
}

/// Per-call fractional progress callback (0.0 - 1.0)
pub type ProgressFn = Arc<dyn Fn(f32) + Send + Sync>;

/// One transcription request
#[derive(Clone)]
pub struct TranscribeRequest {
    pub audio_path: PathBuf,
    pub language: String,
    pub want_word_timestamps: bool,
    pub temperature: f32,

    /// Device resolved by the scheduler (GPU hints already applied)
    pub device: Device,

    pub progress_sink: Option<ProgressFn>,
    pub cancel: CancellationToken,
}

/// Pluggable speech recognition capability
#[async_trait]
pub trait SpeechBackend: Send + Sync {
    /// Load the model. Idempotent; concurrent callers observe at most one
    /// real load.
    async fn load(&self, model_id: &str) -> Result<(), BackendError>;

    /// Release backend memory. Safe to call when not loaded.
    async fn unload(&self) -> Result<(), BackendError>;

    /// Transcribe one audio file. Must honour `request.cancel` by returning
    /// `BackendError::Cancelled` as soon as practical.
    async fn transcribe(&self, request: TranscribeRequest) -> Result<ChunkResult, BackendError>;

    fn describe(&self) -> BackendInfo;
}

// ---------------------------------------------------------------------------
// Mock implementation
// ---------------------------------------------------------------------------

/// Languages the mock pretends to support (the SenseVoice set)
pub const MOCK_LANGUAGES: &[&str] = &["auto", "zh", "en", "yue", "ja", "ko"];

struct MockState {
    loaded: bool,
    model_id: String,
}

/// Scriptable in-process backend used in tests and when no inference engine
/// feature is enabled. Produces one synthetic segment per two seconds of
/// audio; failures can be queued ahead of time to exercise retry paths.
pub struct MockBackend {
    state: tokio::sync::Mutex<MockState>,
    load_count: AtomicUsize,
    default_model: String,

    /// Pending scripted failures, popped one per transcribe call
    failures: parking_lot::Mutex<std::collections::VecDeque<BackendError>>,

    /// Devices observed across transcribe calls, in call order
    devices_seen: parking_lot::Mutex<Vec<Device>>,

    /// Artificial per-call latency
    latency: std::time::Duration,
}

impl MockBackend {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            state: tokio::sync::Mutex::new(MockState {
                loaded: false,
                model_id: String::new(),
            }),
            load_count: AtomicUsize::new(0),
            default_model: model_id.into(),
            failures: parking_lot::Mutex::new(std::collections::VecDeque::new()),
            devices_seen: parking_lot::Mutex::new(Vec::new()),
            latency: std::time::Duration::from_millis(10),
        }
    }

    /// Set artificial latency per transcribe call
    pub fn with_latency(mut self, latency: std::time::Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queue a failure for an upcoming transcribe call
    pub fn push_failure(&self, error: BackendError) {
        self.failures.lock().push_back(error);
    }

    /// How many real loads have happened
    pub fn load_count(&self) -> usize {
        self.load_count.load(Ordering::SeqCst)
    }

    /// Devices seen by transcribe calls, in call order
    pub fn devices_seen(&self) -> Vec<Device> {
        self.devices_seen.lock().clone()
    }

    fn wav_duration_seconds(path: &std::path::Path) -> Result<f64, BackendError> {
        let reader = hound::WavReader::open(path)
            .map_err(|e| BackendError::InputUnreadable(format!("{}: {}", path.display(), e)))?;
        let spec = reader.spec();
        Ok(reader.len() as f64 / spec.sample_rate as f64 / spec.channels as f64)
    }
}

#[async_trait]
impl SpeechBackend for MockBackend {
    async fn load(&self, model_id: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;

        if state.loaded && state.model_id == model_id {
            debug!("Mock model {} already loaded", model_id);
            return Ok(());
        }

        // Simulate model load latency while holding the guard; concurrent
        // callers queue here and observe the loaded flag afterwards.
        tokio::time::sleep(self.latency).await;
        self.load_count.fetch_add(1, Ordering::SeqCst);

        state.loaded = true;
        state.model_id = model_id.to_string();

        info!("Mock model loaded: {}", model_id);
        Ok(())
    }

    async fn unload(&self) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        if state.loaded {
            state.loaded = false;
            state.model_id.clear();
            info!("Mock model unloaded");
        }
        Ok(())
    }

    async fn transcribe(&self, request: TranscribeRequest) -> Result<ChunkResult, BackendError> {
        // Lazy load for first callers; at most one real load happens
        let needs_load = { !self.state.lock().await.loaded };
        if needs_load {
            let model = self.default_model.clone();
            self.load(&model).await?;
        }

        if request.cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }

        self.devices_seen.lock().push(request.device);

        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }

        if let Some(sink) = &request.progress_sink {
            sink(0.0);
        }

        let duration = Self::wav_duration_seconds(&request.audio_path)?;

        // Sleep in small slices so cancellation is observed promptly
        let deadline = tokio::time::Instant::now() + self.latency;
        while tokio::time::Instant::now() < deadline {
            if request.cancel.is_cancelled() {
                return Err(BackendError::Cancelled);
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        // One synthetic segment per ~2s of audio
        let segment_count = (duration / 2.0).ceil().max(1.0) as usize;
        let mut segments = Vec::with_capacity(segment_count);
        let mut text_parts = Vec::with_capacity(segment_count);

        for i in 0..segment_count {
            let start = i as f64 * 2.0;
            let end = (start + 2.0).min(duration);
            if end <= start {
                break;
            }

            let text = format!("segment {} at {:.1}s", i + 1, start);
            text_parts.push(text.clone());
            segments.push(Segment {
                start_seconds: start,
                end_seconds: end,
                text,
                confidence: 0.95,
            });
        }

        if let Some(sink) = &request.progress_sink {
            sink(1.0);
        }

        let language = if request.language == "auto" {
            "zh".to_string()
        } else {
            request.language.clone()
        };

        Ok(ChunkResult {
            text: text_parts.join(" "),
            language,
            segments,
            confidence: Some(0.95),
        })
    }

    fn describe(&self) -> BackendInfo {
        BackendInfo {
            model_id: self.default_model.clone(),
            supported_languages: MOCK_LANGUAGES.iter().map(|s| s.to_string()).collect(),
            needs_accelerator: false,
            approximate_memory_mb: 244,
            thread_safe: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn write_wav(path: &Path, seconds: f64) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..(16000.0 * seconds) as usize {
            let t = i as f32 / 16000.0;
            let v = (2.0 * std::f32::consts::PI * 300.0 * t).sin() * 0.4;
            writer.write_sample((v * i16::MAX as f32) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn request(path: PathBuf) -> TranscribeRequest {
        TranscribeRequest {
            audio_path: path,
            language: "auto".to_string(),
            want_word_timestamps: false,
            temperature: 0.0,
            device: Device::Cpu,
            progress_sink: None,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_load_is_idempotent() {
        let backend = MockBackend::new("sensevoice-small");

        backend.load("sensevoice-small").await.unwrap();
        backend.load("sensevoice-small").await.unwrap();
        backend.load("sensevoice-small").await.unwrap();

        assert_eq!(backend.load_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_loads_run_once() {
        let backend = Arc::new(MockBackend::new("sensevoice-small"));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                backend.load("sensevoice-small").await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(backend.load_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_transcribes_load_once() {
        let dir = tempfile::tempdir().unwrap();
        let wav = dir.path().join("audio.wav");
        write_wav(&wav, 1.0);

        let backend = Arc::new(MockBackend::new("sensevoice-small"));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let backend = backend.clone();
            let req = request(wav.clone());
            handles.push(tokio::spawn(async move { backend.transcribe(req).await }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(backend.load_count(), 1);
    }

    #[tokio::test]
    async fn test_transcribe_produces_segments() {
        let dir = tempfile::tempdir().unwrap();
        let wav = dir.path().join("audio.wav");
        write_wav(&wav, 5.0);

        let backend = MockBackend::new("sensevoice-small");
        let result = backend.transcribe(request(wav)).await.unwrap();

        assert!(!result.text.is_empty());
        assert_eq!(result.segments.len(), 3);
        assert_eq!(result.language, "zh");
        assert!(result.segments.iter().all(|s| s.end_seconds > s.start_seconds));
    }

    #[tokio::test]
    async fn test_transcribe_missing_file() {
        let backend = MockBackend::new("sensevoice-small");
        let result = backend
            .transcribe(request(PathBuf::from("/nonexistent.wav")))
            .await;

        assert!(matches!(result, Err(BackendError::InputUnreadable(_))));
    }

    #[tokio::test]
    async fn test_transcribe_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let wav = dir.path().join("audio.wav");
        write_wav(&wav, 1.0);

        let backend = MockBackend::new("sensevoice-small");
        let mut req = request(wav);
        req.cancel.cancel();

        let result = backend.transcribe(req).await;
        assert!(matches!(result, Err(BackendError::Cancelled)));
    }

    #[tokio::test]
    async fn test_scripted_failure_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let wav = dir.path().join("audio.wav");
        write_wav(&wav, 1.0);

        let backend = MockBackend::new("sensevoice-small");
        backend.push_failure(BackendError::Transient("flaky".to_string()));

        let first = backend.transcribe(request(wav.clone())).await;
        assert!(matches!(first, Err(BackendError::Transient(_))));

        let second = backend.transcribe(request(wav)).await;
        assert!(second.is_ok());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(BackendError::Transient("x".to_string()).is_retryable());
        assert!(BackendError::OutOfMemory("x".to_string()).is_retryable());
        assert!(!BackendError::Cancelled.is_retryable());
        assert!(!BackendError::Internal("x".to_string()).is_retryable());
        assert!(!BackendError::ModelLoadFailed("x".to_string()).is_retryable());
    }

    #[test]
    fn test_describe() {
        let backend = MockBackend::new("sensevoice-small");
        let info = backend.describe();

        assert_eq!(info.model_id, "sensevoice-small");
        assert!(info.supported_languages.contains(&"zh".to_string()));
        assert!(info.thread_safe);
    }
}
