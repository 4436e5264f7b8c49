/// Job data model
///
/// Jobs, batches, per-job options and the progress event types shared by the
/// store, scheduler and progress bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OptionsError {
    #[error("Invalid chunking options: {0}")]
    InvalidChunking(String),

    #[error("Temperature out of range: {0} (must be 0.0 - 1.0)")]
    InvalidTemperature(f32),
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Preparing,
    Transcribing,
    Merging,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }

    /// Whether a transition to `next` is allowed by the state machine
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        match (*self, next) {
            (Pending, Preparing) => true,
            (Preparing, Transcribing) => true,
            (Transcribing, Merging) => true,
            (Merging, Completed) => true,
            // Any non-terminal state may fail or be cancelled
            (s, Failed) | (s, Cancelled) if !s.is_terminal() => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Preparing => "preparing",
            JobState::Transcribing => "transcribing",
            JobState::Merging => "merging",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn all() -> [JobState; 7] {
        [
            JobState::Pending,
            JobState::Preparing,
            JobState::Transcribing,
            JobState::Merging,
            JobState::Completed,
            JobState::Failed,
            JobState::Cancelled,
        ]
    }
}

/// GPU usage request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuMode {
    On,
    Off,
    Auto,
}

impl Default for GpuMode {
    fn default() -> Self {
        GpuMode::Auto
    }
}

/// Device the backend actually ran on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    Gpu,
}

/// Chunking behaviour for long inputs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingOptions {
    /// Whether long inputs are split at all
    pub enabled: bool,

    /// Length of each chunk in seconds
    pub chunk_seconds: f64,

    /// Overlap between adjacent chunks in seconds
    pub overlap_seconds: f64,

    /// Inputs at or below this duration are never split
    pub min_duration_seconds: f64,
}

impl Default for ChunkingOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            chunk_seconds: 300.0,       // 5 minute windows
            overlap_seconds: 2.0,       // 2s of shared context at boundaries
            min_duration_seconds: 300.0, // only split inputs longer than 5 minutes
        }
    }
}

impl ChunkingOptions {
    /// Validate chunking parameters
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.overlap_seconds < 0.0 {
            return Err(OptionsError::InvalidChunking(
                "overlap_seconds must be >= 0".to_string(),
            ));
        }

        if self.chunk_seconds <= self.overlap_seconds {
            return Err(OptionsError::InvalidChunking(format!(
                "chunk_seconds ({}) must be greater than overlap_seconds ({})",
                self.chunk_seconds, self.overlap_seconds
            )));
        }

        if self.min_duration_seconds < 0.0 {
            return Err(OptionsError::InvalidChunking(
                "min_duration_seconds must be >= 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Per-job processing options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// Backend model to transcribe with
    pub model_id: String,

    /// Target language tag, or "auto" for detection
    pub language: String,

    /// Include per-segment time boundaries in the output
    pub want_word_timestamps: bool,

    /// Advisory sampling temperature, passed through to the backend
    pub temperature: f32,

    /// GPU usage request; `auto` may be downgraded by the scheduler
    pub use_gpu: GpuMode,

    /// Chunking behaviour
    pub chunking: ChunkingOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            model_id: "sensevoice-small".to_string(),
            language: "auto".to_string(),
            want_word_timestamps: false,
            temperature: 0.0,
            use_gpu: GpuMode::Auto,
            chunking: ChunkingOptions::default(),
        }
    }
}

impl Options {
    /// Validate option values
    pub fn validate(&self) -> Result<(), OptionsError> {
        if !(0.0..=1.0).contains(&self.temperature) {
            return Err(OptionsError::InvalidTemperature(self.temperature));
        }

        self.chunking.validate()
    }
}

/// A single transcript unit with absolute time boundaries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    /// Start offset in seconds
    pub start_seconds: f64,

    /// End offset in seconds
    pub end_seconds: f64,

    /// Segment text (non-empty after trimming)
    pub text: String,

    /// Confidence score (0.0 - 1.0)
    pub confidence: f32,
}

/// Final merged transcript for one job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    /// Full transcribed text
    pub text: String,

    /// Language detected (or requested) for the input
    pub detected_language: String,

    /// Overall confidence (mean of segment confidences)
    pub confidence: f32,

    /// Segments sorted by start time, pairwise non-overlapping
    pub segments: Vec<Segment>,

    /// Wall-clock processing time in seconds
    pub processing_seconds: f64,

    /// Model that produced the transcript
    pub model_id: String,
}

/// Error kinds visible on failed jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    NotAFile,
    UnsupportedFormat,
    PrepareFailed,
    SplitFailed,
    BackendTransient,
    BackendOom,
    BackendFatal,
    Cancelled,
    Timeout,
    Internal,
}

/// Terminal error recorded on a failed job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// One input file moving through the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Opaque process-unique identifier
    pub job_id: String,

    /// Source media path as submitted
    pub input_path: String,

    /// Processing options
    pub options: Options,

    /// Current lifecycle state
    pub state: JobState,

    /// Progress percentage, monotonically non-decreasing until terminal
    pub progress: u8,

    /// Human-readable description of the current phase
    pub phase: Option<String>,

    /// Batch this job belongs to, if any
    pub batch_id: Option<String>,

    /// Device the backend actually ran on (set once known)
    pub effective_device: Option<Device>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Final transcript, set iff state is Completed
    pub transcript: Option<Transcript>,

    /// Terminal error, set iff state is Failed
    pub error: Option<JobError>,
}

impl Job {
    /// Create a new pending job
    pub fn new(job_id: String, input_path: String, options: Options) -> Self {
        Self {
            job_id,
            input_path,
            options,
            state: JobState::Pending,
            progress: 0,
            phase: None,
            batch_id: None,
            effective_device: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            transcript: None,
            error: None,
        }
    }
}

/// Aggregate over a set of jobs submitted together
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: String,
    pub job_ids: Vec<String>,
    pub total: usize,
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
    pub created_at: DateTime<Utc>,
}

impl Batch {
    pub fn new(batch_id: String, job_ids: Vec<String>) -> Self {
        let total = job_ids.len();
        Self {
            batch_id,
            job_ids,
            total,
            pending: total,
            completed: 0,
            failed: 0,
            created_at: Utc::now(),
        }
    }
}

/// Pipeline phase a progress event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Validate,
    Probe,
    Prepare,
    Transcribe,
    Merge,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Validate => "validate",
            Phase::Probe => "probe",
            Phase::Prepare => "prepare",
            Phase::Transcribe => "transcribe",
            Phase::Merge => "merge",
        }
    }
}

/// Event payload published on the progress bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEventBody {
    Progress {
        percent: u8,
        phase: Phase,
        message: String,
    },
    Result {
        transcript: Transcript,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
    Heartbeat,
}

impl ProgressEventBody {
    /// Terminal events close the subscription and are never dropped
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEventBody::Result { .. } | ProgressEventBody::Error { .. }
        )
    }
}

/// A progress event with its per-job sequence number
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: String,

    /// Monotonically increasing per-job sequence number
    pub seq: u64,

    #[serde(flatten)]
    pub body: ProgressEventBody,
}

/// Generate a process-unique job id: `job_<timestamp>_<hex8>`
pub fn generate_job_id() -> String {
    generate_id("job")
}

/// Generate a process-unique batch id: `batch_<timestamp>_<hex8>`
pub fn generate_batch_id() -> String {
    generate_id("batch")
}

fn generate_id(prefix: &str) -> String {
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}_{}", prefix, timestamp, &random[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Transcribing.is_terminal());
    }

    #[test_case(JobState::Pending, JobState::Preparing => true ; "accept_starts_preparing")]
    #[test_case(JobState::Preparing, JobState::Transcribing => true ; "audio_ready")]
    #[test_case(JobState::Transcribing, JobState::Merging => true ; "all_chunks_done")]
    #[test_case(JobState::Merging, JobState::Completed => true ; "merge_ok")]
    #[test_case(JobState::Pending, JobState::Cancelled => true ; "cancel_while_queued")]
    #[test_case(JobState::Transcribing, JobState::Failed => true ; "chunk_failure")]
    #[test_case(JobState::Pending, JobState::Transcribing => false ; "cannot_skip_prepare")]
    #[test_case(JobState::Preparing, JobState::Merging => false ; "cannot_skip_transcribe")]
    #[test_case(JobState::Merging, JobState::Transcribing => false ; "no_going_back")]
    #[test_case(JobState::Completed, JobState::Pending => false ; "completed_is_final")]
    #[test_case(JobState::Failed, JobState::Cancelled => false ; "failed_is_final")]
    fn test_transition_table(from: JobState, to: JobState) -> bool {
        from.can_transition_to(to)
    }

    #[test]
    fn test_no_transition_out_of_terminal() {
        for terminal in [JobState::Completed, JobState::Failed, JobState::Cancelled] {
            for next in JobState::all() {
                assert!(
                    !terminal.can_transition_to(next),
                    "{:?} -> {:?} should be rejected",
                    terminal,
                    next
                );
            }
        }
    }

    #[test]
    fn test_chunking_options_validation() {
        let valid = ChunkingOptions::default();
        assert!(valid.validate().is_ok());

        let overlap_too_large = ChunkingOptions {
            chunk_seconds: 2.0,
            overlap_seconds: 2.0,
            ..Default::default()
        };
        assert!(overlap_too_large.validate().is_err());

        let negative_overlap = ChunkingOptions {
            overlap_seconds: -1.0,
            ..Default::default()
        };
        assert!(negative_overlap.validate().is_err());
    }

    #[test]
    fn test_options_temperature_validation() {
        let mut options = Options::default();
        assert!(options.validate().is_ok());

        options.temperature = 1.5;
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_id_generation_shape() {
        let job_id = generate_job_id();
        let batch_id = generate_batch_id();

        assert!(job_id.starts_with("job_"));
        assert!(batch_id.starts_with("batch_"));
        assert_ne!(generate_job_id(), job_id);
    }

    #[test]
    fn test_batch_counters_start_consistent() {
        let batch = Batch::new("batch_x".to_string(), vec!["a".into(), "b".into()]);
        assert_eq!(batch.total, 2);
        assert_eq!(batch.pending + batch.completed + batch.failed, batch.total);
    }

    #[test]
    fn test_progress_event_terminal() {
        assert!(ProgressEventBody::Error {
            kind: ErrorKind::Cancelled,
            message: "cancelled".to_string(),
        }
        .is_terminal());
        assert!(!ProgressEventBody::Heartbeat.is_terminal());
    }
}
