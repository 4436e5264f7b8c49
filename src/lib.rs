/// Transcription pipeline library
///
/// Turns video and audio files into punctuated transcripts: media probing,
/// audio preparation, overlapping chunking, pluggable speech recognition,
/// result merging and a bounded-concurrency job scheduler with progress
/// streaming.

pub mod backend;
pub mod chunker;
pub mod config;
pub mod janitor;
pub mod job;
pub mod postprocess;
pub mod prepare;
pub mod probe;
pub mod progress;
pub mod scheduler;
pub mod store;

#[cfg(feature = "whisper")]
pub mod whisper_backend;

// Re-export main types
pub use backend::{BackendError, BackendInfo, ChunkResult, MockBackend, SpeechBackend, TranscribeRequest};
pub use chunker::{AudioChunk, ChunkError};
pub use config::EngineConfig;
pub use janitor::Janitor;
pub use job::{
    Batch, ChunkingOptions, Device, ErrorKind, GpuMode, Job, JobError, JobState, Options, Phase,
    ProgressEvent, ProgressEventBody, Segment, Transcript,
};
pub use postprocess::{PunctuationModel, Postprocessor};
pub use prepare::{AudioDescriptor, PrepareError};
pub use probe::{MediaInfo, ProbeError};
pub use progress::{ProgressBus, Subscription, TelemetryEvent};
pub use scheduler::{Scheduler, SchedulerError, SchedulerStats};
pub use store::{JobStore, StoreError, StoreStats};

#[cfg(feature = "whisper")]
pub use whisper_backend::{WhisperBackend, WhisperBackendConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_library_exports() {
        let _config = EngineConfig::default();
        let _options = Options::default();
        let _chunking = ChunkingOptions::default();
    }
}
