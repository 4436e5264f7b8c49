/// Pipeline scheduler
///
/// Drives submitted jobs through probe -> prepare -> split -> transcribe ->
/// merge -> postprocess under two levels of bounded concurrency, honours
/// cancellation at every stage boundary, retries transient backend faults
/// with backoff, and guarantees temp-file cleanup on any terminal state.

use crate::backend::{BackendError, ChunkResult, ProgressFn, SpeechBackend, TranscribeRequest};
use crate::chunker::{self, AudioChunk};
use crate::config::EngineConfig;
use crate::job::{
    Batch, Device, ErrorKind, GpuMode, Job, JobError, JobState, Options, Phase, ProgressEventBody,
    Transcript,
};
use crate::postprocess::{self, Postprocessor};
use crate::prepare::{self, PrepareError, PrepareMilestone};
use crate::probe::{self, ProbeError};
use crate::progress::{ProgressBus, Subscription};
use crate::store::{JobStore, StoreError, TransitionFields};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Retry backoff base
const RETRY_BASE: Duration = Duration::from_secs(2);

/// Retry backoff cap
const RETRY_CAP: Duration = Duration::from_secs(30);

/// Maximum retries per chunk
const MAX_RETRIES: u32 = 2;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Batch not found: {0}")]
    BatchNotFound(String),

    #[error("Scheduler is shutting down")]
    ShuttingDown,
}

/// Aggregate scheduler statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub jobs: crate::store::StoreStats,
    pub max_concurrent_jobs: usize,
    pub max_concurrent_chunks: usize,
    pub queued_jobs: usize,
}

/// Why a pipeline stopped short of a transcript
enum PipelineError {
    Cancelled,
    Failed(JobError),
}

impl PipelineError {
    fn failed(kind: ErrorKind, message: impl Into<String>) -> Self {
        PipelineError::Failed(JobError::new(kind, message))
    }
}

/// The transcription pipeline engine.
///
/// One instance per process; dependencies are injected at construction and
/// the instance is shared behind an `Arc`.
pub struct Scheduler {
    config: EngineConfig,
    store: Arc<JobStore>,
    bus: Arc<ProgressBus>,
    backend: Arc<dyn SpeechBackend>,
    postprocessor: Arc<Postprocessor>,

    job_permits: Arc<Semaphore>,
    queue_tx: mpsc::UnboundedSender<String>,
    queued: Arc<AtomicUsize>,

    cancel_tokens: Mutex<HashMap<String, CancellationToken>>,
    cleanup_lists: Arc<Mutex<HashMap<String, Vec<PathBuf>>>>,

    /// Serializes clamp-and-publish so event percents stay monotone even
    /// when chunks report progress concurrently
    progress_gate: Mutex<()>,

    shutdown_token: CancellationToken,
    accepting: AtomicBool,
}

impl Scheduler {
    /// Create the scheduler and start its dispatcher task
    pub fn new(
        config: EngineConfig,
        store: Arc<JobStore>,
        bus: Arc<ProgressBus>,
        backend: Arc<dyn SpeechBackend>,
        postprocessor: Arc<Postprocessor>,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        let scheduler = Arc::new(Self {
            job_permits: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
            config,
            store,
            bus,
            backend,
            postprocessor,
            queue_tx,
            queued: Arc::new(AtomicUsize::new(0)),
            cancel_tokens: Mutex::new(HashMap::new()),
            cleanup_lists: Arc::new(Mutex::new(HashMap::new())),
            progress_gate: Mutex::new(()),
            shutdown_token: CancellationToken::new(),
            accepting: AtomicBool::new(true),
        });

        scheduler.clone().spawn_dispatcher(queue_rx);
        scheduler
    }

    /// Dispatcher: admits queued jobs into the worker pool in FIFO order
    fn spawn_dispatcher(self: Arc<Self>, mut queue_rx: mpsc::UnboundedReceiver<String>) {
        tokio::spawn(async move {
            while let Some(job_id) = queue_rx.recv().await {
                self.queued.fetch_sub(1, Ordering::SeqCst);

                let permit = match self.job_permits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break, // semaphore closed
                };

                let scheduler = self.clone();
                tokio::spawn(async move {
                    scheduler.run_job(&job_id).await;
                    drop(permit);
                });
            }
            debug!("Dispatcher stopped");
        });
    }

    // -----------------------------------------------------------------------
    // Programmatic surface
    // -----------------------------------------------------------------------

    /// Validate and enqueue one input file. Never blocks; when the worker
    /// pool is saturated the job waits in `Pending`.
    pub fn submit(&self, input_path: &str, options: Options) -> Result<String, SchedulerError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(SchedulerError::ShuttingDown);
        }

        if input_path.trim().is_empty() {
            return Err(SchedulerError::InvalidInput("empty input path".to_string()));
        }

        options
            .validate()
            .map_err(|e| SchedulerError::InvalidInput(e.to_string()))?;

        let job_id = self.store.create_job(input_path, options);

        self.cancel_tokens
            .lock()
            .insert(job_id.clone(), self.shutdown_token.child_token());
        self.cleanup_lists.lock().insert(job_id.clone(), Vec::new());

        self.publish_progress(&job_id, 0, Phase::Validate, "job accepted");

        self.queued.fetch_add(1, Ordering::SeqCst);
        self.queue_tx
            .send(job_id.clone())
            .map_err(|_| SchedulerError::ShuttingDown)?;

        info!("Submitted job {} for {}", job_id, input_path);
        Ok(job_id)
    }

    /// Submit several inputs as one batch
    pub fn submit_batch(
        &self,
        inputs: Vec<(String, Options)>,
    ) -> Result<(String, Vec<String>), SchedulerError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(SchedulerError::ShuttingDown);
        }

        if inputs.is_empty() {
            return Err(SchedulerError::InvalidInput("empty batch".to_string()));
        }

        for (path, options) in &inputs {
            if path.trim().is_empty() {
                return Err(SchedulerError::InvalidInput("empty input path".to_string()));
            }
            options
                .validate()
                .map_err(|e| SchedulerError::InvalidInput(e.to_string()))?;
        }

        let mut job_ids = Vec::with_capacity(inputs.len());
        for (path, options) in inputs {
            job_ids.push(self.submit(&path, options)?);
        }

        let batch_id = self
            .store
            .create_batch(job_ids.clone())
            .map_err(|e| SchedulerError::InvalidInput(e.to_string()))?;

        Ok((batch_id, job_ids))
    }

    /// Request cancellation. Idempotent; a no-op on completed or failed jobs.
    pub fn cancel(&self, job_id: &str) -> Result<(), SchedulerError> {
        let job = self
            .store
            .get(job_id)
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;

        if job.state.is_terminal() {
            return Ok(());
        }

        if let Some(token) = self.cancel_tokens.lock().get(job_id) {
            token.cancel();
        }

        // A job still waiting in the queue terminalizes immediately; running
        // jobs observe the token at the next suspension point.
        if job.state == JobState::Pending {
            if self
                .store
                .transition(job_id, JobState::Cancelled, TransitionFields::default())
                .is_ok()
            {
                self.finish_job(job_id);
                self.bus.publish(
                    job_id,
                    ProgressEventBody::Error {
                        kind: ErrorKind::Cancelled,
                        message: "cancelled before start".to_string(),
                    },
                );
            }
        }

        info!("Cancellation requested for {}", job_id);
        Ok(())
    }

    /// Cancel every non-terminal job in a batch
    pub fn cancel_batch(&self, batch_id: &str) -> Result<(), SchedulerError> {
        let job_ids = self
            .store
            .batch_job_ids(batch_id)
            .map_err(|_| SchedulerError::BatchNotFound(batch_id.to_string()))?;

        for job_id in job_ids {
            // Individual jobs may already be gone to the janitor
            let _ = self.cancel(&job_id);
        }
        Ok(())
    }

    pub fn get_job(&self, job_id: &str) -> Option<Job> {
        self.store.get(job_id)
    }

    pub fn get_batch(&self, batch_id: &str) -> Option<Batch> {
        self.store.get_batch(batch_id)
    }

    pub fn list_jobs(&self, filter: Option<JobState>, limit: usize, offset: usize) -> Vec<Job> {
        self.store.list(filter, limit, offset)
    }

    /// Subscribe to a job's progress stream. Late subscribers to a finished
    /// job receive its terminal event immediately.
    pub fn subscribe(&self, job_id: &str) -> Result<Subscription, SchedulerError> {
        if self.store.get(job_id).is_none() {
            return Err(SchedulerError::JobNotFound(job_id.to_string()));
        }

        let subscription = self.bus.subscribe(job_id);

        // Re-read after subscribing: a terminal event published before the
        // subscription existed is replayed from the record.
        if let Some(job) = self.store.get(job_id) {
            if job.state.is_terminal() {
                let body = match (&job.state, &job.transcript, &job.error) {
                    (JobState::Completed, Some(t), _) => ProgressEventBody::Result {
                        transcript: t.clone(),
                    },
                    (JobState::Failed, _, Some(e)) => ProgressEventBody::Error {
                        kind: e.kind,
                        message: e.message.clone(),
                    },
                    _ => ProgressEventBody::Error {
                        kind: ErrorKind::Cancelled,
                        message: "cancelled".to_string(),
                    },
                };
                self.bus.publish(job_id, body);
            }
        }

        Ok(subscription)
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            jobs: self.store.snapshot_stats(),
            max_concurrent_jobs: self.config.max_concurrent_jobs,
            max_concurrent_chunks: self.config.max_concurrent_chunks,
            queued_jobs: self.queued.load(Ordering::SeqCst),
        }
    }

    /// Paths that active jobs still own; the janitor must not sweep these
    pub fn active_cleanup_paths(&self) -> HashSet<PathBuf> {
        self.cleanup_lists
            .lock()
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    pub fn temp_root(&self) -> &std::path::Path {
        &self.config.temp_root
    }

    /// Stop accepting work, drain in-flight jobs up to `deadline`, cancel
    /// whatever is still running after it.
    pub async fn shutdown(&self, deadline: Duration) {
        info!("Scheduler shutting down (deadline {:?})", deadline);
        self.accepting.store(false, Ordering::SeqCst);

        let drained = tokio::time::timeout(deadline, async {
            loop {
                if self.store.snapshot_stats().active_jobs == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!("Shutdown deadline reached, cancelling remaining jobs");
            self.shutdown_token.cancel();

            // Pending jobs have no running pipeline to observe the token
            for job in self.store.list(Some(JobState::Pending), usize::MAX, 0) {
                let _ = self.cancel(&job.job_id);
            }

            // Give running pipelines a moment to terminalize
            let _ = tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    if self.store.snapshot_stats().active_jobs == 0 {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            })
            .await;
        }

        info!("Scheduler shut down");
    }

    // -----------------------------------------------------------------------
    // Pipeline driver
    // -----------------------------------------------------------------------

    async fn run_job(self: &Arc<Self>, job_id: &str) {
        let job = match self.store.get(job_id) {
            Some(job) => job,
            None => return,
        };

        // Cancelled while still queued
        if job.state != JobState::Pending {
            return;
        }

        let token = self
            .cancel_tokens
            .lock()
            .get(job_id)
            .cloned()
            .unwrap_or_else(CancellationToken::new);

        let timeout = Duration::from_secs(self.config.job_timeout_secs);
        let started = std::time::Instant::now();

        let outcome =
            tokio::time::timeout(timeout, self.drive_pipeline(&job, token.clone())).await;

        match outcome {
            Ok(Ok(mut transcript)) => {
                transcript.processing_seconds = started.elapsed().as_secs_f64();
                transcript.model_id = job.options.model_id.clone();

                let transition = self.store.transition(
                    job_id,
                    JobState::Completed,
                    TransitionFields {
                        transcript: Some(transcript.clone()),
                        ..Default::default()
                    },
                );

                if transition.is_ok() {
                    self.bus
                        .publish(job_id, ProgressEventBody::Result { transcript });
                    info!("Job {} completed", job_id);
                }
            }
            Ok(Err(PipelineError::Cancelled)) => {
                self.terminalize_cancelled(job_id);
            }
            Ok(Err(PipelineError::Failed(job_error))) => {
                self.terminalize_failed(job_id, job_error);
            }
            Err(_elapsed) => {
                token.cancel();
                self.terminalize_failed(
                    job_id,
                    JobError::new(
                        ErrorKind::Timeout,
                        format!("job exceeded {}s wall-clock timeout", timeout.as_secs()),
                    ),
                );
            }
        }

        self.cleanup_job_files(job_id);
        self.finish_job(job_id);
    }

    fn terminalize_cancelled(&self, job_id: &str) {
        if self
            .store
            .transition(job_id, JobState::Cancelled, TransitionFields::default())
            .is_ok()
        {
            self.bus.publish(
                job_id,
                ProgressEventBody::Error {
                    kind: ErrorKind::Cancelled,
                    message: "cancelled".to_string(),
                },
            );
            info!("Job {} cancelled", job_id);
        }
    }

    fn terminalize_failed(&self, job_id: &str, job_error: JobError) {
        let result = self.store.transition(
            job_id,
            JobState::Failed,
            TransitionFields {
                error: Some(job_error.clone()),
                ..Default::default()
            },
        );

        match result {
            Ok(_) => {
                self.bus.publish(
                    job_id,
                    ProgressEventBody::Error {
                        kind: job_error.kind,
                        message: job_error.message.clone(),
                    },
                );
                warn!("Job {} failed: {:?} {}", job_id, job_error.kind, job_error.message);
            }
            Err(StoreError::InvalidTransition { .. }) => {
                // Already terminal (lost a race with cancellation), keep it
            }
            Err(e) => error!("Failed to terminalize {}: {}", job_id, e),
        }
    }

    /// Drop per-job bookkeeping once the job is terminal
    fn finish_job(&self, job_id: &str) {
        self.cancel_tokens.lock().remove(job_id);
        self.cleanup_lists.lock().remove(job_id);
    }

    /// Delete every path the job created. Never fails; the original input is
    /// never on the list.
    fn cleanup_job_files(&self, job_id: &str) {
        let paths = self
            .cleanup_lists
            .lock()
            .get(job_id)
            .cloned()
            .unwrap_or_default();

        for path in paths {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("Cleanup failed for {}: {}", path.display(), e);
                }
            }
        }

        let job_dir = self.config.job_dir(job_id);
        if job_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&job_dir) {
                warn!("Cleanup failed for {}: {}", job_dir.display(), e);
            }
        }
    }

    fn track_cleanup(&self, job_id: &str, path: PathBuf) {
        if let Some(list) = self.cleanup_lists.lock().get_mut(job_id) {
            list.push(path);
        }
    }

    fn publish_progress(&self, job_id: &str, percent: u8, phase: Phase, message: &str) {
        let _gate = self.progress_gate.lock();

        let clamped = self
            .store
            .increment_progress(job_id, percent, phase.as_str())
            .unwrap_or(percent);

        self.bus.publish(
            job_id,
            ProgressEventBody::Progress {
                percent: clamped,
                phase,
                message: message.to_string(),
            },
        );
    }

    async fn drive_pipeline(
        self: &Arc<Self>,
        job: &Job,
        token: CancellationToken,
    ) -> Result<Transcript, PipelineError> {
        let job_id = job.job_id.clone();
        let options = job.options.clone();

        // Validation already passed at submit
        self.store
            .transition(&job_id, JobState::Preparing, TransitionFields::default())
            .map_err(|e| PipelineError::failed(ErrorKind::Internal, e.to_string()))?;
        self.publish_progress(&job_id, 5, Phase::Validate, "input validated");

        if token.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        // --- Probe ---------------------------------------------------------
        let input = PathBuf::from(&job.input_path);
        let info = {
            let probe_path = input.clone();
            tokio::task::spawn_blocking(move || probe::probe(&probe_path))
                .await
                .map_err(|e| PipelineError::failed(ErrorKind::Internal, e.to_string()))?
                .map_err(map_probe_error)?
        };
        self.publish_progress(
            &job_id,
            10,
            Phase::Probe,
            &format!("{} {:.1}s", info.format, info.duration_seconds),
        );

        if token.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        // GPU admission: long inputs under `auto` run on CPU
        let device = match options.use_gpu {
            GpuMode::On => Device::Gpu,
            GpuMode::Off => Device::Cpu,
            GpuMode::Auto => {
                if info.duration_seconds > self.config.gpu_max_duration_secs {
                    info!(
                        "Job {}: {:.0}s input exceeds GPU admission limit, running on CPU",
                        job_id, info.duration_seconds
                    );
                    Device::Cpu
                } else {
                    Device::Gpu
                }
            }
        };
        let _ = self.store.set_effective_device(&job_id, device);

        // --- Prepare -------------------------------------------------------
        let descriptor = {
            let scheduler = self.clone();
            let milestone_job = job_id.clone();
            let job_dir = self.config.job_dir(&job_id);
            let prepare_token = token.clone();
            let prepare_input = input.clone();

            tokio::task::spawn_blocking(move || {
                prepare::prepare(&prepare_input, &job_dir, &prepare_token, |milestone| {
                    let (percent, message) = match milestone {
                        PrepareMilestone::DecodeStarted => (15, "decoding audio"),
                        PrepareMilestone::DecodeFinished => (40, "audio decoded"),
                        PrepareMilestone::NormalizeFinished => (50, "audio normalized"),
                    };
                    scheduler.publish_progress(&milestone_job, percent, Phase::Prepare, message);
                })
            })
            .await
            .map_err(|e| PipelineError::failed(ErrorKind::Internal, e.to_string()))?
            .map_err(|e| match e {
                PrepareError::Cancelled => PipelineError::Cancelled,
                other => PipelineError::failed(ErrorKind::PrepareFailed, other.to_string()),
            })?
        };
        self.track_cleanup(&job_id, descriptor.path.clone());

        if token.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        // --- Split ---------------------------------------------------------
        self.store
            .transition(&job_id, JobState::Transcribing, TransitionFields::default())
            .map_err(|e| PipelineError::failed(ErrorKind::Internal, e.to_string()))?;

        let chunks = {
            let split_descriptor = descriptor.clone();
            let chunk_opts = options.chunking.clone();
            let job_dir = self.config.job_dir(&job_id);
            let split_token = token.clone();

            tokio::task::spawn_blocking(move || {
                chunker::split(&split_descriptor, &chunk_opts, &job_dir, &split_token)
            })
            .await
            .map_err(|e| PipelineError::failed(ErrorKind::Internal, e.to_string()))?
            .map_err(|e| match e {
                chunker::ChunkError::Cancelled => PipelineError::Cancelled,
                other => PipelineError::failed(ErrorKind::SplitFailed, other.to_string()),
            })?
        };

        for chunk in &chunks {
            self.track_cleanup(&job_id, chunk.path.clone());
        }

        // --- Transcribe ----------------------------------------------------
        self.backend
            .load(&options.model_id)
            .await
            .map_err(|e| PipelineError::Failed(map_backend_error(&e)))?;

        let results = self
            .transcribe_chunks(&job_id, &options, device, chunks, token.clone())
            .await?;

        if token.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        // --- Merge + postprocess -------------------------------------------
        self.store
            .transition(&job_id, JobState::Merging, TransitionFields::default())
            .map_err(|e| PipelineError::failed(ErrorKind::Internal, e.to_string()))?;
        self.publish_progress(&job_id, 95, Phase::Merge, "merging chunk results");

        let mut transcript = chunker::merge(&results, options.chunking.overlap_seconds);

        transcript.text = self
            .postprocessor
            .apply(&transcript.text, &transcript.detected_language)
            .await;
        for segment in &mut transcript.segments {
            segment.text = postprocess::clean(&segment.text);
        }
        transcript.segments.retain(|s| !s.text.is_empty());

        if token.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        self.publish_progress(&job_id, 100, Phase::Merge, "transcript ready");
        Ok(transcript)
    }

    /// Transcribe chunks under the inner concurrency bound, in submission
    /// order, retrying transient faults. Completion order is free; results
    /// come back indexed.
    async fn transcribe_chunks(
        self: &Arc<Self>,
        job_id: &str,
        options: &Options,
        device: Device,
        chunks: Vec<AudioChunk>,
        token: CancellationToken,
    ) -> Result<Vec<(AudioChunk, ChunkResult)>, PipelineError> {
        let total = chunks.len();
        let inner_limit = if self.backend.describe().thread_safe {
            self.config.max_concurrent_chunks
        } else {
            1
        };

        let permits = Arc::new(Semaphore::new(inner_limit));
        let completed = Arc::new(AtomicUsize::new(0));
        // Child token lets a fatal chunk stop its siblings without marking
        // the whole job cancelled
        let chunk_token = token.child_token();

        let mut handles = Vec::with_capacity(total);

        for (index, chunk) in chunks.into_iter().enumerate() {
            let scheduler = self.clone();
            let job_id = job_id.to_string();
            let options = options.clone();
            let permits = permits.clone();
            let completed = completed.clone();
            let chunk_token = chunk_token.clone();

            handles.push(tokio::spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| PipelineError::Cancelled)?;

                if chunk_token.is_cancelled() {
                    return Err(PipelineError::Cancelled);
                }

                let result = scheduler
                    .transcribe_one_chunk(
                        &job_id,
                        &options,
                        device,
                        &chunk,
                        &chunk_token,
                        index,
                        completed.clone(),
                        total,
                    )
                    .await?;

                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                let percent = 50 + (45 * done / total) as u8;
                scheduler.publish_progress(
                    &job_id,
                    percent,
                    Phase::Transcribe,
                    &format!("chunk {}/{} transcribed", done, total),
                );

                Ok::<(usize, AudioChunk, ChunkResult), PipelineError>((index, chunk, result))
            }));
        }

        let mut indexed: Vec<Option<(AudioChunk, ChunkResult)>> =
            (0..total).map(|_| None).collect();
        let mut first_error: Option<PipelineError> = None;

        for handle in handles {
            match handle.await {
                Ok(Ok((index, chunk, result))) => {
                    indexed[index] = Some((chunk, result));
                }
                Ok(Err(e)) => {
                    // Stop submitting work for the remaining chunks
                    chunk_token.cancel();
                    let keep = match (&first_error, &e) {
                        // A real failure beats the cancellations it caused
                        (None, _) => true,
                        (Some(PipelineError::Cancelled), PipelineError::Failed(_)) => true,
                        _ => false,
                    };
                    if keep {
                        first_error = Some(e);
                    }
                }
                Err(join_error) => {
                    chunk_token.cancel();
                    if first_error.is_none() {
                        first_error = Some(PipelineError::failed(
                            ErrorKind::Internal,
                            join_error.to_string(),
                        ));
                    }
                }
            }
        }

        if token.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        if let Some(error) = first_error {
            return Err(error);
        }

        Ok(indexed.into_iter().flatten().collect())
    }

    /// One chunk with the retry policy: transient faults and OOM retry up to
    /// twice with exponential backoff; OOM additionally downgrades GPU to
    /// CPU before the retry.
    #[allow(clippy::too_many_arguments)]
    async fn transcribe_one_chunk(
        self: &Arc<Self>,
        job_id: &str,
        options: &Options,
        initial_device: Device,
        chunk: &AudioChunk,
        token: &CancellationToken,
        index: usize,
        completed: Arc<AtomicUsize>,
        total: usize,
    ) -> Result<ChunkResult, PipelineError> {
        let mut device = initial_device;
        let mut attempt: u32 = 0;

        loop {
            if token.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            // Sub-chunk backend progress refines the bar inside the 50-95
            // band; the store clamp keeps it monotone under reordering
            let progress_sink: Option<ProgressFn> = {
                let scheduler = self.clone();
                let sink_job = job_id.to_string();
                let completed = completed.clone();
                Some(Arc::new(move |fraction: f32| {
                    let done = completed.load(Ordering::SeqCst) as f32;
                    let percent =
                        50.0 + 45.0 * (done + fraction.clamp(0.0, 1.0)) / total as f32;
                    scheduler.publish_progress(
                        &sink_job,
                        percent as u8,
                        Phase::Transcribe,
                        "transcribing",
                    );
                }))
            };

            let request = TranscribeRequest {
                audio_path: chunk.path.clone(),
                language: options.language.clone(),
                want_word_timestamps: options.want_word_timestamps,
                temperature: options.temperature,
                device,
                progress_sink,
                cancel: token.clone(),
            };

            match self.backend.transcribe(request).await {
                Ok(result) => return Ok(result),
                Err(BackendError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                    if matches!(e, BackendError::OutOfMemory(_)) && device == Device::Gpu {
                        warn!(
                            "Job {} chunk {}: backend OOM, downgrading to CPU",
                            job_id, index
                        );
                        device = Device::Cpu;
                        let _ = self.store.set_effective_device(job_id, Device::Cpu);
                    }

                    let backoff = retry_backoff(attempt);
                    debug!(
                        "Job {} chunk {}: retryable backend error ({}), attempt {} in {:?}",
                        job_id,
                        index,
                        e,
                        attempt + 1,
                        backoff
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = token.cancelled() => return Err(PipelineError::Cancelled),
                    }
                    attempt += 1;
                }
                Err(e) => return Err(PipelineError::Failed(map_backend_error(&e))),
            }
        }
    }
}

/// Exponential backoff with jitter: base 2s, factor 2, jitter 0.5-1.0x,
/// capped at 30s
fn retry_backoff(attempt: u32) -> Duration {
    let exp = RETRY_BASE.as_secs_f64() * 2f64.powi(attempt as i32);
    let capped = exp.min(RETRY_CAP.as_secs_f64());
    let jitter = rand::thread_rng().gen_range(0.5..=1.0);
    Duration::from_secs_f64(capped * jitter)
}

fn map_probe_error(e: ProbeError) -> PipelineError {
    let kind = match &e {
        ProbeError::NotFound(_) => ErrorKind::NotFound,
        ProbeError::NotAFile(_) => ErrorKind::NotAFile,
        ProbeError::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
        ProbeError::ProbeUnavailable(_) => ErrorKind::Internal,
    };
    PipelineError::Failed(JobError::new(kind, e.to_string()))
}

fn map_backend_error(e: &BackendError) -> JobError {
    let kind = match e {
        BackendError::Transient(_) => ErrorKind::BackendTransient,
        BackendError::OutOfMemory(_) => ErrorKind::BackendOom,
        BackendError::Cancelled => ErrorKind::Cancelled,
        _ => ErrorKind::BackendFatal,
    };
    JobError::new(kind, e.to_string())
}
