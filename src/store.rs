/// In-memory job store
///
/// Process-local registry of jobs and batches. Every mutator is atomic with
/// respect to readers; readers always observe a consistent snapshot of a
/// record. Per-state index sets keep status-filtered listing cheap.

use crate::job::{
    generate_batch_id, generate_job_id, Batch, Device, Job, JobError, JobState, Options,
    Transcript,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Batch not found: {0}")]
    BatchNotFound(String),

    #[error("Invalid transition for {job_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        job_id: String,
        from: JobState,
        to: JobState,
    },
}

/// Optional fields written together with a state transition
#[derive(Debug, Default)]
pub struct TransitionFields {
    pub phase: Option<String>,
    pub transcript: Option<Transcript>,
    pub error: Option<JobError>,
    pub effective_device: Option<Device>,
}

/// Aggregate statistics over the store's lifetime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    /// Jobs currently held, per state
    pub counts_by_state: HashMap<String, usize>,

    /// Jobs currently held in non-terminal states
    pub active_jobs: usize,

    /// Jobs currently held
    pub total_jobs: usize,

    /// Terminal transitions seen since startup
    pub total_processed: u64,
    pub total_succeeded: u64,
    pub total_failed: u64,

    /// Transcript characters produced since startup
    pub total_characters: u64,

    /// Mean wall-clock seconds from start to terminal, over processed jobs
    pub average_processing_seconds: f64,
}

#[derive(Default)]
struct StatsAccum {
    total_processed: u64,
    total_succeeded: u64,
    total_failed: u64,
    total_characters: u64,
    total_processing_seconds: f64,
}

struct StoreInner {
    jobs: HashMap<String, Job>,
    batches: HashMap<String, Batch>,
    by_state: HashMap<JobState, HashSet<String>>,

    /// Submission order, for FIFO-stable listing
    order: Vec<String>,

    stats: StatsAccum,
}

/// In-memory registry of jobs and batches
pub struct JobStore {
    inner: RwLock<StoreInner>,
}

impl JobStore {
    pub fn new() -> Self {
        let mut by_state = HashMap::new();
        for state in JobState::all() {
            by_state.insert(state, HashSet::new());
        }

        Self {
            inner: RwLock::new(StoreInner {
                jobs: HashMap::new(),
                batches: HashMap::new(),
                by_state,
                order: Vec::new(),
                stats: StatsAccum::default(),
            }),
        }
    }

    /// Create a pending job and return its id
    pub fn create_job(&self, input_path: &str, options: Options) -> String {
        let job_id = generate_job_id();
        let job = Job::new(job_id.clone(), input_path.to_string(), options);

        let mut inner = self.inner.write();
        inner
            .by_state
            .get_mut(&JobState::Pending)
            .expect("state index")
            .insert(job_id.clone());
        inner.order.push(job_id.clone());
        inner.jobs.insert(job_id.clone(), job);

        debug!("Created job {}", job_id);
        job_id
    }

    /// Group existing jobs into a batch and return its id
    pub fn create_batch(&self, job_ids: Vec<String>) -> Result<String, StoreError> {
        let batch_id = generate_batch_id();

        let mut inner = self.inner.write();

        for job_id in &job_ids {
            if !inner.jobs.contains_key(job_id) {
                return Err(StoreError::JobNotFound(job_id.clone()));
            }
        }

        for job_id in &job_ids {
            if let Some(job) = inner.jobs.get_mut(job_id) {
                job.batch_id = Some(batch_id.clone());
            }
        }

        let batch = Batch::new(batch_id.clone(), job_ids);
        info!("Created batch {} with {} jobs", batch_id, batch.total);
        inner.batches.insert(batch_id.clone(), batch);

        Ok(batch_id)
    }

    /// Snapshot of one job
    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.inner.read().jobs.get(job_id).cloned()
    }

    /// Snapshot of one batch
    pub fn get_batch(&self, batch_id: &str) -> Option<Batch> {
        self.inner.read().batches.get(batch_id).cloned()
    }

    /// List jobs in submission order, optionally filtered by state
    pub fn list(&self, filter: Option<JobState>, limit: usize, offset: usize) -> Vec<Job> {
        let inner = self.inner.read();

        let selected: Vec<&String> = match filter {
            Some(state) => {
                let index = inner.by_state.get(&state).expect("state index");
                inner
                    .order
                    .iter()
                    .filter(|id| index.contains(*id))
                    .collect()
            }
            None => inner.order.iter().collect(),
        };

        selected
            .into_iter()
            .skip(offset)
            .take(limit)
            .filter_map(|id| inner.jobs.get(id).cloned())
            .collect()
    }

    /// Apply a state transition, enforcing the job state machine. Terminal
    /// transitions stamp `completed_at`, update batch counters and feed the
    /// lifetime statistics.
    pub fn transition(
        &self,
        job_id: &str,
        new_state: JobState,
        fields: TransitionFields,
    ) -> Result<Job, StoreError> {
        let mut inner = self.inner.write();

        let job = inner
            .jobs
            .get(job_id)
            .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;
        let old_state = job.state;

        if !old_state.can_transition_to(new_state) {
            return Err(StoreError::InvalidTransition {
                job_id: job_id.to_string(),
                from: old_state,
                to: new_state,
            });
        }

        let now = Utc::now();
        let job = inner.jobs.get_mut(job_id).expect("checked above");

        job.state = new_state;
        if let Some(phase) = fields.phase {
            job.phase = Some(phase);
        }
        if let Some(device) = fields.effective_device {
            job.effective_device = Some(device);
        }

        if old_state == JobState::Pending {
            job.started_at = Some(now);
        }

        let mut batch_update: Option<(String, JobState)> = None;

        if new_state.is_terminal() {
            job.completed_at = Some(now);
            if new_state == JobState::Completed {
                job.progress = 100;
            }
            job.transcript = if new_state == JobState::Completed {
                fields.transcript
            } else {
                None
            };
            job.error = if new_state == JobState::Failed {
                fields.error
            } else {
                None
            };

            if let Some(batch_id) = &job.batch_id {
                batch_update = Some((batch_id.clone(), new_state));
            }
        }

        let snapshot = job.clone();
        let started_at = job.started_at;

        // Maintain state indices
        let id_owned = job_id.to_string();
        inner
            .by_state
            .get_mut(&old_state)
            .expect("state index")
            .remove(&id_owned);
        inner
            .by_state
            .get_mut(&new_state)
            .expect("state index")
            .insert(id_owned);

        if new_state.is_terminal() {
            let elapsed = started_at
                .map(|s| (now - s).num_milliseconds() as f64 / 1000.0)
                .unwrap_or(0.0);

            inner.stats.total_processed += 1;
            inner.stats.total_processing_seconds += elapsed.max(0.0);

            match new_state {
                JobState::Completed => {
                    inner.stats.total_succeeded += 1;
                    if let Some(t) = &snapshot.transcript {
                        inner.stats.total_characters += t.text.chars().count() as u64;
                    }
                }
                _ => inner.stats.total_failed += 1,
            }

            if let Some((batch_id, state)) = batch_update {
                if let Some(batch) = inner.batches.get_mut(&batch_id) {
                    batch.pending = batch.pending.saturating_sub(1);
                    match state {
                        JobState::Completed => batch.completed += 1,
                        // Cancelled jobs count as failed in batch accounting
                        _ => batch.failed += 1,
                    }
                }
            }
        }

        debug!("Job {}: {:?} -> {:?}", job_id, old_state, new_state);
        Ok(snapshot)
    }

    /// Raise a job's progress. Values below the current progress and updates
    /// to terminal jobs are ignored.
    pub fn increment_progress(
        &self,
        job_id: &str,
        percent: u8,
        phase: &str,
    ) -> Result<u8, StoreError> {
        let mut inner = self.inner.write();

        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;

        if job.state.is_terminal() {
            return Ok(job.progress);
        }

        let clamped = percent.min(100);
        if clamped > job.progress {
            job.progress = clamped;
        }
        job.phase = Some(phase.to_string());

        Ok(job.progress)
    }

    /// Record the device the backend actually ran on
    pub fn set_effective_device(&self, job_id: &str, device: Device) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;

        if !job.state.is_terminal() {
            job.effective_device = Some(device);
        }
        Ok(())
    }

    /// Lifetime statistics plus a per-state census of live records
    pub fn snapshot_stats(&self) -> StoreStats {
        let inner = self.inner.read();

        let mut counts_by_state = HashMap::new();
        let mut active = 0;
        for state in JobState::all() {
            let count = inner.by_state.get(&state).map(|s| s.len()).unwrap_or(0);
            counts_by_state.insert(state.as_str().to_string(), count);
            if !state.is_terminal() {
                active += count;
            }
        }

        let average = if inner.stats.total_processed > 0 {
            inner.stats.total_processing_seconds / inner.stats.total_processed as f64
        } else {
            0.0
        };

        StoreStats {
            counts_by_state,
            active_jobs: active,
            total_jobs: inner.jobs.len(),
            total_processed: inner.stats.total_processed,
            total_succeeded: inner.stats.total_succeeded,
            total_failed: inner.stats.total_failed,
            total_characters: inner.stats.total_characters,
            average_processing_seconds: average,
        }
    }

    /// Remove terminal jobs (and emptied batches) completed before `cutoff`.
    /// Returns how many records were evicted.
    pub fn evict_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut inner = self.inner.write();

        let stale: Vec<String> = inner
            .jobs
            .values()
            .filter(|j| {
                j.state.is_terminal()
                    && j.completed_at.map(|c| c < cutoff).unwrap_or(false)
            })
            .map(|j| j.job_id.clone())
            .collect();

        let mut evicted = stale.len();

        for job_id in &stale {
            if let Some(job) = inner.jobs.remove(job_id) {
                inner
                    .by_state
                    .get_mut(&job.state)
                    .expect("state index")
                    .remove(job_id);
            }
            inner.order.retain(|id| id != job_id);
        }

        // Drop batches whose jobs are all gone and that are old enough
        let stale_batches: Vec<String> = {
            let jobs = &inner.jobs;
            inner
                .batches
                .values()
                .filter(|b| {
                    b.created_at < cutoff && b.job_ids.iter().all(|id| !jobs.contains_key(id))
                })
                .map(|b| b.batch_id.clone())
                .collect()
        };

        for batch_id in &stale_batches {
            inner.batches.remove(batch_id);
            evicted += 1;
        }

        if evicted > 0 {
            info!("Evicted {} old records", evicted);
        }

        evicted
    }

    /// Ids of all jobs in a batch
    pub fn batch_job_ids(&self, batch_id: &str) -> Result<Vec<String>, StoreError> {
        self.inner
            .read()
            .batches
            .get(batch_id)
            .map(|b| b.job_ids.clone())
            .ok_or_else(|| StoreError::BatchNotFound(batch_id.to_string()))
    }
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ErrorKind;

    fn store_with_job() -> (JobStore, String) {
        let store = JobStore::new();
        let job_id = store.create_job("/data/in.mp4", Options::default());
        (store, job_id)
    }

    fn completed_transcript() -> Transcript {
        Transcript {
            text: "hello".to_string(),
            detected_language: "en".to_string(),
            confidence: 0.9,
            segments: vec![],
            processing_seconds: 1.0,
            model_id: "m".to_string(),
        }
    }

    fn run_to_completion(store: &JobStore, job_id: &str) {
        store
            .transition(job_id, JobState::Preparing, TransitionFields::default())
            .unwrap();
        store
            .transition(job_id, JobState::Transcribing, TransitionFields::default())
            .unwrap();
        store
            .transition(job_id, JobState::Merging, TransitionFields::default())
            .unwrap();
        store
            .transition(
                job_id,
                JobState::Completed,
                TransitionFields {
                    transcript: Some(completed_transcript()),
                    ..Default::default()
                },
            )
            .unwrap();
    }

    #[test]
    fn test_create_and_get() {
        let (store, job_id) = store_with_job();

        let job = store.get(&job_id).unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.progress, 0);
        assert!(job.started_at.is_none());
    }

    #[test]
    fn test_transition_sets_timestamps() {
        let (store, job_id) = store_with_job();

        run_to_completion(&store, &job_id);

        let job = store.get(&job_id).unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_some());
        assert!(job.transcript.is_some());
        assert_eq!(job.progress, 100);
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let (store, job_id) = store_with_job();

        let result = store.transition(&job_id, JobState::Merging, TransitionFields::default());
        assert!(matches!(result, Err(StoreError::InvalidTransition { .. })));
    }

    #[test]
    fn test_terminal_state_is_immutable() {
        let (store, job_id) = store_with_job();
        run_to_completion(&store, &job_id);

        for state in JobState::all() {
            let result = store.transition(&job_id, state, TransitionFields::default());
            assert!(result.is_err());
        }

        // Progress updates after terminal are ignored, not errors
        let progress = store.increment_progress(&job_id, 50, "late").unwrap();
        assert_eq!(progress, 100);
    }

    #[test]
    fn test_progress_is_monotone() {
        let (store, job_id) = store_with_job();

        store.increment_progress(&job_id, 40, "prepare").unwrap();
        let p = store.increment_progress(&job_id, 20, "prepare").unwrap();
        assert_eq!(p, 40);

        let p = store.increment_progress(&job_id, 90, "transcribe").unwrap();
        assert_eq!(p, 90);
    }

    #[test]
    fn test_failed_job_has_no_transcript() {
        let (store, job_id) = store_with_job();

        store
            .transition(&job_id, JobState::Preparing, TransitionFields::default())
            .unwrap();
        store
            .transition(
                &job_id,
                JobState::Failed,
                TransitionFields {
                    error: Some(JobError::new(ErrorKind::PrepareFailed, "decode error")),
                    transcript: Some(completed_transcript()),
                    ..Default::default()
                },
            )
            .unwrap();

        let job = store.get(&job_id).unwrap();
        assert!(job.transcript.is_none());
        assert_eq!(job.error.unwrap().kind, ErrorKind::PrepareFailed);
    }

    #[test]
    fn test_list_filtered_by_state() {
        let store = JobStore::new();
        let a = store.create_job("/a.mp4", Options::default());
        let _b = store.create_job("/b.mp4", Options::default());

        store
            .transition(&a, JobState::Preparing, TransitionFields::default())
            .unwrap();

        let pending = store.list(Some(JobState::Pending), 10, 0);
        assert_eq!(pending.len(), 1);

        let preparing = store.list(Some(JobState::Preparing), 10, 0);
        assert_eq!(preparing.len(), 1);
        assert_eq!(preparing[0].job_id, a);

        let all = store.list(None, 10, 0);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_list_pagination() {
        let store = JobStore::new();
        for i in 0..5 {
            store.create_job(&format!("/{}.mp4", i), Options::default());
        }

        let page = store.list(None, 2, 2);
        assert_eq!(page.len(), 2);
        assert!(page[0].input_path.contains('2'));
    }

    #[test]
    fn test_batch_counters_stay_consistent() {
        let store = JobStore::new();
        let ids: Vec<String> = (0..3)
            .map(|i| store.create_job(&format!("/{}.mp4", i), Options::default()))
            .collect();
        let batch_id = store.create_batch(ids.clone()).unwrap();

        let check = |store: &JobStore| {
            let b = store.get_batch(&batch_id).unwrap();
            assert_eq!(b.pending + b.completed + b.failed, b.total);
        };

        check(&store);

        run_to_completion(&store, &ids[0]);
        check(&store);

        store
            .transition(&ids[1], JobState::Preparing, TransitionFields::default())
            .unwrap();
        store
            .transition(
                &ids[1],
                JobState::Failed,
                TransitionFields {
                    error: Some(JobError::new(ErrorKind::UnsupportedFormat, "bad")),
                    ..Default::default()
                },
            )
            .unwrap();
        check(&store);

        store
            .transition(&ids[2], JobState::Cancelled, TransitionFields::default())
            .unwrap();
        check(&store);

        let batch = store.get_batch(&batch_id).unwrap();
        assert_eq!(batch.completed, 1);
        assert_eq!(batch.failed, 2);
        assert_eq!(batch.pending, 0);
    }

    #[test]
    fn test_stats_accumulate() {
        let (store, job_id) = store_with_job();
        run_to_completion(&store, &job_id);

        let stats = store.snapshot_stats();
        assert_eq!(stats.total_processed, 1);
        assert_eq!(stats.total_succeeded, 1);
        assert_eq!(stats.total_failed, 0);
        assert_eq!(stats.total_characters, 5);
        assert_eq!(stats.active_jobs, 0);
    }

    #[test]
    fn test_eviction_removes_only_old_terminal_jobs() {
        let store = JobStore::new();
        let done = store.create_job("/done.mp4", Options::default());
        let live = store.create_job("/live.mp4", Options::default());
        run_to_completion(&store, &done);

        // Cutoff in the future: the completed job is "old enough"
        let evicted = store.evict_older_than(Utc::now() + chrono::Duration::hours(1));
        assert_eq!(evicted, 1);

        assert!(store.get(&done).is_none());
        assert!(store.get(&live).is_some());
    }

    #[test]
    fn test_eviction_keeps_recent_jobs() {
        let store = JobStore::new();
        let done = store.create_job("/done.mp4", Options::default());
        run_to_completion(&store, &done);

        let evicted = store.evict_older_than(Utc::now() - chrono::Duration::hours(24));
        assert_eq!(evicted, 0);
        assert!(store.get(&done).is_some());
    }
}
