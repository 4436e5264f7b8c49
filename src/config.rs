/// Engine configuration
///
/// Runtime settings for the pipeline engine. Loaded from the environment by
/// the service binary; library callers construct it directly.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root of the engine-owned temp tree (jobs/<id>/ subdirectories)
    pub temp_root: PathBuf,

    /// Maximum job pipelines running in parallel
    pub max_concurrent_jobs: usize,

    /// Maximum chunks transcribed in parallel within one job
    pub max_concurrent_chunks: usize,

    /// Total wall-clock timeout per job (seconds)
    pub job_timeout_secs: u64,

    /// Retention for terminal job/batch records (hours)
    pub retention_hours: u64,

    /// Temp files older than this are swept (seconds)
    pub cleanup_after_secs: u64,

    /// Janitor sweep period (seconds)
    pub janitor_period_secs: u64,

    /// Progress subscriber queue depth before drop-oldest kicks in
    pub subscriber_queue_depth: usize,

    /// Idle subscriptions are closed after this window (seconds)
    pub idle_subscription_secs: u64,

    /// Inputs longer than this downgrade `use_gpu = auto` to CPU (seconds)
    pub gpu_max_duration_secs: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            temp_root: PathBuf::from("./temp"),
            max_concurrent_jobs: 3,
            max_concurrent_chunks: 1, // most backends serialize on GPU anyway
            job_timeout_secs: 3600,
            retention_hours: 24,
            cleanup_after_secs: 3600,
            janitor_period_secs: 3600,
            subscriber_queue_depth: 64,
            idle_subscription_secs: 300,
            gpu_max_duration_secs: 600.0,
        }
    }
}

impl EngineConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_jobs must be > 0".to_string(),
            ));
        }

        if self.max_concurrent_chunks == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_chunks must be > 0".to_string(),
            ));
        }

        if self.job_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "job_timeout_secs must be > 0".to_string(),
            ));
        }

        if self.subscriber_queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "subscriber_queue_depth must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            temp_root: std::env::var("PIPELINE_TEMP_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.temp_root),
            max_concurrent_jobs: env_parse("PIPELINE_MAX_JOBS", defaults.max_concurrent_jobs),
            max_concurrent_chunks: env_parse(
                "PIPELINE_MAX_CHUNKS",
                defaults.max_concurrent_chunks,
            ),
            job_timeout_secs: env_parse("PIPELINE_JOB_TIMEOUT_SECS", defaults.job_timeout_secs),
            retention_hours: env_parse("PIPELINE_RETENTION_HOURS", defaults.retention_hours),
            cleanup_after_secs: env_parse(
                "PIPELINE_CLEANUP_AFTER_SECS",
                defaults.cleanup_after_secs,
            ),
            janitor_period_secs: env_parse(
                "PIPELINE_JANITOR_PERIOD_SECS",
                defaults.janitor_period_secs,
            ),
            subscriber_queue_depth: env_parse(
                "PIPELINE_SUBSCRIBER_QUEUE_DEPTH",
                defaults.subscriber_queue_depth,
            ),
            idle_subscription_secs: env_parse(
                "PIPELINE_IDLE_SUBSCRIPTION_SECS",
                defaults.idle_subscription_secs,
            ),
            gpu_max_duration_secs: env_parse(
                "PIPELINE_GPU_MAX_DURATION_SECS",
                defaults.gpu_max_duration_secs,
            ),
        }
    }

    /// Directory owned by one job: `<temp_root>/jobs/<job_id>`
    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.temp_root.join("jobs").join(job_id)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_concurrent_chunks, 1);
        assert_eq!(config.job_timeout_secs, 3600);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = EngineConfig {
            max_concurrent_jobs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_job_dir_layout() {
        let config = EngineConfig {
            temp_root: PathBuf::from("/tmp/engine"),
            ..Default::default()
        };
        assert_eq!(
            config.job_dir("job_x"),
            PathBuf::from("/tmp/engine/jobs/job_x")
        );
    }
}
