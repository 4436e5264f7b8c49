/// Transcription service binary
///
/// Batch front-end over the pipeline engine: submits the given media files,
/// streams progress to the log and prints each transcript when done.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use transcription_pipeline::{
    ChunkingOptions, EngineConfig, GpuMode, Janitor, JobState, JobStore, Options, Postprocessor,
    ProgressBus, ProgressEventBody, Scheduler, SpeechBackend,
};

#[derive(Parser, Debug)]
#[command(name = "transcription-service", version, about = "Batch video/audio transcription")]
struct Args {
    /// Media files to transcribe
    #[arg(required = true)]
    inputs: Vec<String>,

    /// Backend model id
    #[arg(long, default_value = "sensevoice-small")]
    model: String,

    /// Language tag, or "auto"
    #[arg(long, default_value = "auto")]
    language: String,

    /// Include per-segment timestamps in the JSON output
    #[arg(long)]
    timestamps: bool,

    /// Sampling temperature (0.0 - 1.0)
    #[arg(long, default_value_t = 0.0)]
    temperature: f32,

    /// GPU usage: on, off or auto
    #[arg(long, default_value = "auto")]
    gpu: String,

    /// Disable chunking of long inputs
    #[arg(long)]
    no_chunking: bool,

    /// Print transcripts as JSON instead of plain text
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("transcription_pipeline=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let use_gpu = match args.gpu.as_str() {
        "on" => GpuMode::On,
        "off" => GpuMode::Off,
        "auto" => GpuMode::Auto,
        other => bail!("invalid --gpu value: {}", other),
    };

    let options = Options {
        model_id: args.model.clone(),
        language: args.language.clone(),
        want_word_timestamps: args.timestamps,
        temperature: args.temperature,
        use_gpu,
        chunking: ChunkingOptions {
            enabled: !args.no_chunking,
            ..Default::default()
        },
    };

    let config = EngineConfig::from_env();
    config.validate().context("invalid configuration")?;

    info!("Starting transcription service (model {})", args.model);

    let store = Arc::new(JobStore::new());
    let bus = Arc::new(ProgressBus::new(
        config.subscriber_queue_depth,
        Duration::from_secs(config.idle_subscription_secs),
    ));
    let backend = build_backend(&args.model);
    let postprocessor = Arc::new(Postprocessor::new());

    let scheduler = Scheduler::new(
        config.clone(),
        store.clone(),
        bus.clone(),
        backend,
        postprocessor,
    );

    let janitor_shutdown = CancellationToken::new();
    let janitor_handle = Janitor::new(
        store,
        bus,
        scheduler.clone(),
        Duration::from_secs(config.janitor_period_secs),
        Duration::from_secs(config.retention_hours * 3600),
        Duration::from_secs(config.cleanup_after_secs),
    )
    .spawn(janitor_shutdown.clone());

    let inputs: Vec<(String, Options)> = args
        .inputs
        .iter()
        .map(|path| (path.clone(), options.clone()))
        .collect();

    let (batch_id, job_ids) = scheduler
        .submit_batch(inputs)
        .context("batch submission failed")?;
    info!("Submitted batch {} ({} jobs)", batch_id, job_ids.len());

    // Stream progress for every job until its terminal event
    let mut waiters = Vec::new();
    for job_id in &job_ids {
        let mut subscription = scheduler.subscribe(job_id)?;
        let job_id = job_id.clone();
        waiters.push(tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                match event.body {
                    ProgressEventBody::Progress { percent, phase, .. } => {
                        info!("{}: {}% ({})", job_id, percent, phase.as_str());
                    }
                    ProgressEventBody::Result { .. } => {
                        info!("{}: completed", job_id);
                    }
                    ProgressEventBody::Error { kind, message } => {
                        error!("{}: {:?} {}", job_id, kind, message);
                    }
                    ProgressEventBody::Heartbeat => {}
                }
            }
        }));
    }

    for waiter in waiters {
        let _ = waiter.await;
    }

    let mut failures = 0;
    for job_id in &job_ids {
        let job = scheduler
            .get_job(job_id)
            .context("job record disappeared")?;

        match (job.state, job.transcript) {
            (JobState::Completed, Some(transcript)) => {
                if args.json {
                    println!("{}", serde_json::to_string_pretty(&transcript)?);
                } else {
                    println!("# {}\n{}\n", job.input_path, transcript.text);
                }
            }
            _ => {
                failures += 1;
                if let Some(e) = job.error {
                    eprintln!("{}: {:?} {}", job.input_path, e.kind, e.message);
                }
            }
        }
    }

    janitor_shutdown.cancel();
    let _ = janitor_handle.await;
    scheduler.shutdown(Duration::from_secs(5)).await;

    if failures > 0 {
        bail!("{} of {} jobs failed", failures, job_ids.len());
    }
    Ok(())
}

/// The inference engine is feature-selected; without one the mock backend
/// stands in so the pipeline stays exercisable end to end.
fn build_backend(model_id: &str) -> Arc<dyn SpeechBackend> {
    #[cfg(feature = "whisper")]
    {
        use transcription_pipeline::{WhisperBackend, WhisperBackendConfig};
        let _ = model_id;
        return Arc::new(WhisperBackend::new(WhisperBackendConfig::default()));
    }

    #[cfg(not(feature = "whisper"))]
    {
        use transcription_pipeline::MockBackend;
        tracing::warn!("No inference feature enabled, using mock backend");
        Arc::new(MockBackend::new(model_id))
    }
}
