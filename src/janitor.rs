/// Janitor
///
/// Periodic housekeeping: evicts terminal job/batch records past their
/// retention window and sweeps stale files out of the engine's temp tree.
/// Files still owned by an active job are never touched.

use crate::progress::{ProgressBus, TelemetryEvent};
use crate::scheduler::Scheduler;
use crate::store::JobStore;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Periodic eviction of old records and stale temp files
pub struct Janitor {
    store: Arc<JobStore>,
    bus: Arc<ProgressBus>,
    scheduler: Arc<Scheduler>,

    /// Sweep period
    pub period: Duration,

    /// Terminal records older than this are evicted
    pub retention: Duration,

    /// Temp files with mtime older than this are removed
    pub cleanup_after: Duration,
}

impl Janitor {
    pub fn new(
        store: Arc<JobStore>,
        bus: Arc<ProgressBus>,
        scheduler: Arc<Scheduler>,
        period: Duration,
        retention: Duration,
        cleanup_after: Duration,
    ) -> Self {
        Self {
            store,
            bus,
            scheduler,
            period,
            retention,
            cleanup_after,
        }
    }

    /// Start the periodic task. It stops promptly when `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.period);
            // The immediate first tick would sweep an empty engine
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep();
                    }
                    _ = shutdown.cancelled() => {
                        debug!("Janitor stopping");
                        break;
                    }
                }
            }
        })
    }

    /// One full sweep: record eviction, then the temp tree. Returns the
    /// number of evicted records and removed files.
    pub fn sweep(&self) -> (usize, usize) {
        let evicted = self.evict_records();
        let swept = self.sweep_temp_files();

        if evicted > 0 {
            self.bus
                .publish_telemetry(TelemetryEvent::RecordsEvicted { count: evicted });
        }
        if swept > 0 {
            self.bus
                .publish_telemetry(TelemetryEvent::TempFilesSwept { count: swept });
        }

        (evicted, swept)
    }

    fn evict_records(&self) -> usize {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::hours(24));
        self.store.evict_older_than(cutoff)
    }

    fn sweep_temp_files(&self) -> usize {
        let jobs_root = self.scheduler.temp_root().join("jobs");
        if !jobs_root.exists() {
            return 0;
        }

        let protected = self.scheduler.active_cleanup_paths();
        let deadline = SystemTime::now() - self.cleanup_after;

        let mut removed = 0;
        Self::sweep_dir(&jobs_root, deadline, &protected, &mut removed);

        if removed > 0 {
            info!("Temp sweep removed {} stale files", removed);
        }
        removed
    }

    fn sweep_dir(
        dir: &Path,
        deadline: SystemTime,
        protected: &std::collections::HashSet<std::path::PathBuf>,
        removed: &mut usize,
    ) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Temp sweep cannot read {}: {}", dir.display(), e);
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();

            if path.is_dir() {
                Self::sweep_dir(&path, deadline, protected, removed);
                // Empty job directories go too; failure means not empty
                let _ = std::fs::remove_dir(&path);
                continue;
            }

            if protected.contains(&path) {
                continue;
            }

            let stale = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|mtime| mtime < deadline)
                .unwrap_or(false);

            if stale {
                match std::fs::remove_file(&path) {
                    Ok(()) => *removed += 1,
                    Err(e) => warn!("Temp sweep failed for {}: {}", path.display(), e),
                }
            }
        }
    }
}
