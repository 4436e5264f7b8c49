/// Progress bus
///
/// Fans out per-job progress events to subscribers. Each subscriber owns a
/// bounded queue; when it falls behind, the oldest queued event is dropped
/// and its loss counter incremented, so a slow consumer never blocks the
/// scheduler. A terminal Result/Error event is never dropped and releases
/// the subscription.

use crate::job::{ProgressEvent, ProgressEventBody};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, trace};

/// Default bound of one subscriber queue
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// Default idle window after which a silent subscription closes
pub const DEFAULT_IDLE_WINDOW: Duration = Duration::from_secs(300);

/// Telemetry published on the global broadcast channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    RecordsEvicted { count: usize },
    TempFilesSwept { count: usize },
}

struct QueueState {
    events: VecDeque<ProgressEvent>,
    closed: bool,
}

struct SubscriberQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,

    /// Events dropped because this subscriber fell behind
    losses: AtomicU64,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                events: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
            losses: AtomicU64::new(0),
        }
    }

    fn push(&self, event: ProgressEvent) {
        let terminal = event.body.is_terminal();
        let mut state = self.state.lock();

        if state.closed {
            return;
        }

        if state.events.len() >= self.capacity {
            // Drop the oldest; terminal events always get their slot
            state.events.pop_front();
            self.losses.fetch_add(1, Ordering::Relaxed);
            trace!("Subscriber queue full, dropped oldest event");
        }

        state.events.push_back(event);
        if terminal {
            state.closed = true;
        }

        drop(state);
        self.notify.notify_one();
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }
}

/// Receiving side of one job subscription
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
    idle_window: Duration,
}

impl Subscription {
    /// Next event, in per-job sequence order. Returns `None` once the job has
    /// terminated and the queue is drained, or after the idle window elapses
    /// with no event.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        loop {
            {
                let mut state = self.queue.state.lock();
                if let Some(event) = state.events.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }

            let notified = self.queue.notify.notified();
            if tokio::time::timeout(self.idle_window, notified).await.is_err() {
                debug!("Subscription idle for {:?}, closing", self.idle_window);
                return None;
            }
        }
    }

    /// Events dropped so far because this subscriber fell behind
    pub fn heartbeat_losses(&self) -> u64 {
        self.queue.losses.load(Ordering::Relaxed)
    }
}

struct JobChannel {
    next_seq: u64,
    subscribers: Vec<Weak<SubscriberQueue>>,
}

/// Per-job fan-out of progress events plus a global telemetry channel
pub struct ProgressBus {
    jobs: Mutex<HashMap<String, JobChannel>>,
    queue_depth: usize,
    idle_window: Duration,
    telemetry: broadcast::Sender<TelemetryEvent>,
}

impl ProgressBus {
    pub fn new(queue_depth: usize, idle_window: Duration) -> Self {
        let (telemetry, _) = broadcast::channel(64);
        Self {
            jobs: Mutex::new(HashMap::new()),
            queue_depth,
            idle_window,
            telemetry,
        }
    }

    /// Subscribe to one job's events. Dropping the returned subscription
    /// silently removes it.
    pub fn subscribe(&self, job_id: &str) -> Subscription {
        let queue = Arc::new(SubscriberQueue::new(self.queue_depth));

        let mut jobs = self.jobs.lock();
        let channel = jobs.entry(job_id.to_string()).or_insert_with(|| JobChannel {
            next_seq: 0,
            subscribers: Vec::new(),
        });
        channel.subscribers.push(Arc::downgrade(&queue));

        Subscription {
            queue,
            idle_window: self.idle_window,
        }
    }

    /// Publish an event for a job. Assigns the per-job sequence number and
    /// fans out without blocking. A terminal event closes the job's channel.
    pub fn publish(&self, job_id: &str, body: ProgressEventBody) {
        let terminal = body.is_terminal();

        let mut jobs = self.jobs.lock();
        let channel = jobs.entry(job_id.to_string()).or_insert_with(|| JobChannel {
            next_seq: 0,
            subscribers: Vec::new(),
        });

        let event = ProgressEvent {
            job_id: job_id.to_string(),
            seq: channel.next_seq,
            body,
        };
        channel.next_seq += 1;

        channel.subscribers.retain(|weak| match weak.upgrade() {
            Some(queue) => {
                queue.push(event.clone());
                true
            }
            None => false,
        });

        if terminal {
            // Subscriptions drain what is queued, then observe closure
            if let Some(channel) = jobs.remove(job_id) {
                for weak in channel.subscribers {
                    if let Some(queue) = weak.upgrade() {
                        queue.close();
                    }
                }
            }
        }
    }

    /// Live subscriber count for a job
    pub fn subscriber_count(&self, job_id: &str) -> usize {
        self.jobs
            .lock()
            .get(job_id)
            .map(|c| c.subscribers.iter().filter(|w| w.strong_count() > 0).count())
            .unwrap_or(0)
    }

    /// Broadcast a telemetry event (janitor sweeps and the like)
    pub fn publish_telemetry(&self, event: TelemetryEvent) {
        // No receivers is fine
        let _ = self.telemetry.send(event);
    }

    /// Subscribe to the global telemetry channel
    pub fn subscribe_telemetry(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.telemetry.subscribe()
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_DEPTH, DEFAULT_IDLE_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ErrorKind, Phase, Transcript};

    fn progress(percent: u8) -> ProgressEventBody {
        ProgressEventBody::Progress {
            percent,
            phase: Phase::Transcribe,
            message: format!("{}%", percent),
        }
    }

    fn terminal_result() -> ProgressEventBody {
        ProgressEventBody::Result {
            transcript: Transcript {
                text: "done".to_string(),
                detected_language: "en".to_string(),
                confidence: 0.9,
                segments: vec![],
                processing_seconds: 1.0,
                model_id: "m".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_events_delivered_in_sequence_order() {
        let bus = ProgressBus::default();
        let mut sub = bus.subscribe("job_a");

        for p in [10, 20, 30] {
            bus.publish("job_a", progress(p));
        }
        bus.publish("job_a", terminal_result());

        let mut seqs = Vec::new();
        while let Some(event) = sub.recv().await {
            seqs.push(event.seq);
        }

        assert_eq!(seqs, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_subscription_closes_after_terminal() {
        let bus = ProgressBus::default();
        let mut sub = bus.subscribe("job_a");

        bus.publish("job_a", terminal_result());

        assert!(matches!(
            sub.recv().await.map(|e| e.body),
            Some(ProgressEventBody::Result { .. })
        ));
        assert!(sub.recv().await.is_none());
        assert_eq!(bus.subscriber_count("job_a"), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let bus = ProgressBus::new(4, DEFAULT_IDLE_WINDOW);
        let mut sub = bus.subscribe("job_a");

        for p in 0..100u8 {
            bus.publish("job_a", progress(p));
        }
        bus.publish("job_a", terminal_result());

        assert!(sub.heartbeat_losses() > 0);

        let mut received = Vec::new();
        while let Some(event) = sub.recv().await {
            received.push(event);
        }

        // Bounded queue, survivors in order, terminal event delivered last
        assert!(received.len() <= 4);
        for pair in received.windows(2) {
            assert!(pair[0].seq < pair[1].seq);
        }
        assert!(received.last().unwrap().body.is_terminal());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_block() {
        let bus = ProgressBus::default();
        for p in 0..100u8 {
            bus.publish("job_lonely", progress(p));
        }
        bus.publish("job_lonely", terminal_result());
    }

    #[tokio::test]
    async fn test_dropped_subscriber_removed_silently() {
        let bus = ProgressBus::default();
        let sub = bus.subscribe("job_a");
        assert_eq!(bus.subscriber_count("job_a"), 1);

        drop(sub);
        bus.publish("job_a", progress(10));
        assert_eq!(bus.subscriber_count("job_a"), 0);
    }

    #[tokio::test]
    async fn test_independent_jobs_have_independent_sequences() {
        let bus = ProgressBus::default();
        let mut sub_a = bus.subscribe("job_a");
        let mut sub_b = bus.subscribe("job_b");

        bus.publish("job_a", progress(10));
        bus.publish("job_b", progress(50));

        assert_eq!(sub_a.recv().await.unwrap().seq, 0);
        assert_eq!(sub_b.recv().await.unwrap().seq, 0);
    }

    #[tokio::test]
    async fn test_idle_subscription_times_out() {
        let bus = ProgressBus::new(4, Duration::from_millis(20));
        let mut sub = bus.subscribe("job_quiet");

        let received = sub.recv().await;
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn test_error_event_closes_subscription() {
        let bus = ProgressBus::default();
        let mut sub = bus.subscribe("job_a");

        bus.publish(
            "job_a",
            ProgressEventBody::Error {
                kind: ErrorKind::Cancelled,
                message: "cancelled".to_string(),
            },
        );

        let event = sub.recv().await.unwrap();
        assert!(event.body.is_terminal());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_telemetry_broadcast() {
        let bus = ProgressBus::default();
        let mut rx = bus.subscribe_telemetry();

        bus.publish_telemetry(TelemetryEvent::TempFilesSwept { count: 3 });

        match rx.recv().await.unwrap() {
            TelemetryEvent::TempFilesSwept { count } => assert_eq!(count, 3),
            other => panic!("unexpected telemetry {:?}", other),
        }
    }
}
