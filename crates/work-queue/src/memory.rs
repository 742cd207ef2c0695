//! In-process back-end: a bounded channel of pending jobs plus a reservation
//! map groomed on a timer.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use pressyard_task::ChildTask;
use tokio::sync::mpsc;

use crate::{DEFAULT_GROOM_INTERVAL, JobData, JobEntry, PostError, Queue};

pub const MAX_PENDING_JOBS: usize = 1000;

struct Reservation {
    entry: JobEntry,
    started: Instant,
}

type ReservationMap = Mutex<HashMap<String, Reservation>>;

#[derive(typed_builder::TypedBuilder)]
pub struct MemoryQueueOptions {
    #[builder(default = DEFAULT_GROOM_INTERVAL)]
    groom_interval: Duration,
}

pub struct MemoryQueue {
    next_id: AtomicU64,
    pending_tx: mpsc::Sender<JobEntry>,
    pending_rx: tokio::sync::Mutex<mpsc::Receiver<JobEntry>>,
    reservations: Arc<ReservationMap>,
    _groomer: ChildTask,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::with_options(MemoryQueueOptions::builder().build())
    }

    pub fn with_options(options: MemoryQueueOptions) -> Self {
        let (pending_tx, pending_rx) = mpsc::channel(MAX_PENDING_JOBS);
        let reservations: Arc<ReservationMap> = Arc::new(Mutex::new(HashMap::new()));

        let groomer = ChildTask::spawn({
            let reservations = Arc::clone(&reservations);
            let pending_tx = pending_tx.clone();

            async move {
                let mut interval = tokio::time::interval(options.groom_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

                loop {
                    interval.tick().await;
                    groom(&reservations, &pending_tx).await;
                }
            }
        });

        Self {
            next_id: AtomicU64::new(0),
            pending_tx,
            pending_rx: tokio::sync::Mutex::new(pending_rx),
            reservations,
            _groomer: groomer,
        }
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

async fn groom(reservations: &ReservationMap, pending_tx: &mpsc::Sender<JobEntry>) {
    let now = Instant::now();

    let expired: Vec<JobEntry> = {
        let mut reservations = reservations.lock();

        let expired_ids: Vec<String> = reservations
            .iter()
            .filter(|(_, r)| now > r.started + r.entry.ttr)
            .map(|(id, _)| id.clone())
            .collect();

        expired_ids
            .into_iter()
            .filter_map(|id| reservations.remove(&id))
            .map(|r| r.entry)
            .collect()
    };

    for entry in expired {
        debug!(job_id = %entry.id, "Reservation expired, back to pending");

        // Blocks when pending is full; grooming is out of the pick hot path.
        if pending_tx.send(entry).await.is_err() {
            break;
        }
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn post(&self, data: JobData, ttr: Duration) -> Result<(), PostError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;

        let entry = JobEntry {
            id: id.to_string(),
            ttr,
            data,
        };

        match self.pending_tx.try_send(entry) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(PostError::Full),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(PostError::Other(anyhow::anyhow!("queue is shut down")))
            }
        }
    }

    async fn pick(&self, timeout: Duration) -> anyhow::Result<Option<JobEntry>> {
        let mut pending_rx = self.pending_rx.lock().await;

        match tokio::time::timeout(timeout, pending_rx.recv()).await {
            Err(_elapsed) => Ok(None),
            Ok(None) => anyhow::bail!("queue is shut down"),
            Ok(Some(entry)) => {
                self.reservations.lock().insert(
                    entry.id.clone(),
                    Reservation {
                        entry: entry.clone(),
                        started: Instant::now(),
                    },
                );

                Ok(Some(entry))
            }
        }
    }

    async fn finish(&self, entry: &JobEntry) -> anyhow::Result<()> {
        self.reservations.lock().remove(&entry.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suite;

    fn fast_queue() -> MemoryQueue {
        MemoryQueue::with_options(
            MemoryQueueOptions::builder()
                .groom_interval(Duration::from_millis(25))
                .build(),
        )
    }

    #[tokio::test]
    async fn pick_on_empty_queue() {
        suite::pick_on_empty_queue(&fast_queue()).await;
    }

    #[tokio::test]
    async fn post_then_pick() {
        suite::post_then_pick(&fast_queue()).await;
    }

    #[tokio::test]
    async fn pick_times_out() {
        suite::pick_times_out(&fast_queue()).await;
    }

    #[tokio::test]
    async fn expired_reservation_is_requeued() {
        suite::expired_reservation_is_requeued(&fast_queue(), Duration::from_millis(150)).await;
    }

    #[tokio::test]
    async fn post_unblocks_running_pick() {
        suite::post_unblocks_running_pick(Arc::new(fast_queue())).await;
    }

    #[tokio::test]
    async fn post_on_full_queue_fails_fast() {
        let queue = fast_queue();

        for i in 0..MAX_PENDING_JOBS {
            queue
                .post(suite::render_job(&format!("job-{i}")), Duration::from_secs(1))
                .await
                .expect("post within capacity");
        }

        let overflow = queue
            .post(suite::render_job("overflow"), Duration::from_secs(1))
            .await;

        assert!(matches!(overflow, Err(PostError::Full)));
    }

    #[tokio::test]
    async fn finish_is_idempotent_against_absent_jobs() {
        let queue = fast_queue();

        queue
            .post(suite::render_job("gone"), Duration::from_secs(1))
            .await
            .expect("post");

        let entry = queue
            .pick(Duration::from_millis(1))
            .await
            .expect("pick")
            .expect("entry");

        queue.finish(&entry).await.expect("first finish");
        queue.finish(&entry).await.expect("second finish");
    }
}
