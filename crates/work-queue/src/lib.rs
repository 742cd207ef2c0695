//! Persistent, reservation-based work queue.
//!
//! A posted job is *pending* until a consumer `pick`s it, *reserved* while
//! the consumer works on it, and gone once the consumer calls `finish`. A
//! reservation older than the job's time-to-run budget is returned to
//! pending by a grooming pass, so a crashed consumer only delays a job, it
//! never loses it. Delivery is therefore at-least-once and consumers must
//! tolerate re-execution.

#[macro_use]
extern crate tracing;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod memory;
pub mod redis;

pub use self::memory::{MemoryQueue, MemoryQueueOptions};
pub use self::redis::{RedisQueue, RedisQueueOptions};

pub const DEFAULT_GROOM_INTERVAL: Duration = Duration::from_secs(1);

/// Job payloads, tagged so that both back-ends round-trip the concrete type
/// and consumers dispatch without out-of-band knowledge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobData {
    Render(RenderJob),
}

/// Ask a worker to render a blog and publish the output.
///
/// The auth cookie travels with the job: rendering runs asynchronously and
/// must re-authenticate to the identity and repository services as the user
/// who pushed. Never log it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderJob {
    pub username: String,
    pub repository: String,
    pub auth_cookie: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEntry {
    pub id: String,
    pub ttr: Duration,
    pub data: JobData,
}

#[derive(Debug, thiserror::Error)]
pub enum PostError {
    #[error("queue is full")]
    Full,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type DynQueue = Arc<dyn Queue>;

#[async_trait]
pub trait Queue: Send + Sync {
    /// Enqueues a pending job. Does not block.
    async fn post(&self, data: JobData, ttr: Duration) -> Result<(), PostError>;

    /// Waits up to `timeout` for a pending job; on success the job is moved
    /// to reserved and returned. `None` means the timeout elapsed.
    async fn pick(&self, timeout: Duration) -> anyhow::Result<Option<JobEntry>>;

    /// Releases a reservation. Absent jobs are not an error: the entry may
    /// have expired and been re-queued between pick and finish.
    async fn finish(&self, entry: &JobEntry) -> anyhow::Result<()>;
}

#[cfg(test)]
pub(crate) mod suite {
    //! Behaviour checks shared by both back-ends.

    use super::*;

    pub(crate) fn render_job(marker: &str) -> JobData {
        JobData::Render(RenderJob {
            username: "alice".to_owned(),
            repository: marker.to_owned(),
            auth_cookie: "opaque".to_owned(),
        })
    }

    pub(crate) async fn pick_on_empty_queue(queue: &dyn Queue) {
        let entry = queue
            .pick(Duration::from_millis(1))
            .await
            .expect("pick on an empty queue");
        assert!(entry.is_none(), "pick on an empty queue returned an entry");
    }

    pub(crate) async fn post_then_pick(queue: &dyn Queue) {
        let data = render_job("post-then-pick");
        let ttr = Duration::from_secs(3600);

        queue.post(data.clone(), ttr).await.expect("post");

        let entry = queue
            .pick(Duration::from_millis(1))
            .await
            .expect("pick")
            .expect("a posted job should be picked");

        assert_eq!(entry.data, data);
        assert_eq!(entry.ttr, ttr);

        queue.finish(&entry).await.expect("finish");
    }

    pub(crate) async fn pick_times_out(queue: &dyn Queue) {
        let before = std::time::Instant::now();

        let entry = queue.pick(Duration::from_millis(100)).await.expect("pick");
        assert!(entry.is_none());

        let elapsed = before.elapsed();
        assert!(elapsed >= Duration::from_millis(50), "pick returned too early");
        // The Redis back-end cannot wait less than a second.
        assert!(elapsed <= Duration::from_secs(5), "pick slept too long");
    }

    pub(crate) async fn expired_reservation_is_requeued(queue: &dyn Queue, settle: Duration) {
        let data = render_job("ttr");

        queue.post(data.clone(), Duration::from_millis(50)).await.expect("post");

        let entry = queue
            .pick(Duration::from_millis(1))
            .await
            .expect("pick")
            .expect("first pick");

        // Not finished: once the TTR expires, grooming must re-queue it.
        tokio::time::sleep(settle).await;

        let entry = queue
            .pick(Duration::from_millis(1))
            .await
            .expect("pick")
            .expect("second pick should see the expired job again");
        assert_eq!(entry.data, data);

        queue.finish(&entry).await.expect("finish");

        // Finished for real this time: the job must stay gone.
        tokio::time::sleep(settle).await;

        let entry = queue.pick(Duration::from_millis(1)).await.expect("pick");
        assert!(entry.is_none(), "finished job was re-queued");
    }

    pub(crate) async fn post_unblocks_running_pick(queue: DynQueue) {
        let data = render_job("post-unblocks-pick");

        let picker = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.pick(Duration::from_secs(5)).await }
        });

        // Give the picker some time to start waiting.
        tokio::time::sleep(Duration::from_millis(150)).await;

        queue.post(data.clone(), Duration::from_secs(1)).await.expect("post");

        let entry = tokio::time::timeout(Duration::from_secs(5), picker)
            .await
            .expect("timed out waiting for pick")
            .expect("picker task panicked")
            .expect("pick")
            .expect("pick returned no entry");

        assert_eq!(entry.data, data);

        queue.finish(&entry).await.expect("finish");
    }
}
