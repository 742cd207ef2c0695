//! The worker loop: reserve one job at a time, run it inside its TTR
//! budget, always release the reservation.
//!
//! Several worker processes may consume the same queue. A worker crashing
//! mid-job is not special-cased anywhere: the reservation expires and
//! grooming re-queues the job, so the pipeline has to be re-runnable and
//! is (see [`crate::render`]).

use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use pressyard_task::{ShutdownSignal, Task};
use work_queue::{DynQueue, JobData, JobEntry};

use crate::render::{RenderContext, render_blog};

pub const PICK_TIMEOUT: Duration = Duration::from_secs(1);

pub struct WorkerTask {
    pub queue: DynQueue,
    pub render_ctx: RenderContext,
}

#[async_trait]
impl Task for WorkerTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "worker";

    async fn run(self, shutdown_signal: ShutdownSignal) -> Self::Output {
        worker_task(self, shutdown_signal).await
    }
}

async fn worker_task(ctx: WorkerTask, mut shutdown_signal: ShutdownSignal) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&ctx.render_ctx.work_dir)
        .await
        .context("failed to create the work directory")?;

    loop {
        tokio::select! {
            () = shutdown_signal.wait() => break,
            picked = ctx.queue.pick(PICK_TIMEOUT) => match picked {
                Ok(Some(entry)) => consume_job(&ctx, entry).await,
                Ok(None) => {}
                Err(error) => {
                    warn!(error = format!("{error:#}"), "Failed to pick a job");
                    tokio::time::sleep(PICK_TIMEOUT).await;
                }
            },
        }
    }

    Ok(())
}

async fn consume_job(ctx: &WorkerTask, entry: JobEntry) {
    info!(job_id = %entry.id, "Handling job");

    // Start from a known-empty scratch directory, whatever the previous
    // attempt left behind.
    match clear_directory(&ctx.render_ctx.work_dir).await {
        Ok(()) => {
            let JobData::Render(job) = &entry.data;

            // The TTR is the cancellation deadline: past it the reservation
            // is fair game for grooming, so there is no point continuing.
            match tokio::time::timeout(entry.ttr, render_blog(&ctx.render_ctx, job)).await {
                Ok(Ok(())) => debug!(job_id = %entry.id, "Job done"),
                Ok(Err(error)) => warn!(job_id = %entry.id, error = format!("{error:#}"), "Job failed"),
                Err(_elapsed) => warn!(job_id = %entry.id, "Job ran past its TTR and was cancelled"),
            }
        }
        Err(error) => {
            warn!(job_id = %entry.id, error = format!("{error:#}"), "Failed to clear the work directory");
        }
    }

    // Success or not, the reservation is released here and only here;
    // retries come from TTR expiry alone.
    if let Err(error) = ctx.queue.finish(&entry).await {
        warn!(job_id = %entry.id, error = format!("{error:#}"), "Failed to finish job");
    }
}

async fn clear_directory(directory: &camino::Utf8Path) -> anyhow::Result<()> {
    let mut entries = tokio::fs::read_dir(directory)
        .await
        .context("failed to list the work directory")?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .context("failed to walk the work directory")?
    {
        let path = entry.path();
        let file_type = entry.file_type().await.context("failed to stat a work entry")?;

        let removed = if file_type.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };

        removed.with_context(|| format!("failed to delete {}", path.display()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clear_directory_removes_children_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = camino::Utf8Path::from_path(dir.path()).expect("utf-8 tempdir");

        std::fs::create_dir_all(root.join("blog/content")).expect("mkdir");
        std::fs::write(root.join("blog/content/post.md"), b"post").expect("write");
        std::fs::write(root.join("auth_cookie.txt"), b"cookie").expect("write");

        clear_directory(root).await.expect("clear");

        assert!(root.as_std_path().is_dir(), "the directory itself must survive");
        assert_eq!(
            std::fs::read_dir(root).expect("read_dir").count(),
            0,
            "all children must be gone"
        );
    }
}
