//! Plumbing for the long-running pieces of pressyard: the HTTP listener,
//! the worker loop and the background tickers.
//!
//! Every service-level piece implements [`Task`]; the service spawns them
//! through [`spawn_task`] so they all share one shutdown signal, run
//! inside a span carrying their name, and report that name back when they
//! end. Fire-and-forget futures (pipe relays, reapers, tickers) go
//! through [`ChildTask`] instead.

use std::future::Future;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::Instrument as _;

/// Requests shutdown and waits for the tasks to drain.
#[derive(Debug)]
pub struct Shutdown(watch::Sender<()>);

impl Shutdown {
    pub fn new() -> (Self, ShutdownSignal) {
        let (sender, receiver) = watch::channel(());
        (Self(sender), ShutdownSignal(receiver))
    }

    /// Asks every task holding a signal to wind down.
    pub fn signal(&self) {
        let _ = self.0.send(());
    }

    /// Resolves once every [`ShutdownSignal`] clone is gone; dropping the
    /// signal is how a task acknowledges it is done.
    pub async fn drained(&self) {
        self.0.closed().await;
    }
}

#[derive(Clone, Debug)]
pub struct ShutdownSignal(watch::Receiver<()>);

impl ShutdownSignal {
    pub async fn wait(&mut self) {
        let _ = self.0.changed().await;
    }
}

#[async_trait]
pub trait Task {
    type Output: Send;

    const NAME: &'static str;

    async fn run(self, shutdown_signal: ShutdownSignal) -> Self::Output;
}

/// Handle on a spawned [`Task`]; aborts it when dropped.
pub struct TaskHandle<O> {
    name: &'static str,
    inner: JoinHandle<O>,
}

impl<O> TaskHandle<O> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Waits for the task and pairs the outcome with the task name, so
    /// whoever watches the fleet can say which task ended.
    pub async fn finished(mut self) -> (&'static str, Result<O, JoinError>) {
        let outcome = (&mut self.inner).await;
        (self.name, outcome)
    }
}

impl<O> Drop for TaskHandle<O> {
    fn drop(&mut self) {
        self.inner.abort();
    }
}

pub fn spawn_task<T>(task: T, shutdown_signal: ShutdownSignal) -> TaskHandle<T::Output>
where
    T: Task + Send + 'static,
    T::Output: 'static,
{
    let span = tracing::info_span!("task", name = T::NAME);

    let future = async move {
        tracing::debug!("Task started");
        let output = task.run(shutdown_signal).await;
        tracing::debug!("Task terminated");
        output
    }
    .instrument(span);

    TaskHandle {
        name: T::NAME,
        inner: tokio::spawn(future),
    }
}

/// Abort-on-drop handle for a background future nobody joins.
///
/// Tokio's own `JoinHandle` detaches on drop and would leave the future
/// running; this wrapper cancels it instead, unless it was explicitly
/// `detach`ed.
#[must_use]
pub struct ChildTask(JoinHandle<()>);

impl ChildTask {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self(tokio::spawn(future))
    }

    pub fn abort(&self) {
        self.0.abort();
    }

    /// Lets the future run to completion on its own.
    pub fn detach(self) {
        core::mem::forget(self);
    }
}

impl Drop for ChildTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}
