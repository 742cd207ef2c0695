//! Lease lock over a shared Redis instance.
//!
//! Among N clients refreshing the same lease name, at most one holds the
//! lease at any instant. The holder refreshes its claim every
//! `refresh_interval`; if it stops ticking, the claim expires after
//! `expiration_delay` and another client takes over on its next tick.
//! `expiration_delay` must stay >= 2x `refresh_interval` to absorb clock
//! skew between clients.

#[macro_use]
extern crate tracing;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context as _;
use pressyard_task::ChildTask;
use redis::Script;
use redis::aio::MultiplexedConnection;
use tokio::sync::mpsc;

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

const ACQUIRE_SCRIPT: &str = r#"
local lockKey = KEYS[1]
local nodeId = ARGV[1]
local expirationDelayMs = ARGV[2]
local masterId = redis.call('get', lockKey)

if masterId == false then
  -- No master yet, we become the master
  redis.call('set', lockKey, nodeId, 'PX', expirationDelayMs)
  return 1
end

if masterId == nodeId then
  -- We're the master already, refresh our lease
  redis.call('pexpire', lockKey, expirationDelayMs)
  return 1
end

-- Somebody else is the master, don't touch anything
return 0
"#;

const RELEASE_SCRIPT: &str = r#"
local lockKey = KEYS[1]
local nodeId = ARGV[1]
local masterId = redis.call('get', lockKey)

if masterId == nodeId then
  redis.call('del', lockKey)
  return 1
end

return 0
"#;

#[derive(typed_builder::TypedBuilder)]
pub struct LeaseLockOptions {
    client: redis::Client,
    #[builder(setter(into))]
    name: String,
    #[builder(default = DEFAULT_REFRESH_INTERVAL)]
    refresh_interval: Duration,
    /// Defaults to five times the refresh interval.
    #[builder(default, setter(strip_option))]
    expiration_delay: Option<Duration>,
}

struct Inner {
    name: String,
    id: String,
    expiration_delay: Duration,
    acquire_script: Script,
    master: AtomicBool,
    events_tx: mpsc::Sender<bool>,
}

/// A single client's handle on a named lease.
///
/// The refresh ticker is aborted when the lock is dropped, but only `stop`
/// releases the lease eagerly; a dropped lock leaves takeover to expiry.
pub struct LeaseLock {
    inner: Arc<Inner>,
    conn: MultiplexedConnection,
    release_script: Script,
    ticker: ChildTask,
}

impl LeaseLock {
    /// Connects, uploads the lease scripts and starts the refresh ticker.
    ///
    /// The returned receiver observes master-flag transitions as levels: a
    /// send is attempted on each transition and dropped if the previous one
    /// was not consumed yet.
    pub async fn start(options: LeaseLockOptions) -> anyhow::Result<(Self, mpsc::Receiver<bool>)> {
        anyhow::ensure!(!options.name.is_empty(), "lease name cannot be empty");

        let expiration_delay = options
            .expiration_delay
            .unwrap_or(options.refresh_interval * 5);

        let hostname = hostname::get()
            .context("failed to read hostname")?
            .to_string_lossy()
            .into_owned();
        let id = format!("{hostname}-{}", uuid::Uuid::new_v4());

        let mut conn = options
            .client
            .get_multiplexed_async_connection()
            .await
            .context("failed to connect to Redis")?;

        let acquire_script = Script::new(ACQUIRE_SCRIPT);
        let release_script = Script::new(RELEASE_SCRIPT);

        acquire_script
            .prepare_invoke()
            .load_async(&mut conn)
            .await
            .context("failed to load lease acquire script")?;
        release_script
            .prepare_invoke()
            .load_async(&mut conn)
            .await
            .context("failed to load lease release script")?;

        let (events_tx, events_rx) = mpsc::channel(1);

        let inner = Arc::new(Inner {
            name: options.name,
            id,
            expiration_delay,
            acquire_script,
            master: AtomicBool::new(false),
            events_tx,
        });

        let ticker = ChildTask::spawn({
            let inner = Arc::clone(&inner);
            let conn = conn.clone();
            let refresh_interval = options.refresh_interval;

            async move {
                let mut interval = tokio::time::interval(refresh_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

                loop {
                    interval.tick().await;
                    inner.tick(conn.clone()).await;
                }
            }
        });

        Ok((
            Self {
                inner,
                conn,
                release_script,
                ticker,
            },
            events_rx,
        ))
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn is_master(&self) -> bool {
        self.inner.master.load(Ordering::SeqCst)
    }

    /// A clonable, read-only view on the master flag.
    pub fn view(&self) -> LeaseView {
        LeaseView {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Releases the lease and tears the lock down.
    pub async fn stop(self) {
        let mut conn = self.conn.clone();

        let released: redis::RedisResult<i32> = self
            .release_script
            .key(&self.inner.name)
            .arg(&self.inner.id)
            .invoke_async(&mut conn)
            .await;

        if let Err(error) = released {
            warn!(%error, lease = %self.inner.name, "Failed to release the lease");
        }

        self.ticker.abort();
        self.inner.master.store(false, Ordering::SeqCst);
        // Dropping `self` drops the last events sender, closing the channel.
    }
}

#[derive(Clone)]
pub struct LeaseView {
    inner: Arc<Inner>,
}

impl LeaseView {
    pub fn is_master(&self) -> bool {
        self.inner.master.load(Ordering::SeqCst)
    }
}

impl Inner {
    async fn tick(&self, mut conn: MultiplexedConnection) {
        let expiration_ms = u64::try_from(self.expiration_delay.as_millis()).unwrap_or(u64::MAX);

        let result: redis::RedisResult<i32> = self
            .acquire_script
            .key(&self.name)
            .arg(&self.id)
            .arg(expiration_ms)
            .invoke_async(&mut conn)
            .await;

        let acquired = match result {
            Ok(ret) => ret == 1,
            Err(error) => {
                // Leave the flag as-is; the next successful tick corrects it.
                warn!(%error, lease = %self.name, "Failed to refresh the lease");
                return;
            }
        };

        let changed = self.master.swap(acquired, Ordering::SeqCst) != acquired;

        if changed {
            debug!(lease = %self.name, id = %self.id, master = acquired, "Lease ownership changed");
            let _ = self.events_tx.try_send(acquired);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REFRESH_INTERVAL: Duration = Duration::from_millis(50);

    fn redis_client() -> Option<redis::Client> {
        let url = std::env::var("REDIS_URL").ok()?;
        Some(redis::Client::open(url).expect("valid REDIS_URL"))
    }

    async fn make_lock(client: redis::Client, name: &str) -> (LeaseLock, mpsc::Receiver<bool>) {
        let options = LeaseLockOptions::builder()
            .client(client)
            .name(name)
            .refresh_interval(REFRESH_INTERVAL)
            .expiration_delay(REFRESH_INTERVAL * 5)
            .build();

        LeaseLock::start(options).await.expect("start lock")
    }

    async fn wait_for_master(lock: &LeaseLock, events: &mut mpsc::Receiver<bool>) {
        let event = tokio::time::timeout(10 * REFRESH_INTERVAL, events.recv())
            .await
            .expect("master signal in time")
            .expect("events channel open");

        assert!(event, "first transition should be towards master");
        assert!(lock.is_master());
    }

    #[tokio::test]
    async fn single_lock_becomes_master() {
        let Some(client) = redis_client() else {
            eprintln!("REDIS_URL not set, skipping");
            return;
        };

        let name = format!("lease-test-{}", uuid::Uuid::new_v4());
        let (lock, mut events) = make_lock(client, &name).await;

        wait_for_master(&lock, &mut events).await;

        lock.stop().await;
    }

    #[tokio::test]
    async fn second_lock_takes_over_after_stop() {
        let Some(client) = redis_client() else {
            eprintln!("REDIS_URL not set, skipping");
            return;
        };

        let name = format!("lease-test-{}", uuid::Uuid::new_v4());

        let (lock1, mut events1) = make_lock(client.clone(), &name).await;
        wait_for_master(&lock1, &mut events1).await;

        let (lock2, mut events2) = make_lock(client, &name).await;

        // While lock1 keeps refreshing, lock2 must not become master.
        let takeover = tokio::time::timeout(5 * REFRESH_INTERVAL, events2.recv()).await;
        assert!(takeover.is_err(), "lock2 became master while lock1 is live");
        assert!(!lock2.is_master());

        lock1.stop().await;

        wait_for_master(&lock2, &mut events2).await;
        lock2.stop().await;
    }
}
