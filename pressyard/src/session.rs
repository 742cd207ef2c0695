//! Session records and the stores holding them.
//!
//! A session only ever lives in one store; the gate consults it, the login
//! and logout handlers create and destroy it. Expired sessions are never
//! returned, whichever back-end holds them.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::AsyncCommands as _;
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const REDIS_KEY_PREFIX: &str = "session-";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub sid: String,
    pub username: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl Session {
    fn is_expired(&self) -> bool {
        OffsetDateTime::now_utc() > self.expires_at
    }
}

pub fn generate_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub type DynSessionStore = Arc<dyn SessionStore>;

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn set(&self, session: Session) -> anyhow::Result<()>;
    async fn get(&self, sid: &str) -> anyhow::Result<Option<Session>>;
    async fn delete(&self, sid: &str) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn set(&self, session: Session) -> anyhow::Result<()> {
        anyhow::ensure!(!session.sid.is_empty(), "empty session id");

        self.sessions.lock().insert(session.sid.clone(), session);
        Ok(())
    }

    async fn get(&self, sid: &str) -> anyhow::Result<Option<Session>> {
        let mut sessions = self.sessions.lock();

        match sessions.get(sid) {
            Some(session) if session.is_expired() => {
                sessions.remove(sid);
                Ok(None)
            }
            Some(session) => Ok(Some(session.clone())),
            None => Ok(None),
        }
    }

    async fn delete(&self, sid: &str) -> anyhow::Result<()> {
        self.sessions.lock().remove(sid);
        Ok(())
    }
}

pub struct RedisSessionStore {
    conn: MultiplexedConnection,
}

impl RedisSessionStore {
    pub async fn connect(client: redis::Client) -> anyhow::Result<Self> {
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("failed to connect to Redis")?;

        Ok(Self { conn })
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn set(&self, session: Session) -> anyhow::Result<()> {
        anyhow::ensure!(!session.sid.is_empty(), "empty session id");

        let ttl = (session.expires_at - OffsetDateTime::now_utc()).whole_seconds();

        if ttl <= 0 {
            // Nothing to store; an expired session is indistinguishable from
            // an absent one.
            return Ok(());
        }

        let data = serde_json::to_vec(&session).context("failed to encode session")?;

        let mut conn = self.conn.clone();
        let key = format!("{REDIS_KEY_PREFIX}{}", session.sid);

        let set: redis::RedisResult<()> = conn.set_ex(key, data, u64::try_from(ttl).unwrap_or(u64::MAX)).await;
        set.context("failed to save session into Redis")?;

        Ok(())
    }

    async fn get(&self, sid: &str) -> anyhow::Result<Option<Session>> {
        let mut conn = self.conn.clone();

        let data: Option<Vec<u8>> = conn
            .get(format!("{REDIS_KEY_PREFIX}{sid}"))
            .await
            .context("failed to retrieve session from Redis")?;

        let Some(data) = data else {
            return Ok(None);
        };

        let session: Session = serde_json::from_slice(&data).context("failed to decode session")?;

        // Just in case Redis hasn't cleaned it up yet.
        if session.is_expired() {
            return Ok(None);
        }

        Ok(Some(session))
    }

    async fn delete(&self, sid: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();

        let deleted: redis::RedisResult<()> = conn.del(format!("{REDIS_KEY_PREFIX}{sid}")).await;
        deleted.context("failed to delete session from Redis")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(sid: &str, lifetime: time::Duration) -> Session {
        Session {
            sid: sid.to_owned(),
            username: "user".to_owned(),
            expires_at: OffsetDateTime::now_utc() + lifetime,
        }
    }

    async fn set_get_delete(store: &dyn SessionStore) {
        let first = session("session", time::Duration::hours(1));

        assert!(store.get(&first.sid).await.expect("get").is_none());

        store.set(first.clone()).await.expect("set");
        assert_eq!(store.get(&first.sid).await.expect("get").as_ref(), Some(&first));

        // Overwriting re-stamps the expiry.
        let extended = session("session", time::Duration::hours(2));
        store.set(extended.clone()).await.expect("set");
        assert_eq!(store.get(&extended.sid).await.expect("get").as_ref(), Some(&extended));

        // Deleting some other sid must not touch ours.
        store.delete("session-does-not-exist").await.expect("delete");
        assert_eq!(store.get(&extended.sid).await.expect("get").as_ref(), Some(&extended));

        store.delete(&extended.sid).await.expect("delete");
        assert!(store.get(&extended.sid).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn memory_store_set_get_delete() {
        set_get_delete(&MemorySessionStore::new()).await;
    }

    #[tokio::test]
    async fn memory_store_never_returns_expired_sessions() {
        let store = MemorySessionStore::new();

        store
            .set(session("stale", time::Duration::seconds(-1)))
            .await
            .expect("set");

        assert!(store.get("stale").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn redis_store_set_get_delete() {
        let Ok(url) = std::env::var("REDIS_URL") else {
            eprintln!("REDIS_URL not set, skipping");
            return;
        };

        let client = redis::Client::open(url).expect("valid REDIS_URL");
        let store = RedisSessionStore::connect(client).await.expect("connect");

        set_get_delete(&store).await;
    }
}
