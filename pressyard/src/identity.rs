//! The narrow capability the relay and the worker program against to talk
//! to the identity service, wired either in-process (all-in-one deployment)
//! or over HTTP (split deployment) at composition time.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use reqwest::header::COOKIE;

use crate::cookie::{AUTH_COOKIE_NAME, CookieCodec, SESSION_LIFETIME};
use crate::session::{DynSessionStore, Session};
use crate::userstore::{Blog, DynUserStore, UserProfile};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

pub type DynOwnershipResolver = Arc<dyn OwnershipResolver>;

/// Every operation takes the raw auth cookie value: the resolver
/// authenticates as whoever pushed, not as the process it runs in.
#[async_trait]
pub trait OwnershipResolver: Send + Sync {
    /// `None` when the cookie does not map to a live session.
    async fn whoami(&self, auth_cookie: &str) -> anyhow::Result<Option<String>>;

    /// The blogs owned by the cookie's user. Errors without a live session.
    async fn list_blogs(&self, auth_cookie: &str) -> anyhow::Result<Vec<Blog>>;

    async fn get_blog(&self, auth_cookie: &str, username: &str, slug: &str) -> anyhow::Result<Option<Blog>>;

    /// Re-stamps the session's expiration. An error means the cookie is
    /// dead and anything planning to use it should give up.
    async fn refresh_session(&self, auth_cookie: &str) -> anyhow::Result<()>;
}

pub struct InProcessResolver {
    cookie_codec: Arc<CookieCodec>,
    sessions: DynSessionStore,
    users: DynUserStore,
}

impl InProcessResolver {
    pub fn new(cookie_codec: Arc<CookieCodec>, sessions: DynSessionStore, users: DynUserStore) -> Self {
        Self {
            cookie_codec,
            sessions,
            users,
        }
    }

    async fn session_for(&self, auth_cookie: &str) -> anyhow::Result<Option<Session>> {
        let Some(sid) = self.cookie_codec.decode(auth_cookie) else {
            return Ok(None);
        };

        self.sessions.get(&sid).await
    }
}

#[async_trait]
impl OwnershipResolver for InProcessResolver {
    async fn whoami(&self, auth_cookie: &str) -> anyhow::Result<Option<String>> {
        Ok(self.session_for(auth_cookie).await?.map(|session| session.username))
    }

    async fn list_blogs(&self, auth_cookie: &str) -> anyhow::Result<Vec<Blog>> {
        let session = self
            .session_for(auth_cookie)
            .await?
            .context("authentication required")?;

        self.users
            .list_blogs(&session.username)
            .await
            .context("failed to list blogs")
    }

    async fn get_blog(&self, auth_cookie: &str, username: &str, slug: &str) -> anyhow::Result<Option<Blog>> {
        self.session_for(auth_cookie)
            .await?
            .context("authentication required")?;

        self.users
            .get_blog(username, slug)
            .await
            .context("failed to retrieve blog")
    }

    async fn refresh_session(&self, auth_cookie: &str) -> anyhow::Result<()> {
        let mut session = self
            .session_for(auth_cookie)
            .await?
            .context("session expired or unknown")?;

        session.expires_at = time::OffsetDateTime::now_utc() + SESSION_LIFETIME;

        self.sessions.set(session).await.context("failed to refresh session")
    }
}

pub struct HttpResolver {
    client: reqwest::Client,
    base_url: String,
}

impl HttpResolver {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build the identity HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    fn cookie_header(auth_cookie: &str) -> String {
        format!("{AUTH_COOKIE_NAME}={auth_cookie}")
    }
}

#[async_trait]
impl OwnershipResolver for HttpResolver {
    async fn whoami(&self, auth_cookie: &str) -> anyhow::Result<Option<String>> {
        let response = self
            .client
            .get(self.endpoint("me"))
            .header(COOKIE, Self::cookie_header(auth_cookie))
            .send()
            .await
            .context("whoami request failed")?;

        match response.status() {
            reqwest::StatusCode::OK => {
                let profile: UserProfile = response.json().await.context("failed to decode whoami reply")?;
                Ok(Some(profile.username))
            }
            reqwest::StatusCode::UNAUTHORIZED => Ok(None),
            status => anyhow::bail!("whoami returned status {status}"),
        }
    }

    async fn list_blogs(&self, auth_cookie: &str) -> anyhow::Result<Vec<Blog>> {
        let response = self
            .client
            .get(self.endpoint("blogs"))
            .header(COOKIE, Self::cookie_header(auth_cookie))
            .send()
            .await
            .context("blog list request failed")?;

        anyhow::ensure!(
            response.status() == reqwest::StatusCode::OK,
            "blog list returned status {}",
            response.status()
        );

        response.json().await.context("failed to decode blog list reply")
    }

    async fn get_blog(&self, auth_cookie: &str, username: &str, slug: &str) -> anyhow::Result<Option<Blog>> {
        let response = self
            .client
            .get(self.endpoint(&format!("users/{username}/blogs/{slug}")))
            .header(COOKIE, Self::cookie_header(auth_cookie))
            .send()
            .await
            .context("blog request failed")?;

        match response.status() {
            reqwest::StatusCode::OK => {
                let blog: Blog = response.json().await.context("failed to decode blog reply")?;
                Ok(Some(blog))
            }
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            status => anyhow::bail!("blog request returned status {status}"),
        }
    }

    async fn refresh_session(&self, auth_cookie: &str) -> anyhow::Result<()> {
        let response = self
            .client
            .post(self.endpoint("login"))
            .header(COOKIE, Self::cookie_header(auth_cookie))
            .form(&[("username", ""), ("password", "")])
            .send()
            .await
            .context("session refresh request failed")?;

        anyhow::ensure!(
            response.status() == reqwest::StatusCode::OK,
            "session refresh returned status {}",
            response.status()
        );

        Ok(())
    }
}
