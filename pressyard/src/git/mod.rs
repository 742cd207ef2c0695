//! Smart-HTTP relay between authenticated clients and on-disk bare
//! repositories.
//!
//! The relay never interprets the git protocol beyond the initial
//! advertisement header: request bodies are piped into `git --stateless-rpc`
//! and its stdout is piped back, unbuffered in both directions. Concurrent
//! pushes to the same repository serialise through git's own locks; the
//! relay adds none of its own.

use std::io;
use std::path::{Path as StdPath, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Extension, Path, Query, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::Next;
use axum::response::Response;
use axum::routing::{get, post};
use axum_extra::extract::CookieJar;
use camino::{Utf8Path, Utf8PathBuf};
use futures::{StreamExt as _, TryStreamExt as _};
use pressyard_task::ChildTask;
use serde::Deserialize;
use tokio::process::{Child, Command};
use tokio_util::io::{ReaderStream, StreamReader};
use work_queue::{DynQueue, JobData, RenderJob};

use crate::cookie::AUTH_COOKIE_NAME;
use crate::http::HttpError;
use crate::identity::DynOwnershipResolver;

/// A render gets the same budget whether triggered by a push or retried
/// through grooming.
const RENDER_JOB_TTR: Duration = Duration::from_secs(10 * 60);

pub(crate) const FLUSH_PKT: &[u8] = b"0000";

#[derive(Clone)]
pub struct GitState {
    pub repository_base: Utf8PathBuf,
    pub resolver: DynOwnershipResolver,
    pub queue: DynQueue,
}

/// Authenticated and authorized repository coordinates, attached by the
/// access middleware. `repository` is already `.git`-stripped.
#[derive(Debug, Clone)]
struct RepoAccess {
    username: String,
    repository: String,
    auth_cookie: String,
}

pub fn make_router(state: GitState) -> Router {
    Router::new()
        .route("/{username}/{repository}/info/refs", get(info_refs))
        .route("/{username}/{repository}/git-upload-pack", post(upload_pack))
        .route("/{username}/{repository}/git-receive-pack", post(receive_pack))
        .layer(axum::middleware::from_fn_with_state(state.clone(), repo_access_middleware))
        .with_state(state)
}

/// `[a-zA-Z][a-zA-Z0-9._-]+`, both for usernames and repository names.
pub(crate) fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    let Some(first) = chars.next() else {
        return false;
    };

    if !first.is_ascii_alphabetic() {
        return false;
    }

    let rest = chars.as_str();

    !rest.is_empty()
        && rest
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

pub(crate) fn strip_git_suffix(repository: &str) -> &str {
    repository.strip_suffix(".git").unwrap_or(repository)
}

fn repository_path(base: &Utf8Path, username: &str, repository: &str) -> Utf8PathBuf {
    base.join(username).join(repository)
}

async fn repo_access_middleware(
    State(state): State<GitState>,
    Path((username, repository)): Path<(String, String)>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Result<Response, HttpError> {
    let repository = strip_git_suffix(&repository).to_owned();

    if !is_valid_name(&username) || !is_valid_name(&repository) {
        return Err(HttpError::not_found().msg("no such repository"));
    }

    let Some(cookie) = jar.get(AUTH_COOKIE_NAME) else {
        return Err(HttpError::unauthorized().msg("authentication required"));
    };

    let auth_cookie = cookie.value().to_owned();

    let me = state
        .resolver
        .whoami(&auth_cookie)
        .await
        .map_err(HttpError::internal().err())?;

    let Some(me) = me else {
        return Err(HttpError::unauthorized().msg("invalid session"));
    };

    if me != username {
        return Err(HttpError::unauthorized().msg("not your repository namespace"));
    }

    let blogs = state
        .resolver
        .list_blogs(&auth_cookie)
        .await
        .map_err(HttpError::internal().err())?;

    if !blogs.iter().any(|blog| blog.slug == repository) {
        return Err(HttpError::not_found().msg("no such repository"));
    }

    request.extensions_mut().insert(RepoAccess {
        username,
        repository,
        auth_cookie,
    });

    Ok(next.run(request).await)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GitService {
    UploadPack,
    ReceivePack,
}

impl GitService {
    fn from_query(service: Option<&str>) -> Option<Self> {
        match service {
            Some("git-upload-pack") => Some(Self::UploadPack),
            Some("git-receive-pack") => Some(Self::ReceivePack),
            _ => None,
        }
    }

    /// The git subcommand, without the `git-` prefix.
    fn command(self) -> &'static str {
        match self {
            Self::UploadPack => "upload-pack",
            Self::ReceivePack => "receive-pack",
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::UploadPack => "git-upload-pack",
            Self::ReceivePack => "git-receive-pack",
        }
    }

    fn advertisement_content_type(self) -> &'static str {
        match self {
            Self::UploadPack => "application/x-git-upload-pack-advertisement",
            Self::ReceivePack => "application/x-git-receive-pack-advertisement",
        }
    }

    fn request_content_type(self) -> &'static str {
        match self {
            Self::UploadPack => "application/x-git-upload-pack-request",
            Self::ReceivePack => "application/x-git-receive-pack-request",
        }
    }

    fn result_content_type(self) -> &'static str {
        match self {
            Self::UploadPack => "application/x-git-upload-pack-result",
            Self::ReceivePack => "application/x-git-receive-pack-result",
        }
    }
}

/// Appends one pkt-line: a 4-byte hex length prefix counting itself,
/// followed by the content.
///
/// Panics on content over 65531 bytes; by design the relay never writes
/// such a packet.
pub(crate) fn write_pkt_line(out: &mut Vec<u8>, line: &str) {
    let total = line.len() + 4;

    assert!(total <= 0xffff, "git packet too big");

    out.extend_from_slice(format!("{total:04x}").as_bytes());
    out.extend_from_slice(line.as_bytes());
}

pub(crate) fn find_program(name: &str) -> anyhow::Result<PathBuf> {
    let as_path = StdPath::new(name);

    if as_path.components().count() > 1 {
        return Ok(as_path.to_path_buf());
    }

    let path = std::env::var_os("PATH").context("PATH is not set")?;

    std::env::split_paths(&path)
        .map(|dir| dir.join(as_path))
        .find(|candidate| candidate.is_file())
        .with_context(|| format!("cannot find {name} in PATH"))
}

/// A git command with the environment the relay and the worker both want:
/// nothing from the parent but PATH, prompts disabled, killed when the
/// handle is dropped (request cancellation, worker deadline).
pub(crate) fn git_command() -> anyhow::Result<Command> {
    let program = find_program("git")?;

    let mut command = Command::new(program);
    command.env_clear();
    command.env("GIT_TERMINAL_PROMPT", "0");

    if let Some(path) = std::env::var_os("PATH") {
        command.env("PATH", path);
    }

    command.kill_on_drop(true);

    Ok(command)
}

async fn is_dir(path: &Utf8Path) -> anyhow::Result<bool> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => Ok(metadata.is_dir()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(error) => Err(error).context("failed to check repository directory"),
    }
}

/// Materialises an empty bare repository on first push. A failed
/// materialisation must not leave a partial directory behind: the next
/// attempt has to start from scratch.
async fn ensure_repository(repo_path: &Utf8Path) -> anyhow::Result<()> {
    if is_dir(repo_path).await? {
        return Ok(());
    }

    tokio::fs::create_dir_all(repo_path)
        .await
        .context("failed to create repository directory")?;

    let init = async {
        let output = git_command()?
            .args(["init", "--bare", repo_path.as_str()])
            .output()
            .await
            .context("failed to run git init")?;

        anyhow::ensure!(
            output.status.success(),
            "git init --bare failed (stderr: {})",
            String::from_utf8_lossy(&output.stderr).trim()
        );

        Ok(())
    }
    .await;

    if init.is_err() {
        let _ = tokio::fs::remove_dir_all(repo_path).await;
    }

    init
}

fn spawn_git_service(service: GitService, repo_path: &Utf8Path, extra_args: &[&str]) -> anyhow::Result<Child> {
    let mut command = git_command()?;

    command.arg(service.command());
    command.arg("--stateless-rpc");
    command.args(extra_args);
    command.arg(repo_path.as_str());

    command.stdin(std::process::Stdio::piped());
    command.stdout(std::process::Stdio::piped());
    command.stderr(std::process::Stdio::piped());

    debug!(service = service.name(), %repo_path, "Running git");

    command.spawn().context("failed to spawn git")
}

/// Waits for the subprocess and, for a successful receive-pack, enqueues
/// the render job. Runs detached from the HTTP response.
async fn reap_git_service(mut child: Child, enqueue: Option<(DynQueue, RenderJob)>) {
    let stderr = match child.stderr.take() {
        Some(mut stderr) => {
            let mut buffer = String::new();
            let _ = tokio::io::AsyncReadExt::read_to_string(&mut stderr, &mut buffer).await;
            buffer
        }
        None => String::new(),
    };

    match child.wait().await {
        Ok(status) if status.success() => {
            if let Some((queue, job)) = enqueue {
                let username = job.username.clone();
                let repository = job.repository.clone();

                match queue.post(JobData::Render(job), RENDER_JOB_TTR).await {
                    Ok(()) => debug!(%username, %repository, "Enqueued render job"),
                    // The push already went through; the next one re-triggers.
                    Err(error) => warn!(%error, %username, %repository, "Failed to enqueue render job"),
                }
            }
        }
        Ok(status) => warn!(%status, stderr = %stderr.trim(), "git exited with an error"),
        Err(error) => warn!(%error, "Failed to wait for git"),
    }
}

#[derive(Deserialize)]
struct InfoRefsQuery {
    service: Option<String>,
}

async fn info_refs(
    State(state): State<GitState>,
    Extension(access): Extension<RepoAccess>,
    Query(query): Query<InfoRefsQuery>,
) -> Result<Response, HttpError> {
    let Some(service) = GitService::from_query(query.service.as_deref()) else {
        return Err(HttpError::bad_request().msg("unknown service"));
    };

    let repo_path = repository_path(&state.repository_base, &access.username, &access.repository);

    match service {
        GitService::ReceivePack => {
            ensure_repository(&repo_path).await.map_err(HttpError::internal().err())?;
        }
        GitService::UploadPack => {
            if !is_dir(&repo_path).await.map_err(HttpError::internal().err())? {
                return Err(HttpError::not_found().msg("repository was never pushed"));
            }
        }
    }

    let mut child =
        spawn_git_service(service, &repo_path, &["--advertise-refs"]).map_err(HttpError::internal().err())?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| HttpError::internal().msg("git stdout not captured"))?;

    ChildTask::spawn(reap_git_service(child, None)).detach();

    let mut header = Vec::new();
    write_pkt_line(&mut header, &format!("# service={}\n", service.name()));
    header.extend_from_slice(FLUSH_PKT);

    let body = Body::from_stream(
        futures::stream::iter([Ok::<_, io::Error>(Bytes::from(header))]).chain(ReaderStream::new(stdout)),
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, service.advertisement_content_type())
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .map_err(HttpError::internal().err())
}

async fn upload_pack(
    State(state): State<GitState>,
    Extension(access): Extension<RepoAccess>,
    request: Request,
) -> Result<Response, HttpError> {
    serve_pack(state, access, GitService::UploadPack, request).await
}

async fn receive_pack(
    State(state): State<GitState>,
    Extension(access): Extension<RepoAccess>,
    request: Request,
) -> Result<Response, HttpError> {
    serve_pack(state, access, GitService::ReceivePack, request).await
}

async fn serve_pack(
    state: GitState,
    access: RepoAccess,
    service: GitService,
    request: Request,
) -> Result<Response, HttpError> {
    let content_type_ok = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == service.request_content_type());

    let accept_ok = request
        .headers()
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value == service.result_content_type());

    if !content_type_ok || !accept_ok {
        return Err(HttpError::bad_request().msg("invalid formats"));
    }

    let repo_path = repository_path(&state.repository_base, &access.username, &access.repository);

    match service {
        GitService::ReceivePack => {
            ensure_repository(&repo_path).await.map_err(HttpError::internal().err())?;
        }
        GitService::UploadPack => {
            if !is_dir(&repo_path).await.map_err(HttpError::internal().err())? {
                return Err(HttpError::not_found().msg("repository was never pushed"));
            }
        }
    }

    let mut child = spawn_git_service(service, &repo_path, &[]).map_err(HttpError::internal().err())?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| HttpError::internal().msg("git stdin not captured"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| HttpError::internal().msg("git stdout not captured"))?;

    // Request body -> git stdin. Dropping stdin at the end signals EOF; a
    // cancelled request ends the copy early and git sees a truncated input.
    let body_stream = request.into_body().into_data_stream().map_err(io::Error::other);
    ChildTask::spawn(async move {
        let mut body_reader = StreamReader::new(body_stream);

        if let Err(error) = tokio::io::copy(&mut body_reader, &mut stdin).await {
            debug!(%error, "Request body relay ended early");
        }
    })
    .detach();

    let enqueue = match service {
        GitService::ReceivePack => Some((
            Arc::clone(&state.queue),
            RenderJob {
                username: access.username,
                repository: access.repository,
                auth_cookie: access.auth_cookie,
            },
        )),
        GitService::UploadPack => None,
    };

    ChildTask::spawn(reap_git_service(child, enqueue)).detach();

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, service.result_content_type())
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(ReaderStream::new(stdout)))
        .map_err(HttpError::internal().err())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_names() {
        assert!(is_valid_name("renderer"));
        assert!(is_valid_name("My-repo.2_x"));

        assert!(!is_valid_name(""));
        assert!(!is_valid_name("a"));
        assert!(!is_valid_name("1leading-digit"));
        assert!(!is_valid_name(".hidden"));
        assert!(!is_valid_name("with space"));
        assert!(!is_valid_name("path/traversal"));
    }

    #[test]
    fn dotdot_is_two_valid_chars() {
        // `..` alone can never appear: the first char must be a letter.
        assert!(is_valid_name("a..b"));
        assert!(!is_valid_name(".."));
    }

    #[test]
    fn strips_the_git_suffix_once() {
        assert_eq!(strip_git_suffix("myblog.git"), "myblog");
        assert_eq!(strip_git_suffix("myblog"), "myblog");
        assert_eq!(strip_git_suffix("myblog.git.git"), "myblog.git");
    }

    #[test]
    fn repository_paths_join_under_the_base() {
        let path = repository_path(Utf8Path::new("/srv/repos"), "renderer", "myblog");
        assert_eq!(path, Utf8PathBuf::from("/srv/repos/renderer/myblog"));
    }

    #[test]
    fn pkt_line_prefixes_the_total_length() {
        let mut out = Vec::new();
        write_pkt_line(&mut out, "# service=git-upload-pack\n");

        assert_eq!(out, b"001e# service=git-upload-pack\n");
    }

    #[test]
    #[should_panic(expected = "git packet too big")]
    fn oversized_pkt_line_is_a_programming_error() {
        let mut out = Vec::new();
        write_pkt_line(&mut out, &"x".repeat(65532));
    }

    #[test]
    fn largest_pkt_line_fits() {
        let mut out = Vec::new();
        write_pkt_line(&mut out, &"x".repeat(65531));

        assert_eq!(&out[..4], b"ffff");
    }

    #[test]
    fn service_query_parsing_is_exact() {
        assert_eq!(
            GitService::from_query(Some("git-upload-pack")),
            Some(GitService::UploadPack)
        );
        assert_eq!(
            GitService::from_query(Some("git-receive-pack")),
            Some(GitService::ReceivePack)
        );
        assert_eq!(GitService::from_query(Some("upload-pack")), None);
        assert_eq!(GitService::from_query(Some("git-upload-pack ")), None);
        assert_eq!(GitService::from_query(None), None);
    }
}
