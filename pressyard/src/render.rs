//! The render pipeline: everything between "a render job was reserved" and
//! "the rendered site sits in the blob store".
//!
//! Every stage clobbers its own output, so running the same job twice is
//! safe; grooming relies on exactly that.

use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use object_store::ObjectStore;
use serde::Serialize;
use time::OffsetDateTime;
use url::Url;
use work_queue::RenderJob;

use crate::cookie::{AUTH_COOKIE_NAME, SESSION_LIFETIME};
use crate::git::{find_program, git_command};
use crate::identity::DynOwnershipResolver;
use crate::netscape::{JarCookie, write_cookie};
use crate::userstore::Blog;

const BLOG_DIRECTORY: &str = "blog";
const THEME_DIRECTORY: &str = "theme";
const RESULT_DIRECTORY: &str = "html";

const AUTH_COOKIE_FILE: &str = "auth_cookie.txt";
const CONFIG_FILE: &str = "config.json";

pub struct RenderContext {
    pub admin_url: Url,
    pub git_server_url: Url,
    pub work_dir: Utf8PathBuf,
    pub theme_repository_url: String,
    pub renderer: String,
    pub resolver: DynOwnershipResolver,
    pub blob_store: Arc<dyn ObjectStore>,
}

pub async fn render_blog(ctx: &RenderContext, job: &RenderJob) -> anyhow::Result<()> {
    // A dead cookie fails the job before any expensive work; a live one is
    // re-stamped so it outlasts the pipeline.
    ctx.resolver
        .refresh_session(&job.auth_cookie)
        .await
        .context("session refresh failed")?;

    let blog = ctx
        .resolver
        .get_blog(&job.auth_cookie, &job.username, &job.repository)
        .await
        .context("failed to fetch blog information")?
        .context("blog does not exist")?;

    let cookie_file = ctx.work_dir.join(AUTH_COOKIE_FILE);
    write_cookie_file(ctx, &cookie_file, &job.auth_cookie)
        .await
        .context("failed to write the auth cookie file")?;

    clone_blog(ctx, job, &cookie_file).await.context("failed to clone blog")?;

    sync_theme(ctx).await.context("failed to sync theme")?;

    let config_file = ctx.work_dir.join(CONFIG_FILE);
    write_render_config(&config_file, &blog)
        .await
        .context("failed to write the render configuration")?;

    run_renderer(ctx, &config_file).await.context("renderer failed")?;

    upload_outputs(ctx, job).await.context("failed to upload outputs")?;

    Ok(())
}

async fn write_cookie_file(ctx: &RenderContext, path: &Utf8Path, auth_cookie: &str) -> anyhow::Result<()> {
    let expires = OffsetDateTime::now_utc() + SESSION_LIFETIME;

    let mut buffer = Vec::new();

    // One line per downstream host: the identity service and the
    // repository relay both see the same capability.
    for url in [&ctx.admin_url, &ctx.git_server_url] {
        let domain = url
            .host_str()
            .with_context(|| format!("URL {url} carries no host"))?
            .to_owned();

        write_cookie(
            &mut buffer,
            &JarCookie {
                domain,
                path: "/".to_owned(),
                secure: false,
                expires: Some(expires),
                name: AUTH_COOKIE_NAME.to_owned(),
                value: auth_cookie.to_owned(),
            },
        )?;
    }

    tokio::fs::write(path, &buffer).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    Ok(())
}

async fn run_git<I, S>(args: I) -> anyhow::Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let output = git_command()?
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .context("failed to run git")?;

    anyhow::ensure!(
        output.status.success(),
        "git returned an error (stderr: {})",
        String::from_utf8_lossy(&output.stderr).trim()
    );

    Ok(())
}

async fn clone_blog(ctx: &RenderContext, job: &RenderJob, cookie_file: &Utf8Path) -> anyhow::Result<()> {
    let repo_url = format!(
        "{}/{}/{}",
        ctx.git_server_url.as_str().trim_end_matches('/'),
        job.username,
        job.repository
    );

    let repo_path = ctx.work_dir.join(BLOG_DIRECTORY);

    match tokio::fs::remove_dir_all(&repo_path).await {
        Ok(()) => {}
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => return Err(error).context("failed to clean the blog directory"),
    }

    let cookie_config = format!("http.cookieFile={cookie_file}");

    run_git([
        "-c",
        cookie_config.as_str(),
        "clone",
        "--depth",
        "1",
        repo_url.as_str(),
        repo_path.as_str(),
    ])
    .await
}

async fn sync_theme(ctx: &RenderContext) -> anyhow::Result<()> {
    let theme_path = ctx.work_dir.join(THEME_DIRECTORY);

    match tokio::fs::metadata(&theme_path).await {
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            run_git(["clone", &ctx.theme_repository_url, theme_path.as_str()]).await
        }
        Err(error) => Err(error).context("failed to check the theme directory"),
        Ok(metadata) if metadata.is_dir() => run_git(["-C", theme_path.as_str(), "pull"]).await,
        Ok(_) => anyhow::bail!("theme path exists but is not a directory"),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RenderConfig {
    build_future: bool,
    disable_kinds: [&'static str; 6],
    enable_inline_shortcodes: bool,
    language_code: &'static str,
    rss_limit: u32,
    title: String,
}

fn render_config(blog: &Blog) -> RenderConfig {
    RenderConfig {
        build_future: true,
        disable_kinds: ["section", "taxonomy", "taxonomyTerm", "sitemap", "robotsTXT", "404"],
        enable_inline_shortcodes: false,
        language_code: "en-us",
        rss_limit: 100,
        title: blog.display_name.clone(),
    }
}

async fn write_render_config(path: &Utf8Path, blog: &Blog) -> anyhow::Result<()> {
    let data = serde_json::to_vec(&render_config(blog)).context("failed to encode the configuration")?;

    tokio::fs::write(path, &data).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    Ok(())
}

async fn run_renderer(ctx: &RenderContext, config_file: &Utf8Path) -> anyhow::Result<()> {
    let destination = ctx.work_dir.join(RESULT_DIRECTORY);

    match tokio::fs::remove_dir_all(&destination).await {
        Ok(()) => {}
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => return Err(error).context("failed to clean the destination directory"),
    }

    let program = find_program(&ctx.renderer)?;

    let mut command = tokio::process::Command::new(program);

    // The renderer runs on untrusted input; it gets an empty environment.
    command.env_clear();
    command.kill_on_drop(true);
    command.args([
        "--config",
        config_file.as_str(),
        "--source",
        ctx.work_dir.join(BLOG_DIRECTORY).as_str(),
        "--destination",
        destination.as_str(),
        "--themesDir",
        ctx.work_dir.as_str(),
        "--theme",
        THEME_DIRECTORY,
    ]);
    command.stdin(Stdio::null());
    command.stdout(Stdio::null());
    command.stderr(Stdio::piped());

    debug!(renderer = %ctx.renderer, "Running renderer");

    let output = command.output().await.context("failed to run the renderer")?;

    anyhow::ensure!(
        output.status.success(),
        "renderer returned an error (stderr: {})",
        String::from_utf8_lossy(&output.stderr).trim()
    );

    Ok(())
}

async fn upload_outputs(ctx: &RenderContext, job: &RenderJob) -> anyhow::Result<()> {
    let destination = ctx.work_dir.join(RESULT_DIRECTORY);

    crate::blob::upload_directory(
        ctx.blob_store.as_ref(),
        destination.as_std_path(),
        &job.username,
        &job.repository,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_config_matches_the_renderer_schema() {
        let blog = Blog {
            slug: "myblog".to_owned(),
            display_name: "My fancy blog".to_owned(),
        };

        let value = serde_json::to_value(render_config(&blog)).expect("config");

        assert_eq!(
            value,
            serde_json::json!({
                "buildFuture": true,
                "disableKinds": ["section", "taxonomy", "taxonomyTerm", "sitemap", "robotsTXT", "404"],
                "enableInlineShortcodes": false,
                "languageCode": "en-us",
                "rssLimit": 100,
                "title": "My fancy blog",
            })
        );
    }

    #[tokio::test]
    async fn cookie_file_covers_both_hosts() {
        let work_dir = tempfile::tempdir().expect("tempdir");
        let work_dir_path = Utf8Path::from_path(work_dir.path()).expect("utf-8 tempdir");

        let ctx = RenderContext {
            admin_url: Url::parse("http://admin.example.org/api").expect("url"),
            git_server_url: Url::parse("http://git.example.org/git").expect("url"),
            work_dir: work_dir_path.to_owned(),
            theme_repository_url: "http://git.example.org/theme".to_owned(),
            renderer: "hugo".to_owned(),
            resolver: std::sync::Arc::new(crate::identity::InProcessResolver::new(
                std::sync::Arc::new(
                    crate::cookie::CookieCodec::new(&[0u8; 64], &[0u8; 32]).expect("codec"),
                ),
                std::sync::Arc::new(crate::session::MemorySessionStore::new()),
                std::sync::Arc::new(crate::userstore::MemoryUserStore::new()),
            )),
            blob_store: std::sync::Arc::new(object_store::memory::InMemory::new()),
        };

        let cookie_file = ctx.work_dir.join(AUTH_COOKIE_FILE);

        write_cookie_file(&ctx, &cookie_file, "opaque-value").await.expect("write");

        let contents = std::fs::read_to_string(&cookie_file).expect("read");
        let lines: Vec<&str> = contents.lines().collect();

        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("admin.example.org\tFALSE\t/\tFALSE\t"));
        assert!(lines[1].starts_with("git.example.org\tFALSE\t/\tFALSE\t"));
        assert!(lines.iter().all(|line| line.ends_with("\tauth\topaque-value")));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            let mode = std::fs::metadata(&cookie_file).expect("stat").permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
