#[macro_use]
extern crate tracing;

pub mod api;
pub mod blob;
pub mod config;
pub mod cookie;
pub mod extract;
pub mod git;
pub mod http;
pub mod identity;
pub mod listener;
pub mod log;
pub mod middleware;
pub mod netscape;
pub mod render;
pub mod session;
pub mod userstore;
pub mod worker;

use axum::Router;
use camino::Utf8PathBuf;
use tower_http::services::ServeDir;

use crate::api::AdminState;
use crate::git::GitState;

/// Assembles the HTTP surface for the enabled roles.
///
/// The all-in-one deployment nests the admin API under `/api` and the
/// relay under `/git`; a single-role deployment owns the root. When the
/// blob output is a local directory it is served at `/`, so a freshly
/// rendered blog is browsable from the same process.
pub fn make_http_service(
    admin: Option<AdminState>,
    git: Option<GitState>,
    blog_output_dir: Option<Utf8PathBuf>,
) -> Router {
    let nested = admin.is_some() && git.is_some();

    let mut router = Router::new();

    if let Some(admin) = admin {
        let admin_router = api::make_router(admin);

        router = if nested {
            router.nest("/api", admin_router)
        } else {
            router.merge(admin_router)
        };
    }

    if let Some(git) = git {
        let git_router = git::make_router(git);

        router = if nested {
            router.nest("/git", git_router)
        } else {
            router.merge(git_router)
        };
    }

    if let Some(directory) = blog_output_dir {
        info!(%directory, "Local blog output detected, serving rendered files");
        router = router.fallback_service(ServeDir::new(directory));
    }

    router.layer(axum::middleware::from_fn(middleware::log::log_middleware))
}
