pub mod auth;
pub mod blogs;
pub mod users;

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post};

use crate::cookie::CookieCodec;
use crate::session::DynSessionStore;
use crate::userstore::DynUserStore;

#[derive(Clone)]
pub struct AdminState {
    pub cookie_codec: Arc<CookieCodec>,
    pub sessions: DynSessionStore,
    pub users: DynUserStore,
}

pub fn make_router(state: AdminState) -> Router {
    Router::new()
        .route("/login", post(auth::login))
        .route("/logout", post(auth::logout))
        .route("/me", get(users::whoami))
        .route("/users", post(users::create_user).put(users::update_user))
        .route("/users/{username}", get(users::get_user).delete(users::delete_user))
        .route("/users/{username}/blogs/{slug}", get(blogs::get_user_blog))
        .route(
            "/blogs",
            post(blogs::create_blog).put(blogs::update_blog).get(blogs::list_blogs),
        )
        .route("/blogs/{slug}", delete(blogs::delete_blog))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::middleware::auth::session_middleware,
        ))
        .with_state(state)
}
