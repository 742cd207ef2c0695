use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;

use crate::api::AdminState;
use crate::api::users::map_store_error;
use crate::extract::SessionUser;
use crate::http::HttpError;
use crate::userstore::Blog;

pub(crate) async fn create_blog(
    State(state): State<AdminState>,
    SessionUser(session): SessionUser,
    Json(blog): Json<Blog>,
) -> Result<StatusCode, HttpError> {
    let slug = blog.slug.clone();

    state
        .users
        .add_blog(&session.username, blog)
        .await
        .map_err(map_store_error)?;

    info!(username = %session.username, %slug, "Added blog");

    Ok(StatusCode::OK)
}

pub(crate) async fn update_blog(
    State(state): State<AdminState>,
    SessionUser(session): SessionUser,
    Json(blog): Json<Blog>,
) -> Result<StatusCode, HttpError> {
    let slug = blog.slug.clone();

    state
        .users
        .update_blog(&session.username, blog)
        .await
        .map_err(map_store_error)?;

    info!(username = %session.username, %slug, "Updated blog");

    Ok(StatusCode::OK)
}

pub(crate) async fn list_blogs(
    State(state): State<AdminState>,
    SessionUser(session): SessionUser,
) -> Result<Json<Vec<Blog>>, HttpError> {
    let blogs = state
        .users
        .list_blogs(&session.username)
        .await
        .map_err(map_store_error)?;

    Ok(Json(blogs))
}

pub(crate) async fn get_user_blog(
    State(state): State<AdminState>,
    SessionUser(_session): SessionUser,
    Path((username, slug)): Path<(String, String)>,
) -> Result<Json<Blog>, HttpError> {
    let blog = state
        .users
        .get_blog(&username, &slug)
        .await
        .map_err(map_store_error)?
        .ok_or_else(|| HttpError::not_found().msg("no blog with this slug"))?;

    Ok(Json(blog))
}

pub(crate) async fn delete_blog(
    State(state): State<AdminState>,
    SessionUser(session): SessionUser,
    Path(slug): Path<String>,
) -> Result<StatusCode, HttpError> {
    state
        .users
        .delete_blog(&session.username, &slug)
        .await
        .map_err(map_store_error)?;

    info!(username = %session.username, %slug, "Deleted blog");

    Ok(StatusCode::OK)
}
