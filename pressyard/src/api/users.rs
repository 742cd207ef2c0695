use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::Deserialize;

use crate::api::AdminState;
use crate::extract::SessionUser;
use crate::http::HttpError;
use crate::userstore::{NewUser, UserProfile, UserStoreError};

#[derive(Deserialize)]
pub(crate) struct UserPayload {
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    display_name: String,
}

impl From<UserPayload> for NewUser {
    fn from(payload: UserPayload) -> Self {
        Self {
            username: payload.username,
            password: payload.password,
            display_name: payload.display_name,
        }
    }
}

#[track_caller]
pub(super) fn map_store_error(error: UserStoreError) -> HttpError {
    match error {
        UserStoreError::AlreadyExists | UserStoreError::BlogAlreadyExists => HttpError::conflict().err()(error),
        UserStoreError::DoesNotExist | UserStoreError::BlogDoesNotExist => HttpError::not_found().err()(error),
        UserStoreError::UsernameEmpty | UserStoreError::PasswordEmpty | UserStoreError::BlogSlugEmpty => {
            HttpError::bad_request().err()(error)
        }
        UserStoreError::Internal(_) => HttpError::internal().err()(error),
    }
}

pub(crate) async fn create_user(
    State(state): State<AdminState>,
    Json(payload): Json<UserPayload>,
) -> Result<StatusCode, HttpError> {
    let username = payload.username.clone();

    state
        .users
        .create_user(payload.into())
        .await
        .map_err(map_store_error)?;

    info!(%username, "Created user");

    Ok(StatusCode::OK)
}

pub(crate) async fn update_user(
    State(state): State<AdminState>,
    SessionUser(session): SessionUser,
    Json(payload): Json<UserPayload>,
) -> Result<StatusCode, HttpError> {
    if session.username != payload.username {
        return Err(HttpError::forbidden().msg("you cannot update this user"));
    }

    state
        .users
        .update_user(payload.into())
        .await
        .map_err(map_store_error)?;

    info!(username = %session.username, "Updated user");

    Ok(StatusCode::OK)
}

pub(crate) async fn get_user(
    State(state): State<AdminState>,
    Path(username): Path<String>,
) -> Result<Json<UserProfile>, HttpError> {
    let profile = state
        .users
        .get_user(&username)
        .await
        .map_err(map_store_error)?
        .ok_or_else(|| HttpError::not_found().msg("user does not exist"))?;

    Ok(Json(profile))
}

pub(crate) async fn whoami(
    State(state): State<AdminState>,
    SessionUser(session): SessionUser,
) -> Result<Json<UserProfile>, HttpError> {
    let profile = state
        .users
        .get_user(&session.username)
        .await
        .map_err(map_store_error)?
        .ok_or_else(|| HttpError::not_found().msg("user does not exist"))?;

    Ok(Json(profile))
}

pub(crate) async fn delete_user(
    State(state): State<AdminState>,
    SessionUser(session): SessionUser,
    Path(username): Path<String>,
) -> Result<StatusCode, HttpError> {
    if session.username != username {
        return Err(HttpError::forbidden().msg("you cannot delete this user"));
    }

    state.users.delete_user(&username).await.map_err(map_store_error)?;

    // The session must not outlive its user.
    state
        .sessions
        .delete(&session.sid)
        .await
        .map_err(HttpError::internal().err())?;

    info!(%username, "Deleted user");

    Ok(StatusCode::OK)
}
