use axum::Form;
use axum::extract::State;
use axum::http::StatusCode;
use axum_extra::extract::CookieJar;
use serde::Deserialize;
use time::OffsetDateTime;

use crate::api::AdminState;
use crate::cookie::{SESSION_LIFETIME, auth_cookie, reset_auth_cookie};
use crate::extract::SessionUser;
use crate::http::HttpError;
use crate::session::{Session, generate_session_id};

#[derive(Deserialize)]
pub(crate) struct LoginForm {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

/// Logs a user in and sets the auth cookie.
///
/// With empty credentials this is the session refresh endpoint: a valid
/// cookie gets its session and cookie expiration re-stamped, anything else
/// is a 401. The worker leans on this before reusing a queued cookie.
pub(crate) async fn login(
    State(state): State<AdminState>,
    session: Option<SessionUser>,
    jar: CookieJar,
    Form(form): Form<LoginForm>,
) -> Result<(CookieJar, StatusCode), HttpError> {
    if form.username.is_empty() && form.password.is_empty() {
        let Some(SessionUser(mut session)) = session else {
            return Err(HttpError::unauthorized().msg("no session to refresh"));
        };

        session.expires_at = OffsetDateTime::now_utc() + SESSION_LIFETIME;

        state
            .sessions
            .set(session.clone())
            .await
            .map_err(HttpError::internal().err())?;

        let encoded = state
            .cookie_codec
            .encode(&session.sid)
            .map_err(HttpError::internal().err())?;

        debug!(username = %session.username, "Refreshed session");

        return Ok((jar.add(auth_cookie(encoded, session.expires_at)), StatusCode::OK));
    }

    let authenticated = state
        .users
        .authenticate_user(&form.username, &form.password)
        .await
        .map_err(HttpError::internal().err())?;

    if !authenticated {
        return Err(HttpError::unauthorized().msg("invalid username or password"));
    }

    let session = Session {
        sid: generate_session_id(),
        username: form.username,
        expires_at: OffsetDateTime::now_utc() + SESSION_LIFETIME,
    };

    state
        .sessions
        .set(session.clone())
        .await
        .map_err(HttpError::internal().err())?;

    let encoded = state
        .cookie_codec
        .encode(&session.sid)
        .map_err(HttpError::internal().err())?;

    info!(username = %session.username, sid = %session.sid, "Created new session");

    Ok((jar.add(auth_cookie(encoded, session.expires_at)), StatusCode::OK))
}

pub(crate) async fn logout(
    State(state): State<AdminState>,
    SessionUser(session): SessionUser,
    jar: CookieJar,
) -> Result<(CookieJar, StatusCode), HttpError> {
    state
        .sessions
        .delete(&session.sid)
        .await
        .map_err(HttpError::internal().err())?;

    info!(username = %session.username, sid = %session.sid, "User logged out, destroying session");

    Ok((jar.add(reset_auth_cookie()), StatusCode::OK))
}
