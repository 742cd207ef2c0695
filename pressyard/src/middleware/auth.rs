use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use axum_extra::extract::CookieJar;

use crate::api::AdminState;
use crate::cookie::AUTH_COOKIE_NAME;
use crate::http::HttpError;
use crate::session::Session;

/// The session the gate resolved for this request, if any.
#[derive(Debug, Clone)]
pub struct CurrentSession(pub Session);

/// Converts the auth cookie into a [`CurrentSession`] request extension.
///
/// A missing cookie, an undecodable cookie and an expired or unknown
/// session all leave the request unauthenticated; handlers that require a
/// session reject through the [`crate::extract::SessionUser`] extractor.
pub async fn session_middleware(
    State(state): State<AdminState>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Result<Response, HttpError> {
    if let Some(cookie) = jar.get(AUTH_COOKIE_NAME) {
        if let Some(sid) = state.cookie_codec.decode(cookie.value()) {
            match state.sessions.get(&sid).await {
                Ok(Some(session)) => {
                    request.extensions_mut().insert(CurrentSession(session));
                }
                Ok(None) => {
                    trace!("cookie references an expired or unknown session");
                }
                Err(error) => {
                    return Err(HttpError::internal().err()(error.context("session lookup failed")));
                }
            }
        }
    }

    Ok(next.run(request).await)
}
