//! Errors crossing the HTTP boundary.
//!
//! One status per failure class: malformed protocol input 400, missing or
//! invalid session 401, acting on someone else's resource 403, unknown
//! resource 404, duplicate creation 409, and everything internal
//! (backpressure, transient store or subprocess failures) 500. The
//! original error chain is logged on the way out together with the
//! construction site; the response body stays empty so nothing internal
//! leaks to the client.

use core::fmt;
use core::panic::Location;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

pub struct HttpError {
    code: StatusCode,
    loc: &'static Location<'static>,
    msg: Option<&'static str>,
    source: Option<anyhow::Error>,
}

impl HttpError {
    #[track_caller]
    fn with_code(code: StatusCode) -> Self {
        Self {
            code,
            loc: Location::caller(),
            msg: None,
            source: None,
        }
    }

    /// Validation failures: bad framing, bad parameters.
    #[track_caller]
    pub fn bad_request() -> Self {
        Self::with_code(StatusCode::BAD_REQUEST)
    }

    /// No session, or one that does not decode or resolve.
    #[track_caller]
    pub fn unauthorized() -> Self {
        Self::with_code(StatusCode::UNAUTHORIZED)
    }

    /// Authenticated, but the resource belongs to somebody else.
    #[track_caller]
    pub fn forbidden() -> Self {
        Self::with_code(StatusCode::FORBIDDEN)
    }

    #[track_caller]
    pub fn not_found() -> Self {
        Self::with_code(StatusCode::NOT_FOUND)
    }

    /// The resource already exists.
    #[track_caller]
    pub fn conflict() -> Self {
        Self::with_code(StatusCode::CONFLICT)
    }

    /// Transient and backpressure failures surface here; the client can
    /// only retry.
    #[track_caller]
    pub fn internal() -> Self {
        Self::with_code(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn msg(mut self, msg: &'static str) -> Self {
        self.msg = Some(msg);
        self
    }

    /// For `map_err`: attaches the underlying error as the logged cause.
    pub fn err<T: Into<anyhow::Error>>(self) -> impl FnOnce(T) -> Self {
        move |source| Self {
            source: Some(source.into()),
            ..self
        }
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.msg {
            Some(msg) => write!(f, "{msg} ({}, from {})", self.code, self.loc)?,
            None => write!(f, "{} from {}", self.code, self.loc)?,
        }

        if let Some(source) = &self.source {
            // Alternate anyhow formatting carries the whole cause chain.
            write!(f, ": {source:#}")?;
        }

        Ok(())
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        // Client-side rejections are routine (every unauthenticated probe
        // is one); only our own failures deserve an error-level entry.
        if self.code.is_server_error() {
            error!(error = %self, "Request failed");
        } else {
            debug!(error = %self, "Request rejected");
        }

        self.code.into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_message_status_and_cause() {
        let error = HttpError::unauthorized().msg("authentication required");
        let rendered = error.to_string();

        assert!(rendered.starts_with("authentication required (401 Unauthorized, from "));

        let cause = anyhow::anyhow!("socket closed").context("session lookup failed");
        let error = HttpError::internal().err()(cause);
        let rendered = error.to_string();

        assert!(rendered.contains("500 Internal Server Error"));
        assert!(rendered.ends_with("session lookup failed: socket closed"));
    }
}
