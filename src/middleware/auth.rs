use axum::{
    body::Body,
    extract::Extension,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use thiserror::Error;

use crate::error::HttpError;
use crate::impl_into_response;

const API_KEY_HEADER: &str = "X-API-Key";

/// Key guarding the admin routes; `None` leaves them open
#[derive(Clone)]
pub struct AdminApiKey(pub Option<String>);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    #[error("API key required. Provide X-API-Key header.")]
    Missing,

    #[error("Invalid API key")]
    Invalid,
}

impl HttpError for AuthError {
    fn status_code(&self) -> StatusCode {
        StatusCode::UNAUTHORIZED
    }

    fn error_code(&self) -> Option<&'static str> {
        match self {
            Self::Missing => Some("MISSING_API_KEY"),
            Self::Invalid => Some("INVALID_API_KEY"),
        }
    }
}

impl_into_response!(AuthError);

fn check_key(headers: &HeaderMap, expected: &str) -> Result<(), AuthError> {
    let provided = headers
        .get(API_KEY_HEADER)
        .ok_or(AuthError::Missing)?
        .to_str()
        .map_err(|_| AuthError::Invalid)?;

    if provided == expected {
        Ok(())
    } else {
        Err(AuthError::Invalid)
    }
}

/// Admin route guard (manual resets, reset pass triggers)
pub async fn require_api_key(
    Extension(AdminApiKey(expected)): Extension<AdminApiKey>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, AuthError> {
    if let Some(expected) = expected.as_deref() {
        if let Err(e) = check_key(request.headers(), expected) {
            tracing::warn!(path = %request.uri().path(), error = %e, "Rejected admin request");
            return Err(e);
        }
    }
    Ok(next.run(request).await)
}
