//! HTTP error mapping.
//!
//! Domain outcomes (wrong PIN, blocked user) never pass through here; they
//! are answered as 200-level `PinStatus` envelopes by the handlers. This type
//! covers everything that is an actual request or server failure.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use keyshare_core::error::CoreError;

use crate::db::DbError;

#[derive(Debug)]
pub enum ApiError {
    /// Unparsable or self-contradictory request body.
    MalformedRequest(String),
    /// Invalid or expired token, or a client signature that does not verify.
    InvalidToken,
    /// Unknown user on an identified endpoint.
    UserNotFound,
    /// Missing username/authorization header pair on a proof endpoint.
    MissingAuthorization,
    /// Server-side failure; details are logged, never returned.
    Internal(anyhow::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::MalformedRequest(_) | ApiError::InvalidToken => StatusCode::BAD_REQUEST,
            ApiError::UserNotFound | ApiError::MissingAuthorization => StatusCode::FORBIDDEN,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::MalformedRequest(msg) => msg.clone(),
            ApiError::InvalidToken => "invalid token".to_string(),
            ApiError::UserNotFound => "user not found".to_string(),
            ApiError::MissingAuthorization => "missing authorization".to_string(),
            ApiError::Internal(_) => "internal server error".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(err) = &self {
            tracing::error!(error = %err, "request failed");
        }
        let body = serde_json::json!({ "error": self.message() });
        (self.status(), Json(body)).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            // Client referenced state the server does not hold, or shipped a
            // token/challenge that cannot be honored.
            CoreError::InvalidJwt | CoreError::ExpiredJwt => ApiError::InvalidToken,
            CoreError::UnknownCommit
            | CoreError::KeyNotFound
            | CoreError::InvalidChallenge
            | CoreError::PinTooLong => ApiError::MalformedRequest(err.to_string()),
            // Wrong PINs are answered as PinStatus envelopes before this
            // conversion ever runs.
            CoreError::InvalidPin
            | CoreError::ChallengeResponseRequired
            | CoreError::PublicKeyAlreadySet
            | CoreError::DecryptionFailed
            | CoreError::KeyRegistry(_)
            | CoreError::Crypto(_) => ApiError::Internal(err.into()),
        }
    }
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::UserNotFound => ApiError::UserNotFound,
            other => ApiError::Internal(other.into()),
        }
    }
}
