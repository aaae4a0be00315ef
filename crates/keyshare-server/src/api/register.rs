//! Enrollment endpoint.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use keyshare_core::secrets::parse_client_key;
use keyshare_core::tokens;

use super::helpers::{decode_b64, parse_json, random_alphanumeric};
use crate::db::{DbError, User};
use crate::email;
use crate::error::ApiError;
use crate::state::AppState;

const USERNAME_LENGTH: usize = 12;
const USERNAME_ATTEMPTS: usize = 3;

/// Either a legacy plain enrollment or a JWT self-signed under the key it
/// registers. Supplying both forms at once is malformed.
#[derive(Debug, Deserialize)]
struct EnrollmentRequest {
    #[serde(default)]
    jwt: Option<String>,
    #[serde(default)]
    pin: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EnrollmentClaims {
    pin: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    language: String,
    /// base64 of the SEC1-encoded P-256 public key
    publickey: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct EnrollmentResult {
    username: String,
}

/// POST /client/register
pub async fn register(
    State(state): State<Arc<AppState>>,
    body: String,
) -> Result<Json<EnrollmentResult>, ApiError> {
    let request: EnrollmentRequest = parse_json(&body)?;

    let (pin, email_address, language, client_key) = match (request.jwt, request.pin) {
        (Some(_), Some(_)) => {
            return Err(ApiError::MalformedRequest(
                "both jwt and plain enrollment supplied".to_string(),
            ))
        }
        (None, None) => {
            return Err(ApiError::MalformedRequest(
                "missing enrollment payload".to_string(),
            ))
        }
        (None, Some(pin)) => (
            pin,
            request.email,
            request.language.unwrap_or_default(),
            None,
        ),
        (Some(jwt), None) => {
            let peeked: EnrollmentClaims = tokens::peek_claims(&jwt)
                .map_err(|_| ApiError::MalformedRequest("unparsable enrollment jwt".to_string()))?;
            let key_bytes = decode_b64(&peeked.publickey)?;
            let key = parse_client_key(&key_bytes)
                .map_err(|_| ApiError::MalformedRequest("malformed public key".to_string()))?;

            // Proof of possession: the JWT must verify under the key it
            // carries.
            let claims: EnrollmentClaims = tokens::verify_client_jwt(&jwt, &key)
                .map_err(|e| ApiError::Internal(e.into()))?;
            (claims.pin, claims.email, claims.language, Some(key))
        }
    };

    let secrets = state.core.new_user_secrets(&pin, client_key.as_ref())?;

    // Usernames are generated server-side; retry the negligible collisions.
    let mut user = None;
    for _ in 0..USERNAME_ATTEMPTS {
        let candidate = User {
            username: random_alphanumeric(USERNAME_LENGTH),
            language: language.clone(),
            secrets: secrets.clone(),
        };
        match state.db.add_user(&candidate).await {
            Ok(()) => {
                user = Some(candidate);
                break;
            }
            Err(DbError::UserAlreadyExists) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    let user = user.ok_or_else(|| {
        ApiError::Internal(anyhow::anyhow!("could not allocate a unique username"))
    })?;

    tracing::info!(username = %user.username, upgraded = client_key.is_some(), "enrolled new user");

    if let Some(address) = &email_address {
        email::schedule_verification(
            state.db.as_ref(),
            state.mailer.as_ref(),
            &state.email,
            &user,
            address,
            &state.keyshare_attribute,
        )
        .await?;
    }

    Ok(Json(EnrollmentResult {
        username: user.username,
    }))
}
