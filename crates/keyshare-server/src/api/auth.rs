//! Authentication endpoints: start-auth, PIN verification (legacy and
//! challenge-response), PIN change, and the one-shot public-key upgrade.

use axum::{extract::State, Json};
use base64::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use keyshare_core::error::CoreError;
use keyshare_core::secrets::parse_client_key;
use keyshare_core::tokens;

use super::helpers::{decode_b64, parse_json};
use crate::db::{EventKind, User};
use crate::error::ApiError;
use crate::pin::{reserve_attempt, PinAttempt, PinStatus};
use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct StartAuthRequest {
    id: String,
    #[serde(default)]
    jwt: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct AuthChallenge {
    status: &'static str,
    candidates: Vec<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    challenge: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PinRequest {
    id: String,
    pin: String,
}

#[derive(Debug, Deserialize)]
struct ChallengeResponseRequest {
    username: String,
    pin: String,
    /// base64 DER signature over the canonical challenge serialization
    response: String,
}

#[derive(Debug, Deserialize)]
struct ChangePinRequest {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    oldpin: Option<String>,
    #[serde(default)]
    newpin: Option<String>,
    #[serde(default)]
    jwt: Option<String>,
}

/// Claims of the signed change-pin JWT; only `id` is needed here to find the
/// user, the core re-verifies the full payload.
#[derive(Debug, Deserialize)]
struct ChangePinPeek {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RegisterKeyRequest {
    jwt: String,
}

#[derive(Debug, Deserialize)]
struct PublicKeyRegistrationClaims {
    username: String,
    pin: String,
    /// base64 of the SEC1-encoded P-256 public key
    publickey: String,
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /users/start_auth
///
/// With a valid access token the caller is already authorized. Otherwise a
/// fresh 32-byte challenge is issued for the challenge-response flow.
pub async fn start_auth(
    State(state): State<Arc<AppState>>,
    body: String,
) -> Result<Json<AuthChallenge>, ApiError> {
    let request: StartAuthRequest = parse_json(&body)?;
    let user = state.db.user(&request.id).await?;

    if let Some(jwt) = &request.jwt {
        if state.core.validate_access(&user.secrets, jwt).is_ok() {
            return Ok(Json(AuthChallenge {
                status: "authorized",
                candidates: vec![],
                challenge: None,
            }));
        }
        // an invalid or expired token just falls back to a fresh challenge
    }

    let challenge = state.core.generate_challenge(&user.secrets)?;
    Ok(Json(AuthChallenge {
        status: "invalid",
        candidates: vec!["ecdsa"],
        challenge: Some(BASE64_STANDARD.encode(challenge)),
    }))
}

/// POST /users/verify/pin (legacy, PIN-only users)
pub async fn verify_pin(
    State(state): State<Arc<AppState>>,
    body: String,
) -> Result<Json<PinStatus>, ApiError> {
    let request: PinRequest = parse_json(&body)?;
    let user = state.db.user(&request.id).await?;
    verify_pin_inner(&state, &user, &request.pin, None).await
}

/// POST /users/verify/pin_challengeresponse
pub async fn verify_pin_challenge_response(
    State(state): State<Arc<AppState>>,
    body: String,
) -> Result<Json<PinStatus>, ApiError> {
    let request: ChallengeResponseRequest = parse_json(&body)?;
    let user = state.db.user(&request.username).await?;
    let response = decode_b64(&request.response)?;
    verify_pin_inner(&state, &user, &request.pin, Some(response)).await
}

async fn verify_pin_inner(
    state: &AppState,
    user: &User,
    pin: &str,
    response: Option<Vec<u8>>,
) -> Result<Json<PinStatus>, ApiError> {
    let (remaining, wait) = match reserve_attempt(state.db.as_ref(), user).await? {
        PinAttempt::Blocked { wait } => return Ok(Json(PinStatus::blocked(wait))),
        PinAttempt::Allowed { remaining, wait } => (remaining, wait),
    };

    match state
        .core
        .validate_pin_auth(&user.secrets, pin, response.as_deref())
    {
        Ok(token) => {
            state.db.reset_pin_tries(user).await?;
            state.db.set_seen(user).await?;
            state
                .db
                .add_log(user, EventKind::PinCheckSuccess, None)
                .await?;
            Ok(Json(PinStatus::success(token)))
        }
        Err(CoreError::InvalidPin) => {
            state
                .db
                .add_log(user, EventKind::PinCheckFailed, Some(remaining as i64))
                .await?;
            if remaining == 0 {
                Ok(Json(PinStatus::blocked(wait)))
            } else {
                Ok(Json(PinStatus::failure(remaining)))
            }
        }
        Err(err) => {
            state
                .db
                .add_log(user, EventKind::PinCheckFailed, None)
                .await?;
            Err(err.into())
        }
    }
}

/// POST /users/change/pin
pub async fn change_pin(
    State(state): State<Arc<AppState>>,
    body: String,
) -> Result<Json<PinStatus>, ApiError> {
    let request: ChangePinRequest = parse_json(&body)?;

    let (username, form) = match (request.jwt, request.id) {
        (Some(_), Some(_)) => {
            return Err(ApiError::MalformedRequest(
                "both jwt and plain change-pin supplied".to_string(),
            ))
        }
        (None, None) => {
            return Err(ApiError::MalformedRequest(
                "missing change-pin payload".to_string(),
            ))
        }
        (None, Some(id)) => {
            let oldpin = request.oldpin.ok_or_else(|| {
                ApiError::MalformedRequest("missing oldpin".to_string())
            })?;
            let newpin = request.newpin.ok_or_else(|| {
                ApiError::MalformedRequest("missing newpin".to_string())
            })?;
            (id, ChangePinForm::Legacy { oldpin, newpin })
        }
        (Some(jwt), None) => {
            let peeked: ChangePinPeek = tokens::peek_claims(&jwt)
                .map_err(|_| ApiError::MalformedRequest("unparsable change-pin jwt".to_string()))?;
            (peeked.id, ChangePinForm::Signed { jwt })
        }
    };

    let user = state.db.user(&username).await?;

    let (remaining, wait) = match reserve_attempt(state.db.as_ref(), &user).await? {
        PinAttempt::Blocked { wait } => return Ok(Json(PinStatus::blocked(wait))),
        PinAttempt::Allowed { remaining, wait } => (remaining, wait),
    };

    let result = match &form {
        ChangePinForm::Legacy { oldpin, newpin } => {
            state.core.change_pin_legacy(&user.secrets, oldpin, newpin)
        }
        ChangePinForm::Signed { jwt } => state.core.change_pin_signed(&user.secrets, jwt),
    };

    match result {
        Ok(new_secrets) => {
            let updated = User {
                secrets: new_secrets,
                ..user.clone()
            };
            state.db.update_user(&updated).await?;
            state.db.reset_pin_tries(&user).await?;
            state.db.add_log(&user, EventKind::PinChange, None).await?;
            tracing::info!(username = %user.username, "pin changed");
            Ok(Json(PinStatus::success("")))
        }
        Err(CoreError::InvalidPin) => {
            state
                .db
                .add_log(&user, EventKind::PinCheckFailed, Some(remaining as i64))
                .await?;
            if remaining == 0 {
                Ok(Json(PinStatus::blocked(wait)))
            } else {
                Ok(Json(PinStatus::failure(remaining)))
            }
        }
        Err(err) => {
            state
                .db
                .add_log(&user, EventKind::PinCheckFailed, None)
                .await?;
            Err(err.into())
        }
    }
}

enum ChangePinForm {
    Legacy { oldpin: String, newpin: String },
    Signed { jwt: String },
}

/// POST /users/register_publickey
///
/// One-shot upgrade from PIN-only to challenge-response authentication. The
/// JWT must be self-signed under the key it registers.
pub async fn register_public_key(
    State(state): State<Arc<AppState>>,
    body: String,
) -> Result<Json<PinStatus>, ApiError> {
    let request: RegisterKeyRequest = parse_json(&body)?;

    let peeked: PublicKeyRegistrationClaims = tokens::peek_claims(&request.jwt)
        .map_err(|_| ApiError::MalformedRequest("unparsable registration jwt".to_string()))?;
    let key_bytes = decode_b64(&peeked.publickey)?;
    let key = parse_client_key(&key_bytes)
        .map_err(|_| ApiError::MalformedRequest("malformed public key".to_string()))?;

    // proof of possession of the registered key
    let claims: PublicKeyRegistrationClaims =
        tokens::verify_client_jwt(&request.jwt, &key).map_err(|_| ApiError::InvalidToken)?;

    let user = state.db.user(&claims.username).await?;

    let (remaining, _wait) = match reserve_attempt(state.db.as_ref(), &user).await? {
        PinAttempt::Blocked { wait } => return Ok(Json(PinStatus::blocked(wait))),
        PinAttempt::Allowed { remaining, wait } => (remaining, wait),
    };

    match state
        .core
        .register_public_key(&user.secrets, &claims.pin, &key)
    {
        Ok((token, new_secrets)) => {
            let updated = User {
                secrets: new_secrets,
                ..user.clone()
            };
            state.db.update_user(&updated).await?;
            state.db.reset_pin_tries(&user).await?;
            state.db.set_seen(&user).await?;
            state
                .db
                .add_log(&user, EventKind::PinCheckSuccess, None)
                .await?;
            tracing::info!(username = %user.username, "registered client public key");
            Ok(Json(PinStatus::success(token)))
        }
        Err(err) => {
            if matches!(err, CoreError::InvalidPin) {
                state
                    .db
                    .add_log(&user, EventKind::PinCheckFailed, Some(remaining as i64))
                    .await?;
            }
            // A wrong PIN on this endpoint is not answered with a retry
            // envelope; the upgrade either happens or it does not.
            Err(ApiError::Internal(err.into()))
        }
    }
}
