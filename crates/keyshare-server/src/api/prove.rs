//! Proof participation endpoints.
//!
//! Both endpoints authenticate through the username header plus an access
//! token in `Authorization`. Header checks come before anything else so a
//! request that cannot be attributed to a user is a 403 regardless of body.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use num_bigint::BigUint;
use serde::Serialize;
use std::sync::Arc;

use keyshare_core::keys::PublicKeyIdentifier;
use keyshare_core::proofs::ProofPCommitment;

use super::helpers::parse_json;
use crate::db::EventKind;
use crate::error::ApiError;
use crate::state::AppState;

const USERNAME_HEADER: &str = "X-IRMA-Keyshare-Username";

#[derive(Debug, Serialize)]
pub(crate) struct CommitmentsResponse {
    commitments: Vec<ProofPCommitment>,
    #[serde(rename = "commitID")]
    commit_id: u64,
}

fn require_proof_headers(headers: &HeaderMap) -> Result<(String, String), ApiError> {
    let username = headers
        .get(USERNAME_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::MissingAuthorization)?;
    let authorization = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::MissingAuthorization)?;
    Ok((username.to_string(), authorization.to_string()))
}

/// POST /prove/getCommitments
///
/// Body: JSON list of issuer key ids. Returns the commitment contributions
/// plus the commit-id the client has to finish the session with.
pub async fn get_commitments(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<CommitmentsResponse>, ApiError> {
    let (username, authorization) = require_proof_headers(&headers)?;
    let user = state.db.user(&username).await?;

    let key_ids: Vec<PublicKeyIdentifier> = parse_json(&body)?;
    if key_ids.is_empty() {
        return Err(ApiError::MalformedRequest(
            "at least one key id required".to_string(),
        ));
    }

    let (commitments, commit_id) =
        state
            .core
            .generate_commitments(&user.secrets, &authorization, &key_ids)?;

    state
        .sessions
        .start(&username, commit_id, key_ids[0].clone());

    Ok(Json(CommitmentsResponse {
        commitments,
        commit_id,
    }))
}

/// POST /prove/getResponse
///
/// Body: the proof challenge as a decimal integer. The commit-id and key-id
/// come from the session recorded by the preceding getCommitments call.
pub async fn get_response(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<String, ApiError> {
    let (username, authorization) = require_proof_headers(&headers)?;
    let user = state.db.user(&username).await?;

    let challenge: BigUint = body.trim().parse().map_err(|_| {
        ApiError::MalformedRequest("challenge must be a non-negative decimal integer".to_string())
    })?;

    let (commit_id, key_id) = state
        .sessions
        .get(&username)
        .ok_or_else(|| ApiError::MalformedRequest("no active proof session".to_string()))?;

    let proof_jwt = state.core.generate_response(
        &user.secrets,
        &authorization,
        commit_id,
        &challenge,
        &key_id,
    )?;

    state.db.add_log(&user, EventKind::IrmaSession, None).await?;
    state.db.set_seen(&user).await?;

    Ok(proof_jwt)
}
