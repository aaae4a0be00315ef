//! Shared handler helpers.

use base64::prelude::*;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::de::DeserializeOwned;

use crate::error::ApiError;

/// Parse a JSON request body. Bodies are taken as raw strings so that every
/// parse failure maps to a 400 rather than an extractor-specific status.
pub fn parse_json<T: DeserializeOwned>(body: &str) -> Result<T, ApiError> {
    serde_json::from_str(body)
        .map_err(|e| ApiError::MalformedRequest(format!("invalid request body: {e}")))
}

pub fn decode_b64(value: &str) -> Result<Vec<u8>, ApiError> {
    BASE64_STANDARD
        .decode(value)
        .map_err(|_| ApiError::MalformedRequest("invalid base64".to_string()))
}

pub fn random_alphanumeric(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
