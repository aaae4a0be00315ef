//! Outstanding authentication challenges, keyed by token-id.
//!
//! Each challenge is consumed exactly once; whatever is never consumed lives
//! until process restart. Entries are 64 bytes, so there is no pressure to
//! persist or sweep them.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::{CoreError, Result};
use crate::secrets::TOKEN_ID_SIZE;

/// Size of an authentication challenge.
pub const CHALLENGE_SIZE: usize = 32;

#[derive(Default)]
pub struct ChallengeStore {
    inner: Mutex<HashMap<[u8; TOKEN_ID_SIZE], [u8; CHALLENGE_SIZE]>>,
}

impl ChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<[u8; TOKEN_ID_SIZE], [u8; CHALLENGE_SIZE]>> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("challenge store mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Issue a fresh challenge for the given token-id, replacing any
    /// outstanding one.
    pub fn issue(&self, token_id: &[u8; TOKEN_ID_SIZE]) -> Result<[u8; CHALLENGE_SIZE]> {
        let mut challenge = [0u8; CHALLENGE_SIZE];
        getrandom::getrandom(&mut challenge)
            .map_err(|e| CoreError::Crypto(format!("random challenge: {e}")))?;
        self.lock().insert(*token_id, challenge);
        Ok(challenge)
    }

    /// Remove and return the outstanding challenge, if any.
    pub fn consume(&self, token_id: &[u8; TOKEN_ID_SIZE]) -> Option<[u8; CHALLENGE_SIZE]> {
        self.lock().remove(token_id)
    }
}
