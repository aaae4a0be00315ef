//! Pending proof commitments, keyed by a random 64-bit commit-id.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use num_bigint::BigUint;
use rand::Rng;

use crate::error::{CoreError, Result};

#[derive(Default)]
pub struct CommitmentStore {
    inner: Mutex<HashMap<u64, BigUint>>,
}

impl CommitmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, BigUint>> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("commitment store mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Store a commit secret under a fresh random id. Collisions over a
    /// uniformly random 64-bit space are negligible.
    pub fn insert(&self, commit_secret: BigUint) -> u64 {
        let commit_id: u64 = rand::thread_rng().gen();
        self.lock().insert(commit_id, commit_secret);
        commit_id
    }

    /// Remove and return the commit secret. Exactly one caller can win;
    /// everyone else gets [`CoreError::UnknownCommit`].
    pub fn consume(&self, commit_id: u64) -> Result<BigUint> {
        self.lock()
            .remove(&commit_id)
            .ok_or(CoreError::UnknownCommit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_is_one_shot() {
        let store = CommitmentStore::new();
        let id = store.insert(BigUint::from(42u8));
        assert_eq!(store.consume(id).unwrap(), BigUint::from(42u8));
        assert!(matches!(
            store.consume(id),
            Err(CoreError::UnknownCommit)
        ));
    }

    #[test]
    fn concurrent_sessions_get_distinct_ids() {
        let store = CommitmentStore::new();
        let a = store.insert(BigUint::from(1u8));
        let b = store.insert(BigUint::from(2u8));
        assert_ne!(a, b);
        assert_eq!(store.consume(a).unwrap(), BigUint::from(1u8));
        assert_eq!(store.consume(b).unwrap(), BigUint::from(2u8));
    }

    #[test]
    fn unknown_id_is_unknown_commit() {
        let store = CommitmentStore::new();
        assert!(matches!(
            store.consume(0xdead_beef),
            Err(CoreError::UnknownCommit)
        ));
    }
}
