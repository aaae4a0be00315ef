//! Per-user proof session bookkeeping.
//!
//! `getCommitments` parks the commit-id and key-id it handed out;
//! `getResponse` picks them back up by username. Entries expire after the
//! access-token lifetime and a background task sweeps them out so abandoned
//! sessions do not accumulate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use keyshare_core::keys::PublicKeyIdentifier;

#[derive(Debug, Clone)]
struct ProofSession {
    commit_id: u64,
    key_id: PublicKeyIdentifier,
    created: Instant,
}

#[derive(Clone)]
pub struct ProofSessions {
    inner: Arc<Mutex<HashMap<String, ProofSession>>>,
    ttl: Duration,
}

impl ProofSessions {
    pub fn new(ttl: Duration) -> Self {
        ProofSessions {
            inner: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ProofSession>> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("proof session mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Record the session state for a user, replacing any previous one.
    pub fn start(&self, username: &str, commit_id: u64, key_id: PublicKeyIdentifier) {
        self.lock().insert(
            username.to_string(),
            ProofSession {
                commit_id,
                key_id,
                created: Instant::now(),
            },
        );
    }

    /// Look up the live session for a user. Expired entries count as absent.
    pub fn get(&self, username: &str) -> Option<(u64, PublicKeyIdentifier)> {
        let mut sessions = self.lock();
        match sessions.get(username) {
            Some(session) if session.created.elapsed() < self.ttl => {
                Some((session.commit_id, session.key_id.clone()))
            }
            Some(_) => {
                sessions.remove(username);
                None
            }
            None => None,
        }
    }

    /// Drop every expired session; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|_, session| session.created.elapsed() < self.ttl);
        before - sessions.len()
    }

    /// Spawn the periodic sweep task.
    pub fn spawn_sweeper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let sessions = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip the immediate first tick
            loop {
                ticker.tick().await;
                let removed = sessions.sweep();
                if removed > 0 {
                    tracing::debug!(removed, "swept expired proof sessions");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_id() -> PublicKeyIdentifier {
        "test.test-3".parse().unwrap()
    }

    #[test]
    fn start_then_get() {
        let sessions = ProofSessions::new(Duration::from_secs(60));
        sessions.start("alice", 42, key_id());
        let (commit_id, kid) = sessions.get("alice").unwrap();
        assert_eq!(commit_id, 42);
        assert_eq!(kid, key_id());
        assert!(sessions.get("bob").is_none());
    }

    #[test]
    fn newer_session_replaces_older() {
        let sessions = ProofSessions::new(Duration::from_secs(60));
        sessions.start("alice", 1, key_id());
        sessions.start("alice", 2, key_id());
        assert_eq!(sessions.get("alice").unwrap().0, 2);
    }

    #[test]
    fn expired_sessions_are_absent_and_swept() {
        let sessions = ProofSessions::new(Duration::from_millis(0));
        sessions.start("alice", 1, key_id());
        assert!(sessions.get("alice").is_none());

        sessions.start("bob", 2, key_id());
        assert_eq!(sessions.sweep(), 1);
    }
}
