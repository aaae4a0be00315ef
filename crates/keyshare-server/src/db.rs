//! Persistent user store interface and the in-memory implementation.
//!
//! PIN-retry bookkeeping lives behind this trait on purpose: reserve and
//! reset must be atomic per user so that two concurrent wrong PINs each
//! consume exactly one try. The in-memory store gets this from a single lock;
//! an external database must provide the same guarantee itself.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use keyshare_core::secrets::EncryptedSecrets;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("user not found")]
    UserNotFound,
    #[error("username already taken")]
    UserAlreadyExists,
    #[error("storage failure: {0}")]
    Storage(String),
}

#[derive(Debug, Clone)]
pub struct User {
    pub username: String,
    pub language: String,
    pub secrets: EncryptedSecrets,
}

/// Log entry kinds recorded per user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    PinCheckSuccess,
    PinCheckFailed,
    PinCheckBlocked,
    PinChange,
    IrmaSession,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PinCheckSuccess => "PIN_CHECK_SUCCESS",
            EventKind::PinCheckFailed => "PIN_CHECK_FAILED",
            EventKind::PinCheckBlocked => "PIN_CHECK_BLOCKED",
            EventKind::PinChange => "PIN_CHANGE",
            EventKind::IrmaSession => "IRMA_SESSION",
        }
    }
}

/// Outcome of reserving a PIN attempt.
#[derive(Debug, Clone, Copy)]
pub struct PinReservation {
    /// False when the user is currently blocked; no PIN check may happen.
    pub allowed: bool,
    /// Tries left after this one, valid when `allowed`.
    pub remaining_tries: u64,
    /// Seconds until the block lifts (when blocked, or when this reservation
    /// is the last try before blocking).
    pub wait_seconds: u64,
}

#[async_trait]
pub trait Db: Send + Sync {
    /// Insert a new user; usernames are unique.
    async fn add_user(&self, user: &User) -> Result<(), DbError>;
    async fn user(&self, username: &str) -> Result<User, DbError>;
    async fn update_user(&self, user: &User) -> Result<(), DbError>;

    /// Atomically reserve one PIN attempt for the user.
    async fn reserve_pin_try(&self, user: &User) -> Result<PinReservation, DbError>;
    /// Clear the retry counter after a successful PIN check.
    async fn reset_pin_tries(&self, user: &User) -> Result<(), DbError>;

    async fn set_seen(&self, user: &User) -> Result<(), DbError>;
    async fn add_log(
        &self,
        user: &User,
        event: EventKind,
        param: Option<i64>,
    ) -> Result<(), DbError>;
    async fn add_email_verification(
        &self,
        user: &User,
        email: &str,
        token: &str,
    ) -> Result<(), DbError>;
}

// ============================================================================
// In-memory implementation
// ============================================================================

/// Tries a user gets before being blocked.
pub const MAX_PIN_TRIES: u64 = 3;
/// Base block duration; doubles with every further exhausted window.
const BASE_BLOCK_SECONDS: i64 = 60;
const MAX_BLOCK_DOUBLINGS: u32 = 6;

#[derive(Debug, Clone)]
struct StoredUser {
    user: User,
    pin_tries: u64,
    blocked_until: Option<DateTime<Utc>>,
    blocks_served: u32,
    last_seen: Option<DateTime<Utc>>,
    logs: Vec<(DateTime<Utc>, EventKind, Option<i64>)>,
    email_verifications: Vec<(String, String)>,
}

/// Process-local user store. Everything is lost on restart, which is fine for
/// tests and single-node development setups.
#[derive(Default)]
pub struct MemoryDb {
    users: Mutex<HashMap<String, StoredUser>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StoredUser>> {
        self.users.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("memory db mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Number of stored email-verification tokens for a user.
    pub fn email_verification_count(&self, username: &str) -> usize {
        self.lock()
            .get(username)
            .map(|u| u.email_verifications.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Db for MemoryDb {
    async fn add_user(&self, user: &User) -> Result<(), DbError> {
        let mut users = self.lock();
        if users.contains_key(&user.username) {
            return Err(DbError::UserAlreadyExists);
        }
        users.insert(
            user.username.clone(),
            StoredUser {
                user: user.clone(),
                pin_tries: 0,
                blocked_until: None,
                blocks_served: 0,
                last_seen: None,
                logs: Vec::new(),
                email_verifications: Vec::new(),
            },
        );
        Ok(())
    }

    async fn user(&self, username: &str) -> Result<User, DbError> {
        self.lock()
            .get(username)
            .map(|stored| stored.user.clone())
            .ok_or(DbError::UserNotFound)
    }

    async fn update_user(&self, user: &User) -> Result<(), DbError> {
        let mut users = self.lock();
        let stored = users
            .get_mut(&user.username)
            .ok_or(DbError::UserNotFound)?;
        stored.user = user.clone();
        Ok(())
    }

    async fn reserve_pin_try(&self, user: &User) -> Result<PinReservation, DbError> {
        let mut users = self.lock();
        let stored = users
            .get_mut(&user.username)
            .ok_or(DbError::UserNotFound)?;

        let now = Utc::now();
        if let Some(until) = stored.blocked_until {
            if until > now {
                let wait = (until - now).num_seconds().max(1) as u64;
                return Ok(PinReservation {
                    allowed: false,
                    remaining_tries: 0,
                    wait_seconds: wait,
                });
            }
            // block expired, the user gets a fresh window
            stored.blocked_until = None;
            stored.pin_tries = 0;
        }

        stored.pin_tries += 1;
        let remaining = MAX_PIN_TRIES.saturating_sub(stored.pin_tries);
        let mut wait = 0;
        if remaining == 0 {
            let doublings = stored.blocks_served.min(MAX_BLOCK_DOUBLINGS);
            wait = (BASE_BLOCK_SECONDS << doublings) as u64;
            stored.blocked_until = Some(now + Duration::seconds(wait as i64));
            stored.blocks_served += 1;
        }
        Ok(PinReservation {
            allowed: true,
            remaining_tries: remaining,
            wait_seconds: wait,
        })
    }

    async fn reset_pin_tries(&self, user: &User) -> Result<(), DbError> {
        let mut users = self.lock();
        let stored = users
            .get_mut(&user.username)
            .ok_or(DbError::UserNotFound)?;
        stored.pin_tries = 0;
        stored.blocked_until = None;
        stored.blocks_served = 0;
        Ok(())
    }

    async fn set_seen(&self, user: &User) -> Result<(), DbError> {
        let mut users = self.lock();
        let stored = users
            .get_mut(&user.username)
            .ok_or(DbError::UserNotFound)?;
        stored.last_seen = Some(Utc::now());
        Ok(())
    }

    async fn add_log(
        &self,
        user: &User,
        event: EventKind,
        param: Option<i64>,
    ) -> Result<(), DbError> {
        let mut users = self.lock();
        let stored = users
            .get_mut(&user.username)
            .ok_or(DbError::UserNotFound)?;
        stored.logs.push((Utc::now(), event, param));
        Ok(())
    }

    async fn add_email_verification(
        &self,
        user: &User,
        email: &str,
        token: &str,
    ) -> Result<(), DbError> {
        let mut users = self.lock();
        let stored = users
            .get_mut(&user.username)
            .ok_or(DbError::UserNotFound)?;
        stored
            .email_verifications
            .push((email.to_string(), token.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_user(name: &str) -> User {
        User {
            username: name.to_string(),
            language: "en".to_string(),
            secrets: EncryptedSecrets::from_bytes(vec![1, 2, 3]),
        }
    }

    #[tokio::test]
    async fn usernames_are_unique() {
        let db = MemoryDb::new();
        db.add_user(&test_user("alice")).await.unwrap();
        assert!(matches!(
            db.add_user(&test_user("alice")).await,
            Err(DbError::UserAlreadyExists)
        ));
    }

    #[tokio::test]
    async fn unknown_user_is_distinguishable() {
        let db = MemoryDb::new();
        assert!(matches!(db.user("nobody").await, Err(DbError::UserNotFound)));
    }

    #[tokio::test]
    async fn pin_tries_count_down_and_block() {
        let db = MemoryDb::new();
        let user = test_user("alice");
        db.add_user(&user).await.unwrap();

        let first = db.reserve_pin_try(&user).await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.remaining_tries, MAX_PIN_TRIES - 1);

        let second = db.reserve_pin_try(&user).await.unwrap();
        assert_eq!(second.remaining_tries, MAX_PIN_TRIES - 2);

        let last = db.reserve_pin_try(&user).await.unwrap();
        assert!(last.allowed);
        assert_eq!(last.remaining_tries, 0);
        assert!(last.wait_seconds > 0);

        // now blocked without a PIN check ever happening
        let blocked = db.reserve_pin_try(&user).await.unwrap();
        assert!(!blocked.allowed);
        assert!(blocked.wait_seconds > 0);
    }

    #[tokio::test]
    async fn reset_clears_block() {
        let db = MemoryDb::new();
        let user = test_user("alice");
        db.add_user(&user).await.unwrap();
        for _ in 0..MAX_PIN_TRIES {
            db.reserve_pin_try(&user).await.unwrap();
        }
        assert!(!db.reserve_pin_try(&user).await.unwrap().allowed);

        db.reset_pin_tries(&user).await.unwrap();
        let after = db.reserve_pin_try(&user).await.unwrap();
        assert!(after.allowed);
        assert_eq!(after.remaining_tries, MAX_PIN_TRIES - 1);
    }

    #[tokio::test]
    async fn email_verifications_are_recorded() {
        let db = MemoryDb::new();
        let user = test_user("alice");
        db.add_user(&user).await.unwrap();
        db.add_email_verification(&user, "a@example.com", "tok")
            .await
            .unwrap();
        assert_eq!(db.email_verification_count("alice"), 1);
    }
}
