//! PIN attempt reservation and the status envelope shared by every
//! PIN-consuming endpoint.

use serde::{Deserialize, Serialize};

use crate::db::{Db, DbError, EventKind, User};

/// Domain-level outcome of a PIN-consuming operation. Always delivered with
/// HTTP 200; `status` distinguishes success, a wrong PIN with tries left, and
/// a blocked user.
#[derive(Debug, Serialize, Deserialize)]
pub struct PinStatus {
    pub status: String,
    pub message: String,
}

impl PinStatus {
    pub fn success(message: impl Into<String>) -> Self {
        PinStatus {
            status: "success".to_string(),
            message: message.into(),
        }
    }

    /// Wrong PIN, `remaining` tries left.
    pub fn failure(remaining: u64) -> Self {
        PinStatus {
            status: "failure".to_string(),
            message: remaining.to_string(),
        }
    }

    /// Blocked for `wait_seconds`.
    pub fn blocked(wait_seconds: u64) -> Self {
        PinStatus {
            status: "error".to_string(),
            message: wait_seconds.to_string(),
        }
    }
}

/// Result of asking the store to reserve one PIN attempt.
#[derive(Debug, Clone, Copy)]
pub enum PinAttempt {
    /// Proceed with the check. `wait` only matters when `remaining` is zero:
    /// a wrong PIN on the last try blocks the user for that long.
    Allowed { remaining: u64, wait: u64 },
    /// Already blocked; the PIN must not be checked at all.
    Blocked { wait: u64 },
}

/// Reserve a PIN attempt. A blocked user is logged here, since the flows
/// return immediately without touching the container.
pub async fn reserve_attempt(db: &dyn Db, user: &User) -> Result<PinAttempt, DbError> {
    let reservation = db.reserve_pin_try(user).await?;
    if !reservation.allowed {
        db.add_log(
            user,
            EventKind::PinCheckBlocked,
            Some(reservation.wait_seconds as i64),
        )
        .await?;
        return Ok(PinAttempt::Blocked {
            wait: reservation.wait_seconds,
        });
    }
    Ok(PinAttempt::Allowed {
        remaining: reservation.remaining_tries,
        wait: reservation.wait_seconds,
    })
}
