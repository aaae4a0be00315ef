use thiserror::Error;

/// Errors produced by the keyshare core.
///
/// `InvalidPin` is a domain outcome rather than a fault: callers are expected
/// to match on it and translate it into a retry-counter response. Everything
/// that touches the sealed container collapses into the single opaque
/// `DecryptionFailed` so that callers cannot distinguish a wrong storage key
/// from a tampered blob.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid pin")]
    InvalidPin,

    #[error("pin too long")]
    PinTooLong,

    #[error("challenge out of bounds")]
    InvalidChallenge,

    #[error("invalid jwt")]
    InvalidJwt,

    #[error("jwt expired")]
    ExpiredJwt,

    #[error("public key not found")]
    KeyNotFound,

    #[error("unknown commit id")]
    UnknownCommit,

    #[error("challenge-response authentication required")]
    ChallengeResponseRequired,

    #[error("user already has a public key")]
    PublicKeyAlreadySet,

    #[error("could not decrypt user secrets")]
    DecryptionFailed,

    #[error("key registry: {0}")]
    KeyRegistry(String),

    #[error("crypto failure: {0}")]
    Crypto(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
