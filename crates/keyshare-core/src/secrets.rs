//! Sealed per-user secret container.
//!
//! The plaintext record only ever exists in memory. At rest it is an
//! [`EncryptedSecrets`] blob: XChaCha20-Poly1305 under a process-wide storage
//! key, with a domain-separation AAD so blobs cannot be replayed into other
//! containers. Any tamper, truncation or wrong key surfaces as the single
//! opaque [`CoreError::DecryptionFailed`].

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    Key, XChaCha20Poly1305, XNonce,
};
use num_bigint::BigUint;
use p256::ecdsa::VerifyingKey;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::error::{CoreError, Result};

/// Fixed width of the PIN field inside the container. Input longer than this
/// is rejected before any cryptographic work.
pub const PIN_FIELD_SIZE: usize = 64;

/// Size of the token-id rotated on every PIN write.
pub const TOKEN_ID_SIZE: usize = 32;

const SEAL_VERSION: u8 = 1;
const SEAL_AAD: &[u8] = b"keyshare:user-secrets:v1";
const NONCE_SIZE: usize = 24;

/// Encrypted secrets blob. Opaque everywhere outside this module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncryptedSecrets(Vec<u8>);

impl EncryptedSecrets {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        EncryptedSecrets(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// How a user authenticates, derived from the presence of a client key.
pub enum AuthMode {
    /// PIN only; no client key was ever registered.
    Legacy,
    /// PIN plus an ECDSA signature over a server-issued challenge.
    ChallengeResponse { public_key: VerifyingKey },
}

/// Plaintext user secrets. Never persisted; the PIN field and token-id are
/// wiped on drop.
#[derive(Serialize, Deserialize)]
pub struct UserSecrets {
    /// Zero-padded PIN, always exactly [`PIN_FIELD_SIZE`] bytes.
    pin: Vec<u8>,
    keyshare_secret: BigUint,
    token_id: [u8; TOKEN_ID_SIZE],
    /// SEC1-encoded P-256 point, if the user upgraded to challenge-response.
    client_key: Option<Vec<u8>>,
}

impl UserSecrets {
    pub fn new(
        pin: &str,
        keyshare_secret: BigUint,
        client_key: Option<&VerifyingKey>,
    ) -> Result<Self> {
        let mut secrets = UserSecrets {
            pin: vec![0u8; PIN_FIELD_SIZE],
            keyshare_secret,
            token_id: [0u8; TOKEN_ID_SIZE],
            client_key: client_key.map(encode_client_key),
        };
        secrets.set_pin(pin)?;
        secrets.rotate_token_id()?;
        Ok(secrets)
    }

    /// Write a new PIN into the fixed-width field.
    pub fn set_pin(&mut self, pin: &str) -> Result<()> {
        let padded = pad_pin(pin)?;
        self.pin.zeroize();
        self.pin = padded;
        Ok(())
    }

    /// Constant-time PIN comparison.
    pub fn verify_pin(&self, pin: &str) -> Result<()> {
        let padded = pad_pin(pin)?;
        if self.pin.ct_eq(&padded).into() {
            Ok(())
        } else {
            Err(CoreError::InvalidPin)
        }
    }

    /// Replace the token-id, invalidating every access token bound to the
    /// previous one.
    pub fn rotate_token_id(&mut self) -> Result<()> {
        getrandom::getrandom(&mut self.token_id)
            .map_err(|e| CoreError::Crypto(format!("random token id: {e}")))?;
        Ok(())
    }

    pub fn token_id(&self) -> &[u8; TOKEN_ID_SIZE] {
        &self.token_id
    }

    /// Constant-time token-id comparison.
    pub fn token_id_matches(&self, other: &[u8]) -> bool {
        self.token_id.ct_eq(other).into()
    }

    pub fn keyshare_secret(&self) -> &BigUint {
        &self.keyshare_secret
    }

    pub fn set_client_key(&mut self, key: &VerifyingKey) {
        self.client_key = Some(encode_client_key(key));
    }

    pub fn has_client_key(&self) -> bool {
        self.client_key.is_some()
    }

    pub fn auth_mode(&self) -> Result<AuthMode> {
        match &self.client_key {
            None => Ok(AuthMode::Legacy),
            Some(bytes) => {
                let public_key = VerifyingKey::from_sec1_bytes(bytes)
                    .map_err(|_| CoreError::Crypto("stored client key is malformed".into()))?;
                Ok(AuthMode::ChallengeResponse { public_key })
            }
        }
    }
}

impl Drop for UserSecrets {
    fn drop(&mut self) {
        self.pin.zeroize();
        self.token_id.zeroize();
    }
}

fn encode_client_key(key: &VerifyingKey) -> Vec<u8> {
    key.to_encoded_point(false).as_bytes().to_vec()
}

/// Parse a SEC1-encoded P-256 public key as supplied by clients.
pub fn parse_client_key(bytes: &[u8]) -> Result<VerifyingKey> {
    VerifyingKey::from_sec1_bytes(bytes)
        .map_err(|_| CoreError::Crypto("malformed client public key".into()))
}

fn pad_pin(pin: &str) -> Result<Vec<u8>> {
    let raw = pin.as_bytes();
    if raw.len() > PIN_FIELD_SIZE {
        return Err(CoreError::PinTooLong);
    }
    let mut padded = vec![0u8; PIN_FIELD_SIZE];
    padded[..raw.len()].copy_from_slice(raw);
    Ok(padded)
}

/// Authenticated encryption around [`UserSecrets`].
pub struct SecretsBox {
    cipher: XChaCha20Poly1305,
}

impl SecretsBox {
    pub fn new(storage_key: &[u8; 32]) -> Self {
        SecretsBox {
            cipher: XChaCha20Poly1305::new(Key::from_slice(storage_key)),
        }
    }

    pub fn encrypt(&self, secrets: &UserSecrets) -> Result<EncryptedSecrets> {
        let plain = bincode::serialize(secrets)
            .map_err(|e| CoreError::Crypto(format!("serialize secrets: {e}")))?;

        let mut nonce = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut nonce)
            .map_err(|e| CoreError::Crypto(format!("random nonce: {e}")))?;

        let ciphertext = self
            .cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: &plain,
                    aad: SEAL_AAD,
                },
            )
            .map_err(|_| CoreError::Crypto("seal failed".into()))?;

        let mut blob = Vec::with_capacity(1 + NONCE_SIZE + ciphertext.len());
        blob.push(SEAL_VERSION);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(EncryptedSecrets(blob))
    }

    pub fn decrypt(&self, blob: &EncryptedSecrets) -> Result<UserSecrets> {
        let raw = blob.as_bytes();
        if raw.len() < 1 + NONCE_SIZE || raw[0] != SEAL_VERSION {
            return Err(CoreError::DecryptionFailed);
        }
        let (nonce, ciphertext) = raw[1..].split_at(NONCE_SIZE);

        let plain = self
            .cipher
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: SEAL_AAD,
                },
            )
            .map_err(|_| CoreError::DecryptionFailed)?;

        bincode::deserialize(&plain).map_err(|_| CoreError::DecryptionFailed)
    }

    /// Decrypt and verify the PIN in one step. A wrong PIN yields
    /// [`CoreError::InvalidPin`]; everything else about the blob stays opaque.
    pub fn decrypt_if_pin_ok(&self, blob: &EncryptedSecrets, pin: &str) -> Result<UserSecrets> {
        let secrets = self.decrypt(blob)?;
        secrets.verify_pin(pin)?;
        Ok(secrets)
    }
}
