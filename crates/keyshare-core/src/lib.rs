//! # keyshare-core
//!
//! Cryptographic core of the keyshare server. It custodially holds one half
//! of each user's master secret inside a sealed container and participates in
//! zero-knowledge proof sessions on the user's behalf, gated by a PIN and a
//! short-lived access token.
//!
//! The core is transport- and storage-agnostic: it consumes and returns
//! encrypted blobs, never touching a database or socket.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod challenges;
pub mod commitments;
pub mod error;
pub mod keys;
pub mod proofs;
pub mod secrets;
pub mod tokens;

use base64::prelude::*;
use num_bigint::BigUint;
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use serde::Serialize;

use challenges::{ChallengeStore, CHALLENGE_SIZE};
use commitments::CommitmentStore;
use error::{CoreError, Result};
use keys::{PublicKeyIdentifier, TrustedKeys};
use proofs::ProofPCommitment;
use secrets::{AuthMode, EncryptedSecrets, SecretsBox, UserSecrets};
use tokens::AuthTokens;

/// Canonical serialization of the data a client signs during
/// challenge-response authentication. Field order is part of the format.
#[derive(Serialize)]
struct ChallengeData<'a> {
    challenge: &'a str,
    pin: &'a str,
}

pub struct KeyshareCore {
    secrets_box: SecretsBox,
    tokens: AuthTokens,
    trusted_keys: TrustedKeys,
    challenges: ChallengeStore,
    commitments: CommitmentStore,
}

impl KeyshareCore {
    pub fn new(storage_key: &[u8; 32], tokens: AuthTokens, trusted_keys: TrustedKeys) -> Self {
        KeyshareCore {
            secrets_box: SecretsBox::new(storage_key),
            tokens,
            trusted_keys,
            challenges: ChallengeStore::new(),
            commitments: CommitmentStore::new(),
        }
    }

    /// Create sealed secrets for a new user: fresh keyshare secret, fresh
    /// token-id, the given PIN, and optionally a client public key.
    pub fn new_user_secrets(
        &self,
        pin: &str,
        client_key: Option<&VerifyingKey>,
    ) -> Result<EncryptedSecrets> {
        let secrets = UserSecrets::new(pin, proofs::new_keyshare_secret(), client_key)?;
        self.secrets_box.encrypt(&secrets)
    }

    /// Issue an authentication challenge for a user with a registered client
    /// key. Stored keyed by the user's current token-id, consumed exactly
    /// once by the following PIN verification.
    pub fn generate_challenge(&self, blob: &EncryptedSecrets) -> Result<[u8; CHALLENGE_SIZE]> {
        let secrets = self.secrets_box.decrypt(blob)?;
        match secrets.auth_mode()? {
            AuthMode::Legacy => Err(CoreError::Crypto(
                "challenge-response unavailable: no public key registered".into(),
            )),
            AuthMode::ChallengeResponse { .. } => self.challenges.issue(secrets.token_id()),
        }
    }

    /// Check the PIN (and, for upgraded users, the signed challenge
    /// response) and mint an access token.
    ///
    /// `response` is the client's DER signature over the canonical
    /// `{challenge, pin}` serialization; legacy users pass `None`.
    pub fn validate_pin_auth(
        &self,
        blob: &EncryptedSecrets,
        pin: &str,
        response: Option<&[u8]>,
    ) -> Result<String> {
        let secrets = self.secrets_box.decrypt_if_pin_ok(blob, pin)?;
        self.verify_challenge_response(&secrets, pin, response)?;
        self.tokens.mint_access(&secrets)
    }

    fn verify_challenge_response(
        &self,
        secrets: &UserSecrets,
        pin: &str,
        response: Option<&[u8]>,
    ) -> Result<()> {
        let challenge = self.challenges.consume(secrets.token_id());
        match (challenge, secrets.auth_mode()?) {
            // Legacy user, no challenge outstanding: nothing more to check.
            (None, AuthMode::Legacy) => Ok(()),
            // An upgraded user must go through start-auth first; without a
            // consumed challenge (or after reusing one) the PIN alone is not
            // enough.
            (None, AuthMode::ChallengeResponse { .. }) => {
                Err(CoreError::ChallengeResponseRequired)
            }
            (Some(challenge), AuthMode::ChallengeResponse { public_key }) => {
                let response = response.ok_or(CoreError::ChallengeResponseRequired)?;
                verify_signed_pin(&public_key, &challenge, pin, response)
            }
            (Some(_), AuthMode::Legacy) => Err(CoreError::Crypto(
                "challenge outstanding for a user without a public key".into(),
            )),
        }
    }

    /// Verify an access token against the sealed container and return the
    /// decrypted secrets. The token-id claim must match the container's
    /// current token-id in constant time.
    pub fn validate_access(&self, blob: &EncryptedSecrets, token: &str) -> Result<UserSecrets> {
        let token_id = self.tokens.verify_access(token)?;
        let secrets = self.secrets_box.decrypt(blob)?;
        if !secrets.token_id_matches(&token_id) {
            return Err(CoreError::InvalidJwt);
        }
        Ok(secrets)
    }

    /// Legacy PIN change. Refused once a client key is registered.
    pub fn change_pin_legacy(
        &self,
        blob: &EncryptedSecrets,
        old_pin: &str,
        new_pin: &str,
    ) -> Result<EncryptedSecrets> {
        let mut secrets = self.secrets_box.decrypt(blob)?;
        if secrets.has_client_key() {
            return Err(CoreError::ChallengeResponseRequired);
        }
        secrets.verify_pin(old_pin)?;
        self.write_new_pin(&mut secrets, new_pin)
    }

    /// Signed PIN change: the JWT must verify under the stored client key and
    /// carry the correct old PIN.
    pub fn change_pin_signed(&self, blob: &EncryptedSecrets, jwt: &str) -> Result<EncryptedSecrets> {
        let mut secrets = self.secrets_box.decrypt(blob)?;
        let public_key = match secrets.auth_mode()? {
            AuthMode::Legacy => return Err(CoreError::KeyNotFound),
            AuthMode::ChallengeResponse { public_key } => public_key,
        };
        let claims: ChangePinClaims = tokens::verify_client_jwt(jwt, &public_key)?;
        secrets.verify_pin(&claims.oldpin)?;
        self.write_new_pin(&mut secrets, &claims.newpin)
    }

    fn write_new_pin(&self, secrets: &mut UserSecrets, new_pin: &str) -> Result<EncryptedSecrets> {
        secrets.set_pin(new_pin)?;
        // Rotating the token-id here is what invalidates every access token
        // minted before the change.
        secrets.rotate_token_id()?;
        self.secrets_box.encrypt(secrets)
    }

    /// One-shot upgrade from PIN-only to challenge-response authentication.
    /// Returns a fresh access token together with the re-sealed secrets.
    pub fn register_public_key(
        &self,
        blob: &EncryptedSecrets,
        pin: &str,
        key: &VerifyingKey,
    ) -> Result<(String, EncryptedSecrets)> {
        let mut secrets = self.secrets_box.decrypt_if_pin_ok(blob, pin)?;
        if secrets.has_client_key() {
            return Err(CoreError::PublicKeyAlreadySet);
        }
        secrets.set_client_key(key);
        secrets.rotate_token_id()?;
        let sealed = self.secrets_box.encrypt(&secrets)?;
        let token = self.tokens.mint_access(&secrets)?;
        Ok((token, sealed))
    }

    /// Begin a proof session: resolve every requested issuer key, produce
    /// commitments, and park the commit secret under a fresh commit-id.
    pub fn generate_commitments(
        &self,
        blob: &EncryptedSecrets,
        access_token: &str,
        key_ids: &[PublicKeyIdentifier],
    ) -> Result<(Vec<ProofPCommitment>, u64)> {
        let keys = key_ids
            .iter()
            .map(|id| self.trusted_keys.resolve(id))
            .collect::<Result<Vec<_>>>()?;

        let secrets = self.validate_access(blob, access_token)?;

        let (commit_secret, commitments) =
            proofs::new_keyshare_commitments(secrets.keyshare_secret(), &keys);
        let commit_id = self.commitments.insert(commit_secret);
        Ok((commitments, commit_id))
    }

    /// Complete a proof session: consume the parked commit secret and return
    /// the response wrapped in a signed ProofP token.
    pub fn generate_response(
        &self,
        blob: &EncryptedSecrets,
        access_token: &str,
        commit_id: u64,
        challenge: &BigUint,
        key_id: &PublicKeyIdentifier,
    ) -> Result<String> {
        if !proofs::challenge_in_bounds(challenge) {
            return Err(CoreError::InvalidChallenge);
        }
        let key = self.trusted_keys.resolve(key_id)?;

        let secrets = self.validate_access(blob, access_token)?;

        let commit_secret = self.commitments.consume(commit_id)?;
        let proof =
            proofs::keyshare_response(secrets.keyshare_secret(), &commit_secret, challenge, key);
        self.tokens.mint_proof(&proof)
    }
}

/// Claims of a signed PIN-change request.
#[derive(serde::Deserialize)]
struct ChangePinClaims {
    #[allow(dead_code)]
    id: String,
    oldpin: String,
    newpin: String,
}

fn verify_signed_pin(
    key: &VerifyingKey,
    challenge: &[u8; CHALLENGE_SIZE],
    pin: &str,
    response: &[u8],
) -> Result<()> {
    let message = challenge_signing_input(challenge, pin);
    let signature = Signature::from_der(response)
        .map_err(|_| CoreError::Crypto("malformed challenge response".into()))?;
    key.verify(&message, &signature)
        .map_err(|_| CoreError::Crypto("challenge response verification failed".into()))
}

/// Serialize the challenge data exactly the way the server verifies it.
/// Exposed so clients and tests can produce matching signatures.
pub fn challenge_signing_input(challenge: &[u8], pin: &str) -> Vec<u8> {
    let encoded = BASE64_STANDARD.encode(challenge);
    serde_json::to_vec(&ChallengeData {
        challenge: &encoded,
        pin,
    })
    .expect("challenge data serialization cannot fail")
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::{signature::Signer, SigningKey};
    use p256::pkcs8::{EncodePrivateKey, LineEnding};
    use std::collections::HashMap;

    const PIN: &str = "puZGbaLDmFywGhFDi4vW2G87ZhXpaUsvymZwNJfB/SU=\n";

    fn test_core(pin_expiry: u64) -> KeyshareCore {
        let secret = p256::SecretKey::random(&mut rand::thread_rng());
        let pem = secret.to_pkcs8_pem(LineEnding::LF).unwrap();
        let tokens = AuthTokens::from_pem(pem.as_str(), "keyshare_server", "0", pin_expiry).unwrap();

        let mut keys = HashMap::new();
        keys.insert(
            "test.test-3".parse().unwrap(),
            proofs::IssuerPublicKey {
                n: "340282366920938463463374607431768211507".parse().unwrap(),
                r: vec!["2".parse().unwrap()],
            },
        );
        KeyshareCore::new(&[3u8; 32], tokens, TrustedKeys::new(keys))
    }

    fn sign_challenge(sk: &SigningKey, challenge: &[u8]) -> Vec<u8> {
        let message = challenge_signing_input(challenge, PIN);
        let signature: Signature = sk.sign(&message);
        signature.to_der().as_bytes().to_vec()
    }

    #[test]
    fn legacy_pin_auth_mints_valid_token() {
        let core = test_core(60);
        let blob = core.new_user_secrets(PIN, None).unwrap();
        let token = core.validate_pin_auth(&blob, PIN, None).unwrap();
        assert!(core.validate_access(&blob, &token).is_ok());
    }

    #[test]
    fn upgraded_user_cannot_authenticate_without_challenge() {
        let core = test_core(60);
        let sk = SigningKey::random(&mut rand::thread_rng());
        let blob = core.new_user_secrets(PIN, Some(sk.verifying_key())).unwrap();
        assert!(matches!(
            core.validate_pin_auth(&blob, PIN, None),
            Err(CoreError::ChallengeResponseRequired)
        ));
    }

    #[test]
    fn challenge_response_flow() {
        let core = test_core(60);
        let sk = SigningKey::random(&mut rand::thread_rng());
        let blob = core.new_user_secrets(PIN, Some(sk.verifying_key())).unwrap();

        let challenge = core.generate_challenge(&blob).unwrap();
        let response = sign_challenge(&sk, &challenge);
        let token = core
            .validate_pin_auth(&blob, PIN, Some(&response))
            .unwrap();
        assert!(core.validate_access(&blob, &token).is_ok());

        // the challenge was consumed; replaying the response fails
        assert!(matches!(
            core.validate_pin_auth(&blob, PIN, Some(&response)),
            Err(CoreError::ChallengeResponseRequired)
        ));
    }

    #[test]
    fn tampered_challenge_response_is_rejected() {
        let core = test_core(60);
        let sk = SigningKey::random(&mut rand::thread_rng());
        let blob = core.new_user_secrets(PIN, Some(sk.verifying_key())).unwrap();

        let challenge = core.generate_challenge(&blob).unwrap();
        let mut response = sign_challenge(&sk, &challenge);
        response[4] ^= 0x01;
        assert!(core.validate_pin_auth(&blob, PIN, Some(&response)).is_err());
    }

    #[test]
    fn pin_change_invalidates_previous_tokens() {
        let core = test_core(60);
        let blob = core.new_user_secrets(PIN, None).unwrap();
        let token = core.validate_pin_auth(&blob, PIN, None).unwrap();

        let new_blob = core.change_pin_legacy(&blob, PIN, "newpin").unwrap();
        assert!(matches!(
            core.validate_access(&new_blob, &token),
            Err(CoreError::InvalidJwt)
        ));
        assert!(core.validate_pin_auth(&new_blob, "newpin", None).is_ok());
    }

    #[test]
    fn change_pin_with_wrong_old_pin_fails() {
        let core = test_core(60);
        let blob = core.new_user_secrets(PIN, None).unwrap();
        assert!(matches!(
            core.change_pin_legacy(&blob, "wrong", "newpin"),
            Err(CoreError::InvalidPin)
        ));
    }

    #[test]
    fn register_public_key_is_one_shot() {
        let core = test_core(60);
        let sk = SigningKey::random(&mut rand::thread_rng());
        let blob = core.new_user_secrets(PIN, None).unwrap();

        let (token, upgraded) = core
            .register_public_key(&blob, PIN, sk.verifying_key())
            .unwrap();
        assert!(core.validate_access(&upgraded, &token).is_ok());

        assert!(matches!(
            core.register_public_key(&upgraded, PIN, sk.verifying_key()),
            Err(CoreError::PublicKeyAlreadySet)
        ));
    }

    #[test]
    fn proof_session_roundtrip_and_one_shot_consumption() {
        let core = test_core(60);
        let blob = core.new_user_secrets(PIN, None).unwrap();
        let token = core.validate_pin_auth(&blob, PIN, None).unwrap();
        let key_id: PublicKeyIdentifier = "test.test-3".parse().unwrap();

        let (commitments, commit_id) = core
            .generate_commitments(&blob, &token, std::slice::from_ref(&key_id))
            .unwrap();
        assert_eq!(commitments.len(), 1);

        let challenge: BigUint = "12345678".parse().unwrap();
        let proof_jwt = core
            .generate_response(&blob, &token, commit_id, &challenge, &key_id)
            .unwrap();
        assert!(proof_jwt.starts_with("ey"));

        // exactly one consumption wins
        assert!(matches!(
            core.generate_response(&blob, &token, commit_id, &challenge, &key_id),
            Err(CoreError::UnknownCommit)
        ));
    }

    #[test]
    fn unknown_issuer_key_is_rejected_before_access_check() {
        let core = test_core(60);
        let blob = core.new_user_secrets(PIN, None).unwrap();
        let unknown: PublicKeyIdentifier = "test.test-9".parse().unwrap();
        assert!(matches!(
            core.generate_commitments(&blob, "not-even-a-token", std::slice::from_ref(&unknown)),
            Err(CoreError::KeyNotFound)
        ));
    }

    #[test]
    fn oversized_proof_challenge_is_rejected() {
        let core = test_core(60);
        let blob = core.new_user_secrets(PIN, None).unwrap();
        let token = core.validate_pin_auth(&blob, PIN, None).unwrap();
        let key_id: PublicKeyIdentifier = "test.test-3".parse().unwrap();
        let (_, commit_id) = core
            .generate_commitments(&blob, &token, std::slice::from_ref(&key_id))
            .unwrap();

        let too_big = BigUint::from(1u8) << (proofs::L_H as usize + 1);
        assert!(matches!(
            core.generate_response(&blob, &token, commit_id, &too_big, &key_id),
            Err(CoreError::InvalidChallenge)
        ));
    }

    #[test]
    fn fake_access_token_is_rejected_on_proof_endpoints() {
        let core = test_core(60);
        let blob = core.new_user_secrets(PIN, None).unwrap();
        let key_id: PublicKeyIdentifier = "test.test-3".parse().unwrap();
        assert!(matches!(
            core.generate_commitments(&blob, "fakeauthorization", std::slice::from_ref(&key_id)),
            Err(CoreError::InvalidJwt)
        ));
    }
}
