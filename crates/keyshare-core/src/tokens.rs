//! Signed tokens: short-lived access tokens bound to a user's token-id,
//! ProofP result tokens, and verification of client-signed payloads.
//!
//! Every token on this surface is ES256. Verification pins the algorithm, so
//! a token carrying any other `alg` header is rejected outright.

use base64::prelude::*;
use chrono::Utc;
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use p256::ecdsa::VerifyingKey;
use p256::pkcs8::{DecodePrivateKey, EncodePublicKey, LineEnding};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::proofs::ProofP;
use crate::secrets::UserSecrets;

/// Subject claim of access tokens.
pub const ACCESS_TOKEN_SUBJECT: &str = "auth_tok";
/// Subject claim of ProofP result tokens.
pub const PROOF_TOKEN_SUBJECT: &str = "ProofP";

#[derive(Debug, Serialize, Deserialize)]
pub struct AccessClaims {
    pub iss: String,
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub token_id: String,
}

#[derive(Serialize)]
struct ProofClaims<'a> {
    #[serde(rename = "ProofP")]
    proof: &'a ProofP,
    iat: i64,
    sub: &'static str,
    iss: &'a str,
}

/// Mints and verifies the server's own ES256 tokens.
pub struct AuthTokens {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    key_id: String,
    pin_expiry: u64,
}

impl AuthTokens {
    /// Build from a PKCS#8 (or SEC1) P-256 private key PEM. The verifying
    /// half is derived from the same key; it is never read from elsewhere.
    pub fn from_pem(
        private_key_pem: &str,
        issuer: impl Into<String>,
        key_id: impl Into<String>,
        pin_expiry: u64,
    ) -> Result<Self> {
        let secret = p256::SecretKey::from_pkcs8_pem(private_key_pem)
            .or_else(|_| p256::SecretKey::from_sec1_pem(private_key_pem))
            .map_err(|e| CoreError::Crypto(format!("parse jwt private key: {e}")))?;
        let public_pem = secret
            .public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CoreError::Crypto(format!("derive jwt public key: {e}")))?;

        let encoding_key = EncodingKey::from_ec_pem(private_key_pem.as_bytes())
            .map_err(|e| CoreError::Crypto(format!("load jwt signing key: {e}")))?;
        let decoding_key = DecodingKey::from_ec_pem(public_pem.as_bytes())
            .map_err(|e| CoreError::Crypto(format!("load jwt verifying key: {e}")))?;

        Ok(AuthTokens {
            encoding_key,
            decoding_key,
            issuer: issuer.into(),
            key_id: key_id.into(),
            pin_expiry,
        })
    }

    /// Mint an access token bound to the secrets' current token-id.
    pub fn mint_access(&self, secrets: &UserSecrets) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = AccessClaims {
            iss: self.issuer.clone(),
            sub: ACCESS_TOKEN_SUBJECT.to_string(),
            iat: now,
            exp: now + self.pin_expiry as i64,
            token_id: BASE64_STANDARD.encode(secrets.token_id()),
        };
        self.sign(&claims)
    }

    /// Verify signature, algorithm, expiry and shape of an access token and
    /// return the decoded token-id claim. The caller still has to compare it
    /// against the sealed container.
    pub fn verify_access(&self, token: &str) -> Result<Vec<u8>> {
        let mut validation = Validation::new(Algorithm::ES256);
        validation.leeway = 0;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp"]);

        let data = decode::<AccessClaims>(token, &self.decoding_key, &validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => CoreError::ExpiredJwt,
                _ => CoreError::InvalidJwt,
            }
        })?;

        if data.claims.sub != ACCESS_TOKEN_SUBJECT {
            return Err(CoreError::InvalidJwt);
        }
        BASE64_STANDARD
            .decode(&data.claims.token_id)
            .map_err(|_| CoreError::InvalidJwt)
    }

    /// Wrap a completed proof response in a signed token.
    pub fn mint_proof(&self, proof: &ProofP) -> Result<String> {
        let claims = ProofClaims {
            proof,
            iat: Utc::now().timestamp(),
            sub: PROOF_TOKEN_SUBJECT,
            iss: &self.issuer,
        };
        self.sign(&claims)
    }

    fn sign<T: Serialize>(&self, claims: &T) -> Result<String> {
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.key_id.clone());
        encode(&header, claims, &self.encoding_key)
            .map_err(|e| CoreError::Crypto(format!("sign token: {e}")))
    }
}

/// Decode a client JWT's claims without checking its signature. Used only to
/// discover which user (or which embedded key) the token speaks for; callers
/// must follow up with [`verify_client_jwt`].
pub fn peek_claims<T: DeserializeOwned>(jwt: &str) -> Result<T> {
    let mut validation = Validation::new(Algorithm::ES256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.set_required_spec_claims::<&str>(&[]);

    decode::<T>(jwt, &DecodingKey::from_secret(&[]), &validation)
        .map(|data| data.claims)
        .map_err(|_| CoreError::InvalidJwt)
}

/// Verify an ES256 JWT under a client public key and return its claims.
pub fn verify_client_jwt<T: DeserializeOwned>(jwt: &str, key: &VerifyingKey) -> Result<T> {
    let public_pem = key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| CoreError::Crypto(format!("encode client key: {e}")))?;
    let decoding_key =
        DecodingKey::from_ec_pem(public_pem.as_bytes()).map_err(|_| CoreError::InvalidJwt)?;

    let mut validation = Validation::new(Algorithm::ES256);
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.set_required_spec_claims::<&str>(&[]);

    decode::<T>(jwt, &decoding_key, &validation)
        .map(|data| data.claims)
        .map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => CoreError::ExpiredJwt,
            _ => CoreError::InvalidJwt,
        })
}
