//! Trusted issuer key registry.
//!
//! Loaded once at startup from a directory of JSON key files and immutable
//! afterwards; handlers only ever read it.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::proofs::IssuerPublicKey;

/// Identifier of an issuer public key, written `scheme.issuer-counter`
/// (for example `test.test-3`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicKeyIdentifier {
    pub issuer: String,
    pub counter: u32,
}

impl FromStr for PublicKeyIdentifier {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let (issuer, counter) = s
            .rsplit_once('-')
            .ok_or_else(|| CoreError::KeyRegistry(format!("malformed key id: {s}")))?;
        if issuer.is_empty() {
            return Err(CoreError::KeyRegistry(format!("malformed key id: {s}")));
        }
        let counter = counter
            .parse()
            .map_err(|_| CoreError::KeyRegistry(format!("malformed key counter in: {s}")))?;
        Ok(PublicKeyIdentifier {
            issuer: issuer.to_string(),
            counter,
        })
    }
}

impl fmt::Display for PublicKeyIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.issuer, self.counter)
    }
}

impl TryFrom<String> for PublicKeyIdentifier {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<PublicKeyIdentifier> for String {
    fn from(id: PublicKeyIdentifier) -> String {
        id.to_string()
    }
}

#[derive(Deserialize)]
struct TrustedKeyFile {
    id: PublicKeyIdentifier,
    #[serde(flatten)]
    key: IssuerPublicKey,
}

/// Read-only mapping from key identifier to issuer public key.
pub struct TrustedKeys {
    keys: HashMap<PublicKeyIdentifier, IssuerPublicKey>,
}

impl TrustedKeys {
    pub fn new(keys: HashMap<PublicKeyIdentifier, IssuerPublicKey>) -> Self {
        TrustedKeys { keys }
    }

    /// Load every `*.json` key file under `dir`.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut registry = TrustedKeys {
            keys: HashMap::new(),
        };
        registry.extend_from_dir(dir)?;
        Ok(registry)
    }

    /// Merge another directory of key files into the registry. Later loads
    /// win on duplicate identifiers.
    pub fn extend_from_dir(&mut self, dir: &Path) -> Result<()> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| CoreError::KeyRegistry(format!("read {}: {e}", dir.display())))?;
        for entry in entries {
            let entry = entry.map_err(|e| CoreError::KeyRegistry(e.to_string()))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| CoreError::KeyRegistry(format!("read {}: {e}", path.display())))?;
            let file: TrustedKeyFile = serde_json::from_str(&raw)
                .map_err(|e| CoreError::KeyRegistry(format!("parse {}: {e}", path.display())))?;
            if file.key.r.is_empty() {
                return Err(CoreError::KeyRegistry(format!(
                    "key {} has no bases",
                    file.id
                )));
            }
            tracing::debug!(key_id = %file.id, "loaded trusted issuer key");
            self.keys.insert(file.id, file.key);
        }
        Ok(())
    }

    pub fn resolve(&self, id: &PublicKeyIdentifier) -> Result<&IssuerPublicKey> {
        self.keys.get(id).ok_or(CoreError::KeyNotFound)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_key_identifier() {
        let id: PublicKeyIdentifier = "test.test-3".parse().unwrap();
        assert_eq!(id.issuer, "test.test");
        assert_eq!(id.counter, 3);
        assert_eq!(id.to_string(), "test.test-3");
    }

    #[test]
    fn reject_malformed_identifiers() {
        assert!("test.test".parse::<PublicKeyIdentifier>().is_err());
        assert!("-3".parse::<PublicKeyIdentifier>().is_err());
        assert!("test.test-x".parse::<PublicKeyIdentifier>().is_err());
    }

    #[test]
    fn resolve_miss_is_key_not_found() {
        let registry = TrustedKeys::new(HashMap::new());
        let id: PublicKeyIdentifier = "test.test-3".parse().unwrap();
        assert!(matches!(
            registry.resolve(&id),
            Err(CoreError::KeyNotFound)
        ));
    }
}
