//! Server configuration.

use anyhow::Result;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Registration-email settings. Template bodies are loaded into memory at
/// startup; a missing language falls back to `default_language`.
#[derive(Debug, Clone, Default)]
pub struct EmailConfig {
    /// Mail server address. Empty disables sending (verification records are
    /// still written).
    pub server: String,
    pub from: String,
    pub default_language: String,
    /// language -> template body (contains a `{verification_url}` placeholder)
    pub templates: HashMap<String, String>,
    /// language -> subject line
    pub subjects: HashMap<String, String>,
    /// language -> base URL the verification token is appended to
    pub verification_urls: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: SocketAddr,

    /// ES256 private key (PKCS#8 PEM) used for access and ProofP tokens.
    pub jwt_private_key_file: PathBuf,
    pub jwt_key_id: String,
    pub jwt_issuer: String,

    /// 32-byte hex key sealing the user secret containers.
    pub storage_primary_key_file: PathBuf,

    /// Directory of trusted issuer public key JSON files.
    pub schemes_path: PathBuf,

    /// Optional extra key directory merged into the trusted-key registry,
    /// for issuers this deployment holds keys of itself.
    pub issuer_private_keys_path: Option<PathBuf>,

    /// Attribute issued to the user once their email address is verified.
    pub keyshare_attribute: String,

    /// Access-token lifetime in seconds.
    pub pin_expiry: u64,

    pub email: EmailConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let bind_address = std::env::var("KEYSHARE_BIND_ADDRESS")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()?;

        let jwt_private_key_file = require_path("KEYSHARE_JWT_PRIVATE_KEY_FILE")?;
        let storage_primary_key_file = require_path("KEYSHARE_STORAGE_PRIMARY_KEY_FILE")?;
        let schemes_path = require_path("KEYSHARE_SCHEMES_PATH")?;

        let issuer_private_keys_path = std::env::var("KEYSHARE_ISSUER_PRIVATE_KEYS_PATH")
            .ok()
            .map(PathBuf::from);

        let jwt_key_id = std::env::var("KEYSHARE_JWT_KEY_ID").unwrap_or_else(|_| "0".to_string());
        let jwt_issuer =
            std::env::var("KEYSHARE_JWT_ISSUER").unwrap_or_else(|_| "keyshare_server".to_string());

        let keyshare_attribute = std::env::var("KEYSHARE_ATTRIBUTE").unwrap_or_default();

        let pin_expiry = std::env::var("KEYSHARE_PIN_EXPIRY_SECONDS")
            .unwrap_or_else(|_| "900".to_string())
            .parse()?;

        let email = EmailConfig {
            server: std::env::var("KEYSHARE_EMAIL_SERVER").unwrap_or_default(),
            from: std::env::var("KEYSHARE_EMAIL_FROM").unwrap_or_default(),
            default_language: std::env::var("KEYSHARE_DEFAULT_LANGUAGE")
                .unwrap_or_else(|_| "en".to_string()),
            templates: load_template_files(&parse_lang_map(
                "KEYSHARE_REGISTRATION_EMAIL_FILES",
            ))?,
            subjects: parse_lang_map("KEYSHARE_REGISTRATION_EMAIL_SUBJECTS"),
            verification_urls: parse_lang_map("KEYSHARE_VERIFICATION_URLS"),
        };

        Ok(Config {
            bind_address,
            jwt_private_key_file,
            jwt_key_id,
            jwt_issuer,
            storage_primary_key_file,
            schemes_path,
            issuer_private_keys_path,
            keyshare_attribute,
            pin_expiry,
            email,
        })
    }
}

fn require_path(var: &str) -> Result<PathBuf> {
    let value = std::env::var(var).map_err(|_| anyhow::anyhow!("{var} is required"))?;
    Ok(PathBuf::from(value))
}

/// Parse `lang=value,lang=value` maps from an environment variable.
fn parse_lang_map(var: &str) -> HashMap<String, String> {
    std::env::var(var)
        .unwrap_or_default()
        .split(',')
        .filter_map(|pair| {
            let (lang, value) = pair.split_once('=')?;
            let (lang, value) = (lang.trim(), value.trim());
            if lang.is_empty() || value.is_empty() {
                None
            } else {
                Some((lang.to_string(), value.to_string()))
            }
        })
        .collect()
}

fn load_template_files(files: &HashMap<String, String>) -> Result<HashMap<String, String>> {
    files
        .iter()
        .map(|(lang, path)| {
            let body = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("read email template {path}: {e}"))?;
            Ok((lang.clone(), body))
        })
        .collect()
}

/// Read the 32-byte hex storage key the secret containers are sealed under.
pub fn load_storage_key(path: &std::path::Path) -> Result<[u8; 32]> {
    let hex_str = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("read storage key {}: {e}", path.display()))?;
    let bytes = hex::decode(hex_str.trim())?;
    anyhow::ensure!(bytes.len() == 32, "storage primary key must be 32 bytes");
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lang_map_parsing() {
        std::env::set_var("TEST_LANG_MAP", "en=Hello, nl = Hallo ,,broken");
        let map = parse_lang_map("TEST_LANG_MAP");
        assert_eq!(map.get("en").map(String::as_str), Some("Hello"));
        assert_eq!(map.get("nl").map(String::as_str), Some("Hallo"));
        assert_eq!(map.len(), 2);
    }
}
