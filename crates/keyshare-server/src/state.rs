//! Application state shared across handlers.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use keyshare_core::keys::TrustedKeys;
use keyshare_core::tokens::AuthTokens;
use keyshare_core::KeyshareCore;

use crate::config::{load_storage_key, Config, EmailConfig};
use crate::db::Db;
use crate::email::Mailer;
use crate::sessions::ProofSessions;

/// How often the proof-session sweeper runs.
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

pub struct AppState {
    pub core: KeyshareCore,
    pub db: Arc<dyn Db>,
    pub sessions: ProofSessions,
    pub mailer: Arc<dyn Mailer>,
    pub email: EmailConfig,
    pub keyshare_attribute: String,
}

impl AppState {
    /// Materialize key files and the trusted-key registry, wire up the core,
    /// and start the session sweeper. Must run inside a tokio runtime.
    pub fn new(config: Config, db: Arc<dyn Db>, mailer: Arc<dyn Mailer>) -> Result<Arc<Self>> {
        let storage_key = load_storage_key(&config.storage_primary_key_file)?;

        let jwt_pem = std::fs::read_to_string(&config.jwt_private_key_file).with_context(|| {
            format!(
                "read jwt private key {}",
                config.jwt_private_key_file.display()
            )
        })?;
        let tokens = AuthTokens::from_pem(
            &jwt_pem,
            config.jwt_issuer.clone(),
            config.jwt_key_id.clone(),
            config.pin_expiry,
        )?;

        let mut trusted_keys = TrustedKeys::load_dir(&config.schemes_path)?;
        if let Some(dir) = &config.issuer_private_keys_path {
            trusted_keys.extend_from_dir(dir)?;
        }
        if trusted_keys.is_empty() {
            tracing::warn!(
                path = %config.schemes_path.display(),
                "no trusted issuer keys loaded; proof endpoints will reject everything"
            );
        } else {
            tracing::info!(count = trusted_keys.len(), "loaded trusted issuer keys");
        }

        let sessions = ProofSessions::new(Duration::from_secs(config.pin_expiry));
        let _sweeper = sessions.spawn_sweeper(SESSION_SWEEP_INTERVAL);

        Ok(Arc::new(AppState {
            core: KeyshareCore::new(&storage_key, tokens, trusted_keys),
            db,
            sessions,
            mailer,
            email: config.email,
            keyshare_attribute: config.keyshare_attribute,
        }))
    }
}
