//! Registration email verification.
//!
//! Mail transport is deliberately behind a trait; this module only renders
//! the language-appropriate template and records the verification token.

use async_trait::async_trait;

use crate::config::EmailConfig;
use crate::db::{Db, DbError, User};

/// Length of generated email-verification tokens.
const VERIFICATION_TOKEN_LENGTH: usize = 32;

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, from: &str, subject: &str, body: &str) -> anyhow::Result<()>;
}

/// Mailer that logs instead of delivering. Used until a real transport is
/// wired in, and by every test.
pub struct TracingMailer;

#[async_trait]
impl Mailer for TracingMailer {
    async fn send(&self, to: &str, _from: &str, subject: &str, _body: &str) -> anyhow::Result<()> {
        tracing::info!(to, subject, "outbound mail (transport disabled)");
        Ok(())
    }
}

/// Pick the template set for `language`, falling back to the default
/// language. Unknown languages are not an error. Returns `(subject, body)`.
pub fn render_verification_email(
    config: &EmailConfig,
    language: &str,
    token: &str,
) -> Option<(String, String)> {
    let lang = if config.templates.contains_key(language) {
        language
    } else {
        &config.default_language
    };
    let template = config.templates.get(lang)?;
    let subject = config.subjects.get(lang)?;
    let url = config.verification_urls.get(lang)?;

    let body = template.replace("{verification_url}", &format!("{url}{token}"));
    Some((subject.clone(), body))
}

/// Store a verification token for the user and, when a mail server is
/// configured, send the registration email. `attribute` names the credential
/// the user receives once the address is verified.
pub async fn schedule_verification(
    db: &dyn Db,
    mailer: &dyn Mailer,
    config: &EmailConfig,
    user: &User,
    email: &str,
    attribute: &str,
) -> Result<(), DbError> {
    let token = crate::api::helpers::random_alphanumeric(VERIFICATION_TOKEN_LENGTH);
    db.add_email_verification(user, email, &token).await?;
    tracing::debug!(
        username = %user.username,
        attribute,
        "scheduled email verification"
    );

    if config.server.is_empty() {
        tracing::debug!(username = %user.username, "no email server configured, skipping mail");
        return Ok(());
    }

    match render_verification_email(config, &user.language, &token) {
        Some((subject, body)) => {
            if let Err(e) = mailer.send(email, &config.from, &subject, &body).await {
                tracing::warn!(error = %e, username = %user.username, "sending verification mail failed");
                return Err(DbError::Storage(format!("send verification mail: {e}")));
            }
        }
        None => {
            tracing::warn!(
                language = %user.language,
                "no verification email template configured, skipping mail"
            );
        }
    }
    Ok(())
}
