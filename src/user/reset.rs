//! Forgot/reset-password workflows.
//!
//! A token lives in both stores: the directory carries the authoritative
//! copy (`resetToken`/`resetTokenExpiry` on the user entry), the relational
//! ledger tracks issuance and consumption per user. Expiry is evaluated
//! lazily at validation time.

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use rand::RngCore;
use rand::rngs::OsRng;

use crate::crypto::CredentialHasher;
use crate::error::{Result, ServerError};
use crate::ldap::{Ldap, RESET_EXPIRY_ATTR};
use crate::mail::{MailManager, Template};
use crate::user::UserRepository;

const TOKEN_BYTES: usize = 32;

/// Stored timestamp layout. Always UTC, whatever the directory echoes back.
const EXPIRY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Orchestrates reset-token issuance and consumption.
#[derive(Clone)]
pub struct ResetTokenManager {
    repo: UserRepository,
    ldap: Ldap,
    hasher: Arc<CredentialHasher>,
    mail: MailManager,
    base_url: String,
    ttl: chrono::Duration,
}

impl ResetTokenManager {
    /// Create a new [`ResetTokenManager`].
    pub fn new(
        repo: UserRepository,
        ldap: Ldap,
        hasher: Arc<CredentialHasher>,
        mail: MailManager,
        base_url: String,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            repo,
            ldap,
            hasher,
            mail,
            base_url,
            ttl,
        }
    }

    /// Issue a reset token for the entry matching `email`, if any.
    ///
    /// The route answers the same generic success either way; nothing in
    /// the flow may reveal whether the address matched.
    pub async fn request(&self, email: &str) -> Result<()> {
        let Some(entry) = self.ldap.find_by_mail(email.trim()).await? else {
            tracing::debug!("password reset requested for unknown address");
            return Ok(());
        };

        let token = generate_token();
        let expires_at = Utc::now() + self.ttl;

        // Replace semantics: a second request supersedes the first token.
        self.ldap
            .store_reset_token(
                &entry.dn,
                &token,
                &expires_at.format(EXPIRY_FORMAT).to_string(),
            )
            .await?;

        match entry.uid() {
            Some(uid) => match self.repo.find_by_identifier(uid).await? {
                Some(record) => {
                    self.repo
                        .upsert_reset_ledger(record.user_id, expires_at)
                        .await?;
                },
                None => tracing::debug!(
                    uid,
                    "reset issued for a directory-only identity, no ledger row"
                ),
            },
            None => tracing::debug!(
                dn = %entry.dn,
                "reset target has no uid attribute, no ledger row"
            ),
        }

        // At most one notifier call per request; its outcome never alters
        // the HTTP-visible result.
        let reset_url = self.reset_url(&token);
        if let Err(err) = self
            .mail
            .publish_event(Template::PasswordReset, email.trim(), &reset_url)
            .await
        {
            tracing::warn!(error = %err, "reset notifier failed");
        }

        Ok(())
    }

    /// Validate and consume a token, rotating the credential.
    pub async fn consume(&self, token: &str, new_password: &str) -> Result<()> {
        let token = token.trim();
        if token.is_empty() {
            return Err(ServerError::InvalidToken);
        }

        let Some(entry) = self.ldap.find_by_reset_token(token).await? else {
            return Err(ServerError::InvalidToken);
        };

        let now = Utc::now();
        if !entry
            .first(RESET_EXPIRY_ATTR)
            .is_some_and(|raw| expiry_valid(raw, now))
        {
            tracing::debug!(dn = %entry.dn, "reset token missing or past expiry");
            return Err(ServerError::InvalidToken);
        }

        let password_hash = self.hasher.hash(new_password)?;

        // One modify call: the credential rotates and both token attributes
        // disappear together, so a replay finds nothing to match.
        self.ldap.rotate_password(&entry.dn, &password_hash).await?;

        // The ledger mark is bookkeeping; the directory state above is what
        // rejects a second consumption.
        if let Some(uid) = entry.uid() {
            match self.repo.find_by_identifier(uid).await {
                Ok(Some(record)) => {
                    if let Err(err) =
                        self.repo.mark_ledger_consumed(record.user_id).await
                    {
                        tracing::warn!(
                            user_id = record.user_id,
                            error = %err,
                            "failed to mark reset ledger consumed"
                        );
                    }
                },
                Ok(None) => tracing::debug!(
                    uid,
                    "consumed reset for a directory-only identity"
                ),
                Err(err) => tracing::warn!(
                    uid,
                    error = %err,
                    "ledger lookup failed after credential rotation"
                ),
            }
        }

        Ok(())
    }

    fn reset_url(&self, token: &str) -> String {
        reset_url(&self.base_url, token)
    }
}

/// Build the link embedded in the notification.
fn reset_url(base: &str, token: &str) -> String {
    let mut url = base.trim_end_matches('/').to_owned();
    url.push_str("/reset-password?token=");
    url.extend(url::form_urlencoded::byte_serialize(token.as_bytes()));
    url
}

/// Whether a stored expiry is parsable and still in the future.
fn expiry_valid(raw: &str, now: DateTime<Utc>) -> bool {
    parse_expiry(raw).is_some_and(|at| at > now)
}

/// Parse a stored expiry timestamp, treating zone-less values as UTC.
///
/// Accepts space- or `T`-separated timestamps, with or without a zone
/// suffix, so values written by older deployments keep validating.
fn parse_expiry(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let normalized = trimmed.replacen(' ', "T", 1);
    if let Ok(at) = DateTime::parse_from_rfc3339(&normalized) {
        return Some(at.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_expiry_space_separated_is_utc() {
        let parsed = parse_expiry("2026-08-06 10:30:00").unwrap();
        let expected = Utc.with_ymd_and_hms(2026, 8, 6, 10, 30, 0).unwrap();

        assert_eq!(parsed, expected);
    }

    #[test]
    fn test_parse_expiry_rfc3339_variants() {
        let expected = Utc.with_ymd_and_hms(2026, 8, 6, 10, 30, 0).unwrap();

        assert_eq!(parse_expiry("2026-08-06T10:30:00Z").unwrap(), expected);
        assert_eq!(
            parse_expiry("2026-08-06T12:30:00+02:00").unwrap(),
            expected
        );
        assert_eq!(parse_expiry(" 2026-08-06 10:30:00 ").unwrap(), expected);
    }

    #[test]
    fn test_parse_expiry_rejects_garbage() {
        assert_eq!(parse_expiry(""), None);
        assert_eq!(parse_expiry("   "), None);
        assert_eq!(parse_expiry("not-a-date"), None);
        assert_eq!(parse_expiry("2026-13-40 99:99:99"), None);
    }

    #[test]
    fn test_expiry_one_second_around_now() {
        let now = Utc.with_ymd_and_hms(2026, 8, 6, 10, 30, 0).unwrap();

        assert!(expiry_valid("2026-08-06 10:30:01", now));
        assert!(!expiry_valid("2026-08-06 10:29:59", now));
        assert!(!expiry_valid("2026-08-06 10:30:00", now));
    }

    #[test]
    fn test_generate_token_shape() {
        let first = generate_token();
        let second = generate_token();

        assert_eq!(first.len(), TOKEN_BYTES * 2);
        assert!(first.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(first, second);
    }

    #[test]
    fn test_reset_url_building() {
        assert_eq!(
            reset_url("https://chat.example.com/", "abc123"),
            "https://chat.example.com/reset-password?token=abc123"
        );
        assert_eq!(
            reset_url("https://chat.example.com", "abc123"),
            "https://chat.example.com/reset-password?token=abc123"
        );
        // Hex tokens pass through the encoder unchanged; anything else is
        // percent-encoded.
        assert_eq!(
            reset_url("https://chat.example.com", "a b"),
            "https://chat.example.com/reset-password?token=a+b"
        );
    }
}
