//! Login verification.

use crate::error::{Result, ServerError};
use crate::ldap::Ldap;
use crate::user::{UserRecord, UserRepository};

/// Orchestrates login: relational resolution, then a directory bind as the
/// resolved identity.
#[derive(Clone)]
pub struct Authenticator {
    repo: UserRepository,
    ldap: Ldap,
}

impl Authenticator {
    /// Create a new [`Authenticator`].
    pub fn new(repo: UserRepository, ldap: Ldap) -> Self {
        Self { repo, ldap }
    }

    /// Verify credentials.
    ///
    /// Unknown identifiers and failed binds are indistinguishable to the
    /// caller; the underlying cause only reaches debug logs.
    pub async fn login(
        &self,
        identifier: &str,
        password: &str,
    ) -> Result<UserRecord> {
        let Some(record) = self.repo.find_by_identifier(identifier).await?
        else {
            tracing::debug!("login rejected, unknown identifier");
            return Err(ServerError::InvalidCredentials);
        };

        if let Err(err) = self.ldap.bind_user(&record.ldap_uid, password).await
        {
            tracing::debug!(
                uid = %record.ldap_uid,
                error = %err,
                "login rejected by directory"
            );
            return Err(ServerError::InvalidCredentials);
        }

        // Bookkeeping only; a failure here must not fail the login.
        if let Err(err) = self.repo.update_last_login(&record).await {
            tracing::warn!(
                user_id = record.user_id,
                error = %err,
                "failed to record login time"
            );
        }

        Ok(record)
    }
}
