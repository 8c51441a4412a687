//! Registration workflow.
//!
//! The relational draft commits first, the directory entry follows; a
//! failed directory step is compensated by deleting the draft. The two
//! stores never share a transaction, so ordering is the only consistency
//! mechanism here.

use std::sync::Arc;

use crate::crypto::CredentialHasher;
use crate::error::{Conflict, Result, ServerError};
use crate::ldap::{Ldap, UserEntry};
use crate::user::{RegistrationInput, UserRecord, UserRepository};

/// Orchestrates account provisioning across both stores.
#[derive(Clone)]
pub struct IdentityRegistrar {
    repo: UserRepository,
    ldap: Ldap,
    hasher: Arc<CredentialHasher>,
}

impl IdentityRegistrar {
    /// Create a new [`IdentityRegistrar`].
    pub fn new(
        repo: UserRepository,
        ldap: Ldap,
        hasher: Arc<CredentialHasher>,
    ) -> Self {
        Self { repo, ldap, hasher }
    }

    /// Provision a new identity in both stores.
    pub async fn register(
        &self,
        input: &RegistrationInput,
    ) -> Result<UserRecord> {
        self.check_uniqueness(input).await?;

        let user_id = self
            .repo
            .insert_draft(input.username.trim(), input.display_name.trim())
            .await?;

        let password_hash = self.hasher.hash(&input.password)?;
        let entry = UserEntry::derive(input, password_hash);

        if let Err(err) = self.provision_directory(&entry).await {
            tracing::error!(
                user_id,
                uid = %entry.uid,
                error = %err,
                "directory provisioning failed"
            );
            self.compensate(user_id).await;
            return Err(ServerError::Provisioning);
        }

        Ok(UserRecord {
            user_id,
            ldap_uid: entry.uid,
            display_name: Some(entry.display_name),
            ..Default::default()
        })
    }

    /// Re-check uniqueness defensively, reporting every violated
    /// constraint at once. The two lookups run concurrently.
    async fn check_uniqueness(&self, input: &RegistrationInput) -> Result<()> {
        let (username_taken, email_owner) = tokio::join!(
            self.username_taken(&input.username),
            self.ldap.find_by_mail(&input.email),
        );

        let mut fields = Vec::new();
        if username_taken? {
            fields.push(Conflict::Username);
        }
        if email_owner?.is_some() {
            fields.push(Conflict::Email);
        }

        if fields.is_empty() {
            Ok(())
        } else {
            Err(ServerError::Conflict { fields })
        }
    }

    /// A username is taken when either namespace knows it.
    async fn username_taken(&self, username: &str) -> Result<bool> {
        if self.repo.find_by_identifier(username).await?.is_some() {
            return Ok(true);
        }

        Ok(self.ldap.find_by_uid(username.trim()).await?.is_some())
    }

    async fn provision_directory(&self, entry: &UserEntry) -> Result<()> {
        self.ldap.add_user(entry).await?;
        self.ldap
            .ensure_group_member(&self.ldap.user_dn(&entry.uid))
            .await
    }

    /// Delete the draft row after a failed directory step.
    ///
    /// Not a rollback: the delete is retried once, and a second failure
    /// leaves an orphaned relational row with no directory counterpart.
    async fn compensate(&self, user_id: i64) {
        for attempt in 1..=2u8 {
            match self.repo.delete_draft(user_id).await {
                Ok(()) => {
                    tracing::warn!(
                        user_id,
                        attempt,
                        "registration compensated, draft row deleted"
                    );
                    return;
                },
                Err(err) if attempt == 1 => {
                    tracing::warn!(
                        user_id,
                        error = %err,
                        "draft deletion failed, retrying once"
                    );
                },
                Err(err) => {
                    tracing::error!(
                        user_id,
                        error = %err,
                        "compensation failed, relational row orphaned \
                         without directory entry"
                    );
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Tables;
    use crate::ldap::LdapConfig;
    use sqlx::{Pool, Postgres};
    use std::time::Duration;

    /// A gateway pointed at a closed port: every directory call fails.
    fn dead_ldap() -> Ldap {
        Ldap::new(LdapConfig {
            addr: "ldap://127.0.0.1:1".to_owned(),
            users_dn: "ou=users,dc=example,dc=org".to_owned(),
            groups_dn: "ou=groups,dc=example,dc=org".to_owned(),
            default_group: "members".to_owned(),
            bind_dn: Some("cn=admin,dc=example,dc=org".to_owned()),
            bind_password: Some("admin".to_owned()),
            timeout: Duration::from_millis(250),
        })
    }

    fn light_hasher() -> Arc<CredentialHasher> {
        Arc::new(
            CredentialHasher::new(Some(crate::config::Argon2 {
                memory_cost: 8,
                iterations: 1,
                parallelism: 1,
                hash_length: 32,
            }))
            .unwrap(),
        )
    }

    fn registrar(pool: Pool<Postgres>) -> IdentityRegistrar {
        IdentityRegistrar::new(
            UserRepository::new(pool, Tables::default()),
            dead_ldap(),
            light_hasher(),
        )
    }

    #[sqlx::test]
    async fn test_failed_directory_step_deletes_draft(pool: Pool<Postgres>) {
        let registrar = registrar(pool.clone());
        let input = RegistrationInput {
            first_name: "Alice".to_owned(),
            last_name: "Archer".to_owned(),
            display_name: "Alice A".to_owned(),
            username: "alice".to_owned(),
            email: "alice@example.com".to_owned(),
            password: "s3cret1".to_owned(),
        };

        // The uniqueness re-check already needs the directory; with an
        // unreachable one the whole call is a transport failure before any
        // row is written.
        let err = registrar.register(&input).await.unwrap_err();
        assert!(matches!(err, ServerError::Ldap(_)));

        // Drive the post-draft path directly: draft row in, directory add
        // fails, compensation must remove the row.
        let repo = UserRepository::new(pool, Tables::default());
        let user_id = repo.insert_draft("alice", "Alice A").await.unwrap();
        let entry = UserEntry::derive(&input, "{ARGON2}x".to_owned());

        assert!(registrar.provision_directory(&entry).await.is_err());
        registrar.compensate(user_id).await;

        assert!(repo.find_by_identifier("alice").await.unwrap().is_none());
    }

    #[sqlx::test]
    async fn test_relational_conflict_detected_first(pool: Pool<Postgres>) {
        let repo = UserRepository::new(pool.clone(), Tables::default());
        repo.insert_draft("alice", "Alice A").await.unwrap();

        let registrar = registrar(pool);
        let taken = registrar.username_taken("alice").await.unwrap();

        // The relational hit short-circuits before the directory lookup.
        assert!(taken);
    }
}
