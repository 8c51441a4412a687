//! Handle relational store requests.

use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};

use crate::config::Tables;
use crate::error::Result;
use crate::user::{Origin, UserRecord};

/// Reset-attempt ledger. One row per user; the newest attempt wins.
const RESET_LEDGER_TABLE: &str = "password_resets";

#[derive(Clone)]
pub struct UserRepository {
    pool: Pool<Postgres>,
    tables: Tables,
}

impl UserRepository {
    /// Create a new [`UserRepository`].
    pub fn new(pool: Pool<Postgres>, tables: Tables) -> Self {
        Self { pool, tables }
    }

    /// Resolve an identifier to a record, primary table first, then the
    /// fallback table when one is configured.
    pub async fn find_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<Option<UserRecord>> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Ok(None);
        }

        if let Some(record) =
            self.find_in(&self.tables.primary, identifier).await?
        {
            return Ok(Some(record));
        }

        if let Some(fallback) = &self.tables.fallback {
            if let Some(mut record) = self.find_in(fallback, identifier).await?
            {
                record.origin = Origin::Fallback;
                return Ok(Some(record));
            }
        }

        Ok(None)
    }

    async fn find_in(
        &self,
        table: &str,
        identifier: &str,
    ) -> Result<Option<UserRecord>> {
        let query = format!(
            "SELECT user_id, ldap_uid, display_name, last_login_at
                FROM {table} WHERE ldap_uid = $1 LIMIT 1"
        );

        let record = sqlx::query_as::<_, UserRecord>(&query)
            .bind(identifier)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    /// Insert a draft row for a registration in progress.
    ///
    /// Commits before returning: the directory write that follows belongs
    /// to a separate failure domain and must never hold this transaction
    /// open.
    pub async fn insert_draft(
        &self,
        username: &str,
        display_name: &str,
    ) -> Result<i64> {
        let query = format!(
            "INSERT INTO {} (ldap_uid, display_name, last_login_at)
                VALUES ($1, $2, NOW()) RETURNING user_id",
            self.tables.primary
        );

        let mut tx = self.pool.begin().await?;
        let (user_id,): (i64,) = sqlx::query_as(&query)
            .bind(username)
            .bind(display_name)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(user_id)
    }

    /// Delete a draft row after a failed directory step.
    pub async fn delete_draft(&self, user_id: i64) -> Result<()> {
        let query =
            format!("DELETE FROM {} WHERE user_id = $1", self.tables.primary);

        sqlx::query(&query).bind(user_id).execute(&self.pool).await?;
        Ok(())
    }

    /// Record a successful login.
    pub async fn update_last_login(&self, record: &UserRecord) -> Result<()> {
        if record.origin == Origin::Fallback {
            // Legacy records keep their table read-only.
            tracing::debug!(
                user_id = record.user_id,
                "skipping login bookkeeping for fallback record"
            );
            return Ok(());
        }

        let query = format!(
            "UPDATE {} SET last_login_at = NOW() WHERE user_id = $1",
            self.tables.primary
        );

        sqlx::query(&query)
            .bind(record.user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a freshly issued reset token, superseding any previous row.
    pub async fn upsert_reset_ledger(
        &self,
        user_id: i64,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let query = format!(
            "INSERT INTO {RESET_LEDGER_TABLE} (user_id, token_issued, expires_at, used)
                VALUES ($1, TRUE, $2, FALSE)
                ON CONFLICT (user_id) DO UPDATE
                SET token_issued = TRUE, expires_at = EXCLUDED.expires_at, used = FALSE"
        );

        sqlx::query(&query)
            .bind(user_id)
            .bind(expires_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mark the outstanding reset attempt as consumed.
    pub async fn mark_ledger_consumed(&self, user_id: i64) -> Result<()> {
        let query = format!(
            "UPDATE {RESET_LEDGER_TABLE}
                SET used = TRUE, token_issued = FALSE
                WHERE user_id = $1 AND used = FALSE"
        );

        sqlx::query(&query).bind(user_id).execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repository(pool: Pool<Postgres>) -> UserRepository {
        UserRepository::new(pool, Tables::default())
    }

    #[sqlx::test]
    async fn test_draft_roundtrip(pool: Pool<Postgres>) {
        let repo = repository(pool);

        let user_id = repo.insert_draft("alice", "Alice A").await.unwrap();
        let record = repo
            .find_by_identifier("alice")
            .await
            .unwrap()
            .expect("draft row should resolve");

        assert_eq!(record.user_id, user_id);
        assert_eq!(record.ldap_uid, "alice");
        assert_eq!(record.display_name.as_deref(), Some("Alice A"));
        assert_eq!(record.origin, Origin::Primary);

        repo.delete_draft(user_id).await.unwrap();
        assert!(repo.find_by_identifier("alice").await.unwrap().is_none());
    }

    #[sqlx::test]
    async fn test_blank_identifier_resolves_nothing(pool: Pool<Postgres>) {
        let repo = repository(pool);

        assert!(repo.find_by_identifier("  ").await.unwrap().is_none());
        assert!(repo.find_by_identifier("ghost").await.unwrap().is_none());
    }

    #[sqlx::test]
    async fn test_reset_ledger_keeps_one_row(pool: Pool<Postgres>) {
        let repo = repository(pool.clone());
        let user_id = repo.insert_draft("alice", "Alice A").await.unwrap();

        let first = Utc::now() + chrono::Duration::hours(1);
        let second = Utc::now() + chrono::Duration::hours(2);
        repo.upsert_reset_ledger(user_id, first).await.unwrap();
        repo.upsert_reset_ledger(user_id, second).await.unwrap();

        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM password_resets WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 1);

        let (used, issued): (bool, bool) = sqlx::query_as(
            "SELECT used, token_issued FROM password_resets WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert!(!used);
        assert!(issued);
    }

    #[sqlx::test]
    async fn test_ledger_consumption(pool: Pool<Postgres>) {
        let repo = repository(pool.clone());
        let user_id = repo.insert_draft("alice", "Alice A").await.unwrap();

        let expires_at = Utc::now() + chrono::Duration::hours(1);
        repo.upsert_reset_ledger(user_id, expires_at).await.unwrap();
        repo.mark_ledger_consumed(user_id).await.unwrap();

        let (used, issued): (bool, bool) = sqlx::query_as(
            "SELECT used, token_issued FROM password_resets WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert!(used);
        assert!(!issued);

        // A new attempt reopens the same row.
        repo.upsert_reset_ledger(user_id, expires_at).await.unwrap();
        let (used,): (bool,) = sqlx::query_as(
            "SELECT used FROM password_resets WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert!(!used);
    }

    #[sqlx::test]
    async fn test_last_login_bookkeeping(pool: Pool<Postgres>) {
        let repo = repository(pool);
        repo.insert_draft("alice", "Alice A").await.unwrap();

        let before = repo
            .find_by_identifier("alice")
            .await
            .unwrap()
            .unwrap();
        repo.update_last_login(&before).await.unwrap();

        let after = repo.find_by_identifier("alice").await.unwrap().unwrap();
        assert!(after.last_login_at >= before.last_login_at);

        // Fallback-origin records are left untouched.
        let mut legacy = after;
        legacy.origin = Origin::Fallback;
        repo.update_last_login(&legacy).await.unwrap();
    }
}
