pub mod login;
pub mod password;
pub mod register;
pub mod status;
pub mod users;

use std::sync::LazyLock;

use axum::Json;
use axum::extract::{FromRequest, Request};
use regex_lite::Regex;
use validator::{Validate, ValidationError};

use crate::error::{Result, ServerError};

static USERNAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").unwrap());

/// JSON body extractor running `validator` checks before the handler.
pub struct Valid<T>(pub T);

impl<S, T> FromRequest<S> for Valid<T>
where
    S: Send + Sync,
    T: serde::de::DeserializeOwned + Validate,
{
    type Rejection = ServerError;

    async fn from_request(req: Request, state: &S) -> Result<Self> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        value.validate()?;
        Ok(Valid(value))
    }
}

/// Usernames map to directory uids; keep them to a DN-safe charset.
pub(crate) fn validate_username(
    value: &str,
) -> std::result::Result<(), ValidationError> {
    if USERNAME.is_match(value.trim()) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_username"))
    }
}

#[cfg(test)]
pub(crate) fn state(pool: sqlx::Pool<sqlx::Postgres>) -> crate::AppState {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::{Argon2, Configuration};
    use crate::crypto::CredentialHasher;
    use crate::database::Database;
    use crate::ldap::{Ldap, LdapConfig};
    use crate::mail::MailManager;

    let mut config = Configuration::default();
    config.name = "bindery".to_owned();
    config.url = "https://chat.example.com".to_owned();

    // Closed port: any directory operation fails fast.
    let ldap = Ldap::new(LdapConfig {
        addr: "ldap://127.0.0.1:1".to_owned(),
        users_dn: "ou=users,dc=example,dc=org".to_owned(),
        groups_dn: "ou=groups,dc=example,dc=org".to_owned(),
        default_group: "members".to_owned(),
        bind_dn: Some("cn=admin,dc=example,dc=org".to_owned()),
        bind_password: Some("admin".to_owned()),
        timeout: Duration::from_millis(250),
    });

    let crypto = Arc::new(
        CredentialHasher::new(Some(Argon2 {
            memory_cost: 8,
            iterations: 1,
            parallelism: 1,
            hash_length: 32,
        }))
        .unwrap(),
    );

    crate::AppState {
        config: Arc::new(config),
        db: Database { postgres: pool },
        ldap,
        crypto,
        mail: MailManager::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_username() {
        assert!(validate_username("alice").is_ok());
        assert!(validate_username("alice.archer-2_x").is_ok());
        assert!(validate_username("alice archer").is_err());
        assert!(validate_username("uid=admin,dc=org").is_err());
        assert!(validate_username("a*b").is_err());
    }
}
