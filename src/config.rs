//! Configuration manager for bindery.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::FromRef;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::AppState;

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const VERSION: &str = env!("CARGO_PKG_VERSION");

const DEFAULT_PRIMARY_TABLE: &str = "users";

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    /// Instance name.
    pub name: String,
    /// Domain name of current instance.
    pub url: String,
    #[serde(default)]
    version: String,
    #[serde(skip)]
    path: PathBuf,
    /// Related to PostgreSQL configuration.
    #[serde(skip_serializing)]
    pub postgres: Option<Postgres>,
    /// Related to LDAP3 configuration.
    #[serde(skip_serializing)]
    pub ldap: Option<Ldap>,
    /// Related to Argon2 configuration.
    #[serde(skip_serializing)]
    pub argon2: Option<Argon2>,
    /// Related to automatic mail sending.
    #[serde(skip_serializing)]
    pub mail: Option<Mail>,
    /// Related to password-reset links.
    #[serde(skip_serializing)]
    pub reset: Option<Reset>,
    /// Relational table layout.
    #[serde(default, skip_serializing)]
    pub tables: Tables,
}

/// PostgreSQL configuration.
#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
pub struct Postgres {
    /// Hostname:(?port) for PostgreSQL instance.
    pub address: String,
    /// Database name.
    pub database: Option<String>,
    /// Username credential to connect.
    pub username: Option<String>,
    /// Password credential to connect.
    pub password: Option<String>,
    /// Maximum pool connections.
    pub pool_size: Option<u32>,
}

/// Argon2 configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Argon2 {
    /// Memory used while hashing.
    pub memory_cost: u32,
    /// Iterations of hash.
    pub iterations: u32,
    /// Parallelism degree.
    pub parallelism: u32,
    /// Output hash length.
    pub hash_length: usize,
}

impl Default for Argon2 {
    fn default() -> Self {
        // OpenLDAP's Argon2 overlay defaults, so slapd can verify what we
        // store.
        Self {
            memory_cost: 1024 * 64, // 64 MiB.
            iterations: 2,
            parallelism: 1,
            hash_length: 32,
        }
    }
}

/// Mail queue configuration.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mail {
    /// Hostname:(?port) for RabbitMQ instance.
    pub address: String,
    /// RabbitMQ default vhost.
    pub vhost: Option<String>,
    /// RabbitMQ username to access queue.
    pub username: String,
    /// RabbitMQ password to access queue.
    pub password: String,
    /// Max channel connections.
    pub pool: Option<u16>,
    /// Queue name to send mailing events.
    pub queue: String,
}

/// LDAP configuration.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ldap {
    /// Hostname:(?port) for LDAP instance.
    pub address: String,
    /// Service DN credential to connect.
    pub user: Option<String>,
    /// Password credential to connect.
    pub password: Option<String>,
    /// DN under which user entries live.
    pub users_dn: String,
    /// DN under which group entries live.
    pub groups_dn: String,
    /// Group every new user is linked to.
    pub default_group: String,
    /// Bound on connection and per-operation time, in seconds.
    pub timeout_secs: Option<u64>,
}

/// Password-reset link configuration.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reset {
    /// Base URL reset links are built from. Falls back to `url`.
    pub base_url: Option<String>,
    /// Token lifetime in seconds.
    pub token_ttl_secs: Option<i64>,
}

/// Names of the relational user tables.
///
/// The fallback table holds legacy records and is consulted read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tables {
    #[serde(default = "Tables::default_primary")]
    pub primary: String,
    #[serde(default)]
    pub fallback: Option<String>,
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            primary: DEFAULT_PRIMARY_TABLE.to_owned(),
            fallback: None,
        }
    }
}

impl Tables {
    fn default_primary() -> String {
        DEFAULT_PRIMARY_TABLE.to_owned()
    }

    /// Replace table names that are not plain SQL identifiers.
    ///
    /// Table names are spliced into statements, so they must never carry
    /// anything but an identifier, even coming from the trusted config file.
    fn sanitized(mut self) -> Self {
        if !is_sql_identifier(&self.primary) {
            tracing::error!(
                table = %self.primary,
                "`tables.primary` is not a valid identifier"
            );
            self.primary = DEFAULT_PRIMARY_TABLE.to_owned();
        }

        if let Some(fallback) = self.fallback.take_if(|t| !is_sql_identifier(t))
        {
            tracing::error!(
                table = %fallback,
                "`tables.fallback` is not a valid identifier, ignored"
            );
        }

        self
    }
}

fn is_sql_identifier(name: &str) -> bool {
    let mut chars = name.chars();

    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.len() <= 63
}

impl FromRef<AppState> for Arc<Configuration> {
    fn from_ref(state: &AppState) -> Arc<Configuration> {
        Arc::clone(&state.config)
    }
}

impl Configuration {
    pub fn path(mut self, path: PathBuf) -> Self {
        self.path = path;
        self
    }

    /// Normalizes a URL string by ensuring it starts with a valid scheme
    /// (`http` or `https`).
    fn normalize_url(&self, url: &str) -> Result<String, url::ParseError> {
        let url_with_scheme =
            if url.starts_with("http://") || url.starts_with("https://") {
                url.to_string()
            } else {
                format!("https://{url}")
            };

        let parsed_url = Url::parse(&url_with_scheme)?;
        Ok(parsed_url.to_string())
    }

    /// Reads the `config.yaml` file from the specified path or the default
    /// location.
    pub fn read(self) -> Result<Arc<Self>, url::ParseError> {
        let file_path = if self.path.is_file() {
            &self.path
        } else {
            &Path::new(DEFAULT_CONFIG_PATH).to_path_buf()
        };

        match File::open(file_path) {
            Ok(file) => {
                let mut config: Configuration =
                    match serde_yaml::from_reader(file) {
                        Ok(config) => config,
                        Err(err) => {
                            return Ok(Arc::new(self.error(err)));
                        },
                    };

                // set app version.
                config.version = VERSION.to_owned();

                // normalize URLs.
                config.url = self.normalize_url(&config.url)?;
                if let Some(reset) = &mut config.reset {
                    reset.base_url = reset
                        .base_url
                        .take()
                        .map(|u| self.normalize_url(&u))
                        .transpose()?;
                }

                config.tables = config.tables.sanitized();

                Ok(Arc::new(config))
            },
            Err(err) => Ok(Arc::new(self.error(err))),
        }
    }

    /// Return a default configuration as fallback.
    fn error(&self, err: impl std::error::Error) -> Self {
        tracing::error!(error = %err, "`config.yaml` file not found");
        Self {
            version: VERSION.to_owned(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_identifier() {
        assert!(is_sql_identifier("users"));
        assert!(is_sql_identifier("user_main_details"));
        assert!(is_sql_identifier("_shadow2"));
        assert!(!is_sql_identifier(""));
        assert!(!is_sql_identifier("2users"));
        assert!(!is_sql_identifier("users; DROP TABLE users"));
        assert!(!is_sql_identifier("users-legacy"));
    }

    #[test]
    fn test_tables_sanitized() {
        let tables = Tables {
            primary: "users;--".to_owned(),
            fallback: Some("legacy users".to_owned()),
        };
        let tables = tables.sanitized();

        assert_eq!(tables.primary, DEFAULT_PRIMARY_TABLE);
        assert_eq!(tables.fallback, None);

        let tables = Tables {
            primary: "accounts".to_owned(),
            fallback: Some("accounts_legacy".to_owned()),
        };
        let tables = tables.sanitized();

        assert_eq!(tables.primary, "accounts");
        assert_eq!(tables.fallback.as_deref(), Some("accounts_legacy"));
    }
}
