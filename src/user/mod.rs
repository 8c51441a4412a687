mod authenticator;
mod registrar;
mod repository;
mod reset;

pub use authenticator::*;
pub use registrar::*;
pub use repository::*;
pub use reset::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which relational table a record was resolved from.
///
/// The fallback table holds legacy records and is never written to.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    #[default]
    Primary,
    Fallback,
}

/// User as saved on the relational store.
///
/// The directory owns the credential and contact attributes; this record
/// only carries the numeric identity and login bookkeeping.
#[derive(
    Clone, Debug, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow,
)]
pub struct UserRecord {
    pub user_id: i64,
    pub ldap_uid: String,
    pub display_name: Option<String>,
    #[serde(skip)]
    pub last_login_at: Option<DateTime<Utc>>,
    #[sqlx(skip)]
    #[serde(skip)]
    pub origin: Origin,
}

/// Caller-validated material for a new identity.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegistrationInput {
    pub first_name: String,
    pub last_name: String,
    pub display_name: String,
    pub username: String,
    pub email: String,
    pub password: String,
}
