//! LDAP support.
//!
//! Every exposed operation opens its own connection, performs one unit of
//! work and releases the connection whatever the outcome. Nothing here
//! retries: an ambiguous directory failure must surface to the caller.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use ldap3::{
    Ldap as Ldap3, LdapConnAsync, LdapConnSettings, LdapError, Mod, Scope,
    SearchEntry,
};

use crate::config;
use crate::error::{Result, ServerError};
use crate::user::RegistrationInput;

/// Object classes for every provisioned user entry. `resetTokenAux` carries
/// the reset token attributes.
const USER_OBJECT_CLASSES: [&str; 3] = ["inetOrgPerson", "top", "resetTokenAux"];

pub const RESET_TOKEN_ATTR: &str = "resetToken";
pub const RESET_EXPIRY_ATTR: &str = "resetTokenExpiry";

const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// attributeOrValueExists: the member DN is already in the group.
const RC_ATTRIBUTE_OR_VALUE_EXISTS: u32 = 20;
/// entryAlreadyExists.
const RC_ENTRY_ALREADY_EXISTS: u32 = 68;

#[derive(Debug, Clone)]
pub struct LdapConfig {
    pub addr: String,
    pub users_dn: String,
    pub groups_dn: String,
    pub default_group: String,
    pub bind_dn: Option<String>,
    pub bind_password: Option<String>,
    pub timeout: Duration,
}

impl LdapConfig {
    /// Configure LDAP `dn` for a user identifier.
    pub fn user_dn(&self, uid: &str) -> String {
        format!("uid={},{}", escape_dn(uid), self.users_dn)
    }

    /// Configure LDAP `dn` for a group common name.
    pub fn group_dn(&self, cn: &str) -> String {
        format!("cn={},{}", escape_dn(cn), self.groups_dn)
    }
}

impl From<&config::Ldap> for LdapConfig {
    fn from(cfg: &config::Ldap) -> Self {
        Self {
            addr: cfg.address.clone(),
            users_dn: cfg.users_dn.clone(),
            groups_dn: cfg.groups_dn.clone(),
            default_group: cfg.default_group.clone(),
            bind_dn: cfg.user.clone(),
            bind_password: cfg.password.clone(),
            timeout: Duration::from_secs(
                cfg.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
            ),
        }
    }
}

/// A directory entry with attributes normalized to strings.
///
/// Search results arrive as a mix of textual and binary values; they are
/// collapsed here, once, so no caller does its own type narrowing.
/// Attribute names are folded to lowercase (they are case-insensitive on
/// the wire).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirectoryEntry {
    pub dn: String,
    attrs: HashMap<String, Vec<String>>,
}

impl DirectoryEntry {
    fn from_search(entry: SearchEntry) -> Self {
        let mut attrs: HashMap<String, Vec<String>> = HashMap::new();

        for (name, values) in entry.attrs {
            attrs.entry(name.to_lowercase()).or_default().extend(values);
        }
        for (name, values) in entry.bin_attrs {
            attrs.entry(name.to_lowercase()).or_default().extend(
                values
                    .iter()
                    .map(|bytes| String::from_utf8_lossy(bytes).into_owned()),
            );
        }

        Self {
            dn: entry.dn,
            attrs,
        }
    }

    /// First value of an attribute, if any.
    pub fn first(&self, attr: &str) -> Option<&str> {
        self.attrs
            .get(&attr.to_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn uid(&self) -> Option<&str> {
        self.first("uid")
    }
}

/// Attributes written when provisioning a directory entry.
#[derive(Debug, Clone, PartialEq)]
pub struct UserEntry {
    pub uid: String,
    pub surname: String,
    pub given_name: String,
    pub common_name: String,
    pub display_name: String,
    pub mail: String,
    pub password_hash: String,
}

impl UserEntry {
    /// Derive directory attributes from registration input.
    ///
    /// Surname falls back to the first name, then the username; the common
    /// name is built from the given and last names with the same fallbacks;
    /// a blank display name resolves to the derived common name.
    pub fn derive(input: &RegistrationInput, password_hash: String) -> Self {
        let first = input.first_name.trim();
        let last = input.last_name.trim();
        let display = input.display_name.trim();
        let username = input.username.trim();

        let surname = [last, first, username]
            .into_iter()
            .find(|s| !s.is_empty())
            .unwrap_or(username)
            .to_owned();
        let given_name = if first.is_empty() { username } else { first };
        let common_name = {
            let joined = format!("{given_name} {last}");
            let joined = joined.trim();
            if joined.is_empty() {
                username.to_owned()
            } else {
                joined.to_owned()
            }
        };
        let display_name = if display.is_empty() {
            common_name.clone()
        } else {
            display.to_owned()
        };

        Self {
            uid: username.to_owned(),
            surname,
            given_name: given_name.to_owned(),
            common_name,
            display_name,
            mail: input.email.trim().to_lowercase(),
            password_hash,
        }
    }
}

/// Directory gateway. Holds configuration only; every operation drives its
/// own connection.
#[derive(Clone, Debug)]
pub struct Ldap {
    config: LdapConfig,
}

impl Ldap {
    /// Create a new [`Ldap`] gateway.
    pub fn new(config: LdapConfig) -> Self {
        Self { config }
    }

    /// DN of a user entry under the configured location.
    pub fn user_dn(&self, uid: &str) -> String {
        self.config.user_dn(uid)
    }

    async fn open(&self) -> Result<Ldap3> {
        let settings =
            LdapConnSettings::new().set_conn_timeout(self.config.timeout);
        let (conn, ldap) =
            LdapConnAsync::with_settings(settings, &self.config.addr).await?;
        ldap3::drive!(conn);

        Ok(ldap)
    }

    /// Open a connection bound as the service identity.
    ///
    /// Fails fast when bind credentials are absent; an anonymous bind is
    /// never attempted.
    async fn open_service(&self) -> Result<Ldap3> {
        let (Some(dn), Some(password)) =
            (&self.config.bind_dn, &self.config.bind_password)
        else {
            return Err(ServerError::MissingBindCredentials);
        };

        let mut ldap = self.open().await?;
        let bound = ldap
            .with_timeout(self.config.timeout)
            .simple_bind(dn, password)
            .await
            .and_then(|res| res.success());

        if let Err(err) = bound {
            let _ = ldap.unbind().await;
            return Err(err.into());
        }

        Ok(ldap)
    }

    /// Verify an end user's password by binding as their DN.
    pub async fn bind_user(&self, uid: &str, password: &str) -> Result<()> {
        let dn = self.config.user_dn(uid);
        let mut ldap = self.open().await?;

        let outcome = ldap
            .with_timeout(self.config.timeout)
            .simple_bind(&dn, password)
            .await
            .and_then(|res| res.success());
        let _ = ldap.unbind().await;

        outcome?;
        Ok(())
    }

    async fn search(
        &self,
        base: &str,
        filter: &str,
        attrs: Vec<&str>,
    ) -> Result<Vec<DirectoryEntry>> {
        let mut ldap = self.open_service().await?;

        let outcome = ldap
            .with_timeout(self.config.timeout)
            .search(base, Scope::Subtree, filter, attrs)
            .await
            .and_then(|res| res.success());
        let _ = ldap.unbind().await;

        let (entries, _) = outcome?;
        Ok(entries
            .into_iter()
            .map(|entry| {
                DirectoryEntry::from_search(SearchEntry::construct(entry))
            })
            .collect())
    }

    async fn search_one(
        &self,
        filter: &str,
        attrs: Vec<&str>,
    ) -> Result<Option<DirectoryEntry>> {
        let entries = self.search(&self.config.users_dn, filter, attrs).await?;
        Ok(entries.into_iter().next())
    }

    /// Find a user entry by its uid.
    pub async fn find_by_uid(
        &self,
        uid: &str,
    ) -> Result<Option<DirectoryEntry>> {
        let filter = format!("(uid={})", escape_filter(uid));
        self.search_one(&filter, vec!["uid", "cn", "displayName", "mail"])
            .await
    }

    /// Find a user entry by its mail attribute.
    pub async fn find_by_mail(
        &self,
        mail: &str,
    ) -> Result<Option<DirectoryEntry>> {
        let filter = format!("(mail={})", escape_filter(mail));
        self.search_one(&filter, vec!["uid", "mail"]).await
    }

    /// Find the user entry holding an outstanding reset token.
    pub async fn find_by_reset_token(
        &self,
        token: &str,
    ) -> Result<Option<DirectoryEntry>> {
        let filter =
            format!("({}={})", RESET_TOKEN_ATTR, escape_filter(token));
        self.search_one(&filter, vec!["uid", RESET_EXPIRY_ATTR]).await
    }

    /// List user entries under the configured location.
    pub async fn list_users(&self) -> Result<Vec<DirectoryEntry>> {
        self.search(
            &self.config.users_dn,
            "(objectClass=inetOrgPerson)",
            vec!["uid", "cn", "displayName", "mail"],
        )
        .await
    }

    /// Create the directory entry for a newly provisioned user.
    pub async fn add_user(&self, entry: &UserEntry) -> Result<()> {
        let dn = self.config.user_dn(&entry.uid);
        let attrs: Vec<(&str, HashSet<&str>)> = vec![
            ("objectClass", USER_OBJECT_CLASSES.into_iter().collect()),
            ("uid", [entry.uid.as_str()].into_iter().collect()),
            ("sn", [entry.surname.as_str()].into_iter().collect()),
            ("givenName", [entry.given_name.as_str()].into_iter().collect()),
            ("cn", [entry.common_name.as_str()].into_iter().collect()),
            (
                "displayName",
                [entry.display_name.as_str()].into_iter().collect(),
            ),
            ("mail", [entry.mail.as_str()].into_iter().collect()),
            (
                "userPassword",
                [entry.password_hash.as_str()].into_iter().collect(),
            ),
        ];

        let mut ldap = self.open_service().await?;
        let outcome = ldap
            .with_timeout(self.config.timeout)
            .add(&dn, attrs)
            .await
            .and_then(|res| res.success());
        let _ = ldap.unbind().await;

        outcome?;
        Ok(())
    }

    /// Append a member DN to the default group.
    ///
    /// The directory answering "already present" counts as done.
    pub async fn ensure_group_member(&self, member_dn: &str) -> Result<()> {
        let group_dn = self.config.group_dn(&self.config.default_group);
        let changes = vec![Mod::Add(
            "member",
            [member_dn].into_iter().collect::<HashSet<&str>>(),
        )];

        let mut ldap = self.open_service().await?;
        let outcome = ldap
            .with_timeout(self.config.timeout)
            .modify(&group_dn, changes)
            .await
            .and_then(|res| res.success());
        let _ = ldap.unbind().await;

        match outcome {
            Ok(_) => Ok(()),
            Err(LdapError::LdapResult { result })
                if result.rc == RC_ATTRIBUTE_OR_VALUE_EXISTS
                    || result.rc == RC_ENTRY_ALREADY_EXISTS =>
            {
                tracing::debug!(member = member_dn, "already a group member");
                Ok(())
            },
            Err(err) => Err(err.into()),
        }
    }

    /// Write a fresh reset token and expiry, superseding any previous pair.
    pub async fn store_reset_token(
        &self,
        dn: &str,
        token: &str,
        expires_at: &str,
    ) -> Result<()> {
        let changes = vec![
            Mod::Replace(
                RESET_TOKEN_ATTR,
                [token].into_iter().collect::<HashSet<&str>>(),
            ),
            Mod::Replace(
                RESET_EXPIRY_ATTR,
                [expires_at].into_iter().collect(),
            ),
        ];

        self.modify(dn, changes).await
    }

    /// Rotate the credential and clear the token pair in a single modify.
    pub async fn rotate_password(
        &self,
        dn: &str,
        password_hash: &str,
    ) -> Result<()> {
        let changes = vec![
            Mod::Replace(
                "userPassword",
                [password_hash].into_iter().collect::<HashSet<&str>>(),
            ),
            Mod::Delete(RESET_TOKEN_ATTR, HashSet::new()),
            Mod::Delete(RESET_EXPIRY_ATTR, HashSet::new()),
        ];

        self.modify(dn, changes).await
    }

    async fn modify(&self, dn: &str, changes: Vec<Mod<&str>>) -> Result<()> {
        let mut ldap = self.open_service().await?;

        let outcome = ldap
            .with_timeout(self.config.timeout)
            .modify(dn, changes)
            .await
            .and_then(|res| res.success());
        let _ = ldap.unbind().await;

        outcome?;
        Ok(())
    }
}

/// Escape a value used inside a search filter (RFC 4515).
fn escape_filter(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for b in input.as_bytes() {
        match *b {
            b'*' => out.push_str(r"\2a"),
            b'(' => out.push_str(r"\28"),
            b')' => out.push_str(r"\29"),
            b'\\' => out.push_str(r"\5c"),
            0 => out.push_str(r"\00"),
            c => out.push(c as char),
        }
    }
    out
}

/// Escape a value used inside a DN (RFC 4514).
fn escape_dn(value: &str) -> String {
    let last = value.chars().count().saturating_sub(1);
    let mut out = String::with_capacity(value.len());

    for (i, c) in value.chars().enumerate() {
        match c {
            ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=' => {
                out.push('\\');
                out.push(c);
            },
            '\0' => out.push_str("\\00"),
            ' ' if i == 0 || i == last => out.push_str("\\20"),
            '#' if i == 0 => out.push_str("\\23"),
            _ => out.push(c),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> LdapConfig {
        LdapConfig {
            addr: "ldap://127.0.0.1:389".to_owned(),
            users_dn: "ou=users,dc=example,dc=org".to_owned(),
            groups_dn: "ou=groups,dc=example,dc=org".to_owned(),
            default_group: "members".to_owned(),
            bind_dn: Some("cn=admin,dc=example,dc=org".to_owned()),
            bind_password: Some("admin".to_owned()),
            timeout: Duration::from_secs(5),
        }
    }

    fn input(
        first: &str,
        last: &str,
        display: &str,
        username: &str,
    ) -> RegistrationInput {
        RegistrationInput {
            first_name: first.to_owned(),
            last_name: last.to_owned(),
            display_name: display.to_owned(),
            username: username.to_owned(),
            email: "Alice@Example.com".to_owned(),
            password: "s3cret1".to_owned(),
        }
    }

    #[test]
    fn test_user_dn_escapes_value() {
        let config = test_config();

        assert_eq!(
            config.user_dn("alice"),
            "uid=alice,ou=users,dc=example,dc=org"
        );
        assert_eq!(
            config.user_dn("a,b=c"),
            "uid=a\\,b\\=c,ou=users,dc=example,dc=org"
        );
    }

    #[test]
    fn test_group_dn() {
        let config = test_config();

        assert_eq!(
            config.group_dn("members"),
            "cn=members,ou=groups,dc=example,dc=org"
        );
    }

    #[test]
    fn test_escape_filter() {
        assert_eq!(escape_filter("alice"), "alice");
        assert_eq!(escape_filter("a*(b)\\"), r"a\2a\28b\29\5c");
    }

    #[test]
    fn test_escape_dn_spaces_and_hash() {
        assert_eq!(escape_dn(" alice "), "\\20alice\\20");
        assert_eq!(escape_dn("#tag"), "\\23tag");
        assert_eq!(escape_dn("mid dle"), "mid dle");
    }

    #[test]
    fn test_derive_full_input() {
        let entry = UserEntry::derive(
            &input("Alice", "Archer", "Alice A", "alice"),
            "{ARGON2}hash".to_owned(),
        );

        assert_eq!(entry.uid, "alice");
        assert_eq!(entry.surname, "Archer");
        assert_eq!(entry.given_name, "Alice");
        assert_eq!(entry.common_name, "Alice Archer");
        assert_eq!(entry.display_name, "Alice A");
        assert_eq!(entry.mail, "alice@example.com");
        assert_eq!(entry.password_hash, "{ARGON2}hash");
    }

    #[test]
    fn test_derive_fallbacks() {
        // No last name: surname falls back to the first name.
        let entry = UserEntry::derive(
            &input("Alice", "", "", "alice"),
            String::new(),
        );
        assert_eq!(entry.surname, "Alice");
        assert_eq!(entry.common_name, "Alice");
        assert_eq!(entry.display_name, "Alice");

        // Nothing but a username: everything falls back to it.
        let entry =
            UserEntry::derive(&input("", "", "", "alice"), String::new());
        assert_eq!(entry.surname, "alice");
        assert_eq!(entry.given_name, "alice");
        assert_eq!(entry.common_name, "alice");
        assert_eq!(entry.display_name, "alice");
    }

    #[test]
    fn test_entry_normalization() {
        let raw = SearchEntry {
            dn: "uid=alice,ou=users,dc=example,dc=org".to_owned(),
            attrs: HashMap::from([(
                "Mail".to_owned(),
                vec!["alice@example.com".to_owned()],
            )]),
            bin_attrs: HashMap::from([(
                "resetToken".to_owned(),
                vec![b"deadbeef".to_vec()],
            )]),
        };

        let entry = DirectoryEntry::from_search(raw);
        assert_eq!(entry.first("mail"), Some("alice@example.com"));
        assert_eq!(entry.first("MAIL"), Some("alice@example.com"));
        assert_eq!(entry.first("resettoken"), Some("deadbeef"));
        assert_eq!(entry.first("missing"), None);
    }
}
