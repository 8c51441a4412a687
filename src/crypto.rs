//! Credential hashing.

use argon2::password_hash::{
    PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::{Argon2, Params, Version};
use rand::rngs::OsRng;

use crate::config::Argon2 as ArgonConfig;

/// Scheme marker stored ahead of the PHC string so the directory (and any
/// later verifier) can recognize the format.
pub const SCHEME_MARKER: &str = "{ARGON2}";

type Result<T> = std::result::Result<T, CryptoError>;

#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("argon2 error: {0}")]
    Argon2(String),
}

/// Argon2id hasher with process-wide parameters, built once at startup.
pub struct CredentialHasher {
    params: Params,
}

impl CredentialHasher {
    /// Create a new [`CredentialHasher`].
    pub fn new(config: Option<ArgonConfig>) -> Result<Self> {
        let config = config.unwrap_or_default();

        let params = Params::new(
            config.memory_cost,
            config.iterations,
            config.parallelism,
            Some(config.hash_length),
        )
        .map_err(|err| CryptoError::Argon2(err.to_string()))?;

        Ok(Self { params })
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(
            argon2::Algorithm::Argon2id,
            Version::V0x13,
            self.params.clone(),
        )
    }

    /// Hash a plaintext password into a marked, storable value.
    ///
    /// Pure function of the plaintext; callers run it before touching
    /// either store.
    pub fn hash(&self, password: impl AsRef<[u8]>) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2()
            .hash_password(password.as_ref(), &salt)
            .map_err(|e| CryptoError::Argon2(e.to_string()))?;

        Ok(format!("{SCHEME_MARKER}{hash}"))
    }

    /// Verify a plaintext password against a stored, possibly marked value.
    pub fn verify(
        &self,
        password: impl AsRef<[u8]>,
        stored: &str,
    ) -> Result<bool> {
        let phc = stored.strip_prefix(SCHEME_MARKER).unwrap_or(stored);
        let parsed = PasswordHash::new(phc)
            .map_err(|e| CryptoError::Argon2(e.to_string()))?;

        Ok(self
            .argon2()
            .verify_password(password.as_ref(), &parsed)
            .is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn light_hasher() -> CredentialHasher {
        CredentialHasher::new(Some(ArgonConfig {
            memory_cost: 8,
            iterations: 1,
            parallelism: 1,
            hash_length: 32,
        }))
        .unwrap()
    }

    #[test]
    fn test_hash_carries_scheme_marker() {
        let hasher = light_hasher();
        let stored = hasher.hash("s3cret1").unwrap();

        assert!(stored.starts_with(SCHEME_MARKER));
        assert!(stored.contains("$argon2id$"));
    }

    #[test]
    fn test_verify_roundtrip() {
        let hasher = light_hasher();
        let stored = hasher.hash("s3cret1").unwrap();

        assert!(hasher.verify("s3cret1", &stored).unwrap());
        assert!(!hasher.verify("wrong", &stored).unwrap());
    }

    #[test]
    fn test_verify_accepts_unmarked_phc() {
        let hasher = light_hasher();
        let stored = hasher.hash("s3cret1").unwrap();
        let unmarked = stored.strip_prefix(SCHEME_MARKER).unwrap();

        assert!(hasher.verify("s3cret1", unmarked).unwrap());
    }

    #[test]
    fn test_garbage_hash_is_error() {
        let hasher = light_hasher();

        assert!(hasher.verify("s3cret1", "{ARGON2}not-a-phc").is_err());
    }
}
