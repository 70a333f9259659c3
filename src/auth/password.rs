use std::sync::Arc;

use argon2::{
    password_hash::{PasswordHash, PasswordHasher as _, PasswordVerifier as _, SaltString},
    Algorithm, Argon2, Params, Version,
};
use rand::rngs::OsRng;
use tracing::error;

use crate::auth::errors::AuthError;
use crate::config::HashConfig;

/// Longest accepted password, in bytes.
pub const MAX_PASSWORD_LEN: usize = 1024;

// Verified against when the login email is unknown, so both paths pay for one hash.
const DUMMY_PASSWORD: &str = "usergate-timing-equalizer";

/// Argon2id hashing with a process-wide work factor.
#[derive(Clone)]
pub struct PasswordHasher {
    argon2: Argon2<'static>,
    dummy_hash: Arc<str>,
}

impl PasswordHasher {
    pub fn new(cfg: HashConfig) -> Result<Self, AuthError> {
        let params = Params::new(cfg.memory_kib, cfg.iterations, cfg.parallelism, None)
            .map_err(|e| {
                error!(error = %e, "argon2 params rejected");
                AuthError::Encoding(e.to_string())
            })?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let mut hasher = Self {
            argon2,
            dummy_hash: Arc::from(""),
        };
        hasher.dummy_hash = Arc::from(hasher.hash(DUMMY_PASSWORD)?);
        Ok(hasher)
    }

    /// Salts and hashes `plain` into a PHC string. Every call uses a fresh salt.
    pub fn hash(&self, plain: &str) -> Result<String, AuthError> {
        if plain.is_empty() {
            return Err(AuthError::Encoding("password is empty".into()));
        }
        if plain.len() > MAX_PASSWORD_LEN {
            return Err(AuthError::Encoding("password too long".into()));
        }
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2
            .hash_password(plain.as_bytes(), &salt)
            .map_err(|e| {
                error!(error = %e, "argon2 hash_password error");
                AuthError::Encoding(e.to_string())
            })?
            .to_string();
        Ok(hash)
    }

    /// Checks `plain` against a stored PHC string using the parameters embedded
    /// in it. A mismatch, or an unparseable stored hash, is `false`.
    pub fn verify(&self, plain: &str, hash: &str) -> bool {
        let parsed = match PasswordHash::new(hash) {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "argon2 parse hash error");
                return false;
            }
        };
        self.argon2
            .verify_password(plain.as_bytes(), &parsed)
            .is_ok()
    }

    /// Burns one verification so an unknown-email login costs the same as a
    /// wrong-password one.
    pub fn verify_dummy(&self, plain: &str) -> bool {
        self.verify(plain, &self.dummy_hash);
        false
    }
}

#[cfg(test)]
pub(crate) fn test_hasher() -> PasswordHasher {
    PasswordHasher::new(HashConfig {
        memory_kib: 64,
        iterations: 1,
        parallelism: 1,
    })
    .expect("cheap params are valid")
}
