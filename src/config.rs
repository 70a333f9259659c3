use std::fmt;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

#[derive(Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_minutes: i64,
}

// The secret must never reach a log line.
impl fmt::Debug for JwtConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtConfig")
            .field("secret", &"<redacted>")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("ttl_minutes", &self.ttl_minutes)
            .finish()
    }
}

/// Argon2id work factor, fixed for the lifetime of the process.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct HashConfig {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for HashConfig {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Postgres connection string; the in-memory store is used when absent.
    pub database_url: Option<String>,
    pub jwt: JwtConfig,
    pub hash: HashConfig,
    pub store_timeout_ms: u64,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let secret = std::env::var("JWT_SECRET").context("JWT_SECRET must be set")?;
        anyhow::ensure!(!secret.is_empty(), "JWT_SECRET must not be empty");

        let ttl_minutes = parse_var("JWT_TTL_MINUTES", 60i64)?;
        anyhow::ensure!(ttl_minutes > 0, "JWT_TTL_MINUTES must be positive");

        let jwt = JwtConfig {
            secret,
            issuer: std::env::var("JWT_ISSUER").unwrap_or_else(|_| "usergate".into()),
            audience: std::env::var("JWT_AUDIENCE").unwrap_or_else(|_| "usergate-users".into()),
            ttl_minutes,
        };

        let defaults = HashConfig::default();
        let hash = HashConfig {
            memory_kib: parse_var("HASH_MEMORY_KIB", defaults.memory_kib)?,
            iterations: parse_var("HASH_ITERATIONS", defaults.iterations)?,
            parallelism: parse_var("HASH_PARALLELISM", defaults.parallelism)?,
        };

        Ok(Self {
            database_url,
            jwt,
            hash,
            store_timeout_ms: parse_var("STORE_TIMEOUT_MS", 5000u64)?,
        })
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

fn parse_var<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(v) => v
            .trim()
            .parse::<T>()
            .with_context(|| format!("invalid value for {}", name)),
        Err(_) => Ok(default),
    }
}
