use std::sync::Arc;

use anyhow::Context;

use crate::auth::{
    jwt::TokenIssuer,
    memory::MemoryCredentialStore,
    password::PasswordHasher,
    repo::{CredentialStore, PgCredentialStore},
    services::CredentialService,
};
use crate::config::AppConfig;

#[derive(Clone)]
pub struct AppState {
    pub service: CredentialService,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = Arc::new(AppConfig::from_env()?);

        let store: Arc<dyn CredentialStore> = match &config.database_url {
            Some(url) => {
                let db = sqlx::postgres::PgPoolOptions::new()
                    .max_connections(10)
                    .connect(url)
                    .await
                    .context("connect to database")?;
                sqlx::migrate!("./migrations")
                    .run(&db)
                    .await
                    .context("run migrations")?;
                Arc::new(PgCredentialStore::new(db))
            }
            None => {
                tracing::warn!("DATABASE_URL not set; users are kept in memory");
                Arc::new(MemoryCredentialStore::new())
            }
        };

        let hasher = PasswordHasher::new(config.hash).context("configure password hashing")?;
        let tokens = TokenIssuer::new(&config.jwt);
        let service = CredentialService::new(store, hasher, tokens, config.store_timeout());

        Ok(Self { service, config })
    }

    #[cfg(test)]
    pub fn fake() -> Self {
        Self::fake_with_store(Arc::new(MemoryCredentialStore::new()))
    }

    #[cfg(test)]
    pub fn fake_with_store(store: Arc<dyn CredentialStore>) -> Self {
        use crate::config::{HashConfig, JwtConfig};

        let config = Arc::new(AppConfig {
            database_url: None,
            jwt: JwtConfig {
                secret: "test".into(),
                issuer: "test".into(),
                audience: "test".into(),
                ttl_minutes: 5,
            },
            hash: HashConfig {
                memory_kib: 64,
                iterations: 1,
                parallelism: 1,
            },
            store_timeout_ms: 2000,
        });

        let hasher = PasswordHasher::new(config.hash).expect("cheap params are valid");
        let service = CredentialService::new(
            store,
            hasher,
            TokenIssuer::new(&config.jwt),
            config.store_timeout(),
        );
        Self { service, config }
    }
}
