use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::auth::dto::{AuthResponse, PublicUser};
use crate::auth::errors::{AuthError, StoreError};
use crate::auth::jwt::TokenIssuer;
use crate::auth::password::{PasswordHasher, MAX_PASSWORD_LEN};
use crate::auth::repo::CredentialStore;
use crate::auth::repo_types::NewUser;

pub const DEFAULT_ROLE: &str = "user";

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

/// Emails are compared case-insensitively; they are stored in this form.
pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn normalize_roles(roles: Vec<String>) -> Vec<String> {
    let mut roles: Vec<String> = roles
        .iter()
        .map(|r| r.trim())
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect();
    if roles.is_empty() {
        return vec![DEFAULT_ROLE.to_string()];
    }
    roles.sort();
    roles.dedup();
    roles
}

/// Registration, login and lookup on top of a `CredentialStore`.
#[derive(Clone)]
pub struct CredentialService {
    store: Arc<dyn CredentialStore>,
    hasher: PasswordHasher,
    tokens: TokenIssuer,
    store_timeout: Duration,
}

impl CredentialService {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        hasher: PasswordHasher,
        tokens: TokenIssuer,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            hasher,
            tokens,
            store_timeout,
        }
    }

    pub fn tokens(&self) -> &TokenIssuer {
        &self.tokens
    }

    #[instrument(skip(self, password, roles))]
    pub async fn create(
        &self,
        email: &str,
        name: &str,
        password: &str,
        roles: Vec<String>,
    ) -> Result<PublicUser, AuthError> {
        if password.is_empty() {
            return Err(AuthError::InvalidInput("password must not be empty".into()));
        }
        if password.len() > MAX_PASSWORD_LEN {
            return Err(AuthError::InvalidInput("password too long".into()));
        }
        let email = normalize_email(email);

        let password_hash = self.hash(password).await?;
        let new_user = NewUser {
            email: email.clone(),
            name: name.trim().to_string(),
            password_hash,
            roles: normalize_roles(roles),
        };

        let user = match self.bounded(self.store.insert_unique(new_user)).await {
            Ok(u) => u,
            Err(StoreError::Conflict) => {
                warn!(email = %email, "email already registered");
                return Err(AuthError::DuplicateEmail(email));
            }
            Err(e) => return Err(unavailable(e)),
        };

        info!(user_id = %user.id, email = %user.email, "user created");
        Ok(user.into())
    }

    #[instrument(skip(self, password))]
    pub async fn register(
        &self,
        email: &str,
        name: &str,
        password: &str,
    ) -> Result<AuthResponse, AuthError> {
        let user = self.create(email, name, password, Vec::new()).await?;
        let token = self.tokens.issue(user.id)?;
        info!(user_id = %user.id, "user registered");
        Ok(AuthResponse { user, token })
    }

    #[instrument(skip(self, password))]
    pub async fn login(&self, email: &str, password: &str) -> Result<AuthResponse, AuthError> {
        let email = normalize_email(email);
        let record = self
            .bounded(self.store.find_by_email(&email))
            .await
            .map_err(unavailable)?;

        let Some(user) = record else {
            self.verify_dummy(password).await?;
            warn!(email = %email, "login rejected");
            return Err(AuthError::InvalidCredentials);
        };

        if !self.verify(password, &user.password_hash).await? {
            warn!(email = %email, "login rejected");
            return Err(AuthError::InvalidCredentials);
        }

        let token = self.tokens.issue(user.id)?;
        info!(user_id = %user.id, "user logged in");
        Ok(AuthResponse {
            user: user.into(),
            token,
        })
    }

    #[instrument(skip(self))]
    pub async fn find_by_id(&self, id: Uuid) -> Result<PublicUser, AuthError> {
        self.bounded(self.store.find_by_id(id))
            .await
            .map_err(unavailable)?
            .map(PublicUser::from)
            .ok_or(AuthError::NotFound)
    }

    #[instrument(skip(self))]
    pub async fn find_all(&self) -> Result<Vec<PublicUser>, AuthError> {
        let users = self
            .bounded(self.store.list_all())
            .await
            .map_err(unavailable)?;
        Ok(users.into_iter().map(PublicUser::from).collect())
    }

    /// Runs a store call under the configured deadline.
    async fn bounded<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.store_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(StoreError::Unavailable(format!(
                "store call exceeded {:?}",
                self.store_timeout
            ))),
        }
    }

    async fn hash(&self, password: &str) -> Result<String, AuthError> {
        let hasher = self.hasher.clone();
        let password = password.to_owned();
        tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|e| AuthError::Encoding(e.to_string()))?
    }

    async fn verify(&self, password: &str, hash: &str) -> Result<bool, AuthError> {
        let hasher = self.hasher.clone();
        let password = password.to_owned();
        let hash = hash.to_owned();
        tokio::task::spawn_blocking(move || hasher.verify(&password, &hash))
            .await
            .map_err(|e| AuthError::Encoding(e.to_string()))
    }

    async fn verify_dummy(&self, password: &str) -> Result<bool, AuthError> {
        let hasher = self.hasher.clone();
        let password = password.to_owned();
        tokio::task::spawn_blocking(move || hasher.verify_dummy(&password))
            .await
            .map_err(|e| AuthError::Encoding(e.to_string()))
    }
}

fn unavailable(e: StoreError) -> AuthError {
    error!(error = %e, "credential store failure");
    AuthError::StorageUnavailable
}

#[cfg(test)]
pub(crate) fn test_service(store: Arc<dyn CredentialStore>) -> CredentialService {
    use crate::config::JwtConfig;

    let tokens = TokenIssuer::new(&JwtConfig {
        secret: "test-secret".into(),
        issuer: "test-issuer".into(),
        audience: "test-aud".into(),
        ttl_minutes: 5,
    });
    CredentialService::new(
        store,
        crate::auth::password::test_hasher(),
        tokens,
        Duration::from_secs(2),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::memory::MemoryCredentialStore;
    use crate::auth::repo_types::User;
    use async_trait::async_trait;

    fn service() -> CredentialService {
        test_service(Arc::new(MemoryCredentialStore::new()))
    }

    /// Store that fails every call.
    struct BrokenStore;

    #[async_trait]
    impl CredentialStore for BrokenStore {
        async fn insert_unique(&self, _user: NewUser) -> Result<User, StoreError> {
            Err(StoreError::Unavailable("E11000 connection reset by peer".into()))
        }
        async fn find_by_email(&self, _email: &str) -> Result<Option<User>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn find_by_id(&self, _id: Uuid) -> Result<Option<User>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn list_all(&self) -> Result<Vec<User>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    /// Store that never answers.
    struct HangingStore;

    #[async_trait]
    impl CredentialStore for HangingStore {
        async fn insert_unique(&self, _user: NewUser) -> Result<User, StoreError> {
            std::future::pending().await
        }
        async fn find_by_email(&self, _email: &str) -> Result<Option<User>, StoreError> {
            std::future::pending().await
        }
        async fn find_by_id(&self, _id: Uuid) -> Result<Option<User>, StoreError> {
            std::future::pending().await
        }
        async fn list_all(&self) -> Result<Vec<User>, StoreError> {
            std::future::pending().await
        }
    }

    #[test]
    fn email_validation() {
        assert!(is_valid_email("a@x.com"));
        assert!(!is_valid_email("a@x"));
        assert!(!is_valid_email("a x@x.com"));
        assert!(!is_valid_email(""));
    }

    #[test]
    fn roles_default_and_dedupe() {
        assert_eq!(normalize_roles(vec![]), vec!["user"]);
        assert_eq!(normalize_roles(vec!["  ".into()]), vec!["user"]);
        assert_eq!(
            normalize_roles(vec!["admin".into(), "user".into(), "admin".into()]),
            vec!["admin", "user"]
        );
        assert_eq!(
            normalize_roles(vec![" admin".into(), "admin ".into(), "user".into()]),
            vec!["admin", "user"]
        );
    }

    #[tokio::test]
    async fn create_returns_public_user() {
        let svc = service();
        let user = svc
            .create("u@e.com", "U", "pw123456", Vec::new())
            .await
            .expect("create");
        assert_eq!(user.email, "u@e.com");
        assert_eq!(user.name, "U");
        assert_eq!(user.roles, vec!["user"]);

        let json = serde_json::to_value(&user).unwrap();
        assert!(json.get("id").is_some());
        assert!(json.get("password_hash").is_none());
        assert!(json.get("password").is_none());
    }

    #[tokio::test]
    async fn create_stores_hash_not_plaintext() {
        let store = Arc::new(MemoryCredentialStore::new());
        let svc = test_service(store.clone());
        svc.create("u@e.com", "U", "pw123456", Vec::new())
            .await
            .unwrap();
        let record = store.find_by_email("u@e.com").await.unwrap().unwrap();
        assert!(!record.password_hash.is_empty());
        assert_ne!(record.password_hash, "pw123456");
        assert!(record.password_hash.starts_with("$argon2id$"));
    }

    #[tokio::test]
    async fn create_rejects_empty_password() {
        let svc = service();
        let err = svc.create("u@e.com", "U", "", Vec::new()).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn create_rejects_duplicate_email() {
        let svc = service();
        svc.create("u@e.com", "U", "pw123456", Vec::new())
            .await
            .unwrap();
        let err = svc
            .create("U@E.com ", "Other", "pw654321", Vec::new())
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::DuplicateEmail("u@e.com".into()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_create_same_email_has_one_winner() {
        let svc = service();
        let (a, b) = tokio::join!(
            svc.create("race@x.com", "A", "pw123456", Vec::new()),
            svc.create("race@x.com", "B", "pw654321", Vec::new()),
        );
        let results = [a, b];
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let dup = results
            .iter()
            .filter(|r| matches!(r, Err(AuthError::DuplicateEmail(e)) if e == "race@x.com"))
            .count();
        assert_eq!(ok, 1);
        assert_eq!(dup, 1);
    }

    #[tokio::test]
    async fn register_then_login_roundtrip() {
        let svc = service();
        let registered = svc.register("a@x.com", "A", "secret").await.unwrap();
        let logged_in = svc.login("a@x.com", "secret").await.unwrap();

        assert_eq!(logged_in.user, registered.user);
        let claims = svc.tokens().verify(&logged_in.token).unwrap();
        assert_eq!(claims.sub, registered.user.id);
        let claims = svc.tokens().verify(&registered.token).unwrap();
        assert_eq!(claims.sub, registered.user.id);
    }

    #[tokio::test]
    async fn register_propagates_create_error() {
        let svc = service();
        svc.register("a@x.com", "A", "secret").await.unwrap();
        let err = svc.register("a@x.com", "A", "secret").await.unwrap_err();
        assert_eq!(err, AuthError::DuplicateEmail("a@x.com".into()));
    }

    #[tokio::test]
    async fn login_failures_are_indistinguishable() {
        let svc = service();
        svc.create("u@e.com", "U", "pw123456", Vec::new())
            .await
            .unwrap();

        let unknown = svc.login("nobody@e.com", "pw123456").await.unwrap_err();
        let wrong = svc.login("u@e.com", "wrong").await.unwrap_err();

        assert_eq!(unknown, AuthError::InvalidCredentials);
        assert_eq!(unknown, wrong);
        assert_eq!(unknown.to_string(), wrong.to_string());
    }

    #[tokio::test]
    async fn example_scenario() {
        let svc = service();
        let user = svc
            .create("u@e.com", "U", "pw123456", Vec::new())
            .await
            .unwrap();
        assert_eq!(
            svc.login("u@e.com", "wrong").await.unwrap_err(),
            AuthError::InvalidCredentials
        );
        let ok = svc.login("u@e.com", "pw123456").await.unwrap();
        assert_eq!(ok.user.id, user.id);
        assert!(!ok.token.is_empty());
    }

    #[tokio::test]
    async fn login_is_case_insensitive_on_email() {
        let svc = service();
        svc.register("Mixed@Case.com", "M", "pw123456").await.unwrap();
        let res = svc.login("mixed@case.COM", "pw123456").await.unwrap();
        assert_eq!(res.user.email, "mixed@case.com");
    }

    #[tokio::test]
    async fn find_by_id_and_find_all() {
        let svc = service();
        let a = svc
            .create("a@x.com", "A", "pw123456", vec!["admin".into()])
            .await
            .unwrap();
        let b = svc
            .create("b@x.com", "B", "pw123456", Vec::new())
            .await
            .unwrap();

        let found = svc.find_by_id(a.id).await.unwrap();
        assert_eq!(found, a);
        assert_eq!(found.roles, vec!["admin"]);
        let json = serde_json::to_value(&found).unwrap();
        assert!(json.get("password_hash").is_none());

        assert_eq!(
            svc.find_by_id(Uuid::new_v4()).await.unwrap_err(),
            AuthError::NotFound
        );

        let all = svc.find_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.contains(&a));
        assert!(all.contains(&b));
    }

    #[tokio::test]
    async fn store_failures_map_to_storage_unavailable() {
        let svc = test_service(Arc::new(BrokenStore));
        let err = svc
            .create("a@x.com", "A", "pw123456", Vec::new())
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::StorageUnavailable);
        assert!(!err.to_string().contains("E11000"));

        assert_eq!(
            svc.login("a@x.com", "pw123456").await.unwrap_err(),
            AuthError::StorageUnavailable
        );
        assert_eq!(
            svc.find_by_id(Uuid::new_v4()).await.unwrap_err(),
            AuthError::StorageUnavailable
        );
        assert_eq!(
            svc.find_all().await.unwrap_err(),
            AuthError::StorageUnavailable
        );
    }

    #[tokio::test]
    async fn hanging_store_hits_deadline() {
        let mut svc = test_service(Arc::new(HangingStore));
        svc.store_timeout = Duration::from_millis(20);
        assert_eq!(
            svc.find_by_id(Uuid::new_v4()).await.unwrap_err(),
            AuthError::StorageUnavailable
        );
        assert_eq!(
            svc.login("a@x.com", "pw123456").await.unwrap_err(),
            AuthError::StorageUnavailable
        );
    }
}
