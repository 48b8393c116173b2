use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone)]
pub struct StoredUser {
    pub id: u64,
    pub email: String,
    pub password_hash: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum IdentityStoreError {
    #[error("user with this email already exists")]
    Conflict,
    #[error("identity store failure: {0}")]
    Backend(String),
}

/// Account storage used by the register/login endpoints. The relay itself
/// never touches it; it only sees verified token identities.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn create_user(
        &self,
        email: &str,
        password_hash: String,
    ) -> Result<StoredUser, IdentityStoreError>;
    async fn find_by_email(&self, email: &str) -> Result<Option<StoredUser>, IdentityStoreError>;
}

/// Process-local accounts keyed by lowercased email.
#[derive(Clone)]
pub struct MemoryIdentityStore {
    users: Arc<DashMap<String, StoredUser>>,
    next_id: Arc<AtomicU64>,
}

impl Default for MemoryIdentityStore {
    fn default() -> Self {
        Self {
            users: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn create_user(
        &self,
        email: &str,
        password_hash: String,
    ) -> Result<StoredUser, IdentityStoreError> {
        match self.users.entry(email.to_lowercase()) {
            Entry::Occupied(_) => Err(IdentityStoreError::Conflict),
            Entry::Vacant(slot) => {
                let user = StoredUser {
                    id: self.next_id.fetch_add(1, Ordering::Relaxed),
                    email: email.to_string(),
                    password_hash,
                };
                slot.insert(user.clone());
                Ok(user)
            }
        }
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<StoredUser>, IdentityStoreError> {
        Ok(self
            .users
            .get(&email.to_lowercase())
            .map(|entry| entry.value().clone()))
    }
}

pub fn hash_password(password: &str) -> Result<String, String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| e.to_string())
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool, String> {
    let parsed_hash = PasswordHash::new(hash).map_err(|e| e.to_string())?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}
