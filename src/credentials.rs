use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::ExecutorError;

/// Provider login for one user. Never logged.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn credentials_for(&self, user_id: &str) -> Result<Credentials, ExecutorError>;
}

#[derive(Default)]
pub struct InMemoryCredentials {
    by_user: DashMap<String, Credentials>,
}

impl InMemoryCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON object `{ "<user_id>": { "username": .., "password": .. } }`.
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let map: HashMap<String, Credentials> = serde_json::from_str(&raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let store = Self::new();
        for (user, creds) in map {
            store.insert(user, creds);
        }
        Ok(store)
    }

    pub fn insert(&self, user_id: impl Into<String>, credentials: Credentials) {
        self.by_user.insert(user_id.into(), credentials);
    }

    pub fn len(&self) -> usize {
        self.by_user.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_user.is_empty()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentials {
    async fn credentials_for(&self, user_id: &str) -> Result<Credentials, ExecutorError> {
        self.by_user
            .get(user_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| ExecutorError::MissingCredentials(user_id.to_string()))
    }
}
