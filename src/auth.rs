//! Authentication and user-lookup collaborators.
//!
//! The messaging core consumes these through capability traits so that
//! persistence and token schemes stay pluggable; the in-memory
//! implementations below back the reference binary and the test suite.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;
use crate::error::UnauthorizedSnafu;
use crate::Result;

/// A user known to the system.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Unique user id.
    pub id: String,
    /// Display name.
    pub username: String,
    /// Account creation time.
    pub created_at: DateTime<Utc>,
}

/// The outcome of a successful token verification.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VerifiedToken {
    /// Identity the token proves.
    pub user_id: String,
}

/// Verifies client-presented bearer tokens.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verifies `token`, returning the identity it proves.
    async fn verify(&self, token: &str) -> Result<VerifiedToken>;
}

/// Looks up users by id.
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Fetches a user, or `None` when the id is unknown.
    async fn find_by_id(&self, id: &str) -> Result<Option<User>>;
}

/// Token verifier backed by a static token → user-id table.
pub struct StaticTokenVerifier {
    tokens: HashMap<String, String>,
}

impl StaticTokenVerifier {
    /// Creates a verifier from an explicit table.
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }

    /// Creates a verifier from the `auth.tokens` config table.
    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(config.tokens.clone())
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedToken> {
        match self.tokens.get(token) {
            Some(user_id) => Ok(VerifiedToken {
                user_id: user_id.clone(),
            }),
            None => UnauthorizedSnafu {
                message: "invalid token",
            }
            .fail(),
        }
    }
}

/// User repository holding its records in memory.
pub struct InMemoryUserRepository {
    users: RwLock<HashMap<String, User>>,
}

impl InMemoryUserRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a repository seeded with `users`.
    pub fn with_users(users: impl IntoIterator<Item = User>) -> Self {
        Self {
            users: RwLock::new(users.into_iter().map(|user| (user.id.clone(), user)).collect()),
        }
    }

    /// Creates a repository seeded from the `auth.users` config list.
    pub fn from_config(config: &AuthConfig) -> Self {
        Self::with_users(config.users.iter().map(|entry| User {
            id: entry.id.clone(),
            username: entry.username.clone(),
            created_at: Utc::now(),
        }))
    }

    /// Inserts or replaces a user record.
    pub fn insert(&self, user: User) {
        self.users
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(user.id.clone(), user);
    }
}

impl Default for InMemoryUserRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<User>> {
        Ok(self
            .users
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_user(id: &str) -> User {
        User {
            id: id.to_owned(),
            username: format!("user-{id}"),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn static_verifier_accepts_known_tokens_only() {
        let verifier =
            StaticTokenVerifier::new(HashMap::from([("tok".to_owned(), "u1".to_owned())]));

        assert_eq!(verifier.verify("tok").await.unwrap().user_id, "u1");
        let error = verifier.verify("nope").await.unwrap_err();
        assert_eq!(error.code(), "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn repository_round_trips_users() {
        let repo = InMemoryUserRepository::new();
        repo.insert(test_user("u1"));

        assert_eq!(repo.find_by_id("u1").await.unwrap().unwrap().id, "u1");
        assert_eq!(repo.find_by_id("u2").await.unwrap(), None);
    }
}
