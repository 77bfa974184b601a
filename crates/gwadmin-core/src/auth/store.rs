use std::sync::Arc;

use tracing::{debug, warn};

use super::storage::{KeyValueStore, MemoryStore, StorageError};
use crate::models::{StorageScope, TokenPair, User};

const ACCESS_TOKEN_KEY: &str = "accessToken";
const REFRESH_TOKEN_KEY: &str = "refreshToken";
const USER_KEY: &str = "user";

const SESSION_KEYS: [&str; 3] = [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USER_KEY];

/// A session as read back from one storage scope.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSession {
    pub user: User,
    pub tokens: TokenPair,
    pub scope: StorageScope,
}

/// Persists the session into exactly one of two scoped backings.
///
/// A session is never split across scopes: writing into one scope first
/// clears the other, and reading never combines fields from both.
#[derive(Clone)]
pub struct CredentialStore {
    durable: Arc<dyn KeyValueStore>,
    ephemeral: Arc<dyn KeyValueStore>,
}

impl CredentialStore {
    pub fn new(durable: Arc<dyn KeyValueStore>, ephemeral: Arc<dyn KeyValueStore>) -> Self {
        Self { durable, ephemeral }
    }

    /// Both scopes in memory; nothing outlives the process
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()))
    }

    fn backing(&self, scope: StorageScope) -> &dyn KeyValueStore {
        match scope {
            StorageScope::Durable => self.durable.as_ref(),
            StorageScope::Ephemeral => self.ephemeral.as_ref(),
        }
    }

    /// Write user and tokens into `scope`, after clearing the other scope.
    ///
    /// On a failed write the target scope is cleared again so no partial
    /// session is left behind.
    pub fn persist(
        &self,
        user: &User,
        tokens: &TokenPair,
        scope: StorageScope,
    ) -> Result<(), StorageError> {
        Self::clear_backing(self.backing(scope.other()))?;

        let user_json =
            serde_json::to_string(user).map_err(|e| StorageError::Corrupt(e.to_string()))?;
        let target = self.backing(scope);
        let written = target
            .set(ACCESS_TOKEN_KEY, &tokens.access_token)
            .and_then(|_| target.set(REFRESH_TOKEN_KEY, &tokens.refresh_token))
            .and_then(|_| target.set(USER_KEY, &user_json));

        if let Err(e) = written {
            if let Err(cleanup) = Self::clear_backing(target) {
                warn!(%scope, error = %cleanup, "Failed to roll back partial session write");
            }
            return Err(e);
        }
        debug!(%scope, user_id = user.id, "Session persisted");
        Ok(())
    }

    /// Replace the stored token pair in `scope`, keeping the stored user.
    ///
    /// If either write fails the scope is cleared, so storage never holds
    /// an access token paired with the wrong refresh token.
    pub fn update_tokens(&self, tokens: &TokenPair, scope: StorageScope) -> Result<(), StorageError> {
        let target = self.backing(scope);
        let written = target
            .set(REFRESH_TOKEN_KEY, &tokens.refresh_token)
            .and_then(|_| target.set(ACCESS_TOKEN_KEY, &tokens.access_token));

        if let Err(e) = written {
            if let Err(cleanup) = Self::clear_backing(target) {
                warn!(%scope, error = %cleanup, "Failed to clear half-rotated tokens");
            }
            return Err(e);
        }
        debug!(%scope, "Stored tokens updated");
        Ok(())
    }

    /// Read back a stored session, durable scope first.
    ///
    /// The first scope holding an access token decides the outcome. If that
    /// scope's data is incomplete or unreadable the result is `None`; the
    /// other scope is not consulted.
    pub fn restore(&self) -> Option<StoredSession> {
        for scope in [StorageScope::Durable, StorageScope::Ephemeral] {
            match self.read_scope(scope) {
                Ok(Some(session)) => {
                    debug!(%scope, user_id = session.user.id, "Stored session found");
                    return Some(session);
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!(%scope, error = %e, "Ignoring unreadable stored session");
                    return None;
                }
            }
        }
        None
    }

    fn read_scope(&self, scope: StorageScope) -> Result<Option<StoredSession>, StorageError> {
        let backing = self.backing(scope);
        let Some(access_token) = backing.get(ACCESS_TOKEN_KEY)? else {
            return Ok(None);
        };
        let refresh_token = backing
            .get(REFRESH_TOKEN_KEY)?
            .ok_or_else(|| StorageError::Corrupt("refresh token missing".to_string()))?;
        let user_json = backing
            .get(USER_KEY)?
            .ok_or_else(|| StorageError::Corrupt("user profile missing".to_string()))?;
        let user: User = serde_json::from_str(&user_json)
            .map_err(|e| StorageError::Corrupt(format!("user profile: {}", e)))?;

        Ok(Some(StoredSession {
            user,
            tokens: TokenPair::new(access_token, refresh_token),
            scope,
        }))
    }

    /// Remove session keys from both scopes.
    ///
    /// Every key is attempted even if an earlier removal fails; the first
    /// error is returned afterwards.
    pub fn clear(&self) -> Result<(), StorageError> {
        let durable = Self::clear_backing(self.durable.as_ref());
        let ephemeral = Self::clear_backing(self.ephemeral.as_ref());
        durable.and(ephemeral)
    }

    fn clear_backing(backing: &dyn KeyValueStore) -> Result<(), StorageError> {
        let mut first_error = None;
        for key in SESSION_KEYS {
            if let Err(e) = backing.remove(key) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
