use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Profile of the signed-in administrator.
///
/// Replaced wholesale on login; never patched field by field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub locale: String,
    #[serde(default)]
    pub roles: BTreeSet<String>,
}

impl User {
    /// Name to show in prompts, falling back to the email address
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.email
        } else {
            &self.name
        }
    }
}

/// Access/refresh token pair. Both values are opaque.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl TokenPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }

    /// Apply a refresh result. The refresh token is replaced only when the
    /// server rotated it, and always together with the access token.
    pub fn rotated(&self, access_token: String, refresh_token: Option<String>) -> Self {
        Self {
            access_token,
            refresh_token: refresh_token.unwrap_or_else(|| self.refresh_token.clone()),
        }
    }
}

// Tokens stay out of logs and panic messages.
impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// Where a session's credentials live. Chosen once per login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageScope {
    /// Survives restarts of the console
    Durable,
    /// Lives only as long as the running process
    Ephemeral,
}

impl StorageScope {
    pub fn from_remember_me(remember_me: bool) -> Self {
        if remember_me {
            StorageScope::Durable
        } else {
            StorageScope::Ephemeral
        }
    }

    pub fn other(self) -> Self {
        match self {
            StorageScope::Durable => StorageScope::Ephemeral,
            StorageScope::Ephemeral => StorageScope::Durable,
        }
    }
}

impl fmt::Display for StorageScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageScope::Durable => write!(f, "durable"),
            StorageScope::Ephemeral => write!(f, "ephemeral"),
        }
    }
}
