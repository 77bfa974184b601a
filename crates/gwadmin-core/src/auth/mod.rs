//! Authentication module for managing the signed-in session.
//!
//! This module provides:
//! - `SessionContext`: the in-memory session with login, logout and refresh
//! - `CredentialStore`: scoped persistence of the session (durable or ephemeral)
//! - `KeyValueStore` backings: memory, JSON file, OS keychain
//! - `AuthService`: the remote login/refresh/logout endpoints
//! - `Navigator`: how the session layer drives the UI

pub mod credentials;
pub mod navigator;
pub mod service;
pub mod session;
pub mod storage;
pub mod store;

pub use credentials::KeyringStore;
pub use navigator::{Destination, Navigator, Notice};
pub use service::{AuthService, HttpAuthService};
pub use session::{ActiveSession, AuthState, RefreshFailure, SessionContext};
pub use storage::{FileStore, KeyValueStore, MemoryStore, StorageError};
pub use store::{CredentialStore, StoredSession};
