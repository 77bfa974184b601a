//! Core library for gwadmin, the API gateway administration console.
//!
//! - `auth`: session state, credential persistence, login/refresh/logout
//! - `api`: request dispatch with transparent token refresh, plus the
//!   service and route endpoints
//! - `config`: console configuration
//! - `models`: wire and session data types

pub mod api;
pub mod auth;
pub mod config;
pub mod console;
pub mod models;

#[cfg(test)]
mod test_support;

pub use api::{ApiError, Dispatcher, GatewayApi, ServiceQuery};
pub use auth::{AuthState, Destination, Navigator, Notice, SessionContext};
pub use config::Config;
pub use console::Console;
pub use models::{StorageScope, TokenPair, User};
