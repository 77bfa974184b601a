//! Data models shared by the session layer and the API client.
//!
//! - `user`: the signed-in user profile and the token pair
//! - `envelope`: the response wrapper the gateway backend puts around
//!   every payload, plus the auth endpoint shapes

pub mod envelope;
pub mod user;

pub use envelope::{ApiEnvelope, LoginGrant, TokenGrant};
pub use user::{StorageScope, TokenPair, User};
