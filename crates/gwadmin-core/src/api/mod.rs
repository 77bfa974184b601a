//! REST API client module for the gateway admin backend.
//!
//! Requests go through the `Dispatcher`, which attaches the session's bearer
//! token and recovers from an expired access token by refreshing once.
//! `GatewayApi` exposes the service and route endpoints on top of it.

pub mod client;
pub mod dispatcher;
pub mod error;
pub mod transport;

pub use client::{GatewayApi, ServiceQuery};
pub use dispatcher::{Dispatcher, TrackedRequest};
pub use error::ApiError;
pub use transport::{ApiRequest, HttpTransport, RawResponse, Transport};
