//! Wire-level request/response types and the transport seam.
//!
//! `Transport` is the only place bytes leave the process. The dispatcher and
//! the auth service are written against the trait so the refresh protocol can
//! be exercised without a server.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use super::ApiError;
use crate::models::ApiEnvelope;

/// Header the backend reads the caller's user id from on sign-out
pub const USER_ID_HEADER: &str = "X-User-Id";

/// An outbound call, relative to the configured base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn patch(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PATCH, path).with_body(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn with_header(mut self, name: &str, value: impl ToString) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// Status and body of a completed HTTP exchange, whatever the status.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub body: String,
}

impl RawResponse {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == StatusCode::UNAUTHORIZED
    }

    /// Turn a non-2xx response into a typed error
    pub fn error_for_status(self) -> Result<Self, ApiError> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(ApiError::from_status(self.status, &self.body))
        }
    }

    /// Decode the `data` field of the backend envelope.
    pub fn into_data<T: DeserializeOwned>(self) -> Result<T, ApiError> {
        let envelope: ApiEnvelope<T> = serde_json::from_str(&self.body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse response: {}", e)))?;
        if !envelope.success {
            return Err(ApiError::InvalidResponse(envelope.error_message()));
        }
        envelope
            .data
            .ok_or_else(|| ApiError::InvalidResponse("Response has no data".to_string()))
    }

    /// Like `into_data`, for endpoints whose payload may be null.
    pub fn into_optional_data<T: DeserializeOwned>(self) -> Result<Option<T>, ApiError> {
        let envelope: ApiEnvelope<T> = serde_json::from_str(&self.body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse response: {}", e)))?;
        if !envelope.success {
            return Err(ApiError::InvalidResponse(envelope.error_message()));
        }
        Ok(envelope.data)
    }
}

/// Sends one request and returns the server's answer.
///
/// Implementations return `Ok` for every HTTP status; `Err` is reserved for
/// failures where no response arrived.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &ApiRequest, bearer: Option<&str>)
        -> Result<RawResponse, ApiError>;
}

/// `Transport` over a pooled reqwest client.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: Url,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: Self::parse_base_url(base_url)?,
        })
    }

    /// Parse the base URL, making sure relative paths join under it.
    fn parse_base_url(base_url: &str) -> Result<Url, ApiError> {
        let mut normalized = base_url.trim().to_string();
        if !normalized.ends_with('/') {
            normalized.push('/');
        }
        Url::parse(&normalized)
            .map_err(|e| ApiError::Transport(format!("Invalid base URL {}: {}", base_url, e)))
    }

    fn url_for(&self, path: &str) -> Result<Url, ApiError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| ApiError::Transport(format!("Invalid request path {}: {}", path, e)))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        request: &ApiRequest,
        bearer: Option<&str>,
    ) -> Result<RawResponse, ApiError> {
        let url = self.url_for(&request.path)?;
        debug!(method = %request.method, url = %url, authenticated = bearer.is_some(), "Sending request");

        let mut builder = self
            .client
            .request(request.method.clone(), url)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, "application/json");
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        debug!(status = %status, bytes = body.len(), "Response received");
        Ok(RawResponse { status, body })
    }
}
