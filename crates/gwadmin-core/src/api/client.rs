//! Gateway administration API: services and their routes.
//!
//! Resource bodies are passed through as JSON untouched; the console does
//! not interpret them.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use super::dispatcher::{Dispatcher, TrackedRequest};
use super::transport::ApiRequest;
use super::ApiError;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Filters for listing services
#[derive(Debug, Clone, Default)]
pub struct ServiceQuery {
    pub search: Option<String>,
    pub page: Option<u32>,
    pub size: Option<u32>,
}

impl ServiceQuery {
    pub fn search(term: impl Into<String>) -> Self {
        Self {
            search: Some(term.into()),
            ..Self::default()
        }
    }

    fn apply(&self, mut request: ApiRequest) -> ApiRequest {
        if let Some(ref search) = self.search {
            request = request.with_query("search", search);
        }
        if let Some(page) = self.page {
            request = request.with_query("page", page);
        }
        if let Some(size) = self.size {
            request = request.with_query("size", size);
        }
        request
    }
}

/// Clone is cheap - the dispatcher is shared.
#[derive(Clone)]
pub struct GatewayApi {
    dispatcher: Arc<Dispatcher>,
    initial_backoff: Duration,
}

impl GatewayApi {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        }
    }

    /// Override the first rate-limit backoff; doubles on each retry
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Dispatch, backing off on 429, and unwrap the envelope's `data`.
    ///
    /// Rate-limit resends reuse one tracked request, so a 401 after a
    /// 429 does not earn a second token refresh.
    async fn call(&self, request: ApiRequest) -> Result<Value, ApiError> {
        let mut tracked = TrackedRequest::new(request);
        let mut retries = 0;
        let mut backoff = self.initial_backoff;

        loop {
            match self
                .dispatcher
                .dispatch_tracked(&mut tracked)
                .await?
                .error_for_status()
            {
                Ok(response) => {
                    return Ok(response.into_optional_data()?.unwrap_or(Value::Null));
                }
                Err(ApiError::RateLimited) if retries < MAX_RATE_LIMIT_RETRIES => {
                    retries += 1;
                    warn!(path = %tracked.request().path, retry = retries, backoff_ms = backoff.as_millis() as u64, "Rate limited, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ===== Services =====

    pub async fn list_services(&self, query: &ServiceQuery) -> Result<Value, ApiError> {
        self.call(query.apply(ApiRequest::get("services"))).await
    }

    pub async fn get_service(&self, id: &str) -> Result<Value, ApiError> {
        self.call(ApiRequest::get(format!("services/{}", id))).await
    }

    pub async fn create_service(&self, service: Value) -> Result<Value, ApiError> {
        self.call(ApiRequest::post("services", service)).await
    }

    pub async fn update_service(&self, id: &str, changes: Value) -> Result<Value, ApiError> {
        self.call(ApiRequest::patch(format!("services/{}", id), changes))
            .await
    }

    pub async fn delete_service(&self, id: &str) -> Result<(), ApiError> {
        self.call(ApiRequest::delete(format!("services/{}", id)))
            .await
            .map(|_| ())
    }

    // ===== Routes =====

    pub async fn list_routes(&self, service_id: &str) -> Result<Value, ApiError> {
        self.call(ApiRequest::get(format!("services/{}/routes", service_id)))
            .await
    }

    pub async fn get_route(&self, id: &str) -> Result<Value, ApiError> {
        self.call(ApiRequest::get(format!("routes/{}", id))).await
    }

    pub async fn create_route(&self, service_id: &str, route: Value) -> Result<Value, ApiError> {
        self.call(ApiRequest::post(format!("services/{}/routes", service_id), route))
            .await
    }

    pub async fn update_route(&self, id: &str, changes: Value) -> Result<Value, ApiError> {
        self.call(ApiRequest::patch(format!("routes/{}", id), changes))
            .await
    }

    pub async fn delete_route(&self, id: &str) -> Result<(), ApiError> {
        self.call(ApiRequest::delete(format!("routes/{}", id)))
            .await
            .map(|_| ())
    }
}
