use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;
use tracing::debug;

use crate::api::transport::{ApiRequest, RawResponse, Transport, USER_ID_HEADER};
use crate::api::ApiError;
use crate::models::envelope::{LoginRequest, RefreshRequest};
use crate::models::{ApiEnvelope, LoginGrant, TokenGrant};

const LOGIN_PATH: &str = "auth/login";
const REFRESH_PATH: &str = "auth/refresh";
const LOGOUT_PATH: &str = "auth/logout";

/// Remote authentication endpoints.
#[async_trait]
pub trait AuthService: Send + Sync {
    /// Exchange credentials for a token pair and profile
    async fn login(
        &self,
        email: &str,
        password: &str,
        remember_me: bool,
    ) -> Result<LoginGrant, ApiError>;

    /// Mint a new access token. Any failure is final for the session.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, ApiError>;

    /// Revoke server-side session state for a user
    async fn logout(&self, user_id: i64, access_token: &str) -> Result<(), ApiError>;
}

/// `AuthService` backed by the gateway's `/auth` endpoints.
///
/// Calls go straight to the transport, never through the dispatcher, so a
/// rejected refresh cannot trigger another refresh.
pub struct HttpAuthService {
    transport: Arc<dyn Transport>,
}

impl HttpAuthService {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Message from an error envelope, or the raw body if it isn't one
    fn rejection_message(response: &RawResponse) -> String {
        serde_json::from_str::<ApiEnvelope<serde_json::Value>>(&response.body)
            .map(|envelope| envelope.error_message())
            .unwrap_or_else(|_| format!("Status {}", response.status))
    }
}

#[async_trait]
impl AuthService for HttpAuthService {
    async fn login(
        &self,
        email: &str,
        password: &str,
        remember_me: bool,
    ) -> Result<LoginGrant, ApiError> {
        let body = LoginRequest {
            email,
            password,
            remember_me,
        };
        let body = serde_json::to_value(&body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to encode login: {}", e)))?;

        let response = self
            .transport
            .send(&ApiRequest::post(LOGIN_PATH, body), None)
            .await?;

        match response.status {
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                debug!(status = %response.status, "Login rejected");
                Err(ApiError::InvalidCredentials(Self::rejection_message(&response)))
            }
            _ => response.error_for_status()?.into_data(),
        }
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, ApiError> {
        let body = serde_json::to_value(RefreshRequest { refresh_token })
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to encode refresh: {}", e)))?;

        let response = self
            .transport
            .send(&ApiRequest::post(REFRESH_PATH, body), None)
            .await?;

        if !response.status.is_success() {
            return Err(ApiError::RefreshFailed(Self::rejection_message(&response)));
        }
        response.into_data()
    }

    async fn logout(&self, user_id: i64, access_token: &str) -> Result<(), ApiError> {
        let request =
            ApiRequest::post(LOGOUT_PATH, json!({})).with_header(USER_ID_HEADER, user_id);
        self.transport
            .send(&request, Some(access_token))
            .await?
            .error_for_status()?;
        Ok(())
    }
}
