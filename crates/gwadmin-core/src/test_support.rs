//! Scripted collaborators for exercising the session layer without a server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::api::transport::{ApiRequest, RawResponse, Transport};
use crate::api::ApiError;
use crate::auth::navigator::{Destination, Navigator, Notice};
use crate::auth::service::AuthService;
use crate::models::{LoginGrant, TokenGrant, TokenPair, User};

pub(crate) fn sample_user() -> User {
    serde_json::from_str(
        r#"{"id":1,"email":"a@b.com","name":"Admin","locale":"en","roles":["ADMIN"]}"#,
    )
    .expect("Failed to parse sample user")
}

type Responder =
    Box<dyn Fn(&ApiRequest, Option<&str>) -> Result<RawResponse, ApiError> + Send + Sync>;

/// Transport answering from a closure and recording every call.
pub(crate) struct ScriptedTransport {
    responder: Mutex<Arc<Responder>>,
    calls: Mutex<Vec<(ApiRequest, Option<String>)>>,
    holds: Mutex<HashMap<String, Arc<Semaphore>>>,
    rejections: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&ApiRequest, Option<&str>) -> Result<RawResponse, ApiError> + Send + Sync + 'static,
    {
        let responder: Responder = Box::new(responder);
        Self {
            responder: Mutex::new(Arc::new(responder)),
            calls: Mutex::new(Vec::new()),
            holds: Mutex::new(HashMap::new()),
            rejections: AtomicUsize::new(0),
        }
    }

    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&ApiRequest, Option<&str>) -> Result<RawResponse, ApiError> + Send + Sync + 'static,
    {
        let responder: Responder = Box::new(responder);
        *self.responder.lock() = Arc::new(responder);
    }

    /// Delay responses for `path` until a permit is available
    pub fn hold(&self, path: &str, gate: Arc<Semaphore>) {
        self.holds.lock().insert(path.to_string(), gate);
    }

    pub fn calls(&self) -> Vec<(ApiRequest, Option<String>)> {
        self.calls.lock().clone()
    }

    pub fn bearers(&self) -> Vec<Option<String>> {
        self.calls.lock().iter().map(|(_, b)| b.clone()).collect()
    }

    /// Number of 401 responses handed out so far
    pub fn rejections(&self) -> usize {
        self.rejections.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        request: &ApiRequest,
        bearer: Option<&str>,
    ) -> Result<RawResponse, ApiError> {
        self.calls
            .lock()
            .push((request.clone(), bearer.map(str::to_string)));

        let hold = self.holds.lock().get(&request.path).cloned();
        if let Some(gate) = hold {
            let _permit = gate.acquire().await.expect("hold semaphore closed");
        }

        let responder = self.responder.lock().clone();
        let response = (*responder)(request, bearer);
        if matches!(response, Ok(ref r) if r.is_unauthorized()) {
            self.rejections.fetch_add(1, Ordering::SeqCst);
        }
        response
    }
}

enum RefreshBehavior {
    Grant {
        access_token: String,
        refresh_token: Option<String>,
    },
    Fail,
}

/// Auth service issuing T1/R1 on login and T2 on refresh unless told otherwise.
pub(crate) struct FakeAuth {
    reject_logins: AtomicBool,
    refresh: Mutex<RefreshBehavior>,
    gate: Option<Arc<Semaphore>>,
    login_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    logout_calls: AtomicUsize,
    last_refresh_token: Mutex<Option<String>>,
}

impl FakeAuth {
    pub fn new() -> Self {
        Self {
            reject_logins: AtomicBool::new(false),
            refresh: Mutex::new(RefreshBehavior::Grant {
                access_token: "T2".to_string(),
                refresh_token: None,
            }),
            gate: None,
            login_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
            last_refresh_token: Mutex::new(None),
        }
    }

    /// Block each refresh until the semaphore hands out a permit
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn reject_logins(&self) {
        self.reject_logins.store(true, Ordering::SeqCst);
    }

    pub fn grant_refresh(&self, access_token: &str, refresh_token: Option<&str>) {
        *self.refresh.lock() = RefreshBehavior::Grant {
            access_token: access_token.to_string(),
            refresh_token: refresh_token.map(str::to_string),
        };
    }

    pub fn fail_refresh(&self) {
        *self.refresh.lock() = RefreshBehavior::Fail;
    }

    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn logout_calls(&self) -> usize {
        self.logout_calls.load(Ordering::SeqCst)
    }

    pub fn last_refresh_token(&self) -> Option<String> {
        self.last_refresh_token.lock().clone()
    }
}

#[async_trait]
impl AuthService for FakeAuth {
    async fn login(
        &self,
        _email: &str,
        _password: &str,
        _remember_me: bool,
    ) -> Result<LoginGrant, ApiError> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        if self.reject_logins.load(Ordering::SeqCst) {
            return Err(ApiError::InvalidCredentials("Bad credentials".to_string()));
        }
        let tokens = TokenPair::new("T1", "R1");
        Ok(LoginGrant {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            token_type: Some("Bearer".to_string()),
            expires_in: Some(900),
            user: sample_user(),
        })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, ApiError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_refresh_token.lock() = Some(refresh_token.to_string());

        if let Some(ref gate) = self.gate {
            let _permit = gate.acquire().await.expect("refresh gate closed");
        }

        match *self.refresh.lock() {
            RefreshBehavior::Grant {
                ref access_token,
                ref refresh_token,
            } => Ok(TokenGrant {
                access_token: access_token.clone(),
                refresh_token: refresh_token.clone(),
                expires_in: None,
            }),
            RefreshBehavior::Fail => Err(ApiError::RefreshFailed("refresh token revoked".to_string())),
        }
    }

    async fn logout(&self, _user_id: i64, _access_token: &str) -> Result<(), ApiError> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Navigator remembering every navigation and notice.
#[derive(Default)]
pub(crate) struct RecordingNavigator {
    destinations: Mutex<Vec<Destination>>,
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNavigator {
    pub fn destinations(&self) -> Vec<Destination> {
        self.destinations.lock().clone()
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().clone()
    }
}

impl Navigator for RecordingNavigator {
    fn navigate(&self, destination: Destination) {
        self.destinations.lock().push(destination);
    }

    fn notify(&self, notice: &Notice) {
        self.notices.lock().push(notice.clone());
    }
}
