use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::navigator::{Destination, Navigator, Notice};
use super::service::AuthService;
use super::store::CredentialStore;
use crate::api::ApiError;
use crate::models::{StorageScope, TokenPair, User};

/// What observers see: either a signed-in user or nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthState {
    Unauthenticated,
    Authenticated(User),
}

/// A signed-in session. User and tokens only ever exist together.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveSession {
    pub user: User,
    pub tokens: TokenPair,
    pub scope: StorageScope,
}

/// Why a refresh produced no new access token. Shared by every request
/// waiting on the same refresh, hence `Clone`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshFailure {
    #[error("no active session to refresh")]
    NoSession,

    #[error("session ended while the refresh was in flight")]
    Superseded,

    #[error("{0}")]
    Rejected(String),
}

impl From<RefreshFailure> for ApiError {
    fn from(failure: RefreshFailure) -> Self {
        ApiError::RefreshFailed(failure.to_string())
    }
}

struct SessionState {
    active: Option<ActiveSession>,
    // Bumped whenever a session starts or ends
    epoch: u64,
}

/// The single in-memory authority on who is signed in.
///
/// Login, refresh commits and logout each update memory and the credential
/// store under one lock, so no caller observes a half-applied change. The
/// store is written synchronously inside that lock; a logout has fully
/// cleared storage before any waiting request can resend.
pub struct SessionContext {
    auth: Arc<dyn AuthService>,
    store: CredentialStore,
    navigator: Arc<dyn Navigator>,
    state: Mutex<SessionState>,
    events: watch::Sender<AuthState>,
}

impl SessionContext {
    /// Build the context and adopt any stored session.
    ///
    /// A restored session is trusted as-is; the server gets to reject it on
    /// the first request.
    pub fn initialize(
        auth: Arc<dyn AuthService>,
        store: CredentialStore,
        navigator: Arc<dyn Navigator>,
    ) -> Arc<Self> {
        let active = store.restore().map(|stored| ActiveSession {
            user: stored.user,
            tokens: stored.tokens,
            scope: stored.scope,
        });

        let initial = match active {
            Some(ref session) => {
                info!(user_id = session.user.id, scope = %session.scope, "Restored stored session");
                AuthState::Authenticated(session.user.clone())
            }
            None => {
                debug!("No stored session, starting unauthenticated");
                AuthState::Unauthenticated
            }
        };
        let (events, _) = watch::channel(initial);

        Arc::new(Self {
            auth,
            store,
            navigator,
            state: Mutex::new(SessionState { active, epoch: 0 }),
            events,
        })
    }

    /// Receive every authentication state change from now on
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.events.subscribe()
    }

    pub fn current(&self) -> Option<ActiveSession> {
        self.state.lock().active.clone()
    }

    pub fn user(&self) -> Option<User> {
        self.state.lock().active.as_ref().map(|s| s.user.clone())
    }

    pub fn access_token(&self) -> Option<String> {
        self.state
            .lock()
            .active
            .as_ref()
            .map(|s| s.tokens.access_token.clone())
    }

    /// Current session epoch together with its access token
    pub(crate) fn token_snapshot(&self) -> (u64, Option<String>) {
        let state = self.state.lock();
        let token = state.active.as_ref().map(|s| s.tokens.access_token.clone());
        (state.epoch, token)
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.lock().active.is_some()
    }

    /// Sign in and persist the session in the scope picked by `remember_me`.
    ///
    /// A rejected login leaves memory and storage untouched.
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        remember_me: bool,
    ) -> Result<User, ApiError> {
        let grant = match self.auth.login(email, password, remember_me).await {
            Ok(grant) => grant,
            Err(e) => {
                warn!(error = %e, "Login failed");
                self.navigator.notify(&Notice::LoginFailed(e.to_string()));
                return Err(e);
            }
        };

        let scope = StorageScope::from_remember_me(remember_me);
        let session = ActiveSession {
            tokens: grant.tokens(),
            user: grant.user,
            scope,
        };
        let user = session.user.clone();
        {
            let mut state = self.state.lock();
            if let Err(e) = self.store.persist(&session.user, &session.tokens, scope) {
                warn!(error = %e, %scope, "Failed to persist session");
            }
            state.active = Some(session);
            state.epoch += 1;
        }

        info!(user_id = user.id, %scope, "Signed in");
        self.events.send_replace(AuthState::Authenticated(user.clone()));
        self.navigator.navigate(Destination::AuthenticatedHome);
        Ok(user)
    }

    /// Drop the session from memory and both storage scopes.
    ///
    /// Returns whether a session was actually ended. Calling this while
    /// signed out changes nothing and signals nobody.
    pub fn logout(&self) -> bool {
        self.end_session(None, None)
    }

    /// Force the session started at `epoch` to end, telling the user it
    /// expired.
    ///
    /// Does nothing if that session already ended or was replaced by a new
    /// login.
    pub fn expire(&self, epoch: u64) -> bool {
        self.end_session(Some(epoch), Some(Notice::SessionExpired))
    }

    /// Revoke the session on the server, then log out locally.
    ///
    /// The remote call is best-effort; the local logout always happens.
    pub async fn sign_out(&self) -> bool {
        if let Some(session) = self.current() {
            if let Err(e) = self
                .auth
                .logout(session.user.id, &session.tokens.access_token)
                .await
            {
                warn!(error = %e, "Server-side logout failed");
            }
        }
        self.logout()
    }

    /// Exchange the refresh token for a new access token and commit it.
    ///
    /// A rejected refresh ends the session. Outcomes that arrive after the
    /// session they were started for has ended are dropped.
    pub async fn refresh(&self) -> Result<String, RefreshFailure> {
        let (epoch, refresh_token) = {
            let state = self.state.lock();
            let Some(ref session) = state.active else {
                return Err(RefreshFailure::NoSession);
            };
            (state.epoch, session.tokens.refresh_token.clone())
        };

        match self.auth.refresh(&refresh_token).await {
            Ok(grant) => {
                let mut state = self.state.lock();
                if state.epoch != epoch {
                    debug!("Discarding refresh result for an ended session");
                    return Err(RefreshFailure::Superseded);
                }
                let Some(session) = state.active.as_mut() else {
                    return Err(RefreshFailure::Superseded);
                };
                let rotated = grant.refresh_token.is_some();
                let tokens = session.tokens.rotated(grant.access_token, grant.refresh_token);
                if let Err(e) = self.store.update_tokens(&tokens, session.scope) {
                    warn!(error = %e, scope = %session.scope, "Failed to persist refreshed tokens");
                }
                session.tokens = tokens;
                info!(user_id = session.user.id, rotated, "Access token refreshed");
                Ok(session.tokens.access_token.clone())
            }
            Err(e) => {
                warn!(error = %e, "Token refresh failed, ending session");
                self.expire(epoch);
                Err(RefreshFailure::Rejected(e.to_string()))
            }
        }
    }

    /// Clear memory and storage; signal observers if a session ended.
    ///
    /// With `expected_epoch` set, nothing happens unless that session is
    /// still the current one.
    fn end_session(&self, expected_epoch: Option<u64>, notice: Option<Notice>) -> bool {
        let ended = {
            let mut state = self.state.lock();
            if expected_epoch.is_some_and(|epoch| epoch != state.epoch) {
                return false;
            }
            if let Err(e) = self.store.clear() {
                warn!(error = %e, "Failed to clear stored credentials");
            }
            let ended = state.active.take();
            if ended.is_some() {
                state.epoch += 1;
            }
            ended
        };

        let Some(session) = ended else {
            return false;
        };
        info!(user_id = session.user.id, "Signed out");
        self.events.send_replace(AuthState::Unauthenticated);
        if let Some(ref notice) = notice {
            self.navigator.notify(notice);
        }
        self.navigator.navigate(Destination::Login);
        true
    }
}
