//! Authenticated request dispatch with transparent token refresh.
//!
//! Every request carries the current access token. A 401 triggers at most
//! one refresh-and-resend for that request, and concurrent 401s share a
//! single refresh call.

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::transport::{ApiRequest, RawResponse, Transport};
use super::ApiError;
use crate::auth::session::{RefreshFailure, SessionContext};

type RefreshOutcome = Result<String, RefreshFailure>;

/// The refresh currently in flight, tagged so it can clear only its own slot.
struct InFlightRefresh {
    id: u64,
    outcome: Shared<BoxFuture<'static, RefreshOutcome>>,
}

#[derive(Default)]
struct RefreshSlot {
    current: Option<InFlightRefresh>,
    next_id: u64,
}

/// A request plus its own retry bookkeeping.
///
/// Reuse the same record when re-sending a logical request (e.g. after a
/// 429) so the retry-once rule spans every attempt.
pub struct TrackedRequest {
    request: ApiRequest,
    retried: bool,
    // Session the request was first sent under
    epoch: Option<u64>,
}

impl TrackedRequest {
    pub fn new(request: ApiRequest) -> Self {
        Self {
            request,
            retried: false,
            epoch: None,
        }
    }

    pub fn request(&self) -> &ApiRequest {
        &self.request
    }
}

pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    session: Arc<SessionContext>,
    refresh: Arc<Mutex<RefreshSlot>>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>, session: Arc<SessionContext>) -> Self {
        Self {
            transport,
            session,
            refresh: Arc::new(Mutex::new(RefreshSlot::default())),
        }
    }

    pub fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }

    /// Send a request on behalf of the current session.
    ///
    /// Any response other than 401 is returned as-is, whatever its status.
    /// Transport failures are returned untouched.
    pub async fn dispatch(&self, request: ApiRequest) -> Result<RawResponse, ApiError> {
        self.dispatch_tracked(&mut TrackedRequest::new(request)).await
    }

    /// `dispatch` for a request whose retry state outlives one call.
    pub async fn dispatch_tracked(
        &self,
        tracked: &mut TrackedRequest,
    ) -> Result<RawResponse, ApiError> {
        loop {
            let (epoch, bearer) = self.session.token_snapshot();
            let session_epoch = *tracked.epoch.get_or_insert(epoch);
            let response = self
                .transport
                .send(&tracked.request, bearer.as_deref())
                .await?;
            if !response.is_unauthorized() {
                return Ok(response);
            }

            if tracked.retried {
                warn!(path = %tracked.request.path, "Request rejected after token refresh, ending session");
                // No-op if that session already ended or was replaced
                self.session.expire(session_epoch);
                return Err(ApiError::Unauthorized);
            }
            tracked.retried = true;

            let Some(sent_with) = bearer else {
                debug!(path = %tracked.request.path, "Unauthenticated request rejected");
                return Err(ApiError::Unauthorized);
            };

            if let Err(failure) = self.shared_refresh(&sent_with).await {
                debug!(path = %tracked.request.path, %failure, "Giving up after failed refresh");
                return Err(failure.into());
            }
            debug!(path = %tracked.request.path, "Resending with refreshed access token");
        }
    }

    /// Join the refresh in flight, or start one if there is none.
    ///
    /// If the session's token already differs from `sent_with`, a refresh
    /// committed since the request left and the current token is returned
    /// without starting another.
    async fn shared_refresh(&self, sent_with: &str) -> RefreshOutcome {
        let outcome = {
            let mut guard = self.refresh.lock();
            let slot = &mut *guard;
            match slot.current {
                Some(ref flight) => {
                    debug!(refresh_id = flight.id, "Joining token refresh in flight");
                    flight.outcome.clone()
                }
                None => {
                    // Checked under the slot lock: a finished refresh vacates
                    // the slot only after committing its token
                    if let Some(current) = self
                        .session
                        .access_token()
                        .filter(|current| current != sent_with)
                    {
                        debug!("Access token already refreshed");
                        return Ok(current);
                    }

                    let id = slot.next_id;
                    slot.next_id += 1;
                    debug!(refresh_id = id, "Starting token refresh");

                    let session = Arc::clone(&self.session);
                    let refresh = Arc::clone(&self.refresh);
                    let outcome = async move {
                        let outcome = session.refresh().await;
                        // Vacate the slot as the outcome is published so the
                        // next 401 starts a fresh refresh
                        let mut slot = refresh.lock();
                        if slot.current.as_ref().is_some_and(|f| f.id == id) {
                            slot.current = None;
                        }
                        outcome
                    }
                    .boxed()
                    .shared();

                    slot.current = Some(InFlightRefresh {
                        id,
                        outcome: outcome.clone(),
                    });
                    outcome
                }
            }
        };
        outcome.await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::auth::navigator::{Destination, Notice};
    use crate::auth::storage::{KeyValueStore, MemoryStore};
    use crate::auth::store::CredentialStore;
    use crate::models::{StorageScope, TokenPair};
    use crate::test_support::{sample_user, FakeAuth, RecordingNavigator, ScriptedTransport};
    use futures::future::join_all;
    use reqwest::StatusCode;
    use tokio::sync::Semaphore;

    struct Harness {
        durable: Arc<MemoryStore>,
        ephemeral: Arc<MemoryStore>,
        auth: Arc<FakeAuth>,
        navigator: Arc<RecordingNavigator>,
        transport: Arc<ScriptedTransport>,
        dispatcher: Dispatcher,
    }

    /// Signed-in session holding T1/R1 in the durable scope
    fn harness(auth: FakeAuth, transport: ScriptedTransport) -> Harness {
        let durable = Arc::new(MemoryStore::new());
        let ephemeral = Arc::new(MemoryStore::new());
        let store = CredentialStore::new(durable.clone(), ephemeral.clone());
        store
            .persist(&sample_user(), &TokenPair::new("T1", "R1"), StorageScope::Durable)
            .unwrap();

        let auth = Arc::new(auth);
        let navigator = Arc::new(RecordingNavigator::default());
        let transport = Arc::new(transport);
        let session = SessionContext::initialize(auth.clone(), store, navigator.clone());
        let dispatcher = Dispatcher::new(transport.clone(), session);
        Harness {
            durable,
            ephemeral,
            auth,
            navigator,
            transport,
            dispatcher,
        }
    }

    /// Accepts only "Bearer T2"; echoes the request path back
    fn accepts_t2() -> ScriptedTransport {
        ScriptedTransport::new(|request, bearer| match bearer {
            Some("T2") => Ok(RawResponse::new(StatusCode::OK, request.path.clone())),
            _ => Ok(RawResponse::new(StatusCode::UNAUTHORIZED, "")),
        })
    }

    /// Resolves once the transport has returned `count` 401s
    async fn wait_for_rejections(transport: &ScriptedTransport, count: usize) {
        while transport.rejections() < count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_attaches_bearer_token() {
        let h = harness(
            FakeAuth::new(),
            ScriptedTransport::new(|_, _| Ok(RawResponse::new(StatusCode::OK, "{}"))),
        );

        h.dispatcher.dispatch(ApiRequest::get("services")).await.unwrap();
        h.dispatcher.session().logout();
        h.dispatcher.dispatch(ApiRequest::get("services")).await.unwrap();

        assert_eq!(
            h.transport.bearers(),
            vec![Some("T1".to_string()), None]
        );
    }

    #[tokio::test]
    async fn test_refreshes_and_resends_once() {
        let h = harness(FakeAuth::new(), accepts_t2());

        let response = h
            .dispatcher
            .dispatch(ApiRequest::get("services/1"))
            .await
            .expect("request should succeed after refresh");

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, "services/1");
        assert_eq!(h.auth.refresh_calls(), 1);
        assert_eq!(h.auth.last_refresh_token().as_deref(), Some("R1"));
        assert_eq!(
            h.transport.bearers(),
            vec![Some("T1".to_string()), Some("T2".to_string())]
        );
        assert_eq!(h.durable.get("accessToken").unwrap().as_deref(), Some("T2"));
        assert!(h.ephemeral.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_rejections_share_one_refresh() {
        let gate = Arc::new(Semaphore::new(0));
        let h = harness(FakeAuth::new().with_gate(gate.clone()), accepts_t2());

        let requests = join_all((0..5).map(|i| {
            h.dispatcher
                .dispatch(ApiRequest::get(format!("services/{}", i)))
        }));
        let release = async {
            wait_for_rejections(&h.transport, 5).await;
            gate.add_permits(1);
        };
        let (results, _) = tokio::join!(requests, release);

        for (i, result) in results.into_iter().enumerate() {
            let response = result.expect("request should succeed after refresh");
            assert_eq!(response.body, format!("services/{}", i));
        }
        assert_eq!(h.auth.refresh_calls(), 1);
        assert_eq!(h.transport.calls().len(), 10);
    }

    #[tokio::test]
    async fn test_stale_token_rejection_resends_without_refresh() {
        let held = Arc::new(Semaphore::new(0));
        let transport = accepts_t2();
        transport.hold("slow", held.clone());
        let h = harness(FakeAuth::new(), transport);

        // "slow" leaves with T1 but its 401 only lands after "fast" refreshed
        let slow = h.dispatcher.dispatch(ApiRequest::get("slow"));
        let fast_then_release = async {
            while h.transport.calls().is_empty() {
                tokio::task::yield_now().await;
            }
            let fast = h.dispatcher.dispatch(ApiRequest::get("fast")).await;
            held.add_permits(1);
            fast
        };
        let (slow, fast) = tokio::join!(slow, fast_then_release);

        assert_eq!(fast.unwrap().status, StatusCode::OK);
        assert_eq!(slow.unwrap().body, "slow");
        assert_eq!(h.auth.refresh_calls(), 1);
        assert_eq!(
            h.transport.bearers(),
            vec![
                Some("T1".to_string()),
                Some("T1".to_string()),
                Some("T2".to_string()),
                Some("T2".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_refresh_logs_out_once_for_all_waiters() {
        let gate = Arc::new(Semaphore::new(0));
        let auth = FakeAuth::new().with_gate(gate.clone());
        auth.fail_refresh();
        let h = harness(auth, accepts_t2());

        let requests = join_all((0..3).map(|_| h.dispatcher.dispatch(ApiRequest::get("routes/1"))));
        let release = async {
            wait_for_rejections(&h.transport, 3).await;
            gate.add_permits(1);
        };
        let (results, _) = tokio::join!(requests, release);

        for result in results {
            assert!(matches!(result, Err(ApiError::RefreshFailed(_))));
        }
        assert_eq!(h.auth.refresh_calls(), 1);
        assert!(h.durable.is_empty());
        assert!(h.ephemeral.is_empty());
        assert!(!h.dispatcher.session().is_authenticated());
        assert_eq!(h.navigator.destinations(), vec![Destination::Login]);
        assert_eq!(h.navigator.notices().len(), 1);
        // Nobody resent after the failed refresh
        assert_eq!(h.transport.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_rejection_after_retry_does_not_refresh_again() {
        let h = harness(
            FakeAuth::new(),
            ScriptedTransport::new(|_, _| Ok(RawResponse::new(StatusCode::UNAUTHORIZED, ""))),
        );

        let result = h.dispatcher.dispatch(ApiRequest::get("services")).await;

        assert!(matches!(result, Err(ApiError::Unauthorized)));
        assert_eq!(h.auth.refresh_calls(), 1);
        assert_eq!(
            h.transport.bearers(),
            vec![Some("T1".to_string()), Some("T2".to_string())]
        );
        assert!(!h.dispatcher.session().is_authenticated());
        assert!(h.durable.is_empty());
        assert_eq!(h.navigator.destinations(), vec![Destination::Login]);
        assert_eq!(h.navigator.notices(), vec![Notice::SessionExpired]);
    }

    #[tokio::test]
    async fn test_late_rejection_does_not_end_newer_session() {
        // First send goes straight through; the resend waits for a permit
        let held = Arc::new(Semaphore::new(1));
        let transport =
            ScriptedTransport::new(|_, _| Ok(RawResponse::new(StatusCode::UNAUTHORIZED, "")));
        transport.hold("services", held.clone());
        let h = harness(FakeAuth::new(), transport);
        let session = Arc::clone(h.dispatcher.session());

        let request = h.dispatcher.dispatch(ApiRequest::get("services"));
        let relogin_then_release = async {
            while h.transport.calls().len() < 2 {
                tokio::task::yield_now().await;
            }
            assert!(session.logout());
            session.login("a@b.com", "x", true).await.unwrap();
            held.add_permits(1);
        };
        let (result, _) = tokio::join!(request, relogin_then_release);

        assert!(matches!(result, Err(ApiError::Unauthorized)));
        assert_eq!(h.auth.refresh_calls(), 1);
        assert!(session.is_authenticated());
        assert_eq!(h.durable.get("accessToken").unwrap().as_deref(), Some("T1"));
        assert!(h.navigator.notices().is_empty());
        assert_eq!(
            h.navigator.destinations(),
            vec![Destination::Login, Destination::AuthenticatedHome]
        );
    }

    #[tokio::test]
    async fn test_new_refresh_after_previous_completed() {
        let h = harness(
            FakeAuth::new(),
            ScriptedTransport::new(|_, bearer| match bearer {
                Some("T2") | Some("T3") => Ok(RawResponse::new(StatusCode::OK, "")),
                _ => Ok(RawResponse::new(StatusCode::UNAUTHORIZED, "")),
            }),
        );

        h.dispatcher.dispatch(ApiRequest::get("a")).await.unwrap();
        assert_eq!(h.auth.refresh_calls(), 1);

        // The server now rejects T2 as well
        h.transport.set_responder(|_, bearer| match bearer {
            Some("T3") => Ok(RawResponse::new(StatusCode::OK, "")),
            _ => Ok(RawResponse::new(StatusCode::UNAUTHORIZED, "")),
        });
        h.auth.grant_refresh("T3", Some("R3"));
        h.dispatcher.dispatch(ApiRequest::get("b")).await.unwrap();

        assert_eq!(h.auth.refresh_calls(), 2);
        assert_eq!(h.auth.last_refresh_token().as_deref(), Some("R1"));
        assert_eq!(h.durable.get("refreshToken").unwrap().as_deref(), Some("R3"));
    }

    #[tokio::test]
    async fn test_refresh_outcome_after_logout_is_ignored() {
        let gate = Arc::new(Semaphore::new(0));
        let h = harness(FakeAuth::new().with_gate(gate.clone()), accepts_t2());

        let request = h.dispatcher.dispatch(ApiRequest::get("services"));
        let logout_then_release = async {
            wait_for_rejections(&h.transport, 1).await;
            assert!(h.dispatcher.session().logout());
            gate.add_permits(1);
        };
        let (result, _) = tokio::join!(request, logout_then_release);

        assert!(matches!(result, Err(ApiError::RefreshFailed(_))));
        assert!(h.dispatcher.session().access_token().is_none());
        assert!(h.durable.is_empty());
        assert_eq!(h.navigator.destinations(), vec![Destination::Login]);
    }

    #[tokio::test]
    async fn test_other_statuses_and_transport_errors_pass_through() {
        let h = harness(
            FakeAuth::new(),
            ScriptedTransport::new(|request, _| match request.path.as_str() {
                "broken" => Err(ApiError::Transport("connection reset".to_string())),
                _ => Ok(RawResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "boom")),
            }),
        );

        let response = h.dispatcher.dispatch(ApiRequest::get("services")).await.unwrap();
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);

        let result = h.dispatcher.dispatch(ApiRequest::get("broken")).await;
        assert!(matches!(result, Err(ApiError::Transport(_))));

        assert_eq!(h.auth.refresh_calls(), 0);
        assert!(h.dispatcher.session().is_authenticated());
    }

    #[tokio::test]
    async fn test_unauthenticated_rejection_skips_refresh() {
        let h = harness(
            FakeAuth::new(),
            ScriptedTransport::new(|_, _| Ok(RawResponse::new(StatusCode::UNAUTHORIZED, ""))),
        );
        h.dispatcher.session().logout();

        let result = h.dispatcher.dispatch(ApiRequest::get("services")).await;
        assert!(matches!(result, Err(ApiError::Unauthorized)));
        assert_eq!(h.auth.refresh_calls(), 0);
        assert_eq!(h.transport.calls().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_refresh_across_worker_threads() {
        let gate = Arc::new(Semaphore::new(0));
        let h = harness(FakeAuth::new().with_gate(gate.clone()), accepts_t2());
        let dispatcher = Arc::new(h.dispatcher);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    dispatcher
                        .dispatch(ApiRequest::get(format!("routes/{}", i)))
                        .await
                })
            })
            .collect();

        tokio::time::timeout(Duration::from_secs(5), wait_for_rejections(&h.transport, 8))
            .await
            .expect("requests never reached the server");
        gate.add_permits(1);

        for handle in handles {
            let response = handle.await.unwrap().expect("request should succeed");
            assert_eq!(response.status, StatusCode::OK);
        }
        assert_eq!(h.auth.refresh_calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_rejections_straddling_refresh_completion_share_it() {
        // Ungated refresh: some 401s land while it commits and vacates its slot
        for _ in 0..16 {
            let h = harness(FakeAuth::new(), accepts_t2());
            let dispatcher = Arc::new(h.dispatcher);

            let handles: Vec<_> = (0..16)
                .map(|i| {
                    let dispatcher = Arc::clone(&dispatcher);
                    tokio::spawn(async move {
                        dispatcher
                            .dispatch(ApiRequest::get(format!("services/{}", i)))
                            .await
                    })
                })
                .collect();

            for handle in handles {
                let response = handle.await.unwrap().expect("request should succeed");
                assert_eq!(response.status, StatusCode::OK);
            }
            assert_eq!(h.auth.refresh_calls(), 1);
        }
    }
}
