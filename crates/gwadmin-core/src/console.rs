use std::sync::Arc;

use anyhow::Result;

use crate::api::{Dispatcher, GatewayApi, HttpTransport, Transport};
use crate::auth::{
    AuthService, CredentialStore, FileStore, HttpAuthService, KeyValueStore, KeyringStore,
    MemoryStore, Navigator, SessionContext,
};
use crate::config::{Config, DurableBackend};

/// The session layer and API client, wired together.
pub struct Console {
    pub session: Arc<SessionContext>,
    pub api: GatewayApi,
}

impl Console {
    /// Build a console talking HTTP to the configured gateway.
    ///
    /// Any stored session is restored here.
    pub fn connect(config: &Config, navigator: Arc<dyn Navigator>) -> Result<Self> {
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(
            &config.api_base_url,
            config.request_timeout(),
        )?);
        let durable: Arc<dyn KeyValueStore> = match config.durable_backend {
            DurableBackend::File => Arc::new(FileStore::new(config.credentials_path()?)),
            DurableBackend::Keyring => Arc::new(KeyringStore::new()),
        };
        let store = CredentialStore::new(durable, Arc::new(MemoryStore::new()));
        let auth = Arc::new(HttpAuthService::new(Arc::clone(&transport)));
        Ok(Self::assemble(transport, auth, store, navigator))
    }

    pub fn assemble(
        transport: Arc<dyn Transport>,
        auth: Arc<dyn AuthService>,
        store: CredentialStore,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        let session = SessionContext::initialize(auth, store, navigator);
        let dispatcher = Arc::new(Dispatcher::new(transport, Arc::clone(&session)));
        Self {
            session,
            api: GatewayApi::new(dispatcher),
        }
    }
}
