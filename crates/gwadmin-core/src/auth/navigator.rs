use tracing::info;

/// Where the console should go after a session change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Landing area for signed-in users
    AuthenticatedHome,
    /// Unauthenticated entry point
    Login,
}

/// User-visible notifications raised by the session layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    LoginFailed(String),
    SessionExpired,
}

/// The UI side of the session layer.
pub trait Navigator: Send + Sync {
    fn navigate(&self, destination: Destination);

    fn notify(&self, notice: &Notice) {
        info!(?notice, "Session notice");
    }
}
