use async_trait::async_trait;
use tracing::{error, warn};

use super::client::ClientSocket;
use super::peer_cred::PeerCredentials;
use crate::Error;

/// Per-use-case callbacks for a [`Manager`](super::Manager).
///
/// `on_client_accepted` runs on its own task for every accepted connection,
/// so a slow peer never holds up the accept loop. The handler owns the
/// [`ClientSocket`] from then on; dropping it closes the connection.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Handle an accepted connection whose peer passed
    /// [`is_client_allowed`](Self::is_client_allowed).
    async fn on_client_accepted(&self, client: ClientSocket, peer: PeerCredentials);

    /// Authorization hook. The default accepts every peer.
    fn is_client_allowed(&self, _peer: &PeerCredentials) -> bool {
        true
    }

    /// Called instead of `on_client_accepted` for a refused peer. The
    /// connection is closed once this returns.
    fn on_disallowed_client(&self, client: &ClientSocket, peer: &PeerCredentials) {
        warn!(
            "Disallowed client connected: {} ({})",
            peer.log_string(),
            client.id()
        );
    }

    /// Errors scoped to one connection or a transient accept failure. The
    /// accept loop keeps running.
    fn on_error(&self, err: &Error) {
        warn!("Socket error: {}", err);
    }

    /// The accept loop ended on an unrecoverable error and the manager stopped.
    fn on_manager_failure(&self, err: &Error) {
        error!("Socket manager stopped after fatal error: {}", err);
    }
}
