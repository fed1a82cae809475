//! Listening socket lifecycle.
//!
//! Binds a filesystem or abstract namespace Unix socket, applies the
//! configured backlog and hands out [`ClientSocket`]s. Closing through a
//! [`CloseHandle`] wakes a pending `accept` so shutdown never hangs on it.

use std::fmt;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::client::ClientSocket;
use super::peer_cred::PeerCredentialResolver;
use super::run_config::{RunConfig, UNBOUND_FD};
use crate::diagnostics::DiagnosticStringGenerator;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Unbound,
    Listening,
    Closed,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unbound => f.write_str("Unbound"),
            Self::Listening => f.write_str("Listening"),
            Self::Closed => f.write_str("Closed"),
        }
    }
}

/// Result of waiting for a connection
#[derive(Debug)]
pub enum AcceptOutcome {
    Accepted(ClientSocket),
    /// The socket was closed, deliberately, before or while waiting
    Closed,
}

/// Closes a [`ServerSocket`] from another task
#[derive(Debug, Clone)]
pub struct CloseHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CloseHandle {
    pub fn close(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Listening Unix domain socket
#[derive(Debug)]
pub struct ServerSocket {
    config: Arc<RunConfig>,
    listener: Option<UnixListener>,
    state: ServerState,
    close_tx: Arc<watch::Sender<bool>>,
    close_rx: watch::Receiver<bool>,
    resolver: Arc<dyn PeerCredentialResolver>,
}

impl ServerSocket {
    /// Bind and listen at `config.path()` with `config.backlog()`.
    ///
    /// Must run inside a tokio runtime. A filesystem path that already exists
    /// is not removed; binding fails instead.
    pub fn bind(config: Arc<RunConfig>, resolver: Arc<dyn PeerCredentialResolver>) -> Result<Self> {
        let bind_error = |source: io::Error| Error::Bind {
            path: config.display_path(),
            source,
        };

        let listener = bind_std_listener(&config).map_err(bind_error)?;
        let listener = set_backlog(&listener, config.backlog())
            .and_then(|()| listener.set_nonblocking(true))
            .and_then(|()| UnixListener::from_std(listener));
        let listener = match listener {
            Ok(listener) => listener,
            Err(e) => {
                // Only the entry we just created is removed
                remove_socket_file(&config);
                return Err(bind_error(e));
            }
        };

        config.set_fd(listener.as_raw_fd());
        info!(
            "{} listening on {} (fd {}, backlog {})",
            config.log_title(),
            config.display_path(),
            config.fd(),
            config.backlog()
        );

        let (close_tx, close_rx) = watch::channel(false);
        Ok(Self {
            config,
            listener: Some(listener),
            state: ServerState::Listening,
            close_tx: Arc::new(close_tx),
            close_rx,
            resolver,
        })
    }

    pub fn config(&self) -> &Arc<RunConfig> {
        &self.config
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Listening fd, [`UNBOUND_FD`] once closed
    pub fn fd(&self) -> RawFd {
        self.listener
            .as_ref()
            .map_or(UNBOUND_FD, |listener| listener.as_raw_fd())
    }

    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            tx: Arc::clone(&self.close_tx),
        }
    }

    /// Wait for the next connection.
    ///
    /// Returns [`AcceptOutcome::Closed`] if the socket is closed before or
    /// while waiting.
    pub async fn accept(&mut self) -> Result<AcceptOutcome> {
        if *self.close_rx.borrow() {
            self.close();
            return Ok(AcceptOutcome::Closed);
        }
        let Some(listener) = self.listener.as_ref() else {
            return Ok(AcceptOutcome::Closed);
        };

        let accepted = tokio::select! {
            biased;
            _ = self.close_rx.changed() => None,
            result = listener.accept() => Some(result),
        };

        match accepted {
            None => {
                self.close();
                Ok(AcceptOutcome::Closed)
            }
            Some(Ok((stream, _addr))) => {
                let client = ClientSocket::new(stream, &self.config, Arc::clone(&self.resolver));
                debug!("{} accepted client {}", self.config.log_title(), client.id());
                Ok(AcceptOutcome::Accepted(client))
            }
            Some(Err(e)) => Err(Error::accept(e)),
        }
    }

    /// Release the fd and remove a filesystem socket's entry. Idempotent.
    pub fn close(&mut self) {
        self.close_tx.send_replace(true);
        if self.state == ServerState::Closed {
            return;
        }

        if self.listener.take().is_some() {
            remove_socket_file(&self.config);
            info!("{} closed {}", self.config.log_title(), self.config.display_path());
        }
        self.config.set_fd(UNBOUND_FD);
        self.state = ServerState::Closed;
    }

    fn string_generator(&self) -> DiagnosticStringGenerator {
        let mut generator = DiagnosticStringGenerator::new();
        generator.push("State", self.state).push("FD", self.fd());
        generator
    }

    pub fn log_string(&self) -> String {
        self.string_generator().log_string()
    }

    pub fn markdown_string(&self) -> String {
        self.string_generator().markdown_string()
    }
}

impl Drop for ServerSocket {
    fn drop(&mut self) {
        self.close();
    }
}

fn bind_std_listener(config: &RunConfig) -> io::Result<std::os::unix::net::UnixListener> {
    if config.is_abstract_namespace_socket() {
        bind_abstract(&config.path().as_bytes()[1..])
    } else {
        std::os::unix::net::UnixListener::bind(config.path())
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn bind_abstract(name: &[u8]) -> io::Result<std::os::unix::net::UnixListener> {
    #[cfg(target_os = "android")]
    use std::os::android::net::SocketAddrExt;
    #[cfg(target_os = "linux")]
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::{SocketAddr, UnixListener};

    let addr = SocketAddr::from_abstract_name(name)?;
    UnixListener::bind_addr(&addr)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn bind_abstract(_name: &[u8]) -> io::Result<std::os::unix::net::UnixListener> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "abstract namespace sockets are not supported on this platform",
    ))
}

/// Re-issue `listen(2)` with the configured backlog; std always listens with its own default.
fn set_backlog(listener: &std::os::unix::net::UnixListener, backlog: u32) -> io::Result<()> {
    let backlog = libc::c_int::try_from(backlog).unwrap_or(libc::c_int::MAX);
    // SAFETY: the fd is a valid, bound socket owned by `listener` for the duration of the call.
    let rc = unsafe { libc::listen(listener.as_raw_fd(), backlog) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn remove_socket_file(config: &RunConfig) {
    if config.is_abstract_namespace_socket() {
        return;
    }
    if let Err(e) = std::fs::remove_file(config.path()) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(
                "{} failed to remove socket file {}: {}",
                config.log_title(),
                config.path(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::{ConnectionHandler, KernelPeerCredentialResolver, PeerCredentials};
    use async_trait::async_trait;
    use std::path::Path;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct NoopHandler;

    #[async_trait]
    impl ConnectionHandler for NoopHandler {
        async fn on_client_accepted(&self, _client: ClientSocket, _peer: PeerCredentials) {}
    }

    fn config_at(path: &Path) -> Arc<RunConfig> {
        Arc::new(RunConfig::new("server-test", path.to_str().unwrap(), &NoopHandler).unwrap())
    }

    fn bind(config: &Arc<RunConfig>) -> Result<ServerSocket> {
        ServerSocket::bind(Arc::clone(config), Arc::new(KernelPeerCredentialResolver))
    }

    #[tokio::test]
    async fn test_bind_accept_and_close() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sock_path = tmp.path().join("server.sock");
        let config = config_at(&sock_path);

        let mut server = bind(&config).unwrap();
        assert_eq!(server.state(), ServerState::Listening);
        assert!(config.fd() >= 0);
        assert_eq!(config.fd(), server.fd());
        assert!(sock_path.exists());

        let mut peer = tokio::net::UnixStream::connect(&sock_path).await.unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(2), server.accept())
            .await
            .expect("Timed out waiting for accept")
            .unwrap();

        let mut client = match outcome {
            AcceptOutcome::Accepted(client) => client,
            AcceptOutcome::Closed => panic!("Expected a client"),
        };

        peer.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hi");

        client.write_all(b"yo").await.unwrap();
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"yo");

        server.close();
        assert_eq!(server.state(), ServerState::Closed);
        assert_eq!(config.fd(), UNBOUND_FD);
        assert!(!sock_path.exists());

        // Idempotent
        server.close();
        assert_eq!(server.state(), ServerState::Closed);
    }

    #[tokio::test]
    async fn test_bind_fails_when_path_exists() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sock_path = tmp.path().join("taken.sock");
        std::fs::write(&sock_path, b"").unwrap();

        let err = bind(&config_at(&sock_path)).unwrap_err();
        assert!(matches!(err, Error::Bind { .. }));
        // The existing entry is left alone
        assert!(sock_path.exists());
    }

    #[tokio::test]
    async fn test_bind_fails_in_missing_directory() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sock_path = tmp.path().join("missing").join("x.sock");

        let config = config_at(&sock_path);
        assert!(matches!(bind(&config), Err(Error::Bind { .. })));
        assert_eq!(config.fd(), UNBOUND_FD);
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_accept() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sock_path = tmp.path().join("pending.sock");
        let mut server = bind(&config_at(&sock_path)).unwrap();
        let handle = server.close_handle();

        let accept_task = tokio::spawn(async move {
            let outcome = server.accept().await;
            (outcome, server)
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.close();
        assert!(handle.is_closed());

        let (outcome, server) = tokio::time::timeout(Duration::from_secs(2), accept_task)
            .await
            .expect("accept did not return after close")
            .unwrap();
        assert!(matches!(outcome, Ok(AcceptOutcome::Closed)));
        assert_eq!(server.state(), ServerState::Closed);
        assert!(!sock_path.exists());
    }

    #[tokio::test]
    async fn test_accept_after_close_reports_closed() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut server = bind(&config_at(&tmp.path().join("again.sock"))).unwrap();
        server.close();
        assert!(matches!(server.accept().await, Ok(AcceptOutcome::Closed)));
    }

    #[tokio::test]
    async fn test_drop_removes_socket_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sock_path = tmp.path().join("dropped.sock");
        let server = bind(&config_at(&sock_path)).unwrap();
        assert!(sock_path.exists());
        drop(server);
        assert!(!sock_path.exists());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_abstract_namespace_bind() {
        use std::os::linux::net::SocketAddrExt;

        let name = format!("localsock-test-{}", uuid::Uuid::new_v4());
        let config = Arc::new(
            RunConfig::new("abstract", format!("\u{0}{}", name), &NoopHandler).unwrap(),
        );
        let mut server = bind(&config).unwrap();

        let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes()).unwrap();
        let std_peer = std::os::unix::net::UnixStream::connect_addr(&addr).unwrap();
        std_peer.set_nonblocking(true).unwrap();
        let _peer = tokio::net::UnixStream::from_std(std_peer).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(2), server.accept())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, AcceptOutcome::Accepted(_)));
        server.close();
    }

    #[tokio::test]
    async fn test_server_diagnostics() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut server = bind(&config_at(&tmp.path().join("diag.sock"))).unwrap();
        assert!(server.log_string().starts_with("State: Listening FD: "));

        server.close();
        assert_eq!(server.log_string(), "State: Closed FD: -1");
        assert_eq!(server.markdown_string(), "**State**: `Closed`  \n**FD**: `-1`  ");
    }
}
