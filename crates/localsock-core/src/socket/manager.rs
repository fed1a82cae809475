//! Socket manager
//!
//! Owns one endpoint's lifecycle: binds the [`ServerSocket`], runs the accept
//! loop on its own task and dispatches every accepted connection to the
//! [`ConnectionHandler`] on a separate task.

use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::ops::ControlFlow;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::client::ClientSocket;
use super::handler::ConnectionHandler;
use super::peer_cred::{KernelPeerCredentialResolver, PeerCredentialResolver, PeerCredentials};
use super::run_config::RunConfig;
use super::server::{AcceptOutcome, CloseHandle, ServerSocket};
use crate::diagnostics::DiagnosticStringGenerator;
use crate::{Error, Result};

/// Upper bound for `stop()` to wait on the accept loop and running handlers
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after a transient accept failure such as fd exhaustion
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => f.write_str("Stopped"),
            Self::Starting => f.write_str("Starting"),
            Self::Running => f.write_str("Running"),
            Self::Stopping => f.write_str("Stopping"),
        }
    }
}

struct RunningServer {
    server_fd: RawFd,
    closer: CloseHandle,
    accept_task: JoinHandle<()>,
}

struct Inner {
    state: ManagerState,
    running: Option<RunningServer>,
    /// Last started config, kept after stop for post-mortem diagnostics
    config: Option<Arc<RunConfig>>,
    /// Handlers of the most recent run. Replaced on every start so handlers
    /// left behind by an earlier stop are not waited on again.
    handlers: Arc<HandlerTracker>,
}

/// Counts running handler tasks and wakes `stop()` when the last one ends
#[derive(Default)]
struct HandlerTracker {
    active: AtomicUsize,
    idle: Notify,
}

struct ActiveHandler(Arc<HandlerTracker>);

impl HandlerTracker {
    fn track(self: &Arc<Self>) -> ActiveHandler {
        self.active.fetch_add(1, Ordering::AcqRel);
        ActiveHandler(Arc::clone(self))
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for ActiveHandler {
    fn drop(&mut self) {
        if self.0.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Runs one local socket endpoint
pub struct Manager {
    inner: Arc<Mutex<Inner>>,
    accepted: Arc<AtomicU64>,
    resolver: Arc<dyn PeerCredentialResolver>,
    stop_timeout: Duration,
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl Manager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: ManagerState::Stopped,
                running: None,
                config: None,
                handlers: Arc::new(HandlerTracker::default()),
            })),
            accepted: Arc::new(AtomicU64::new(0)),
            resolver: Arc::new(KernelPeerCredentialResolver),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    /// Use a different peer credential lookup
    pub fn with_resolver(mut self, resolver: Arc<dyn PeerCredentialResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Bound on how long `stop()` waits
    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock_inner(&self.inner)
    }

    pub fn state(&self) -> ManagerState {
        self.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == ManagerState::Running
    }

    /// The most recently started config, also after stop
    pub fn config(&self) -> Option<Arc<RunConfig>> {
        self.lock().config.clone()
    }

    /// Handler tasks of the current (or last) run still running
    pub fn active_connections(&self) -> usize {
        self.lock().handlers.active.load(Ordering::Acquire)
    }

    /// Connections accepted since this manager was created
    pub fn accepted_connections(&self) -> u64 {
        self.accepted.load(Ordering::Acquire)
    }

    /// Listening fd of the running server
    pub fn server_fd(&self) -> Result<RawFd> {
        let inner = self.lock();
        match (&inner.state, &inner.running) {
            (ManagerState::Running, Some(running)) => Ok(running.server_fd),
            _ => Err(Error::NotRunning),
        }
    }

    /// Bind the endpoint and start accepting connections.
    ///
    /// Must be called from within a tokio runtime. On bind failure the error
    /// is returned and the manager stays stopped.
    pub fn start(&self, config: RunConfig, handler: Arc<dyn ConnectionHandler>) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Runtime(e.to_string()))?;

        let mut inner = self.lock();
        if inner.state != ManagerState::Stopped {
            return Err(Error::AlreadyRunning(config.title().to_string()));
        }
        inner.state = ManagerState::Starting;

        let config = Arc::new(config);
        inner.config = Some(Arc::clone(&config));
        debug!("Starting {}: {}", config.log_title(), config.log_string());

        let server = match ServerSocket::bind(Arc::clone(&config), Arc::clone(&self.resolver)) {
            Ok(server) => server,
            Err(e) => {
                inner.state = ManagerState::Stopped;
                error!("{} failed to start: {}", config.log_title(), e);
                return Err(e);
            }
        };

        let server_fd = server.fd();
        let closer = server.close_handle();
        let handlers = Arc::new(HandlerTracker::default());
        inner.handlers = Arc::clone(&handlers);

        let span = info_span!("local_socket", title = %config.log_title());
        let accept_task = runtime.spawn(
            accept_loop(AcceptLoop {
                server,
                handler,
                inner: Arc::clone(&self.inner),
                handlers,
                accepted: Arc::clone(&self.accepted),
            })
            .instrument(span),
        );

        inner.running = Some(RunningServer {
            server_fd,
            closer,
            accept_task,
        });
        inner.state = ManagerState::Running;
        info!("{} started", config.log_title());
        Ok(())
    }

    /// Close the endpoint and wait, bounded, for the accept loop and running
    /// handlers. No-op when already stopped.
    pub async fn stop(&self) -> Result<()> {
        let (running, handlers, title) = {
            let mut inner = self.lock();
            match inner.state {
                ManagerState::Stopped | ManagerState::Stopping => return Ok(()),
                ManagerState::Starting | ManagerState::Running => {}
            }
            inner.state = ManagerState::Stopping;
            let title = inner
                .config
                .as_ref()
                .map(|config| config.log_title())
                .unwrap_or_default();
            (inner.running.take(), Arc::clone(&inner.handlers), title)
        };

        let started = Instant::now();
        if let Some(running) = running {
            running.closer.close();

            let mut accept_task = running.accept_task;
            match tokio::time::timeout(self.stop_timeout, &mut accept_task).await {
                Ok(Ok(())) => debug!("{} accept loop exited", title),
                Ok(Err(e)) => warn!("{} accept loop ended abnormally: {}", title, e),
                Err(_) => {
                    warn!(
                        "{} accept loop did not exit within {:?}, aborting",
                        title, self.stop_timeout
                    );
                    accept_task.abort();
                }
            }

            let remaining = self.stop_timeout.saturating_sub(started.elapsed());
            if tokio::time::timeout(remaining, handlers.wait_idle())
                .await
                .is_err()
            {
                warn!(
                    "{} stopping with {} handler(s) still running",
                    title,
                    handlers.active.load(Ordering::Acquire)
                );
            }
        }

        self.lock().state = ManagerState::Stopped;
        info!("{} stopped", title);
        Ok(())
    }

    fn string_generator(&self) -> DiagnosticStringGenerator {
        let (state, config) = {
            let inner = self.lock();
            (inner.state, inner.config.clone())
        };

        let mut generator = DiagnosticStringGenerator::new();
        generator
            .push_optional("Title", config.as_ref().map(|config| config.title()))
            .push("State", state)
            .push("ActiveConnections", self.active_connections())
            .push("AcceptedConnections", self.accepted_connections());
        if let Some(config) = config {
            for (label, value) in config.diagnostic_entries() {
                generator.push(label, value);
            }
        }
        generator
    }

    pub fn log_string(&self) -> String {
        self.string_generator().log_string()
    }

    pub fn markdown_string(&self) -> String {
        self.string_generator().markdown_string()
    }
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("state", &self.state())
            .field("active_connections", &self.active_connections())
            .field("stop_timeout", &self.stop_timeout)
            .finish()
    }
}

fn lock_inner(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

struct AcceptLoop {
    server: ServerSocket,
    handler: Arc<dyn ConnectionHandler>,
    inner: Arc<Mutex<Inner>>,
    handlers: Arc<HandlerTracker>,
    accepted: Arc<AtomicU64>,
}

async fn accept_loop(state: AcceptLoop) {
    let AcceptLoop {
        mut server,
        handler,
        inner,
        handlers,
        accepted,
    } = state;

    loop {
        match server.accept().await {
            Ok(AcceptOutcome::Accepted(mut client)) => {
                accepted.fetch_add(1, Ordering::AcqRel);

                let peer = match client.resolve_peer_credentials() {
                    Ok(peer) => peer.clone(),
                    Err(e) => {
                        warn!("Dropping client {}: {}", client.id(), e);
                        handler.on_error(&e);
                        client.close();
                        continue;
                    }
                };

                let guard = handlers.track();
                let handler = Arc::clone(&handler);
                tokio::spawn(
                    async move {
                        let _guard = guard;
                        dispatch(client, peer, handler.as_ref()).await;
                    }
                    .in_current_span(),
                );
            }
            Ok(AcceptOutcome::Closed) => {
                debug!("Server socket closed, stopping accept loop");
                break;
            }
            Err(e) => match on_accept_error(&e, &mut server, &inner, handler.as_ref()) {
                ControlFlow::Continue(()) => tokio::time::sleep(ACCEPT_RETRY_DELAY).await,
                ControlFlow::Break(()) => break,
            },
        }
    }

    server.close();
}

/// Authorize the peer and hand the connection to the handler. Runs on the
/// connection's own task.
async fn dispatch(
    mut client: ClientSocket,
    mut peer: PeerCredentials,
    handler: &dyn ConnectionHandler,
) {
    peer.load_process_name().await;
    client.cache_peer_credentials(peer.clone());

    if !handler.is_client_allowed(&peer) {
        handler.on_disallowed_client(&client, &peer);
        client.close();
        return;
    }

    debug!("Dispatching client {} ({})", client.id(), peer);
    handler.on_client_accepted(client, peer).await;
}

/// Report a failed accept. Transient failures keep the loop going after a
/// pause. Anything else closes the server and marks the manager stopped.
fn on_accept_error(
    err: &Error,
    server: &mut ServerSocket,
    inner: &Mutex<Inner>,
    handler: &dyn ConnectionHandler,
) -> ControlFlow<()> {
    if err.is_transient_accept() {
        warn!("Transient accept error: {}", err);
        handler.on_error(err);
        return ControlFlow::Continue(());
    }

    error!("Fatal accept error, stopping: {}", err);
    server.close();
    {
        let mut inner = lock_inner(inner);
        if inner.state == ManagerState::Running {
            inner.state = ManagerState::Stopped;
            inner.running = None;
        }
    }
    handler.on_manager_failure(err);
    ControlFlow::Break(())
}
