//! Run configuration for one local socket endpoint.

use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use tracing::warn;

use super::handler::ConnectionHandler;
use crate::config::SocketDefaults;
use crate::diagnostics::DiagnosticStringGenerator;
use crate::{Error, Result};

/// Maximum encoded path length, the size of `sun_path` on Linux.
pub const MAX_PATH_BYTES: usize = 108;

/// Prefix for per-endpoint log titles.
pub const LOG_TAG: &str = "localsock";

/// Sentinel fd for a socket that is not bound.
pub const UNBOUND_FD: RawFd = -1;

/// Identity and tunables for one socket endpoint.
///
/// A filesystem path must be absolute once canonicalized; relative input is
/// anchored at `/`. The binding process needs write and search permission on
/// the containing directory, and connecting processes need write permission
/// on the socket file.
///
/// An abstract namespace address starts with a NUL byte and has no
/// filesystem entry. Some platforms confine the abstract namespace per
/// security domain, which can refuse peers even though the address exists.
#[derive(Debug)]
pub struct RunConfig {
    title: String,
    path: String,
    abstract_namespace: bool,
    client_type: String,
    /// Listening fd once bound, [`UNBOUND_FD`] before bind and after close
    fd: AtomicI32,
    receive_timeout_ms: Option<u64>,
    send_timeout_ms: Option<u64>,
    deadline_ms: Option<u64>,
    backlog: Option<u32>,
    defaults: SocketDefaults,
}

impl RunConfig {
    /// Create a config with the published defaults. The handler's type name is
    /// recorded for diagnostics.
    pub fn new<H>(title: impl Into<String>, path: impl Into<String>, client: &H) -> Result<Self>
    where
        H: ConnectionHandler + ?Sized,
    {
        Self::with_defaults(title, path, client, SocketDefaults::default())
    }

    /// Create a config whose unset tunables fall back to `defaults`
    pub fn with_defaults<H>(
        title: impl Into<String>,
        path: impl Into<String>,
        _client: &H,
        defaults: SocketDefaults,
    ) -> Result<Self>
    where
        H: ConnectionHandler + ?Sized,
    {
        Self::with_client_type(title, path, std::any::type_name::<H>(), defaults)
    }

    /// Create a config with an explicit client type label
    pub fn with_client_type(
        title: impl Into<String>,
        path: impl Into<String>,
        client_type: impl Into<String>,
        defaults: SocketDefaults,
    ) -> Result<Self> {
        let path = path.into();
        if path.is_empty() {
            return Err(Error::Config("socket path must not be empty".to_string()));
        }

        let abstract_namespace = path.as_bytes()[0] == 0;
        let path = if abstract_namespace {
            path
        } else {
            canonicalize_path(&path)
        };

        if path.len() > MAX_PATH_BYTES {
            return Err(Error::Config(format!(
                "socket path is {} bytes, max {}: {}",
                path.len(),
                MAX_PATH_BYTES,
                display_path(&path, abstract_namespace)
            )));
        }

        Ok(Self {
            title: title.into(),
            path,
            abstract_namespace,
            client_type: client_type.into(),
            fd: AtomicI32::new(UNBOUND_FD),
            receive_timeout_ms: None,
            send_timeout_ms: None,
            deadline_ms: None,
            backlog: None,
            defaults,
        })
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// Title used in log output for this endpoint
    pub fn log_title(&self) -> String {
        format!("{}.{}", LOG_TAG, self.title)
    }

    /// Canonical filesystem path, or the abstract address including its leading NUL
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Path with an abstract address shown as `@name`
    pub fn display_path(&self) -> String {
        display_path(&self.path, self.abstract_namespace)
    }

    pub fn is_abstract_namespace_socket(&self) -> bool {
        self.abstract_namespace
    }

    pub fn client_type(&self) -> &str {
        &self.client_type
    }

    pub fn defaults(&self) -> &SocketDefaults {
        &self.defaults
    }

    pub fn fd(&self) -> RawFd {
        self.fd.load(Ordering::Acquire)
    }

    /// Store the listening fd. Negative values are normalized to [`UNBOUND_FD`].
    pub fn set_fd(&self, fd: RawFd) {
        let fd = if fd >= 0 { fd } else { UNBOUND_FD };
        self.fd.store(fd, Ordering::Release);
    }

    pub fn receive_timeout_ms(&self) -> u64 {
        self.receive_timeout_ms.unwrap_or(self.defaults.receive_timeout_ms)
    }

    /// 0 disables the timeout
    pub fn set_receive_timeout_ms(&mut self, timeout_ms: u64) {
        self.receive_timeout_ms = Some(timeout_ms);
    }

    pub fn send_timeout_ms(&self) -> u64 {
        self.send_timeout_ms.unwrap_or(self.defaults.send_timeout_ms)
    }

    /// 0 disables the timeout
    pub fn set_send_timeout_ms(&mut self, timeout_ms: u64) {
        self.send_timeout_ms = Some(timeout_ms);
    }

    /// Client connection lifetime; after it elapses all reads and writes fail
    pub fn deadline_ms(&self) -> u64 {
        self.deadline_ms.unwrap_or(self.defaults.deadline_ms)
    }

    /// 0 disables the deadline
    pub fn set_deadline_ms(&mut self, deadline_ms: u64) {
        self.deadline_ms = Some(deadline_ms);
    }

    pub fn backlog(&self) -> u32 {
        self.backlog.unwrap_or(self.defaults.backlog)
    }

    /// Set the listen backlog. Non-positive values are rejected and the
    /// previous value is kept.
    pub fn set_backlog(&mut self, backlog: i32) -> Result<()> {
        match u32::try_from(backlog) {
            Ok(backlog) if backlog > 0 => {
                self.backlog = Some(backlog);
                Ok(())
            }
            _ => {
                warn!(
                    "{}: ignoring invalid backlog {}, keeping {}",
                    self.log_title(),
                    backlog,
                    self.backlog()
                );
                Err(Error::Config(format!(
                    "backlog must be greater than 0, got {}",
                    backlog
                )))
            }
        }
    }

    fn string_generator(&self) -> DiagnosticStringGenerator {
        let mut generator = DiagnosticStringGenerator::new();
        generator
            .push("Path", self.display_path())
            .push("AbstractNamespaceSocket", self.abstract_namespace)
            .push("ClientType", &self.client_type)
            .push("FD", self.fd())
            .push("ReceiveTimeout", self.receive_timeout_ms())
            .push("SendTimeout", self.send_timeout_ms())
            .push("Deadline", self.deadline_ms())
            .push("Backlog", self.backlog());
        generator
    }

    /// Ordered (label, value) pairs describing this config
    pub fn diagnostic_entries(&self) -> Vec<(String, String)> {
        self.string_generator().entries().to_vec()
    }

    pub fn log_string(&self) -> String {
        self.string_generator().log_string()
    }

    pub fn markdown_string(&self) -> String {
        self.string_generator().markdown_string()
    }
}

impl fmt::Display for RunConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.log_string())
    }
}

/// Lexically resolve `.` and `..` and anchor relative paths at `/`.
///
/// The socket file does not exist before bind, so nothing is looked up on disk.
fn canonicalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }
    format!("/{}", parts.join("/"))
}

fn display_path(path: &str, abstract_namespace: bool) -> String {
    if abstract_namespace {
        format!("@{}", &path[1..])
    } else {
        path.to_string()
    }
}
