use std::fmt;
use std::io;

use thiserror::Error;

/// Whether an accept failure leaves the listening socket usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptErrorKind {
    /// The accept loop may continue (interrupted call, aborted peer, fd exhaustion).
    Transient,
    /// The listening socket is unusable and the accept loop must end.
    Fatal,
}

impl fmt::Display for AcceptErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => f.write_str("transient"),
            Self::Fatal => f.write_str("fatal"),
        }
    }
}

/// Direction of a bounded client socket I/O call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOperation {
    Read,
    Write,
}

impl fmt::Display for IoOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("Read"),
            Self::Write => f.write_str("Write"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to bind socket at {path}: {source}")]
    Bind {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Accept error ({kind}): {source}")]
    Accept {
        kind: AcceptErrorKind,
        #[source]
        source: io::Error,
    },

    #[error("{operation} timed out after {timeout_ms} ms")]
    Timeout {
        operation: IoOperation,
        timeout_ms: u64,
    },

    #[error("Connection deadline of {deadline_ms} ms exceeded")]
    DeadlineExceeded { deadline_ms: u64 },

    #[error("Peer credential lookup failed: {0}")]
    CredentialLookup(String),

    #[error("Socket manager \"{0}\" is already running")]
    AlreadyRunning(String),

    #[error("Socket manager is not running")]
    NotRunning,

    #[error("Socket is closed")]
    Closed,

    #[error("Async runtime error: {0}")]
    Runtime(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Classify an `accept(2)` failure.
    pub fn accept(source: io::Error) -> Self {
        let kind = if is_transient_accept_error(&source) {
            AcceptErrorKind::Transient
        } else {
            AcceptErrorKind::Fatal
        };
        Self::Accept { kind, source }
    }

    pub fn is_transient_accept(&self) -> bool {
        matches!(
            self,
            Self::Accept {
                kind: AcceptErrorKind::Transient,
                ..
            }
        )
    }
}

/// Errors after which the listener is still healthy.
///
/// This includes:
/// - interrupted / would-block wakeups
/// - peers that went away between SYN and accept (ECONNABORTED, ECONNRESET, EPROTO)
/// - descriptor or memory exhaustion (EMFILE, ENFILE, ENOBUFS, ENOMEM)
fn is_transient_accept_error(err: &io::Error) -> bool {
    use io::ErrorKind;

    if matches!(
        err.kind(),
        ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
    ) {
        return true;
    }

    matches!(
        err.raw_os_error(),
        Some(libc::EPROTO)
            | Some(libc::EMFILE)
            | Some(libc::ENFILE)
            | Some(libc::ENOBUFS)
            | Some(libc::ENOMEM)
    )
}

pub type Result<T> = std::result::Result<T, Error>;
