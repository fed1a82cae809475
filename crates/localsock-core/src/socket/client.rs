//! Accepted client connection with timeout and deadline aware I/O.

use std::future::Future;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::peer_cred::{PeerCredentialResolver, PeerCredentials};
use super::run_config::{RunConfig, UNBOUND_FD};
use crate::diagnostics::DiagnosticStringGenerator;
use crate::error::IoOperation;
use crate::{Error, Result};

const READ_CHUNK: usize = 4096;

/// What bounds a single I/O wait
#[derive(Debug, Clone, Copy)]
enum IoLimit {
    Timeout(Duration),
    Deadline(Duration),
}

/// One accepted connection.
///
/// Timeouts and the deadline are captured from the [`RunConfig`] at accept
/// time. Every read and write first checks the deadline and then waits at
/// most the per-call timeout (0 = unbounded), capped by whatever remains of
/// the deadline.
#[derive(Debug)]
pub struct ClientSocket {
    id: Uuid,
    stream: Option<UnixStream>,
    fd: RawFd,
    created_at: Instant,
    created_wall: DateTime<Utc>,
    receive_timeout_ms: u64,
    send_timeout_ms: u64,
    deadline_ms: u64,
    peer_credentials: Option<PeerCredentials>,
    resolver: Arc<dyn PeerCredentialResolver>,
}

impl ClientSocket {
    pub fn new(
        stream: UnixStream,
        config: &RunConfig,
        resolver: Arc<dyn PeerCredentialResolver>,
    ) -> Self {
        let fd = stream.as_raw_fd();
        Self {
            id: Uuid::new_v4(),
            stream: Some(stream),
            fd,
            created_at: Instant::now(),
            created_wall: Utc::now(),
            receive_timeout_ms: config.receive_timeout_ms(),
            send_timeout_ms: config.send_timeout_ms(),
            deadline_ms: config.deadline_ms(),
            peer_credentials: None,
            resolver,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Connection fd, [`UNBOUND_FD`] once closed
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_wall
    }

    /// Time since the connection was accepted
    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn receive_timeout_ms(&self) -> u64 {
        self.receive_timeout_ms
    }

    pub fn send_timeout_ms(&self) -> u64 {
        self.send_timeout_ms
    }

    pub fn deadline_ms(&self) -> u64 {
        self.deadline_ms
    }

    /// Read into `buf`. Returns 0 at end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let limit = self.io_limit(self.receive_timeout_ms)?;
        let stream = self.stream.as_mut().ok_or(Error::Closed)?;
        let result = bounded(
            limit,
            IoOperation::Read,
            self.receive_timeout_ms,
            self.deadline_ms,
            stream.read(buf),
        )
        .await;
        self.close_on_io_error(result)
    }

    /// Write some of `buf`, returning how many bytes were written
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let limit = self.io_limit(self.send_timeout_ms)?;
        let stream = self.stream.as_mut().ok_or(Error::Closed)?;
        let result = bounded(
            limit,
            IoOperation::Write,
            self.send_timeout_ms,
            self.deadline_ms,
            stream.write(buf),
        )
        .await;
        self.close_on_io_error(result)
    }

    /// Write all of `buf`; each underlying write is bounded separately
    pub async fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf).await?;
            if n == 0 {
                let err = Error::Io(io::Error::from(io::ErrorKind::WriteZero));
                return self.close_on_io_error(Err(err));
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Read until the peer closes its write side, appending to `out`
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let mut total = 0;
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(total);
            }
            out.extend_from_slice(&chunk[..n]);
            total += n;
        }
    }

    /// Read until end of stream and decode as UTF-8
    pub async fn read_to_string(&mut self) -> Result<String> {
        let mut data = Vec::new();
        self.read_to_end(&mut data).await?;
        String::from_utf8(data)
            .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
    }

    /// Half-close the connection so the peer reads end of stream
    pub async fn shutdown_write(&mut self) -> Result<()> {
        let limit = self.io_limit(self.send_timeout_ms)?;
        let stream = self.stream.as_mut().ok_or(Error::Closed)?;
        let result = bounded(
            limit,
            IoOperation::Write,
            self.send_timeout_ms,
            self.deadline_ms,
            stream.shutdown(),
        )
        .await;
        self.close_on_io_error(result)
    }

    /// Resolve the peer's credentials once and cache them
    pub fn resolve_peer_credentials(&mut self) -> Result<&PeerCredentials> {
        if self.peer_credentials.is_none() {
            let stream = self.stream.as_ref().ok_or_else(|| {
                Error::CredentialLookup("connection is already closed".to_string())
            })?;
            self.peer_credentials = Some(self.resolver.resolve(stream)?);
        }
        self.peer_credentials
            .as_ref()
            .ok_or_else(|| Error::CredentialLookup("credentials unavailable".to_string()))
    }

    /// Replace the cached credentials with an enriched copy
    pub(crate) fn cache_peer_credentials(&mut self, peer: PeerCredentials) {
        self.peer_credentials = Some(peer);
    }

    /// Cached credentials, if already resolved
    pub fn peer_credentials(&self) -> Option<&PeerCredentials> {
        self.peer_credentials.as_ref()
    }

    /// Release the connection. Safe to call more than once.
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!("Closed client socket {} (fd {})", self.id, self.fd);
            self.fd = UNBOUND_FD;
        }
    }

    /// Check the deadline and work out how long the next call may wait.
    fn io_limit(&self, timeout_ms: u64) -> Result<Option<IoLimit>> {
        let timeout = (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms));

        if self.deadline_ms == 0 {
            return Ok(timeout.map(IoLimit::Timeout));
        }

        let deadline = Duration::from_millis(self.deadline_ms);
        let elapsed = self.created_at.elapsed();
        if elapsed > deadline {
            return Err(Error::DeadlineExceeded {
                deadline_ms: self.deadline_ms,
            });
        }

        let remaining = deadline - elapsed;
        Ok(Some(match timeout {
            Some(timeout) if timeout <= remaining => IoLimit::Timeout(timeout),
            _ => IoLimit::Deadline(remaining),
        }))
    }

    fn close_on_io_error<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(Error::Io(ref e)) = result {
            debug!("I/O error on client socket {}: {}", self.id, e);
            self.close();
        }
        result
    }

    fn string_generator(&self) -> DiagnosticStringGenerator {
        let mut generator = DiagnosticStringGenerator::new();
        generator
            .push("Id", self.id)
            .push("FD", self.fd)
            .push("CreationTime", self.created_wall.format("%Y-%m-%d %H:%M:%S%.3f UTC"))
            .push("ReceiveTimeout", self.receive_timeout_ms)
            .push("SendTimeout", self.send_timeout_ms)
            .push("Deadline", self.deadline_ms)
            .push_optional(
                "PeerCredentials",
                self.peer_credentials.as_ref().map(|cred| cred.log_string()),
            );
        generator
    }

    pub fn log_string(&self) -> String {
        self.string_generator().log_string()
    }

    pub fn markdown_string(&self) -> String {
        self.string_generator().markdown_string()
    }
}

impl Drop for ClientSocket {
    fn drop(&mut self) {
        self.close();
    }
}

async fn bounded<T, F>(
    limit: Option<IoLimit>,
    operation: IoOperation,
    timeout_ms: u64,
    deadline_ms: u64,
    io: F,
) -> Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match limit {
        None => Ok(io.await?),
        Some(IoLimit::Timeout(wait)) => match tokio::time::timeout(wait, io).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::Timeout {
                operation,
                timeout_ms,
            }),
        },
        Some(IoLimit::Deadline(wait)) => match tokio::time::timeout(wait, io).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::DeadlineExceeded { deadline_ms }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::{ConnectionHandler, KernelPeerCredentialResolver};
    use async_trait::async_trait;

    struct NoopHandler;

    #[async_trait]
    impl ConnectionHandler for NoopHandler {
        async fn on_client_accepted(&self, _client: ClientSocket, _peer: PeerCredentials) {}
    }

    fn client_pair(configure: impl FnOnce(&mut RunConfig)) -> (ClientSocket, UnixStream) {
        let mut config = RunConfig::new("test", "/tmp/client-test.sock", &NoopHandler).unwrap();
        configure(&mut config);
        let (server_side, peer) = UnixStream::pair().unwrap();
        let client =
            ClientSocket::new(server_side, &config, Arc::new(KernelPeerCredentialResolver));
        (client, peer)
    }

    #[tokio::test]
    async fn test_read_and_write() {
        let (mut client, mut peer) = client_pair(|_| {});

        peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        client.write_all(b"pong").await.unwrap();
        let mut reply = [0u8; 4];
        peer.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");
    }

    #[tokio::test]
    async fn test_read_to_string_until_eof() {
        let (mut client, mut peer) = client_pair(|_| {});

        peer.write_all(b"hello ").await.unwrap();
        peer.write_all(b"world").await.unwrap();
        peer.shutdown().await.unwrap();

        assert_eq!(client.read_to_string().await.unwrap(), "hello world");
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let (mut client, _peer) = client_pair(|config| config.set_receive_timeout_ms(50));

        let mut buf = [0u8; 8];
        let err = client.read(&mut buf).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Timeout {
                operation: IoOperation::Read,
                timeout_ms: 50
            }
        ));
        // A timeout does not close the connection
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_deadline_exceeded_before_io() {
        let (mut client, mut peer) = client_pair(|config| {
            config.set_deadline_ms(100);
            config.set_receive_timeout_ms(0);
            config.set_send_timeout_ms(60_000);
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        // Data is available, but the deadline wins
        peer.write_all(b"late").await.unwrap();

        let mut buf = [0u8; 8];
        assert!(matches!(
            client.read(&mut buf).await,
            Err(Error::DeadlineExceeded { deadline_ms: 100 })
        ));
        assert!(matches!(
            client.write(b"x").await,
            Err(Error::DeadlineExceeded { deadline_ms: 100 })
        ));
    }

    #[tokio::test]
    async fn test_deadline_caps_long_timeout() {
        let (mut client, _peer) = client_pair(|config| {
            config.set_deadline_ms(80);
            config.set_receive_timeout_ms(60_000);
        });

        let started = std::time::Instant::now();
        let mut buf = [0u8; 8];
        let err = client.read(&mut buf).await.unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut client, _peer) = client_pair(|_| {});
        assert!(client.fd() >= 0);

        client.close();
        client.close();
        assert!(client.is_closed());
        assert_eq!(client.fd(), UNBOUND_FD);

        let mut buf = [0u8; 1];
        assert!(matches!(client.read(&mut buf).await, Err(Error::Closed)));
        assert!(matches!(client.write(b"x").await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_peer_credentials_cached() {
        let (mut client, _peer) = client_pair(|_| {});
        assert!(client.peer_credentials().is_none());

        let first = client.resolve_peer_credentials().unwrap().clone();
        assert!(first.is_same_user());
        assert_eq!(client.peer_credentials(), Some(&first));
        assert!(client.log_string().contains(&format!("PeerCredentials: {}", first.log_string())));
    }

    #[tokio::test]
    async fn test_peer_credentials_after_close() {
        let (mut client, _peer) = client_pair(|_| {});
        client.close();
        assert!(matches!(
            client.resolve_peer_credentials(),
            Err(Error::CredentialLookup(_))
        ));
    }

    #[tokio::test]
    async fn test_diagnostics_capture_config() {
        let (client, _peer) = client_pair(|config| {
            config.set_receive_timeout_ms(1234);
            config.set_deadline_ms(5000);
        });

        let log = client.log_string();
        assert!(log.contains("ReceiveTimeout: 1234"));
        assert!(log.contains("SendTimeout: 10000"));
        assert!(log.contains("Deadline: 5000"));
        assert!(log.ends_with("PeerCredentials: -"));
        assert_eq!(client.markdown_string().lines().count(), 7);
    }
}
