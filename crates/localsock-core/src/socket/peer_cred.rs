//! Peer credential resolution
//!
//! The kernel records the uid/gid/pid of the process on the other end of a
//! Unix domain socket at connect time. Lookup is isolated behind
//! [`PeerCredentialResolver`] so platforms without `SO_PEERCRED` or
//! `getpeereid` can plug in their own implementation.

use std::fmt;

use tokio::net::UnixStream;

use crate::diagnostics::DiagnosticStringGenerator;
use crate::{Error, Result};

/// Identity of a connected peer process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCredentials {
    pub uid: u32,
    pub gid: u32,
    /// Not reported on every platform
    pub pid: Option<i32>,
    /// First `/proc/<pid>/cmdline` argument, best effort. Left empty by the
    /// resolver and filled in by [`load_process_name`](Self::load_process_name).
    pub process_name: Option<String>,
}

impl PeerCredentials {
    pub fn new(uid: u32, gid: u32, pid: Option<i32>) -> Self {
        Self {
            uid,
            gid,
            pid,
            process_name: None,
        }
    }

    /// Fill in `process_name` from the peer's pid, if not already known
    pub async fn load_process_name(&mut self) {
        if self.process_name.is_none() {
            if let Some(pid) = self.pid {
                self.process_name = process_name(pid).await;
            }
        }
    }

    /// True if the peer runs as the same user as this process
    pub fn is_same_user(&self) -> bool {
        // SAFETY: getuid has no preconditions and cannot fail.
        self.uid == unsafe { libc::getuid() }
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }

    fn string_generator(&self) -> DiagnosticStringGenerator {
        let mut generator = DiagnosticStringGenerator::new();
        generator
            .push("Uid", self.uid)
            .push("Gid", self.gid)
            .push_optional("Pid", self.pid)
            .push_optional("ProcessName", self.process_name.as_deref());
        generator
    }

    pub fn log_string(&self) -> String {
        self.string_generator().log_string()
    }

    pub fn markdown_string(&self) -> String {
        self.string_generator().markdown_string()
    }
}

impl fmt::Display for PeerCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.log_string())
    }
}

/// Looks up the credentials of the process connected to a stream
pub trait PeerCredentialResolver: Send + Sync + fmt::Debug {
    fn resolve(&self, stream: &UnixStream) -> Result<PeerCredentials>;
}

/// Resolver backed by the kernel's peer credential query
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelPeerCredentialResolver;

impl PeerCredentialResolver for KernelPeerCredentialResolver {
    fn resolve(&self, stream: &UnixStream) -> Result<PeerCredentials> {
        let cred = stream
            .peer_cred()
            .map_err(|e| Error::CredentialLookup(e.to_string()))?;

        Ok(PeerCredentials::new(cred.uid(), cred.gid(), cred.pid()))
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
async fn process_name(pid: i32) -> Option<String> {
    let cmdline = tokio::fs::read(format!("/proc/{}/cmdline", pid)).await.ok()?;
    let first = cmdline.split(|b| *b == 0).next()?;
    if first.is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(first).into_owned())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
async fn process_name(_pid: i32) -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolves_own_process() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut cred = KernelPeerCredentialResolver.resolve(&a).unwrap();

        assert!(cred.is_same_user());
        // SAFETY: getgid has no preconditions.
        assert_eq!(cred.gid, unsafe { libc::getgid() });
        assert_eq!(cred.process_name, None);

        cred.load_process_name().await;
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            assert_eq!(cred.pid, Some(std::process::id() as i32));
            assert!(cred.process_name.is_some());
        }
    }

    #[tokio::test]
    async fn test_load_process_name_without_pid() {
        let mut cred = PeerCredentials::new(1000, 1000, None);
        cred.load_process_name().await;
        assert_eq!(cred.process_name, None);
    }

    #[test]
    fn test_log_and_markdown() {
        let cred = PeerCredentials::new(1000, 1000, None);
        assert_eq!(cred.log_string(), "Uid: 1000 Gid: 1000 Pid: - ProcessName: -");
        assert_eq!(
            cred.markdown_string(),
            "**Uid**: `1000`  \n**Gid**: `1000`  \n**Pid**: `-`  \n**ProcessName**: `-`  "
        );
        assert!(!cred.is_root());
    }
}
