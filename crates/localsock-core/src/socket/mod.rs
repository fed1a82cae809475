//! Local socket IPC
//!
//! This module provides Unix domain socket servers for cooperating local
//! processes: a [`RunConfig`] describes the endpoint, the [`Manager`] binds a
//! [`ServerSocket`] and hands each accepted [`ClientSocket`] plus the peer's
//! [`PeerCredentials`] to a [`ConnectionHandler`].

mod client;
mod handler;
mod manager;
mod peer_cred;
mod run_config;
mod server;

pub use client::ClientSocket;
pub use handler::ConnectionHandler;
pub use manager::{Manager, ManagerState, DEFAULT_STOP_TIMEOUT};
pub use peer_cred::{KernelPeerCredentialResolver, PeerCredentialResolver, PeerCredentials};
pub use run_config::{RunConfig, LOG_TAG, MAX_PATH_BYTES, UNBOUND_FD};
pub use server::{AcceptOutcome, CloseHandle, ServerSocket, ServerState};
