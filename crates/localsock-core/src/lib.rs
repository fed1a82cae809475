pub mod config;
pub mod diagnostics;
pub mod error;
pub mod socket;

pub use config::SocketDefaults;
pub use diagnostics::DiagnosticStringGenerator;
pub use error::{AcceptErrorKind, Error, IoOperation, Result};
pub use socket::{
    AcceptOutcome, ClientSocket, ConnectionHandler, KernelPeerCredentialResolver, Manager,
    ManagerState, PeerCredentialResolver, PeerCredentials, RunConfig, ServerSocket, ServerState,
};
