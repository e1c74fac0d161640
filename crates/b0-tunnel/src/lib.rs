//! b0-tunnel: the tunnel data plane
//!
//! Everything between a socket's `connect` event and bytes flowing to the
//! upstream: outbound transport (direct or proxied), short-lived certificate
//! auth, the SSH tunnel session with its remote listener, the optional mTLS
//! terminator, and the process-wide tunnel registry.

mod credentials;
mod dialer;
mod httpdir;
mod registry;
mod session;
mod ssh_server;
mod terminator;

pub use credentials::{CredentialError, CredentialIssuer};
pub use dialer::{DialError, Dialer};
pub use registry::{TunnelHandle, TunnelRegistry};
pub use session::{SessionConfig, SessionMode, TunnelSession};
pub use terminator::MtlsTerminator;

use thiserror::Error;

use b0_api::ApiError;

/// Tunnel session errors
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Transport or filesystem I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SSH protocol failure
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    /// Key handling failure
    #[error("key error: {0}")]
    Keys(#[from] russh::keys::Error),

    /// Certificate or key material could not be parsed
    #[error("key material error: {0}")]
    KeyMaterial(#[from] russh::keys::ssh_key::Error),

    /// Control-plane call failed
    #[error(transparent)]
    Api(#[from] ApiError),

    /// Credential issuance failed
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// Outbound dial failed
    #[error(transparent)]
    Dial(#[from] DialError),

    /// TLS setup or handshake failed
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Certificate generation or CA pool construction failed
    #[error("certificate error: {0}")]
    Certificate(String),

    /// No usable authentication method was accepted by the tunnel server
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The tunnel server did not grant the remote listener
    #[error("remote forwarding refused")]
    ForwardingRefused,

    /// The SSH handshake did not complete in time
    #[error("connection timed out")]
    Timeout,
}
