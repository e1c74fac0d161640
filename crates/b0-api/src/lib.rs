//! b0-api: control-plane client
//!
//! The reconciler and tunnel sessions consume the control plane through the
//! [`Border0Api`] trait; [`ApiClient`] is the HTTP implementation. Tests
//! substitute recording mocks.

mod client;
mod token;

pub use client::ApiClient;
pub use token::{principal_from_token, user_id_from_token};

use async_trait::async_trait;
use thiserror::Error;

use b0_core::{Organization, Socket, Tunnel};

/// Control-plane errors
#[derive(Debug, Error)]
pub enum ApiError {
    /// Transport-level failure
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Unexpected HTTP status
    #[error("unexpected status {status} from {path}")]
    Status { status: u16, path: String },

    /// The access token is missing or not a readable JWT
    #[error("invalid access token")]
    InvalidToken,

    /// The organization lacks a certificate the connector needs
    #[error("organization has no {0} certificate")]
    MissingCertificate(&'static str),
}

/// Operations the connector core performs against the control plane.
#[async_trait]
pub trait Border0Api: Send + Sync {
    /// List the full socket inventory.
    async fn get_sockets(&self) -> Result<Vec<Socket>, ApiError>;

    /// Fetch a single socket.
    async fn get_socket(&self, socket_id: &str) -> Result<Socket, ApiError>;

    /// Create a socket and return the server-assigned copy.
    async fn create_socket(&self, socket: &Socket) -> Result<Socket, ApiError>;

    /// Update a socket in place.
    async fn update_socket(&self, socket_id: &str, socket: &Socket) -> Result<(), ApiError>;

    /// Delete a socket.
    async fn delete_socket(&self, socket_id: &str) -> Result<(), ApiError>;

    /// Fetch organization info, including the SSH and mTLS certificates.
    async fn get_organization(&self) -> Result<Organization, ApiError>;

    /// Sign an SSH public key (authorized-key line) for a socket, returning
    /// the signed certificate in OpenSSH format.
    async fn sign_ssh_key(&self, socket_id: &str, public_key: &str) -> Result<String, ApiError>;

    /// Fetch a tunnel descriptor for a socket.
    async fn get_tunnel(&self, socket_id: &str, tunnel_id: &str) -> Result<Tunnel, ApiError>;

    /// Attach the named policies to a socket. Policy evaluation itself is a
    /// control-plane concern.
    async fn apply_policies(
        &self,
        socket: &Socket,
        policy_names: &[String],
    ) -> Result<(), ApiError>;

    /// Current access token. Re-read on every connection attempt; the value
    /// may change after a refresh.
    fn access_token(&self) -> String;

    /// Refresh the access token.
    async fn refresh_token(&self) -> Result<(), ApiError>;
}
