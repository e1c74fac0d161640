//! Tunnel session
//!
//! One session maintains one outbound SSH tunnel for one socket: dial the
//! tunnel server (directly or through a proxy), authenticate with a
//! short-lived certificate, open the remote listener, then serve forwarded
//! streams until the transport dies or the session is cancelled. The
//! reconciler re-emits a connect event on its next tick whenever the
//! registry reports the socket as disconnected.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle};
use russh::keys::ssh_key::Certificate;
use russh::keys::{load_secret_key, PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, ChannelMsg, SshId};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use b0_api::{user_id_from_token, ApiError, Border0Api};
use b0_core::ConnectorData;

use crate::credentials::{CredentialError, CredentialIssuer};
use crate::dialer::Dialer;
use crate::httpdir;
use crate::registry::{TunnelHandle, TunnelRegistry};
use crate::ssh_server::LocalSshServer;
use crate::terminator::MtlsTerminator;
use crate::TunnelError;

const DEFAULT_TUNNEL_HOST: &str = "tunnel.border0.com";
const TUNNEL_PORT: u16 = 22;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between `keepalive@openssh.com` probes (reply requested).
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
/// Consecutive unanswered probes before the transport is closed.
const KEEPALIVE_MAX: usize = 4;

/// Establishment attempts before the session gives up; the reconciler
/// retries on its next tick.
const CONNECT_ATTEMPTS: u32 = 3;

const DEFAULT_KEY_FILES: [&str; 4] = ["id_dsa", "id_ecdsa", "id_ed25519", "id_rsa"];

/// Tunnel server host, overridable via `BORDER0_TUNNEL`.
fn tunnel_host() -> String {
    std::env::var("BORDER0_TUNNEL").unwrap_or_else(|_| DEFAULT_TUNNEL_HOST.to_string())
}

fn client_banner(version: &str) -> String {
    format!("SSH-2.0-Border0-{version}")
}

fn client_config(version: &str) -> client::Config {
    client::Config {
        client_id: SshId::Standard(client_banner(version)),
        keepalive_interval: Some(KEEPALIVE_INTERVAL),
        keepalive_max: KEEPALIVE_MAX,
        ..Default::default()
    }
}

/// What happens to accepted streams after (optional) mTLS termination.
#[derive(Debug, Clone, Default)]
pub enum SessionMode {
    /// Splice to the socket's upstream host and port.
    #[default]
    Passthrough,
    /// Serve a local directory over HTTP.
    HttpDir(PathBuf),
    /// Terminate SSH locally, authenticating against the org SSH CA.
    SshServer,
}

/// Per-session parameters supplied by the supervisor.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub socket_id: String,
    pub mode: SessionMode,
    /// Extra identity file for the key-based fallback (`-i`).
    pub identity_file: Option<PathBuf>,
    pub dialer: Dialer,
    /// Connector version, advertised in the SSH client banner.
    pub version: String,
}

enum AuthMaterial {
    Certificate { key: PrivateKey, cert: Certificate },
    Keys(Vec<PrivateKey>),
}

/// A single socket's tunnel lifecycle.
pub struct TunnelSession {
    api: Arc<dyn Border0Api>,
    registry: Arc<TunnelRegistry>,
    cfg: SessionConfig,
}

impl TunnelSession {
    pub fn new(
        api: Arc<dyn Border0Api>,
        registry: Arc<TunnelRegistry>,
        cfg: SessionConfig,
    ) -> Self {
        Self { api, registry, cfg }
    }

    /// Drive the session to completion, then release the registry slot.
    pub async fn run(self, handle: TunnelHandle) {
        let socket_id = self.cfg.socket_id.clone();

        if let Err(err) = self.serve(&handle).await {
            error!(socket_id = %socket_id, %err, "tunnel session failed");
        }

        handle.mark_closed();
        self.registry.remove_session(&socket_id, &handle);
    }

    async fn serve(&self, handle: &TunnelHandle) -> Result<(), TunnelError> {
        // refresh the socket so the session sees the latest connector data
        let mut socket = self.api.get_socket(&self.cfg.socket_id).await?;
        socket.build_connector_data_by_tags();
        let data = socket.connector_data.clone().unwrap_or_default();

        let org = self.api.get_organization().await?;

        let terminator = if socket.connector_auth_enabled {
            let ca_pem = org
                .certificates
                .get("mtls_certificate")
                .ok_or(ApiError::MissingCertificate("mtls"))?;
            Some(Arc::new(MtlsTerminator::new(&socket.socket_id, ca_pem)?))
        } else {
            None
        };

        let ssh_server = match self.cfg.mode {
            SessionMode::SshServer => {
                let ssh_ca = org
                    .certificates
                    .get("ssh_public_key")
                    .ok_or(ApiError::MissingCertificate("ssh"))?;
                Some(Arc::new(LocalSshServer::new(ssh_ca)?))
            }
            _ => None,
        };

        // tokens may rotate; re-read per session
        let user_id = user_id_from_token(&self.api.access_token())?;

        // reuse the socket's assigned tunnel port when one exists; port 0
        // asks the server to pick
        let listen_port = match socket.tunnels.first() {
            Some(tunnel) if !tunnel.tunnel_id.is_empty() => self
                .api
                .get_tunnel(&socket.socket_id, &tunnel.tunnel_id)
                .await
                .map(|t| t.local_port)
                .unwrap_or(tunnel.local_port),
            Some(tunnel) => tunnel.local_port,
            None => 0,
        };

        let mut last_err: Option<TunnelError> = None;
        for attempt in 1..=CONNECT_ATTEMPTS {
            if handle.cancellation().is_cancelled() {
                return Ok(());
            }

            match self
                .connect_and_serve(
                    handle,
                    &user_id,
                    &socket.name,
                    &data,
                    listen_port,
                    terminator.clone(),
                    ssh_server.clone(),
                )
                .await
            {
                Ok(()) => return Ok(()),
                Err(err @ TunnelError::Credential(CredentialError::FailedToGetCert)) => {
                    return Err(err);
                }
                Err(err) => {
                    warn!(socket_id = %self.cfg.socket_id, %err, attempt, "tunnel connect failed");
                    last_err = Some(err);
                    tokio::time::sleep(Duration::from_secs(u64::from(attempt) * 2)).await;
                }
            }
        }

        Err(last_err.unwrap_or(TunnelError::Timeout))
    }

    #[allow(clippy::too_many_arguments)]
    async fn connect_and_serve(
        &self,
        handle: &TunnelHandle,
        user_id: &str,
        socket_name: &str,
        data: &ConnectorData,
        listen_port: u16,
        terminator: Option<Arc<MtlsTerminator>>,
        ssh_server: Option<Arc<LocalSshServer>>,
    ) -> Result<(), TunnelError> {
        let auth = self.acquire_auth(user_id).await?;

        let host = tunnel_host();
        info!(socket = %socket_name, server = %host, "connecting to tunnel server");
        let stream = self.cfg.dialer.dial(&host, TUNNEL_PORT).await?;

        let config = Arc::new(client_config(&self.cfg.version));
        let (forwarded_tx, mut forwarded_rx) = mpsc::unbounded_channel();
        let handler = TunnelClientHandler { forwarded_tx };

        let mut ssh = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            client::connect_stream(config, stream, handler),
        )
        .await
        .map_err(|_| TunnelError::Timeout)??;

        self.authenticate(&mut ssh, user_id, auth).await?;

        // remote listener; port 0 lets the server pick
        match ssh
            .tcpip_forward("localhost", u32::from(listen_port))
            .await
        {
            Ok(_) => {}
            Err(russh::Error::RequestDenied) => return Err(TunnelError::ForwardingRefused),
            Err(err) => return Err(err.into()),
        }

        // the interactive shell channel anchors the session lifetime; its
        // output is the tunnel server's status feed
        let mut shell = ssh.channel_open_session().await?;
        shell
            .request_pty(false, "xterm-256color", 80, 40, 0, 0, &[])
            .await?;
        shell.request_shell(false).await?;

        info!(socket = %socket_name, "tunnel established");

        let upstream_host = data.target_hostname.clone();
        let upstream_port = data.port;

        loop {
            tokio::select! {
                _ = handle.cancellation().cancelled() => {
                    debug!(socket = %socket_name, "session cancelled, disconnecting");
                    let _ = ssh
                        .disconnect(russh::Disconnect::ByApplication, "closing", "en")
                        .await;
                    return Ok(());
                }

                msg = shell.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { data }) => {
                            for line in String::from_utf8_lossy(&data).lines() {
                                if !line.trim().is_empty() {
                                    info!(target: "tunnel", socket = %socket_name, "{line}");
                                }
                            }
                        }
                        Some(_) => {}
                        None => {
                            // transport gone: server close or keepalive death
                            info!(socket = %socket_name, "tunnel connection closed");
                            return Ok(());
                        }
                    }
                }

                channel = forwarded_rx.recv() => {
                    let Some(channel) = channel else {
                        info!(socket = %socket_name, "tunnel listener closed");
                        return Ok(());
                    };

                    let terminator = terminator.clone();
                    let ssh_server = ssh_server.clone();
                    let mode = self.cfg.mode.clone();
                    let upstream_host = upstream_host.clone();

                    tokio::spawn(async move {
                        handle_stream(
                            channel.into_stream(),
                            terminator,
                            mode,
                            upstream_host,
                            upstream_port,
                            ssh_server,
                        )
                        .await;
                    });
                }
            }
        }
    }

    /// Prefer a freshly minted certificate; fall back to on-disk keys and the
    /// agent. With neither available the session fails permanently.
    async fn acquire_auth(&self, user_id: &str) -> Result<AuthMaterial, TunnelError> {
        let issuer = CredentialIssuer::new(self.api.clone());

        match issuer
            .short_lived_certificate(user_id, &self.cfg.socket_id)
            .await
        {
            Ok((key, cert)) => Ok(AuthMaterial::Certificate { key, cert }),
            Err(err) => {
                warn!(%err, "certificate issuance failed, trying static keys");

                let keys = self.fallback_keys();
                if keys.is_empty() && std::env::var("SSH_AUTH_SOCK").is_err() {
                    return Err(CredentialError::FailedToGetCert.into());
                }
                Ok(AuthMaterial::Keys(keys))
            }
        }
    }

    fn fallback_keys(&self) -> Vec<PrivateKey> {
        let mut keys = Vec::new();

        if let Some(identity) = &self.cfg.identity_file {
            match load_secret_key(identity, None) {
                Ok(key) => keys.push(key),
                Err(err) => warn!(path = %identity.display(), %err, "cannot read identity file"),
            }
        }

        if let Some(home) = dirs::home_dir() {
            for name in DEFAULT_KEY_FILES {
                let path = home.join(".ssh").join(name);
                if path.exists() {
                    if let Ok(key) = load_secret_key(&path, None) {
                        keys.push(key);
                    }
                }
            }
        }

        keys
    }

    async fn authenticate(
        &self,
        ssh: &mut Handle<TunnelClientHandler>,
        user_id: &str,
        auth: AuthMaterial,
    ) -> Result<(), TunnelError> {
        match auth {
            AuthMaterial::Certificate { key, cert } => {
                if ssh
                    .authenticate_openssh_cert(user_id, Arc::new(key), cert)
                    .await?
                    .success()
                {
                    return Ok(());
                }
                Err(TunnelError::Auth("certificate rejected by server".into()))
            }
            AuthMaterial::Keys(keys) => {
                for key in keys {
                    if ssh
                        .authenticate_publickey(
                            user_id,
                            PrivateKeyWithHashAlg::new(Arc::new(key), None),
                        )
                        .await?
                        .success()
                    {
                        return Ok(());
                    }
                }

                if try_agent_auth(ssh, user_id).await? {
                    return Ok(());
                }

                Err(TunnelError::Auth("no accepted authentication method".into()))
            }
        }
    }
}

#[cfg(unix)]
async fn try_agent_auth(
    ssh: &mut Handle<TunnelClientHandler>,
    user_id: &str,
) -> Result<bool, TunnelError> {
    if std::env::var("SSH_AUTH_SOCK").is_err() {
        return Ok(false);
    }

    let mut agent = match russh::keys::agent::client::AgentClient::connect_env().await {
        Ok(agent) => agent,
        Err(err) => {
            debug!(%err, "ssh agent unavailable");
            return Ok(false);
        }
    };

    let identities = match agent.request_identities().await {
        Ok(identities) => identities,
        Err(err) => {
            debug!(%err, "ssh agent listed no identities");
            return Ok(false);
        }
    };

    for key in identities {
        match ssh
            .authenticate_publickey_with(user_id, key, None, &mut agent)
            .await
        {
            Ok(result) if result.success() => return Ok(true),
            Ok(_) => {}
            Err(err) => debug!(%err, "agent authentication attempt failed"),
        }
    }

    Ok(false)
}

#[cfg(not(unix))]
async fn try_agent_auth(
    _ssh: &mut Handle<TunnelClientHandler>,
    _user_id: &str,
) -> Result<bool, TunnelError> {
    Ok(false)
}

/// Handle one accepted tunnel stream: optional mTLS termination, then the
/// configured upstream path. Errors are logged; the accept loop continues.
async fn handle_stream<S>(
    stream: S,
    terminator: Option<Arc<MtlsTerminator>>,
    mode: SessionMode,
    upstream_host: String,
    upstream_port: u16,
    ssh_server: Option<Arc<LocalSshServer>>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let stream = match &terminator {
        Some(terminator) => match terminator.terminate(stream).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(%err, "client tls handshake failed");
                return;
            }
        },
        None => stream,
    };

    match mode {
        SessionMode::Passthrough => {
            passthrough(stream, &upstream_host, upstream_port).await;
        }
        SessionMode::HttpDir(dir) => {
            if let Err(err) = httpdir::serve_connection(stream, &dir).await {
                debug!(%err, "http stream ended");
            }
        }
        SessionMode::SshServer => {
            if let Some(server) = ssh_server {
                if let Err(err) = server.handle_connection(stream).await {
                    warn!(%err, "local ssh session failed");
                }
            }
        }
    }
}

/// Splice an accepted stream with the local upstream service.
async fn passthrough<S>(mut stream: S, host: &str, port: u16)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut upstream = match TcpStream::connect((host, port)).await {
        Ok(upstream) => upstream,
        Err(err) => {
            warn!(host, port, %err, "dial into local service failed");
            return;
        }
    };

    match tokio::io::copy_bidirectional(&mut stream, &mut upstream).await {
        Ok((to_upstream, to_client)) => {
            debug!(to_upstream, to_client, "stream closed");
        }
        Err(err) => debug!(%err, "stream copy ended"),
    }
}

/// Client-side russh handler: accepts the server key (the tunnel is
/// additionally authenticated by the short-lived client certificate; pinning
/// the server host key remains a compatibility concession) and queues
/// forwarded channels for the accept loop.
struct TunnelClientHandler {
    forwarded_tx: mpsc::UnboundedSender<Channel<client::Msg>>,
}

impl client::Handler for TunnelClientHandler {
    type Error = TunnelError;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        _connected_address: &str,
        _connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            originator = %originator_address,
            originator_port,
            "accepted tunnel stream"
        );
        let _ = self.forwarded_tx.send(channel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banner_carries_connector_version() {
        assert_eq!(client_banner("0.3.1"), "SSH-2.0-Border0-0.3.1");
    }

    #[test]
    fn keepalive_detects_a_stalled_link_within_the_bound() {
        let config = client_config("test");
        assert_eq!(config.keepalive_interval, Some(KEEPALIVE_INTERVAL));
        assert_eq!(config.keepalive_max, KEEPALIVE_MAX);

        // a dead link is detected after at most max * interval, plus one
        // in-flight probe
        let detection = KEEPALIVE_INTERVAL.as_secs() * KEEPALIVE_MAX as u64;
        assert!(detection <= 40);
    }

    #[test]
    fn tunnel_host_defaults_and_respects_override() {
        // run sequentially within one test to avoid env races
        std::env::remove_var("BORDER0_TUNNEL");
        assert_eq!(tunnel_host(), "tunnel.border0.com");

        std::env::set_var("BORDER0_TUNNEL", "tunnel.example.net");
        assert_eq!(tunnel_host(), "tunnel.example.net");
        std::env::remove_var("BORDER0_TUNNEL");
    }
}
