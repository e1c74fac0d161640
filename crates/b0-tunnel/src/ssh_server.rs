//! Local SSH server mode
//!
//! Terminates SSH sessions at the connector instead of forwarding raw TCP.
//! Clients authenticate with user certificates signed by the organization's
//! SSH CA; each session gets a shell on the local host through a PTY.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use russh::keys::ssh_key::{Certificate, Fingerprint};
use russh::keys::{Algorithm, HashAlg, PrivateKey, PublicKey};
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::TunnelError;

/// In-process SSH server handling accepted tunnel streams.
pub struct LocalSshServer {
    config: Arc<server::Config>,
    ca_fingerprint: Option<Fingerprint>,
}

impl LocalSshServer {
    /// Build a server trusting user certificates signed by `ssh_ca`
    /// (an authorized-key line). The host key is generated per session;
    /// tunnel clients do not pin it.
    pub fn new(ssh_ca: &str) -> Result<Self, TunnelError> {
        let host_key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)?;

        let config = server::Config {
            keys: vec![host_key],
            auth_rejection_time: Duration::from_secs(1),
            ..Default::default()
        };

        let ca_fingerprint = if ssh_ca.trim().is_empty() {
            None
        } else {
            Some(PublicKey::from_openssh(ssh_ca.trim())?.fingerprint(HashAlg::Sha256))
        };

        Ok(Self {
            config: Arc::new(config),
            ca_fingerprint,
        })
    }

    /// Serve one accepted stream until the SSH session ends.
    pub async fn handle_connection<S>(&self, stream: S) -> Result<(), TunnelError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handler = TerminatorHandler {
            ca_fingerprint: self.ca_fingerprint.clone(),
            pty_size: PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            },
            shell: None,
        };

        let session = server::run_stream(self.config.clone(), stream, handler).await?;
        session.await?;
        Ok(())
    }
}

/// A spawned shell bound to one session channel.
struct ShellSession {
    writer: Box<dyn Write + Send>,
    child: Box<dyn portable_pty::Child + Send + Sync>,
}

struct TerminatorHandler {
    ca_fingerprint: Option<Fingerprint>,
    pty_size: PtySize,
    shell: Option<ShellSession>,
}

impl TerminatorHandler {
    fn spawn_shell(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), TunnelError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(self.pty_size)
            .map_err(|e| TunnelError::Auth(format!("pty allocation failed: {e}")))?;

        let shell_path = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
        let mut cmd = CommandBuilder::new(&shell_path);
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TunnelError::Auth(format!("shell spawn failed: {e}")))?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| TunnelError::Auth(format!("pty writer unavailable: {e}")))?;
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| TunnelError::Auth(format!("pty reader unavailable: {e}")))?;

        // pump shell output back over the channel
        let handle = session.handle();
        tokio::spawn(async move {
            loop {
                let read = tokio::task::spawn_blocking(move || {
                    let mut buf = [0u8; 4096];
                    let n = std::io::Read::read(&mut reader, &mut buf);
                    (reader, buf, n)
                })
                .await;

                let Ok((r, buf, n)) = read else { break };
                reader = r;

                match n {
                    Ok(0) | Err(_) => {
                        let _ = handle.close(channel).await;
                        break;
                    }
                    Ok(n) => {
                        if handle
                            .data(channel, CryptoVec::from_slice(&buf[..n]))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        });

        self.shell = Some(ShellSession { writer, child });
        Ok(())
    }
}

impl server::Handler for TerminatorHandler {
    type Error = TunnelError;

    async fn auth_publickey(
        &mut self,
        user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        // plain keys are not enough; a certificate from the org CA is required
        debug!(user, "rejecting plain public-key authentication");
        Ok(Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        })
    }

    async fn auth_openssh_certificate(
        &mut self,
        user: &str,
        certificate: &Certificate,
    ) -> Result<Auth, Self::Error> {
        let Some(ca) = &self.ca_fingerprint else {
            warn!("no SSH CA configured, rejecting certificate authentication");
            return Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            });
        };

        match certificate.validate([ca]) {
            Ok(()) => {
                info!(user, key_id = certificate.key_id(), "ssh user authenticated");
                Ok(Auth::Accept)
            }
            Err(err) => {
                warn!(user, %err, "ssh certificate rejected");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.pty_size.cols = col_width as u16;
        self.pty_size.rows = row_height as u16;
        session.channel_success(channel)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.spawn_shell(channel, session)?;
        session.channel_success(channel)?;
        Ok(())
    }

    async fn data(
        &mut self,
        _channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(shell) = &mut self.shell {
            if shell.writer.write_all(data).is_err() {
                debug!("shell input closed");
            }
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(mut shell) = self.shell.take() {
            let _ = shell.child.kill();
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(mut shell) = self.shell.take() {
            let _ = shell.child.kill();
        }
        Ok(())
    }
}
