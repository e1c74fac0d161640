//! Short-lived tunnel credentials
//!
//! Each user gets one long-lived ECDSA/P-256 key under `~/.border0`,
//! created on first use and reused afterwards. Per session, the public key
//! is sent to the control plane's signkey endpoint and the returned OpenSSH
//! certificate authenticates the tunnel.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use russh::keys::ssh_key::{Certificate, EcdsaCurve, LineEnding};
use russh::keys::{Algorithm, PrivateKey};

use b0_api::{ApiError, Border0Api};

const SIGN_ATTEMPTS: u32 = 10;

/// Credential issuance errors
#[derive(Debug, Error)]
pub enum CredentialError {
    /// Key file or directory I/O failed
    #[error("key storage error: {0}")]
    Io(#[from] std::io::Error),

    /// Key or certificate material could not be encoded or parsed
    #[error("key material error: {0}")]
    Key(#[from] russh::keys::ssh_key::Error),

    /// The signkey call failed outright
    #[error(transparent)]
    Api(#[from] ApiError),

    /// The control plane never returned a signed certificate
    #[error("failed to get ssh cert")]
    FailedToGetCert,
}

/// Persists per-user keys and mints short-lived SSH certificates.
pub struct CredentialIssuer {
    api: Arc<dyn Border0Api>,
    base_dir: PathBuf,
}

impl CredentialIssuer {
    /// Issuer over the default `~/.border0` key directory.
    pub fn new(api: Arc<dyn Border0Api>) -> Self {
        let base_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".border0");
        Self { api, base_dir }
    }

    /// Issuer over an explicit key directory.
    pub fn with_base_dir(api: Arc<dyn Border0Api>, base_dir: PathBuf) -> Self {
        Self { api, base_dir }
    }

    /// Load the user's private key, generating and persisting it on first
    /// use. The directory is 0700, the key file 0600.
    pub fn user_key(&self, user_id: &str) -> Result<PrivateKey, CredentialError> {
        if !self.base_dir.exists() {
            std::fs::create_dir_all(&self.base_dir)?;
            set_mode(&self.base_dir, 0o700)?;
        }

        let key_path = self.base_dir.join(format!("user_{user_id}"));
        if !key_path.exists() {
            let key = PrivateKey::random(
                &mut rand::thread_rng(),
                Algorithm::Ecdsa {
                    curve: EcdsaCurve::NistP256,
                },
            )?;

            std::fs::write(&key_path, key.to_openssh(LineEnding::LF)?.as_bytes())?;
            set_mode(&key_path, 0o600)?;
            debug!(path = %key_path.display(), "generated user key");
        }

        let contents = std::fs::read_to_string(&key_path)?;
        Ok(PrivateKey::from_openssh(&contents)?)
    }

    /// Mint a short-lived certificate for one tunnel session.
    ///
    /// Retries the signkey call up to ten times with linear backoff
    /// (2·i seconds after attempt i).
    pub async fn short_lived_certificate(
        &self,
        user_id: &str,
        socket_id: &str,
    ) -> Result<(PrivateKey, Certificate), CredentialError> {
        let key = self.user_key(user_id)?;
        let public_line = key.public_key().to_openssh()?;
        let public_line = public_line.trim_end();

        let mut signed = String::new();
        for attempt in 1..=SIGN_ATTEMPTS {
            match self.api.sign_ssh_key(socket_id, public_line).await {
                Ok(cert) if !cert.is_empty() => {
                    signed = cert;
                    break;
                }
                Ok(_) => break,
                Err(err) => {
                    if attempt == SIGN_ATTEMPTS {
                        break;
                    }
                    let delay = Duration::from_secs(2 * u64::from(attempt));
                    warn!(
                        %err,
                        attempt,
                        "unable to get signed cert from API, retrying in {}s",
                        delay.as_secs()
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        if signed.is_empty() {
            return Err(CredentialError::FailedToGetCert);
        }

        let certificate = Certificate::from_openssh(&signed)?;
        Ok((key, certificate))
    }
}

#[cfg(unix)]
fn set_mode(path: &std::path::Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &std::path::Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use std::sync::Mutex;

    use b0_core::{Organization, Socket, Tunnel};
    use russh::keys::ssh_key::certificate::{self, CertType};

    struct SignerApi {
        responses: Mutex<Vec<Result<String, ()>>>,
        calls: Mutex<u32>,
    }

    impl SignerApi {
        fn new(responses: Vec<Result<String, ()>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl Border0Api for SignerApi {
        async fn get_sockets(&self) -> Result<Vec<Socket>, ApiError> {
            unimplemented!()
        }
        async fn get_socket(&self, _: &str) -> Result<Socket, ApiError> {
            unimplemented!()
        }
        async fn create_socket(&self, _: &Socket) -> Result<Socket, ApiError> {
            unimplemented!()
        }
        async fn update_socket(&self, _: &str, _: &Socket) -> Result<(), ApiError> {
            unimplemented!()
        }
        async fn delete_socket(&self, _: &str) -> Result<(), ApiError> {
            unimplemented!()
        }
        async fn get_organization(&self) -> Result<Organization, ApiError> {
            unimplemented!()
        }
        async fn sign_ssh_key(&self, _: &str, _: &str) -> Result<String, ApiError> {
            *self.calls.lock().unwrap() += 1;
            let mut responses = self.responses.lock().unwrap();
            match responses.remove(0) {
                Ok(cert) => Ok(cert),
                Err(()) => Err(ApiError::Status {
                    status: 500,
                    path: "signkey".into(),
                }),
            }
        }
        async fn get_tunnel(&self, _: &str, _: &str) -> Result<Tunnel, ApiError> {
            unimplemented!()
        }
        async fn apply_policies(&self, _: &Socket, _: &[String]) -> Result<(), ApiError> {
            Ok(())
        }
        fn access_token(&self) -> String {
            String::new()
        }
        async fn refresh_token(&self) -> Result<(), ApiError> {
            Ok(())
        }
    }

    fn sign_user_cert(user_key: &PrivateKey) -> String {
        let ca_key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519).unwrap();

        let mut builder = certificate::Builder::new_with_random_nonce(
            &mut rand::thread_rng(),
            user_key.public_key().key_data().clone(),
            0,
            u64::MAX,
        )
        .unwrap();
        builder.cert_type(CertType::User).unwrap();
        builder.valid_principal("user-1").unwrap();
        builder.key_id("user-1").unwrap();

        let cert = builder.sign(&ca_key).unwrap();
        cert.to_openssh().unwrap()
    }

    #[test]
    fn user_key_is_created_once_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(SignerApi::new(vec![]));
        let issuer = CredentialIssuer::with_base_dir(api, dir.path().join("state"));

        let first = issuer.user_key("u1").unwrap();
        let second = issuer.user_key("u1").unwrap();
        assert_eq!(
            first.public_key().to_openssh().unwrap(),
            second.public_key().to_openssh().unwrap()
        );

        let line = first.public_key().to_openssh().unwrap();
        assert!(line.starts_with("ecdsa-sha2-nistp256 "));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let dir_mode = std::fs::metadata(dir.path().join("state"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(dir_mode & 0o777, 0o700);

            let key_mode = std::fs::metadata(dir.path().join("state").join("user_u1"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(key_mode & 0o777, 0o600);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_returns_certificate() {
        let dir = tempfile::tempdir().unwrap();

        // pre-create the key so the mock can sign for it
        let bootstrap = CredentialIssuer::with_base_dir(
            Arc::new(SignerApi::new(vec![])),
            dir.path().to_path_buf(),
        );
        let user_key = bootstrap.user_key("u1").unwrap();
        let cert = sign_user_cert(&user_key);

        let api = Arc::new(SignerApi::new(vec![Err(()), Err(()), Ok(cert)]));
        let issuer = CredentialIssuer::with_base_dir(api.clone(), dir.path().to_path_buf());

        let (key, certificate) = issuer.short_lived_certificate("u1", "sock-1").await.unwrap();
        assert_eq!(*api.calls.lock().unwrap(), 3);
        assert_eq!(
            certificate.public_key(),
            key.public_key().key_data(),
        );
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_exhausting_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(SignerApi::new(vec![Err(()); 10]));
        let issuer = CredentialIssuer::with_base_dir(api.clone(), dir.path().to_path_buf());

        let err = issuer
            .short_lived_certificate("u1", "sock-1")
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::FailedToGetCert));
        assert_eq!(*api.calls.lock().unwrap(), 10);
    }
}
