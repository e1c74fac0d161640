//! Connector-edge mTLS termination
//!
//! When a socket has connector authentication enabled, every accepted tunnel
//! stream first completes a mutual-TLS handshake against the organization's
//! client CA. The server side uses a self-signed ECDSA/P-256 certificate
//! generated once per session. After a successful handshake the terminator
//! writes an authentication marker on the raw stream — the handshake only
//! authenticates, payload bytes flow outside the TLS session — pauses
//! briefly so the client can consume it, and hands the stream to the
//! upstream path.

use std::sync::Arc;
use std::time::Duration;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::PrivateKeyDer;
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::TunnelError;

/// Marker written to the client after a successful mTLS handshake.
pub const AUTHENTICATED_MARKER: &[u8] = b"BORDER0-CLIENT-CONNECTOR-AUTHENTICATED";

/// Delay between writing the marker and handing the stream off, giving the
/// client time to consume the marker before upstream bytes follow.
const HANDOFF_DELAY: Duration = Duration::from_millis(200);

/// Per-session mTLS terminator for one socket.
pub struct MtlsTerminator {
    acceptor: TlsAcceptor,
    certificate_pem: String,
}

impl MtlsTerminator {
    /// Generate the session certificate and build the TLS acceptor.
    ///
    /// `client_ca_pem` is the organization's mTLS certificate pool; clients
    /// must present a certificate chaining to it.
    pub fn new(socket_id: &str, client_ca_pem: &str) -> Result<Self, TunnelError> {
        let mut params = CertificateParams::new(vec![socket_id.to_string()])
            .map_err(|e| TunnelError::Certificate(e.to_string()))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, socket_id);
        dn.push(DnType::OrganizationName, "Border0 Connector");
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(365);
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(365 * 10);

        let key_pair =
            KeyPair::generate().map_err(|e| TunnelError::Certificate(e.to_string()))?;
        let certificate = params
            .self_signed(&key_pair)
            .map_err(|e| TunnelError::Certificate(e.to_string()))?;

        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut client_ca_pem.as_bytes()) {
            roots
                .add(cert.map_err(|e| TunnelError::Certificate(e.to_string()))?)
                .map_err(TunnelError::Tls)?;
        }
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| TunnelError::Certificate(e.to_string()))?;

        let key = PrivateKeyDer::try_from(key_pair.serialize_der())
            .map_err(|e| TunnelError::Certificate(format!("{e:?}")))?;

        let mut config = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(vec![certificate.der().clone()], key)?;
        // Nothing but the marker may follow the handshake on the raw stream.
        config.send_tls13_tickets = 0;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
            certificate_pem: certificate.pem(),
        })
    }

    /// Session certificate in PEM form.
    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    /// Run the mTLS handshake on an accepted stream, write the marker, and
    /// return the raw stream for the upstream path.
    pub async fn terminate<S>(&self, stream: S) -> Result<S, TunnelError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let tls_stream = self.acceptor.accept(stream).await?;
        let (_, connection) = tls_stream.get_ref();
        debug!(
            client_certs = connection
                .peer_certificates()
                .map(|certs| certs.len())
                .unwrap_or(0),
            "client connector authentication succeeded"
        );

        let (mut inner, _connection) = tls_stream.into_inner();
        inner.write_all(AUTHENTICATED_MARKER).await?;
        inner.flush().await?;
        tokio::time::sleep(HANDOFF_DELAY).await;

        Ok(inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rcgen::Issuer;
    use rustls::pki_types::ServerName;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_rustls::TlsConnector;

    struct TestCa {
        cert_pem: String,
        key_pem: String,
    }

    fn test_ca(common_name: &str) -> TestCa {
        let mut params = CertificateParams::new(vec![]).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);

        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();

        TestCa {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        }
    }

    /// Client certificate + key (DER) signed by the given CA.
    fn client_identity(ca: &TestCa) -> (Vec<u8>, Vec<u8>) {
        let ca_key = KeyPair::from_pem(&ca.key_pem).unwrap();
        let issuer = Issuer::from_ca_cert_pem(&ca.cert_pem, ca_key).unwrap();

        let mut params = CertificateParams::new(vec![]).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "client-1");
        params.distinguished_name = dn;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &issuer).unwrap();

        (cert.der().to_vec(), key.serialize_der())
    }

    fn client_config(server_cert_pem: &str, identity: (Vec<u8>, Vec<u8>)) -> rustls::ClientConfig {
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut server_cert_pem.as_bytes()) {
            roots.add(cert.unwrap()).unwrap();
        }

        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(
                vec![identity.0.into()],
                PrivateKeyDer::try_from(identity.1).unwrap(),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn authenticated_client_reads_marker_then_upstream_bytes() {
        let org_ca = test_ca("Test Org CA");
        let terminator = MtlsTerminator::new("sock-mtls-test", &org_ca.cert_pem).unwrap();
        let server_cert_pem = terminator.certificate_pem().to_string();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut raw = terminator.terminate(stream).await.unwrap();
            raw.write_all(b"upstream").await.unwrap();
        });

        let config = client_config(&server_cert_pem, client_identity(&org_ca));
        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from("sock-mtls-test").unwrap();

        let stream = TcpStream::connect(addr).await.unwrap();
        let tls = connector.connect(server_name, stream).await.unwrap();

        // marker and upstream bytes arrive on the raw stream, after the
        // handshake but outside the TLS session
        let (mut raw, _connection) = tls.into_inner();
        let mut marker = vec![0u8; AUTHENTICATED_MARKER.len()];
        raw.read_exact(&mut marker).await.unwrap();
        assert_eq!(marker, AUTHENTICATED_MARKER);

        let mut upstream = vec![0u8; 8];
        raw.read_exact(&mut upstream).await.unwrap();
        assert_eq!(&upstream, b"upstream");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn foreign_client_certificate_fails_without_marker() {
        let org_ca = test_ca("Test Org CA");
        let other_ca = test_ca("Unrelated CA");

        let terminator = MtlsTerminator::new("sock-mtls-test", &org_ca.cert_pem).unwrap();
        let server_cert_pem = terminator.certificate_pem().to_string();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            terminator.terminate(stream).await.map(|_| ())
        });

        let config = client_config(&server_cert_pem, client_identity(&other_ca));
        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from("sock-mtls-test").unwrap();

        let stream = TcpStream::connect(addr).await.unwrap();
        let marker_seen = match connector.connect(server_name, stream).await {
            // TLS 1.3 clients may not learn about the rejection until the
            // first read; either way no marker can arrive
            Ok(tls) => {
                let (mut raw, _connection) = tls.into_inner();
                let mut buf = vec![0u8; AUTHENTICATED_MARKER.len()];
                match raw.read_exact(&mut buf).await {
                    Ok(_) => buf == AUTHENTICATED_MARKER,
                    Err(_) => false,
                }
            }
            Err(_) => false,
        };

        assert!(!marker_seen);
        assert!(server.await.unwrap().is_err());
    }
}
