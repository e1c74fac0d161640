//! Outbound transport dialer
//!
//! Dials the tunnel server directly or through an HTTP(S) CONNECT proxy with
//! optional basic authentication taken from the proxy URL.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Dial errors
#[derive(Debug, Error)]
pub enum DialError {
    /// TCP-level failure
    #[error("dial failed: {0}")]
    Io(#[from] std::io::Error),

    /// The proxy URL could not be interpreted
    #[error("invalid proxy URL: {0}")]
    InvalidProxy(String),

    /// The proxy answered CONNECT with a non-200 status
    #[error("proxy CONNECT returned status {0}")]
    ProxyStatus(u16),

    /// The proxy response was not parseable HTTP
    #[error("malformed proxy response")]
    MalformedResponse,
}

/// Outbound dialer: direct TCP or HTTP CONNECT proxied.
#[derive(Debug, Clone, Default)]
pub enum Dialer {
    #[default]
    Direct,
    HttpProxy {
        host: String,
        port: u16,
        username: Option<String>,
        password: Option<String>,
    },
}

impl Dialer {
    /// Build a dialer from an optional proxy setting. Only `http://` and
    /// `https://` URLs select the proxy path; anything else dials directly.
    pub fn from_proxy(proxy: Option<&str>) -> Result<Self, DialError> {
        let Some(proxy) = proxy.filter(|p| !p.is_empty()) else {
            return Ok(Self::Direct);
        };

        let rest = if let Some(rest) = proxy.strip_prefix("http://") {
            rest
        } else if let Some(rest) = proxy.strip_prefix("https://") {
            rest
        } else {
            return Ok(Self::Direct);
        };

        let rest = rest.trim_end_matches('/');
        let (userinfo, hostport) = match rest.rsplit_once('@') {
            Some((userinfo, hostport)) => (Some(userinfo), hostport),
            None => (None, rest),
        };

        let (host, port) = match hostport.rsplit_once(':') {
            Some((host, port)) => (
                host.to_string(),
                port.parse::<u16>()
                    .map_err(|_| DialError::InvalidProxy(proxy.to_string()))?,
            ),
            None => (hostport.to_string(), 8080),
        };

        if host.is_empty() {
            return Err(DialError::InvalidProxy(proxy.to_string()));
        }

        let (username, password) = match userinfo {
            Some(userinfo) => match userinfo.split_once(':') {
                Some((user, pass)) => (Some(user.to_string()), Some(pass.to_string())),
                None => (Some(userinfo.to_string()), None),
            },
            None => (None, None),
        };

        Ok(Self::HttpProxy {
            host,
            port,
            username,
            password,
        })
    }

    /// Open a TCP connection to `host:port`, tunneling through the proxy
    /// when one is configured.
    pub async fn dial(&self, host: &str, port: u16) -> Result<TcpStream, DialError> {
        match self {
            Self::Direct => Ok(TcpStream::connect((host, port)).await?),
            Self::HttpProxy {
                host: proxy_host,
                port: proxy_port,
                username,
                password,
            } => {
                let mut stream = TcpStream::connect((proxy_host.as_str(), *proxy_port)).await?;
                debug!(proxy = %proxy_host, "dialing through CONNECT proxy");

                let target = format!("{host}:{port}");
                let mut request = format!(
                    "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nUser-Agent: Border0\r\n"
                );
                if let Some(username) = username {
                    let credentials = format!(
                        "{}:{}",
                        username,
                        password.as_deref().unwrap_or_default()
                    );
                    request.push_str(&format!(
                        "Proxy-Authorization: Basic {}\r\n",
                        BASE64.encode(credentials)
                    ));
                }
                request.push_str("\r\n");

                stream.write_all(request.as_bytes()).await?;

                let status = read_connect_status(&mut stream).await?;
                if status != 200 {
                    return Err(DialError::ProxyStatus(status));
                }

                Ok(stream)
            }
        }
    }
}

/// Read the proxy's response head and return the status code. Reads one byte
/// at a time so nothing past the blank line is consumed; the SSH banner
/// follows immediately on the same stream.
async fn read_connect_status(stream: &mut TcpStream) -> Result<u16, DialError> {
    const MAX_HEAD: usize = 8 * 1024;

    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HEAD {
            return Err(DialError::MalformedResponse);
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(DialError::MalformedResponse);
        }
        head.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().ok_or(DialError::MalformedResponse)?;

    // "HTTP/1.1 200 Connection established"
    status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or(DialError::MalformedResponse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn parses_proxy_urls() {
        assert!(matches!(Dialer::from_proxy(None).unwrap(), Dialer::Direct));
        assert!(matches!(
            Dialer::from_proxy(Some("")).unwrap(),
            Dialer::Direct
        ));
        // non-http schemes fall back to direct dialing
        assert!(matches!(
            Dialer::from_proxy(Some("socks5://proxy:1080")).unwrap(),
            Dialer::Direct
        ));

        match Dialer::from_proxy(Some("http://user:pw@proxy.internal:8080")).unwrap() {
            Dialer::HttpProxy {
                host,
                port,
                username,
                password,
            } => {
                assert_eq!(host, "proxy.internal");
                assert_eq!(port, 8080);
                assert_eq!(username.as_deref(), Some("user"));
                assert_eq!(password.as_deref(), Some("pw"));
            }
            other => panic!("expected proxy dialer, got {other:?}"),
        }
    }

    async fn read_request_head(stream: &mut tokio::net::TcpStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            let n = stream.read(&mut byte).await.unwrap();
            assert!(n > 0, "client closed before request completed");
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    #[tokio::test]
    async fn connect_sends_auth_and_advances_on_200() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let head = read_request_head(&mut stream).await;

            stream
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\nSSH-2.0-test\r\n")
                .await
                .unwrap();

            head
        });

        let dialer = Dialer::from_proxy(Some(&format!("http://user:pw@{addr}"))).unwrap();
        let mut stream = dialer.dial("tunnel.border0.com", 22).await.unwrap();

        let head = server.await.unwrap();
        assert!(head.starts_with("CONNECT tunnel.border0.com:22 HTTP/1.1\r\n"));
        assert!(head.contains("Proxy-Authorization: Basic dXNlcjpwdw==\r\n"));
        assert!(head.contains("User-Agent: Border0\r\n"));

        // bytes after the blank line stay on the stream for the SSH client
        let mut banner = vec![0u8; 14];
        stream.read_exact(&mut banner).await.unwrap();
        assert_eq!(&banner, b"SSH-2.0-test\r\n");
    }

    #[tokio::test]
    async fn connect_fails_on_non_200() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_request_head(&mut stream).await;
            stream
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let dialer = Dialer::from_proxy(Some(&format!("http://{addr}"))).unwrap();
        let err = dialer.dial("tunnel.border0.com", 22).await.unwrap_err();
        assert!(matches!(err, DialError::ProxyStatus(407)));
    }
}
