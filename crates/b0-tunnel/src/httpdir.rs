//! Local HTTP directory mode
//!
//! Serves a directory of static files over accepted tunnel streams. Each
//! stream carries one HTTP/1.1 exchange; the connection closes after the
//! response, matching how tunnel clients open a fresh stream per request.
//! Request heads are parsed with httparse rather than scanned by hand.

use std::path::{Component, Path, PathBuf};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Maximum number of headers to parse
const MAX_HEADERS: usize = 32;
const MAX_REQUEST_HEAD: usize = 16 * 1024;

/// A parsed request head.
enum RequestHead {
    /// The stream closed before a request arrived.
    Empty,
    /// The bytes never formed a valid HTTP/1.x request.
    Invalid,
    Complete { method: String, path: String },
}

/// Serve a single request from `root` over the stream.
pub async fn serve_connection<S>(mut stream: S, root: &Path) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (method, path) = match read_request_head(&mut stream).await? {
        RequestHead::Empty => return Ok(()),
        RequestHead::Invalid => {
            return respond(
                &mut stream,
                "400 Bad Request",
                "text/plain; charset=utf-8",
                b"bad request",
                false,
            )
            .await;
        }
        RequestHead::Complete { method, path } => (method, path),
    };

    if method != "GET" && method != "HEAD" {
        return respond(
            &mut stream,
            "405 Method Not Allowed",
            "text/plain; charset=utf-8",
            b"method not allowed",
            method == "HEAD",
        )
        .await;
    }

    let Some(path) = resolve(root, &path) else {
        return respond(
            &mut stream,
            "404 Not Found",
            "text/plain; charset=utf-8",
            b"not found",
            method == "HEAD",
        )
        .await;
    };

    match tokio::fs::read(&path).await {
        Ok(body) => {
            debug!(path = %path.display(), bytes = body.len(), "served file");
            respond(
                &mut stream,
                "200 OK",
                content_type(&path),
                &body,
                method == "HEAD",
            )
            .await
        }
        Err(_) => {
            respond(
                &mut stream,
                "404 Not Found",
                "text/plain; charset=utf-8",
                b"not found",
                method == "HEAD",
            )
            .await
        }
    }
}

/// Accumulate stream bytes until httparse sees a complete request head.
async fn read_request_head<S>(stream: &mut S) -> std::io::Result<RequestHead>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(if buffer.is_empty() {
                RequestHead::Empty
            } else {
                RequestHead::Invalid
            });
        }
        buffer.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        match request.parse(&buffer) {
            Ok(httparse::Status::Complete(_)) => {
                return Ok(RequestHead::Complete {
                    method: request.method.unwrap_or_default().to_string(),
                    path: request.path.unwrap_or("/").to_string(),
                });
            }
            Ok(httparse::Status::Partial) => {
                if buffer.len() >= MAX_REQUEST_HEAD {
                    return Ok(RequestHead::Invalid);
                }
            }
            Err(_) => return Ok(RequestHead::Invalid),
        }
    }
}

/// Map the request target onto the served directory, rejecting anything
/// that would escape it. Directory targets resolve to `index.html`.
fn resolve(root: &Path, target: &str) -> Option<PathBuf> {
    let path = target.split(['?', '#']).next().unwrap_or_default();
    if !path.starts_with('/') {
        return None;
    }

    let mut resolved = root.to_path_buf();
    for component in Path::new(path.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }

    if resolved.is_dir() {
        resolved.push("index.html");
    }

    Some(resolved)
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "text/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

async fn respond<S>(
    stream: &mut S,
    status: &str,
    content_type: &str,
    body: &[u8],
    head_only: bool,
) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let header = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(header.as_bytes()).await?;
    if !head_only {
        stream.write_all(body).await?;
    }
    stream.flush().await
}
