//! Public listeners: HTTP redirect and SNI-dispatched TLS termination.
//!
//! The redirect listener answers every parseable request with a literal
//! `301 Moved permanently` pointing at the HTTPS equivalent and closes. The
//! TLS listener terminates the handshake with the currently installed
//! server configuration, resolves a backend from the negotiated SNI (with
//! `"default"` fallback), and pumps bytes in both directions until either
//! side closes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use arc_swap::ArcSwap;
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::state::SharedState;

/// Server header advertised on redirect responses.
pub const SERVER_TAG: &str = concat!("snigate/", env!("CARGO_PKG_VERSION"));

/// Copy-loop chunk size for the bidirectional pump.
const PUMP_BUF_SIZE: usize = 8192;

/// Largest first chunk the redirect listener will read.
const REDIRECT_READ_SIZE: usize = 4096;

/// Parsed redirect target from a plaintext request's first chunk.
#[derive(Debug, PartialEq, Eq)]
struct RedirectTarget {
    host: String,
    url: String,
}

/// Parse the first chunk of an HTTP request into a redirect target.
///
/// Splits on CRLF: the request line must be `<METHOD> <URL> <rest>`, and
/// the first header with the lowercased prefix `host:` supplies the host.
/// This reads the request exactly once; a Host header that has not arrived
/// in the first chunk loses the connection.
fn parse_redirect_request(buf: &[u8]) -> Option<RedirectTarget> {
    let text = std::str::from_utf8(buf).ok()?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next()?;
    let mut parts = request_line.splitn(3, ' ');
    let _method = parts.next()?;
    let url = parts.next()?;
    parts.next()?;

    let host_value = lines.find_map(|line| {
        let bytes = line.as_bytes();
        (bytes.len() >= 5 && bytes[..5].eq_ignore_ascii_case(b"host:"))
            .then(|| line[5..].trim())
    })?;

    Some(RedirectTarget {
        host: strip_port(host_value).to_string(),
        url: url.to_string(),
    })
}

/// Strip a `:port` suffix from a Host header value. Bracketed IPv6
/// literals keep their brackets.
fn strip_port(host: &str) -> &str {
    if let Some(end) = host.rfind(']') {
        // [::1]:80 -> [::1]
        return &host[..=end];
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

fn format_redirect_response(target: &RedirectTarget) -> String {
    format!(
        "HTTP/1.1 301 Moved permanently\r\n\
         Location: https://{}{}\r\n\
         Content-Length: 0\r\n\
         Server: {}\r\n\
         \r\n",
        target.host, target.url, SERVER_TAG
    )
}

/// Run the plaintext redirect listener.
pub async fn run_redirect_listener(listener: TcpListener) -> Result<()> {
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "HTTP redirect listener started");

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Redirect accept error");
                continue;
            }
        };

        tokio::spawn(async move {
            if let Err(e) = handle_redirect_conn(stream).await {
                debug!(peer = %peer_addr, error = %e, "Redirect connection error");
            }
        });
    }
}

async fn handle_redirect_conn(mut stream: TcpStream) -> Result<()> {
    let mut buf = vec![0u8; REDIRECT_READ_SIZE];
    let n = stream.read(&mut buf).await?;

    match parse_redirect_request(&buf[..n]) {
        Some(target) => {
            let response = format_redirect_response(&target);
            stream.write_all(response.as_bytes()).await?;
            stream.shutdown().await?;
        }
        None => {
            // Unparseable request: drop without writing.
            debug!("Unparseable redirect request, closing");
        }
    }
    Ok(())
}

/// Run the public TLS listener.
///
/// Every accept reads the currently installed server configuration once
/// from the swap cell, so certificate rotations apply to new connections
/// while sessions in flight keep the configuration they started with.
pub async fn run_tls_listener(
    listener: TcpListener,
    tls_config: Arc<ArcSwap<ServerConfig>>,
    state: Arc<SharedState>,
    handshake_timeout: Duration,
) -> Result<()> {
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "TLS listener started");

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "TLS accept error");
                continue;
            }
        };

        let config = tls_config.load_full();
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) =
                handle_tls_conn(stream, peer_addr, config, &state, handshake_timeout).await
            {
                debug!(peer = %peer_addr, error = %e, "TLS connection error");
            }
        });
    }
}

async fn handle_tls_conn(
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<ServerConfig>,
    state: &SharedState,
    handshake_timeout: Duration,
) -> Result<()> {
    let acceptor = TlsAcceptor::from(config);

    let tls_stream = match tokio::time::timeout(handshake_timeout, acceptor.accept(stream)).await {
        Ok(Ok(tls_stream)) => tls_stream,
        Ok(Err(e)) => {
            warn!(peer = %peer_addr, error = %e, "TLS handshake failed");
            return Ok(());
        }
        Err(_) => {
            warn!(peer = %peer_addr, "TLS handshake timed out");
            return Ok(());
        }
    };

    let sni = tls_stream
        .get_ref()
        .1
        .server_name()
        .map(|name| name.to_string());

    let Some(backend) = state.resolve(sni.as_deref()) else {
        debug!(peer = %peer_addr, sni = ?sni, "No backend for connection, closing");
        return Ok(());
    };

    let backend_addr = SocketAddr::new(backend.host, backend.port);
    let backend_stream = match TcpStream::connect(backend_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(peer = %peer_addr, backend = %backend_addr, error = %e, "Backend dial failed");
            return Ok(());
        }
    };

    debug!(peer = %peer_addr, sni = ?sni, backend = %backend_addr, "Proxying connection");

    let (client_bytes, backend_bytes) = pump(tls_stream, backend_stream).await;
    debug!(
        peer = %peer_addr,
        bytes_to_backend = client_bytes,
        bytes_from_backend = backend_bytes,
        "Connection closed"
    );

    Ok(())
}

/// The bidirectional pump: two concurrent copy loops, torn down together.
///
/// When either direction hits end-of-stream or an error, both endpoints
/// are closed — the backend TCP connection first, then the TLS session —
/// and the surviving loop unwinds on its next I/O. Returns the byte
/// counts (client→backend, backend→client) moved before teardown.
async fn pump<S>(tls_stream: S, backend: TcpStream) -> (u64, u64)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut tls_rd, mut tls_wr) = tokio::io::split(tls_stream);
    let (mut backend_rd, mut backend_wr) = backend.into_split();

    let client_to_backend = async {
        let mut buf = vec![0u8; PUMP_BUF_SIZE];
        let mut total = 0u64;
        loop {
            match tls_rd.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if backend_wr.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                    total += n as u64;
                }
                Err(_) => break,
            }
        }
        total
    };

    let backend_to_client = async {
        let mut buf = vec![0u8; PUMP_BUF_SIZE];
        let mut total = 0u64;
        loop {
            match backend_rd.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tls_wr.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                    total += n as u64;
                }
                Err(_) => break,
            }
        }
        total
    };

    let counts = tokio::select! {
        sent = client_to_backend => (sent, 0),
        received = backend_to_client => (0, received),
    };

    // Close the backend TCP connection first, then the TLS session.
    let _ = backend_wr.shutdown().await;
    drop(backend_rd);
    let _ = tls_wr.shutdown().await;
    drop(tls_rd);

    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_request() {
        let target =
            parse_redirect_request(b"GET /foo HTTP/1.1\r\nHost: a.example:80\r\n\r\n").unwrap();
        assert_eq!(target.host, "a.example");
        assert_eq!(target.url, "/foo");
    }

    #[test]
    fn test_parse_host_case_insensitive() {
        let target =
            parse_redirect_request(b"GET / HTTP/1.1\r\nhOsT: b.example\r\n\r\n").unwrap();
        assert_eq!(target.host, "b.example");
    }

    #[test]
    fn test_parse_missing_host() {
        assert!(parse_redirect_request(b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n").is_none());
    }

    #[test]
    fn test_parse_bad_request_line() {
        assert!(parse_redirect_request(b"GARBAGE\r\nHost: a.example\r\n\r\n").is_none());
        assert!(parse_redirect_request(b"\xff\xfe\r\n").is_none());
        assert!(parse_redirect_request(b"").is_none());
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("a.example:80"), "a.example");
        assert_eq!(strip_port("a.example"), "a.example");
        assert_eq!(strip_port("[::1]:443"), "[::1]");
        assert_eq!(strip_port("[::1]"), "[::1]");
    }

    #[test]
    fn test_response_format() {
        let target = RedirectTarget {
            host: "a.example".to_string(),
            url: "/foo".to_string(),
        };
        let response = format_redirect_response(&target);
        assert!(response.starts_with("HTTP/1.1 301 Moved permanently\r\n"));
        assert!(response.contains("Location: https://a.example/foo\r\n"));
        assert!(response.contains("Content-Length: 0\r\n"));
        assert!(response.contains("Server: snigate/"));
        assert!(response.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_pump_teardown_on_either_close() {
        // Client half closes immediately; the pump must return rather than
        // wait on the backend direction.
        let (client_side, proxy_side) = tokio::io::duplex(1024);
        let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend_listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (_stream, _) = backend_listener.accept().await.unwrap();
            // Hold the backend open; never write.
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let backend = TcpStream::connect(backend_addr).await.unwrap();
        drop(client_side);

        let result = tokio::time::timeout(Duration::from_secs(1), pump(proxy_side, backend)).await;
        assert!(result.is_ok(), "pump did not tear down on client close");
    }
}
