//! Proxy server implementation
//!
//! Accepts client connections and routes each request: CONNECT to the intercept
//! domain is decrypted and captured, other CONNECT targets are tunnelled as-is,
//! and plain HTTP requests are relayed to the configured upstream.

use anyhow::Context;
use http::Method;
use reqwest::Url;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use super::cert_manager::CertificateAuthority;
use super::forwarder::{Forward, OutboundRequest};
use super::http::{
    join_host_and_port, respond_preflight, respond_with_status, respond_with_status_and_headers,
    split_host_and_port, ParsedRequest, RequestBodyTooLarge, RequestReader, CONNECTION_ESTABLISHED, CORS_HEADERS,
};
use super::tunnel;
use crate::capture::{CaptureEngine, CaptureRequest};

/// Keep-alive idle timeout in seconds
const KEEP_ALIVE_TIMEOUT_SECS: u64 = 30;

const HTTPS_PORT: u16 = 443;

/// Everything a connection task needs, shared across all of them.
pub struct ProxyState {
    ca: Arc<CertificateAuthority>,
    capture: Arc<CaptureEngine>,
    forwarder: Arc<dyn Forward>,
    intercept_domain: String,
    upstream_url: Url,
    verbose: bool,
}

impl ProxyState {
    pub fn new(
        ca: Arc<CertificateAuthority>,
        capture: Arc<CaptureEngine>,
        forwarder: Arc<dyn Forward>,
        intercept_domain: &str,
        upstream_url: Url,
        verbose: bool,
    ) -> Self {
        Self {
            ca,
            capture,
            forwarder,
            intercept_domain: intercept_domain.trim_start_matches('.').to_ascii_lowercase(),
            upstream_url,
            verbose,
        }
    }

    pub fn ca(&self) -> &CertificateAuthority {
        &self.ca
    }

    pub fn capture(&self) -> &CaptureEngine {
        &self.capture
    }

    /// True for the intercept domain itself and any of its subdomains.
    pub fn intercepts(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        host == self.intercept_domain
            || host
                .strip_suffix(&self.intercept_domain)
                .is_some_and(|prefix| prefix.ends_with('.'))
    }

    /// Destination for a plain-HTTP request target.
    fn passthrough_url(&self, target: &str) -> String {
        if is_absolute_form(target) {
            return target.to_string();
        }
        let mut url = self.upstream_url.clone();
        if let Some((_, query)) = target.split_once('?') {
            url.set_query(Some(query));
        }
        url.to_string()
    }
}

/// Accept connections forever, one task per connection.
pub async fn run_server(listener: TcpListener, state: Arc<ProxyState>) -> anyhow::Result<()> {
    loop {
        match listener.accept().await {
            Ok((socket, peer_addr)) => {
                tracing::debug!("Connection from {}", peer_addr);
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(socket, state).await {
                        let err_str = e.to_string().to_lowercase();
                        if err_str.contains("eof")
                            || err_str.contains("broken pipe")
                            || err_str.contains("connection reset")
                            || err_str.contains("connection closed")
                        {
                            tracing::debug!("Connection closed by client: {}", e);
                        } else {
                            tracing::error!("Error handling connection: {}", e);
                        }
                    }
                });
            }
            Err(e) => tracing::error!("Accept error: {}", e),
        }
    }
}

/// Handle a client connection with keep-alive support
pub async fn handle_connection<S>(socket: S, state: Arc<ProxyState>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut reader = RequestReader::new(socket);
    let mut request_number: u32 = 0;

    loop {
        request_number += 1;

        let parsed = match tokio::time::timeout(
            tokio::time::Duration::from_secs(KEEP_ALIVE_TIMEOUT_SECS),
            reader.next_request(),
        )
        .await
        {
            Ok(Ok(Some(req))) => req,
            Ok(Ok(None)) => break,
            Ok(Err(err)) => {
                if err.downcast_ref::<RequestBodyTooLarge>().is_some() {
                    let _ = respond_with_status(
                        reader.get_mut(),
                        413,
                        "Payload Too Large",
                        "Request body exceeds allowed size",
                    )
                    .await;
                } else if request_number == 1 {
                    let _ = respond_with_status(
                        reader.get_mut(),
                        400,
                        "Bad Request",
                        "Unable to parse HTTP request",
                    )
                    .await;
                }
                if state.verbose {
                    tracing::debug!("Failed to parse request: {err}");
                }
                break;
            }
            Err(_) => {
                tracing::debug!("Keep-alive timeout after {} requests", request_number - 1);
                break;
            }
        };

        // CONNECT takes over the connection completely
        if parsed.method == Method::CONNECT {
            let (socket, leftover) = reader.into_parts();
            return handle_connect(socket, leftover, parsed, state).await;
        }

        let keep_alive = parsed.keep_alive();
        if parsed.method == Method::OPTIONS {
            respond_preflight(reader.get_mut()).await?;
        } else if !passthrough(reader.get_mut(), parsed, &state).await? {
            break;
        }

        if !keep_alive {
            break;
        }
    }

    Ok(())
}

async fn handle_connect<S>(
    socket: S,
    leftover: Vec<u8>,
    parsed: ParsedRequest,
    state: Arc<ProxyState>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (host, port) = split_host_and_port(&parsed.target, HTTPS_PORT);
    if state.intercepts(&host) {
        tracing::debug!("Intercepting CONNECT to {}", join_host_and_port(&host, port));
        intercept_tls_stream(socket, leftover, host, port, state).await
    } else {
        tunnel::handle_plain_connect(socket, &host, port, &leftover).await
    }
}

/// Terminate TLS with a leaf for `host` and serve decrypted requests until the client stops.
pub async fn intercept_tls_stream<S>(
    mut client: S,
    leftover: Vec<u8>,
    host: String,
    port: u16,
    state: Arc<ProxyState>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let leaf = state
        .ca
        .issue_leaf(&host)
        .with_context(|| format!("Failed to issue certificate for {host}"))?;

    client.write_all(CONNECTION_ESTABLISHED).await?;
    client.flush().await?;

    let acceptor = TlsAcceptor::from(leaf.server_config());
    let tls_stream = match acceptor.accept(PrefixedStream::new(leftover, client)).await {
        Ok(stream) => stream,
        Err(err) => {
            if state.verbose {
                tracing::info!("TLS handshake failed for {}: {}", host, err);
            }
            return Ok(());
        }
    };

    let authority = url_authority(&host, port);
    let mut reader = RequestReader::new(tls_stream);
    let mut request_count: u32 = 0;

    loop {
        request_count += 1;
        let parsed = match reader.next_request().await {
            Ok(Some(req)) => req,
            Ok(None) => break,
            Err(err) => {
                if state.verbose {
                    tracing::debug!(
                        "HTTPS connection to {} closed after {} requests: {err}",
                        host,
                        request_count - 1
                    );
                }
                break;
            }
        };

        let keep_alive = parsed.keep_alive();
        let url = format!("https://{}{}", authority, origin_form(&parsed.target));

        let capture_request = CaptureRequest {
            url: &url,
            host: &host,
            content_encoding: parsed.header("content-encoding"),
        };
        state.capture.capture(&capture_request, &parsed.body).await;

        let outbound = OutboundRequest {
            method: parsed.method,
            url,
            headers: parsed.headers,
            body: parsed.body,
        };
        match state.forwarder.forward(outbound).await {
            Ok(response) => {
                let stream = reader.get_mut();
                stream.write_all(&response.to_bytes()).await?;
                stream.flush().await?;
            }
            Err(err) => {
                tracing::error!("Forward error: {}", err);
                break;
            }
        }

        if !keep_alive {
            break;
        }
    }

    let (mut stream, _) = reader.into_parts();
    let _ = stream.shutdown().await;
    Ok(())
}

/// Relay one plain-HTTP request. Returns false when the connection must close.
async fn passthrough<W>(
    client: &mut W,
    parsed: ParsedRequest,
    state: &ProxyState,
) -> anyhow::Result<bool>
where
    W: AsyncWrite + Unpin,
{
    let url = state.passthrough_url(&parsed.target);
    let host = parsed
        .header("host")
        .map(|h| split_host_and_port(h, 80).0)
        .unwrap_or_default();

    let capture_request = CaptureRequest {
        url: &parsed.target,
        host: &host,
        content_encoding: parsed.header("content-encoding"),
    };
    state.capture.capture(&capture_request, &parsed.body).await;

    let outbound = OutboundRequest {
        method: parsed.method,
        url,
        headers: parsed.headers,
        body: parsed.body,
    };
    match state.forwarder.forward(outbound).await {
        Ok(mut response) => {
            for (name, value) in CORS_HEADERS {
                response.set_header(name, value);
            }
            client.write_all(&response.to_bytes()).await?;
            client.flush().await?;
            Ok(true)
        }
        Err(err) => {
            tracing::error!("Proxy error: {}", err);
            respond_with_status_and_headers(
                client,
                502,
                "Bad Gateway",
                &CORS_HEADERS,
                &err.to_string(),
            )
            .await?;
            Ok(false)
        }
    }
}

fn is_absolute_form(target: &str) -> bool {
    let lower = target.get(..8).unwrap_or(target).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Path and query of a request-target; absolute-form targets lose their
/// scheme and authority.
fn origin_form(target: &str) -> String {
    if !is_absolute_form(target) {
        return target.to_string();
    }
    let rest = target
        .find("://")
        .map_or(target, |scheme_end| &target[scheme_end + 3..]);
    match rest.find(|c: char| c == '/' || c == '?') {
        Some(start) if rest[start..].starts_with('/') => rest[start..].to_string(),
        Some(start) => format!("/{}", &rest[start..]),
        None => "/".to_string(),
    }
}

/// `host[:port]` as it appears in an https URL; the default port is omitted.
fn url_authority(host: &str, port: u16) -> String {
    if port == HTTPS_PORT {
        if host.contains(':') {
            format!("[{host}]")
        } else {
            host.to_string()
        }
    } else {
        join_host_and_port(host, port)
    }
}

/// Replays bytes read ahead of the TLS handshake before reading from the stream itself.
struct PrefixedStream<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.offset < this.prefix.len() {
            let remaining = &this.prefix[this.offset..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.offset += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::crypto_provider;
    use crate::proxy::forwarder::{ForwardError, ForwardedResponse};
    use crate::storage::CaptureStore;
    use bytes::Bytes;
    use futures::future::BoxFuture;
    use rustls::pki_types::ServerName;
    use rustls::{ClientConfig, RootCertStore};
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};
    use tokio::task::JoinHandle;
    use tokio_rustls::client::TlsStream;
    use tokio_rustls::TlsConnector;

    /// Upstream stand-in that echoes the URL it was asked for.
    #[derive(Default)]
    struct StubForward {
        fail: bool,
        seen: Mutex<Vec<OutboundRequest>>,
    }

    impl StubForward {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn seen(&self) -> Vec<OutboundRequest> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl Forward for StubForward {
        fn forward(
            &self,
            request: OutboundRequest,
        ) -> BoxFuture<'_, Result<ForwardedResponse, ForwardError>> {
            self.seen.lock().unwrap().push(request.clone());
            let fail = self.fail;
            Box::pin(async move {
                if fail {
                    return Err(ForwardError::Timeout(Duration::from_secs(30)));
                }
                Ok(ForwardedResponse::new(
                    200,
                    "OK",
                    vec![
                        ("Content-Type".into(), "text/plain".into()),
                        ("Access-Control-Allow-Origin".into(), "https://www.twitch.tv".into()),
                    ],
                    Bytes::from(format!("echo {}", request.url)),
                ))
            })
        }
    }

    fn state_with(dir: &Path, forwarder: Arc<StubForward>) -> Arc<ProxyState> {
        let ca = Arc::new(CertificateAuthority::generate_root(dir).unwrap());
        let capture = Arc::new(CaptureEngine::new("gql", false, CaptureStore::new(dir)));
        Arc::new(ProxyState::new(
            ca,
            capture,
            forwarder,
            "twitch.tv",
            Url::parse("https://gql.twitch.tv/gql").unwrap(),
            false,
        ))
    }

    /// Read one Content-Length framed response.
    async fn read_response<S: AsyncRead + Unpin>(stream: &mut S) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..end]).to_string();
                let length = head
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    return String::from_utf8_lossy(&buf[..end + 4 + length]).to_string();
                }
            }
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "stream closed mid-response");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn json_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".json"))
            .collect()
    }

    /// Send `connect` on a fresh connection and finish a TLS handshake for
    /// `server_name`, trusting only the proxy's root.
    async fn open_intercepted_tunnel(
        state: &Arc<ProxyState>,
        connect: &[u8],
        server_name: &str,
    ) -> (TlsStream<DuplexStream>, JoinHandle<anyhow::Result<()>>) {
        let mut roots = RootCertStore::empty();
        roots.add(state.ca().ca_cert_der().clone()).unwrap();

        let (mut client, server_side) = duplex(64 * 1024);
        let server_task = tokio::spawn(handle_connection(server_side, state.clone()));

        client.write_all(connect).await.unwrap();
        let mut established = vec![0u8; CONNECTION_ESTABLISHED.len()];
        client.read_exact(&mut established).await.unwrap();
        assert_eq!(established, CONNECTION_ESTABLISHED);

        let client_cfg = ClientConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(client_cfg));
        let server_name = ServerName::try_from(server_name.to_string()).unwrap();
        let tls_client = connector.connect(server_name, client).await.unwrap();
        (tls_client, server_task)
    }

    #[test]
    fn intercept_domain_matches_itself_and_subdomains_only() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(dir.path(), Arc::new(StubForward::default()));
        assert!(state.intercepts("twitch.tv"));
        assert!(state.intercepts("gql.twitch.tv"));
        assert!(state.intercepts("GQL.Twitch.TV"));
        assert!(!state.intercepts("nottwitch.tv"));
        assert!(!state.intercepts("twitch.tv.example.com"));
        assert!(!state.intercepts("example.com"));
    }

    #[test]
    fn passthrough_url_keeps_query_or_absolute_target() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(dir.path(), Arc::new(StubForward::default()));
        assert_eq!(state.passthrough_url("/gql"), "https://gql.twitch.tv/gql");
        assert_eq!(
            state.passthrough_url("/anything?x=1&y=2"),
            "https://gql.twitch.tv/gql?x=1&y=2"
        );
        assert_eq!(
            state.passthrough_url("http://example.com/a?b"),
            "http://example.com/a?b"
        );
    }

    #[test]
    fn origin_form_drops_scheme_and_authority() {
        assert_eq!(origin_form("/gql?x=1"), "/gql?x=1");
        assert_eq!(origin_form("http://other.example/x?y=1"), "/x?y=1");
        assert_eq!(origin_form("https://other.example"), "/");
        assert_eq!(origin_form("http://other.example?y=1"), "/?y=1");
    }

    #[test]
    fn authority_omits_default_port() {
        assert_eq!(url_authority("gql.twitch.tv", 443), "gql.twitch.tv");
        assert_eq!(url_authority("gql.twitch.tv", 8443), "gql.twitch.tv:8443");
        assert_eq!(url_authority("::1", 443), "[::1]");
    }

    #[tokio::test]
    async fn prefixed_stream_replays_prefix_first() {
        let (mut writer, reader) = duplex(64);
        writer.write_all(b" world").await.unwrap();
        drop(writer);
        let mut stream = PrefixedStream::new(b"hello".to_vec(), reader);
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn intercepted_requests_are_captured_and_forwarded_with_keep_alive() {
        let dir = tempfile::tempdir().unwrap();
        let forwarder = Arc::new(StubForward::default());
        let state = state_with(dir.path(), forwarder.clone());
        let (mut tls_client, server_task) = open_intercepted_tunnel(
            &state,
            b"CONNECT gql.twitch.tv:443 HTTP/1.1\r\nHost: gql.twitch.tv:443\r\n\r\n",
            "gql.twitch.tv",
        )
        .await;

        let body = r#"{"operationName":"Foo","query":"q","variables":{}}"#;
        tls_client
            .write_all(
                format!(
                    "POST /gql HTTP/1.1\r\nHost: gql.twitch.tv\r\nClient-Id: abc\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                )
                .as_bytes(),
            )
            .await
            .unwrap();
        let first = read_response(&mut tls_client).await;
        assert!(first.starts_with("HTTP/1.1 200 OK"), "{first}");
        assert!(first.ends_with("echo https://gql.twitch.tv/gql"));

        tls_client
            .write_all(b"GET /second HTTP/1.1\r\nHost: gql.twitch.tv\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let second = read_response(&mut tls_client).await;
        assert!(second.ends_with("echo https://gql.twitch.tv/second"));

        tokio::time::timeout(Duration::from_secs(5), server_task)
            .await
            .expect("interceptor stops after Connection: close")
            .unwrap()
            .unwrap();

        let seen = forwarder.seen();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].method, Method::POST);
        assert_eq!(seen[0].body.as_ref(), body.as_bytes());
        assert!(seen[0]
            .headers
            .iter()
            .any(|(k, v)| k == "Client-Id" && v == "abc"));

        let files = json_files(dir.path());
        assert_eq!(files.len(), 1);
        assert!(files[0].starts_with("Foo_"));
        assert_eq!(state.capture().seen_operations(), vec!["Foo"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn intercepted_forward_error_closes_connection() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(dir.path(), Arc::new(StubForward::failing()));
        let (mut tls_client, server_task) = open_intercepted_tunnel(
            &state,
            b"CONNECT www.twitch.tv HTTP/1.1\r\n\r\n",
            "www.twitch.tv",
        )
        .await;

        tls_client
            .write_all(b"GET / HTTP/1.1\r\nHost: www.twitch.tv\r\n\r\n")
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), server_task)
            .await
            .expect("interceptor stops after a forward error")
            .unwrap()
            .unwrap();

        let mut rest = Vec::new();
        let _ = tls_client.read_to_end(&mut rest).await;
        assert!(rest.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn absolute_targets_inside_the_tunnel_stay_on_the_connect_host() {
        let dir = tempfile::tempdir().unwrap();
        let forwarder = Arc::new(StubForward::default());
        let state = state_with(dir.path(), forwarder.clone());
        let (mut tls_client, server_task) = open_intercepted_tunnel(
            &state,
            b"CONNECT gql.twitch.tv:443 HTTP/1.1\r\n\r\n",
            "gql.twitch.tv",
        )
        .await;

        tls_client
            .write_all(b"GET http://other.example/x?y=1 HTTP/1.1\r\nHost: other.example\r\n\r\n")
            .await
            .unwrap();
        let first = read_response(&mut tls_client).await;
        assert!(first.ends_with("echo https://gql.twitch.tv/x?y=1"), "{first}");

        tls_client
            .write_all(b"GET HTTPS://other.example HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let second = read_response(&mut tls_client).await;
        assert!(second.ends_with("echo https://gql.twitch.tv/"), "{second}");

        tokio::time::timeout(Duration::from_secs(5), server_task)
            .await
            .expect("interceptor stops after Connection: close")
            .unwrap()
            .unwrap();

        let urls: Vec<String> = forwarder.seen().into_iter().map(|r| r.url).collect();
        assert_eq!(urls, ["https://gql.twitch.tv/x?y=1", "https://gql.twitch.tv/"]);
    }

    #[tokio::test]
    async fn options_preflight_is_answered_locally() {
        let dir = tempfile::tempdir().unwrap();
        let forwarder = Arc::new(StubForward::default());
        let state = state_with(dir.path(), forwarder.clone());

        let (mut client, server_side) = duplex(4096);
        let server_task = tokio::spawn(handle_connection(server_side, state));
        client
            .write_all(b"OPTIONS /gql HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        server_task.await.unwrap().unwrap();

        assert!(response.starts_with("HTTP/1.1 204 No Content"));
        assert!(response.contains("Access-Control-Allow-Origin: *"));
        assert!(response.contains("Access-Control-Max-Age: 86400"));
        assert!(forwarder.seen().is_empty());
    }

    #[tokio::test]
    async fn plain_requests_are_rewritten_to_upstream_with_cors() {
        let dir = tempfile::tempdir().unwrap();
        let forwarder = Arc::new(StubForward::default());
        let state = state_with(dir.path(), forwarder.clone());

        let (mut client, server_side) = duplex(4096);
        let server_task = tokio::spawn(handle_connection(server_side, state));

        let body = r#"[{"operationName":"Alpha"},{"operationName":"Beta"}]"#;
        client
            .write_all(
                format!(
                    "POST /gql?trace=1 HTTP/1.1\r\nHost: localhost:19808\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                )
                .as_bytes(),
            )
            .await
            .unwrap();
        let response = read_response(&mut client).await;
        assert!(response.contains("Access-Control-Allow-Origin: *"));
        assert!(!response.contains("https://www.twitch.tv"));
        assert!(response.contains("Access-Control-Allow-Methods: GET, POST, OPTIONS"));
        assert!(response.ends_with("echo https://gql.twitch.tv/gql?trace=1"));

        client
            .write_all(b"GET http://example.com/page HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let response = read_response(&mut client).await;
        assert!(response.ends_with("echo http://example.com/page"));
        server_task.await.unwrap().unwrap();

        assert_eq!(forwarder.seen().len(), 2);
        assert_eq!(json_files(dir.path()).len(), 2);
    }

    #[tokio::test]
    async fn plain_forward_error_becomes_bad_gateway() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(dir.path(), Arc::new(StubForward::failing()));

        let (mut client, server_side) = duplex(4096);
        let server_task = tokio::spawn(handle_connection(server_side, state));
        client
            .write_all(b"GET /gql HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        server_task.await.unwrap().unwrap();
        assert!(response.starts_with("HTTP/1.1 502 Bad Gateway"), "{response}");
        assert!(response.contains("Access-Control-Allow-Origin: *"));
        assert!(response.contains("Access-Control-Allow-Headers: *"));
        assert!(response.contains("timed out"));
    }

    #[tokio::test]
    async fn plain_requests_are_filtered_on_the_target_they_arrived_with() {
        let dir = tempfile::tempdir().unwrap();
        let forwarder = Arc::new(StubForward::default());
        let state = state_with(dir.path(), forwarder.clone());

        let (mut client, server_side) = duplex(4096);
        let server_task = tokio::spawn(handle_connection(server_side, state.clone()));
        let body = r#"{"operationName":"NotGql"}"#;
        client
            .write_all(
                format!(
                    "POST /api/login HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                )
                .as_bytes(),
            )
            .await
            .unwrap();
        let response = read_response(&mut client).await;
        server_task.await.unwrap().unwrap();

        assert!(response.ends_with("echo https://gql.twitch.tv/gql"));
        assert_eq!(forwarder.seen().len(), 1);
        assert!(state.capture().seen_operations().is_empty());
        assert!(json_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn oversized_plain_body_gets_payload_too_large() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(dir.path(), Arc::new(StubForward::default()));

        let (mut client, server_side) = duplex(4096);
        let server_task = tokio::spawn(handle_connection(server_side, state));
        client
            .write_all(b"POST /gql HTTP/1.1\r\nHost: localhost\r\nContent-Length: 999999999\r\n\r\n")
            .await
            .unwrap();

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        server_task.await.unwrap().unwrap();
        assert!(response.starts_with("HTTP/1.1 413 Payload Too Large"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn other_hosts_are_tunnelled_untouched() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = echo.accept().await.unwrap();
            let (mut reader, mut writer) = socket.split();
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        });

        let dir = tempfile::tempdir().unwrap();
        let forwarder = Arc::new(StubForward::default());
        let state = state_with(dir.path(), forwarder.clone());

        let (mut client, server_side) = duplex(4096);
        let server_task = tokio::spawn(handle_connection(server_side, state.clone()));
        client
            .write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", echo_addr.port()).as_bytes())
            .await
            .unwrap();
        let mut established = vec![0u8; CONNECTION_ESTABLISHED.len()];
        client.read_exact(&mut established).await.unwrap();
        assert_eq!(established, CONNECTION_ESTABLISHED);

        let payload = b"\x16\x03\x01 opaque bytes \x00\xff";
        client.write_all(payload).await.unwrap();
        let mut echoed = vec![0u8; payload.len()];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, payload);

        drop(client);
        server_task.await.unwrap().unwrap();
        assert!(forwarder.seen().is_empty());
        assert_eq!(state.ca().cached_leaf_count(), 0);
    }
}
