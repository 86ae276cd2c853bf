//! Upstream forwarding
//!
//! Replays a buffered client request against the real service over a fully
//! verified TLS connection and hands back the complete response.

use anyhow::Context;
use bytes::Bytes;
use futures::future::BoxFuture;
use http::Method;
use reqwest::header::{HeaderName, HeaderValue};
use rustls::{ClientConfig, RootCertStore};
use std::time::Duration;
use thiserror::Error;
use webpki_roots::TLS_SERVER_ROOTS;

use super::crypto_provider;
use super::http::header_value;

/// Fixed budget for one forwarded exchange, connect through last body byte
pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(30);

/// Headers re-derived from the URL and the buffered body instead of copied
const SKIPPED_REQUEST_HEADERS: [&str; 4] =
    ["host", "content-length", "transfer-encoding", "proxy-connection"];

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("invalid upstream URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("upstream request timed out after {0:?}")]
    Timeout(Duration),
    #[error("upstream transport error: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("failed to read upstream response body: {0}")]
    Body(#[source] reqwest::Error),
}

/// A request as it will be replayed upstream.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    /// Absolute URL, e.g. `https://gql.twitch.tv/gql`
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// The complete upstream response, body already de-chunked.
#[derive(Debug, Clone)]
pub struct ForwardedResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    /// Responses that never carry a body (HEAD, 1xx, 204, 304) keep upstream framing headers
    bodiless: bool,
}

impl ForwardedResponse {
    pub fn new(status: u16, reason: &str, headers: Vec<(String, String)>, body: Bytes) -> Self {
        Self {
            status,
            reason: reason.to_string(),
            headers,
            body,
            bodiless: status_forbids_body(status),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    /// Replace every occurrence of `name` with a single value
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.to_string()));
    }

    /// Serialise as an HTTP/1.1 response with exact framing.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status, self.reason).into_bytes();
        for (name, value) in &self.headers {
            if !self.bodiless
                && (name.eq_ignore_ascii_case("content-length")
                    || name.eq_ignore_ascii_case("transfer-encoding"))
            {
                continue;
            }
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        if !self.bodiless {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        if !self.bodiless {
            out.extend_from_slice(&self.body);
        }
        out
    }
}

fn status_forbids_body(status: u16) -> bool {
    (100..200).contains(&status) || status == 204 || status == 304
}

/// Anything able to carry an [`OutboundRequest`] to its destination.
pub trait Forward: Send + Sync {
    fn forward(
        &self,
        request: OutboundRequest,
    ) -> BoxFuture<'_, Result<ForwardedResponse, ForwardError>>;
}

pub fn build_tls_client_config() -> anyhow::Result<ClientConfig> {
    let root_store = RootCertStore::from_iter(TLS_SERVER_ROOTS.iter().cloned());
    let mut config = ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .context("Failed to select TLS protocol versions")?
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// Forwarder backed by a shared `reqwest` client.
pub struct UpstreamForwarder {
    client: reqwest::Client,
    timeout: Duration,
}

impl UpstreamForwarder {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_timeout(FORWARD_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .use_preconfigured_tls(build_tls_client_config()?)
            // Redirects go back to the client untouched
            .redirect(reqwest::redirect::Policy::none())
            // Environment proxies could point back at this process
            .no_proxy()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client, timeout })
    }

    async fn send(&self, request: OutboundRequest) -> Result<ForwardedResponse, ForwardError> {
        let url = reqwest::Url::parse(&request.url).map_err(|e| ForwardError::InvalidUrl {
            url: request.url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ForwardError::InvalidUrl {
                url: request.url.clone(),
                reason: format!("unsupported scheme {}", url.scheme()),
            });
        }

        let is_head = request.method == Method::HEAD;
        let carries_body = !request.body.is_empty()
            || matches!(request.method, Method::POST | Method::PUT | Method::PATCH);

        let mut builder = self.client.request(request.method, url);
        for (name, value) in &request.headers {
            if SKIPPED_REQUEST_HEADERS
                .iter()
                .any(|skipped| name.eq_ignore_ascii_case(skipped))
            {
                continue;
            }
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => builder = builder.header(name, value),
                _ => tracing::debug!("Dropping unforwardable header {name}"),
            }
        }
        if carries_body {
            builder = builder.body(request.body);
        }

        let response = builder.send().await.map_err(|e| self.classify(e, false))?;

        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).to_string(),
                )
            })
            .collect::<Vec<_>>();
        let body = response.bytes().await.map_err(|e| self.classify(e, true))?;

        let mut forwarded = ForwardedResponse::new(
            status.as_u16(),
            status.canonical_reason().unwrap_or(""),
            headers,
            body,
        );
        if is_head {
            forwarded.bodiless = true;
        }
        Ok(forwarded)
    }

    fn classify(&self, err: reqwest::Error, reading_body: bool) -> ForwardError {
        if err.is_timeout() {
            ForwardError::Timeout(self.timeout)
        } else if reading_body {
            ForwardError::Body(err)
        } else {
            ForwardError::Transport(err)
        }
    }
}

impl Forward for UpstreamForwarder {
    fn forward(
        &self,
        request: OutboundRequest,
    ) -> BoxFuture<'_, Result<ForwardedResponse, ForwardError>> {
        Box::pin(self.send(request))
    }
}
