//! HTTP/1.x request parsing shared by the plain listener and decrypted tunnels
//!
//! Bodies are always buffered in full: both the forwarder and the capture
//! engine consume the same owned bytes.

use anyhow::{anyhow, Context};
use bytes::Bytes;
use http::Method;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_HEADER_COUNT: usize = 128;
pub const MAX_REQUEST_BODY_BYTES: usize = 32 * 1024 * 1024; // 32MB hard cap on inbound bodies

pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

pub const CORS_HEADERS: [(&str, &str); 3] = [
    ("Access-Control-Allow-Origin", "*"),
    ("Access-Control-Allow-Methods", "GET, POST, OPTIONS"),
    ("Access-Control-Allow-Headers", "*"),
];
const CORS_MAX_AGE_SECS: u32 = 86_400;

#[derive(Debug, Error)]
#[error("request body exceeds configured limit of {limit} bytes")]
pub struct RequestBodyTooLarge {
    limit: usize,
}

impl RequestBodyTooLarge {
    fn new(limit: usize) -> Self {
        Self { limit }
    }
}

/// One fully buffered request read off a client connection.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub method: Method,
    /// Request-target exactly as sent: origin-form, absolute-form or CONNECT authority
    pub target: String,
    pub version: String,
    /// Every header occurrence in arrival order
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl ParsedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    pub fn keep_alive(&self) -> bool {
        should_keep_alive(&self.version, &self.headers)
    }
}

/// Buffered reader yielding consecutive requests from one connection.
///
/// Bytes read past the end of a request stay buffered for the next one, so
/// pipelined requests are not lost.
pub struct RequestReader<S> {
    stream: S,
    buffer: Vec<u8>,
}

impl<S> RequestReader<S>
where
    S: AsyncRead + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: Vec::with_capacity(4096),
        }
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Give back the stream together with any bytes already read but not consumed
    pub fn into_parts(self) -> (S, Vec<u8>) {
        (self.stream, self.buffer)
    }

    /// Read the next request. `Ok(None)` means the peer closed cleanly between requests.
    pub async fn next_request(&mut self) -> anyhow::Result<Option<ParsedRequest>> {
        let head_end = loop {
            if let Some(pos) = find_header_end(&self.buffer) {
                break pos;
            }
            if self.buffer.len() > MAX_HEADER_BYTES {
                return Err(anyhow!("HTTP headers exceed allowed size"));
            }
            if !self.fill().await? {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(anyhow!("connection closed before headers completed"));
            }
        };
        let raw_head: Vec<u8> = self.buffer.drain(..head_end).collect();

        let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
        let mut req = httparse::Request::new(&mut header_storage);
        let status = req.parse(&raw_head)?;
        if status.is_partial() {
            return Err(anyhow!("partial HTTP request"));
        }

        let method_str = req.method.ok_or_else(|| anyhow!("missing request method"))?;
        let method = Method::from_bytes(method_str.as_bytes())
            .with_context(|| format!("invalid request method {method_str}"))?;
        let target = req.path.unwrap_or("/").to_string();
        let version = format!("HTTP/1.{}", req.version.unwrap_or(1));
        let headers = headers_from_httparse(req.headers);

        let body = if method == Method::CONNECT {
            Vec::new()
        } else if is_chunked(&headers) {
            self.read_chunked_body().await?
        } else if let Some(length) = content_length(&headers)? {
            if length > MAX_REQUEST_BODY_BYTES {
                return Err(RequestBodyTooLarge::new(MAX_REQUEST_BODY_BYTES).into());
            }
            self.read_exact_buffered(length).await?
        } else {
            Vec::new()
        };

        Ok(Some(ParsedRequest {
            method,
            target,
            version,
            headers,
            body: Bytes::from(body),
        }))
    }

    async fn fill(&mut self) -> std::io::Result<bool> {
        let mut temp = [0u8; 4096];
        let read = self.stream.read(&mut temp).await?;
        if read == 0 {
            return Ok(false);
        }
        self.buffer.extend_from_slice(&temp[..read]);
        Ok(true)
    }

    async fn read_exact_buffered(&mut self, len: usize) -> anyhow::Result<Vec<u8>> {
        while self.buffer.len() < len {
            if !self.fill().await? {
                return Err(anyhow!("connection closed while reading request body"));
            }
        }
        Ok(self.buffer.drain(..len).collect())
    }

    async fn read_crlf_line(&mut self) -> anyhow::Result<Vec<u8>> {
        loop {
            if let Some(pos) = find_crlf(&self.buffer) {
                return Ok(self.buffer.drain(..pos + 2).collect());
            }
            if self.buffer.len() > MAX_HEADER_BYTES {
                return Err(anyhow!("chunk header line too long"));
            }
            if !self.fill().await? {
                return Err(anyhow!("connection closed while reading chunked body"));
            }
        }
    }

    async fn read_chunked_body(&mut self) -> anyhow::Result<Vec<u8>> {
        let mut body = Vec::new();

        loop {
            let line = self.read_crlf_line().await?;
            let header_bytes = &line[..line.len() - 2];
            let size_token = std::str::from_utf8(header_bytes)
                .unwrap_or("")
                .split(';')
                .next()
                .unwrap_or("")
                .trim();
            let chunk_size = usize::from_str_radix(size_token, 16)
                .map_err(|_| anyhow!("invalid chunk size: {size_token}"))?;

            if chunk_size == 0 {
                // Trailers end with a blank line
                loop {
                    let trailer_line = self.read_crlf_line().await?;
                    if trailer_line == b"\r\n" {
                        break;
                    }
                }
                break;
            }

            let total = body
                .len()
                .checked_add(chunk_size)
                .ok_or_else(|| RequestBodyTooLarge::new(MAX_REQUEST_BODY_BYTES))?;
            if total > MAX_REQUEST_BODY_BYTES {
                return Err(RequestBodyTooLarge::new(MAX_REQUEST_BODY_BYTES).into());
            }

            let chunk = self.read_exact_buffered(chunk_size).await?;
            body.extend_from_slice(&chunk);

            let crlf = self.read_exact_buffered(2).await?;
            if crlf != b"\r\n" {
                return Err(anyhow!("invalid chunk terminator"));
            }
        }

        Ok(body)
    }
}

/// Keep-alive rules: explicit `Connection` header wins, otherwise HTTP/1.1 persists.
pub fn should_keep_alive(version: &str, headers: &[(String, String)]) -> bool {
    match header_value(headers, "connection") {
        Some(v) if v.eq_ignore_ascii_case("close") => false,
        Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
        _ => version.contains("1.1"),
    }
}

pub fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn is_chunked(headers: &[(String, String)]) -> bool {
    header_value(headers, "transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
}

fn content_length(headers: &[(String, String)]) -> anyhow::Result<Option<usize>> {
    header_value(headers, "content-length")
        .map(|v| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| anyhow!("invalid Content-Length: {v}"))
        })
        .transpose()
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|window| window == b"\r\n")
}

fn headers_from_httparse(headers: &[httparse::Header]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|h| {
            let name = h.name.to_string();
            let value = String::from_utf8_lossy(h.value).to_string();
            (name, value)
        })
        .collect()
}

/// Split `host[:port]`, accepting bracketed IPv6 literals.
pub fn split_host_and_port(input: &str, default_port: u16) -> (String, u16) {
    if let Some(rest) = input.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail
                .strip_prefix(':')
                .and_then(|p| p.parse::<u16>().ok())
                .unwrap_or(default_port);
            return (host.to_string(), port);
        }
    }
    if let Some((host, port)) = input.rsplit_once(':') {
        if !host.contains(':') {
            if let Ok(parsed) = port.parse::<u16>() {
                return (host.to_string(), parsed);
            }
        }
    }
    (input.to_string(), default_port)
}

/// Inverse of [`split_host_and_port`], suitable for dialing.
pub fn join_host_and_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

pub async fn respond_with_status<W>(
    stream: &mut W,
    code: u16,
    message: &str,
    body: &str,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    respond_with_status_and_headers(stream, code, message, &[], body).await
}

/// Like [`respond_with_status`], with `headers` written before the framing headers.
pub async fn respond_with_status_and_headers<W>(
    stream: &mut W,
    code: u16,
    message: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut response = format!("HTTP/1.1 {} {}\r\n", code, message);
    for (name, value) in headers {
        response.push_str(&format!("{name}: {value}\r\n"));
    }
    response.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\nContent-Type: text/plain\r\n\r\n{}",
        body.len(),
        body
    ));
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Answer a CORS preflight without touching the upstream.
pub async fn respond_preflight<W>(stream: &mut W) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut response = String::from("HTTP/1.1 204 No Content\r\n");
    for (name, value) in CORS_HEADERS {
        response.push_str(&format!("{name}: {value}\r\n"));
    }
    response.push_str(&format!("Access-Control-Max-Age: {CORS_MAX_AGE_SECS}\r\n\r\n"));
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}
