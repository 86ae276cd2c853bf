//! Proxy API
//!
//! Configuration, logging setup and the [`GqlProxy`] handle that owns one
//! running proxy instance.

use anyhow::Context;
use reqwest::Url;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::capture::CaptureEngine;
use crate::proxy::cert_manager::CertificateAuthority;
use crate::proxy::forwarder::{Forward, UpstreamForwarder};
use crate::proxy::server::{run_server, ProxyState};
use crate::storage::CaptureStore;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:19808";
pub const DEFAULT_OUTPUT_DIR: &str = "./gql_captures";
pub const DEFAULT_INTERCEPT_DOMAIN: &str = "twitch.tv";
pub const DEFAULT_CAPTURE_MARKER: &str = "gql";
pub const DEFAULT_UPSTREAM_URL: &str = "https://gql.twitch.tv/gql";

/// Running log written next to the captures
pub const LOG_FILE: &str = "proxy.log";

/// Proxy configuration, fixed once the proxy is constructed
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address the listener binds, e.g. "127.0.0.1:19808"
    pub listen_addr: String,
    /// Directory receiving `ca.crt`, capture files and the running log
    pub output_dir: PathBuf,
    /// Log variables, parse failures and handshake failures
    pub verbose: bool,
    /// CONNECT hosts equal to this domain or below it are decrypted
    pub intercept_domain: String,
    /// Substring of the URL or host identifying operation traffic
    pub capture_marker: String,
    /// Destination for origin-form plain HTTP requests
    pub upstream_url: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            verbose: false,
            intercept_domain: DEFAULT_INTERCEPT_DOMAIN.to_string(),
            capture_marker: DEFAULT_CAPTURE_MARKER.to_string(),
            upstream_url: DEFAULT_UPSTREAM_URL.to_string(),
        }
    }
}

/// Install console and file logging.
///
/// Keep the returned guard alive for as long as logs should reach `proxy.log`.
/// An already installed subscriber is left in place.
pub fn init_logging(output_dir: &Path, verbose: bool) -> anyhow::Result<WorkerGuard> {
    fs::create_dir_all(output_dir).with_context(|| {
        format!(
            "Failed to create output directory {}",
            output_dir.display()
        )
    })?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(LOG_FILE)
        .build(output_dir)
        .with_context(|| format!("Failed to open {}", output_dir.join(LOG_FILE).display()))?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let _ = tracing_subscriber::registry()
        .with(resolve_log_level(verbose))
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .try_init();

    Ok(guard)
}

fn resolve_log_level(verbose: bool) -> LevelFilter {
    match std::env::var("RUST_LOG") {
        Ok(val) => parse_level(&val),
        Err(_) if verbose => LevelFilter::DEBUG,
        Err(_) => LevelFilter::INFO,
    }
}

fn parse_level(val: &str) -> LevelFilter {
    match val.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}

/// One proxy instance: its root CA, capture registry and forwarder.
pub struct GqlProxy {
    config: ProxyConfig,
    state: Arc<ProxyState>,
}

impl GqlProxy {
    /// Generate the root CA and prepare the capture pipeline. Nothing is bound yet.
    pub fn new(config: ProxyConfig) -> anyhow::Result<Self> {
        let forwarder = UpstreamForwarder::new()?;
        Self::with_forwarder(config, Arc::new(forwarder))
    }

    /// Like [`GqlProxy::new`] with a caller-supplied upstream.
    pub fn with_forwarder(config: ProxyConfig, forwarder: Arc<dyn Forward>) -> anyhow::Result<Self> {
        let upstream_url = Url::parse(&config.upstream_url)
            .with_context(|| format!("Invalid upstream URL {}", config.upstream_url))?;
        if !matches!(upstream_url.scheme(), "http" | "https") {
            anyhow::bail!("Upstream URL must be http or https: {}", config.upstream_url);
        }

        fs::create_dir_all(&config.output_dir).with_context(|| {
            format!(
                "Failed to create output directory {}",
                config.output_dir.display()
            )
        })?;

        let ca = CertificateAuthority::generate_root(&config.output_dir)?;
        tracing::info!("CA certificate saved to {}", ca.ca_path().display());
        tracing::info!(
            "Import it as a trusted root on the client device to decrypt traffic for {}",
            config.intercept_domain
        );

        let capture = CaptureEngine::new(
            config.capture_marker.clone(),
            config.verbose,
            CaptureStore::new(&config.output_dir),
        );
        let state = ProxyState::new(
            Arc::new(ca),
            Arc::new(capture),
            forwarder,
            &config.intercept_domain,
            upstream_url,
            config.verbose,
        );

        Ok(Self {
            config,
            state: Arc::new(state),
        })
    }

    /// Bind the configured address and serve until the process exits.
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.listen_addr))?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!("Starting proxy on {}", addr);
        tracing::info!("Saving captures to {}", self.config.output_dir.display());
        run_server(listener, self.state.clone()).await
    }

    /// Distinct operation names captured so far, sorted
    pub fn captured_operations(&self) -> Vec<String> {
        self.state.capture().seen_operations()
    }

    pub fn captured_count(&self) -> usize {
        self.state.capture().seen_count()
    }

    pub fn ca_path(&self) -> &Path {
        self.state.ca().ca_path()
    }
}
