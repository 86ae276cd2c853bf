//! Command-line entry point.
//!
//! Usage:
//! ```text
//! gqlproxy --listen 127.0.0.1:19808 --output-dir ./gql_captures -v
//! ```

use std::path::PathBuf;

use clap::Parser;
use gqlproxy::api::{
    init_logging, GqlProxy, ProxyConfig, DEFAULT_CAPTURE_MARKER, DEFAULT_INTERCEPT_DOMAIN,
    DEFAULT_LISTEN_ADDR, DEFAULT_OUTPUT_DIR, DEFAULT_UPSTREAM_URL,
};

#[derive(Parser, Debug)]
#[command(name = "gqlproxy")]
#[command(version, about, long_about = None)]
#[command(about = "Intercept HTTPS traffic for one service and capture its GraphQL operations")]
struct Args {
    /// Address to listen on
    #[arg(long = "listen", value_name = "ADDR", default_value = DEFAULT_LISTEN_ADDR)]
    listen: String,

    /// Directory for ca.crt, captured operations and proxy.log
    #[arg(long = "output-dir", value_name = "DIR", default_value = DEFAULT_OUTPUT_DIR)]
    output_dir: PathBuf,

    /// Log variables, parse failures and TLS handshake failures
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Decrypt CONNECT traffic for this domain and its subdomains
    #[arg(long = "intercept-domain", value_name = "DOMAIN", default_value = DEFAULT_INTERCEPT_DOMAIN)]
    intercept_domain: String,

    /// Capture request bodies whose URL or host contains this text
    #[arg(long = "capture-marker", value_name = "TEXT", default_value = DEFAULT_CAPTURE_MARKER)]
    capture_marker: String,

    /// Destination for plain HTTP requests sent straight to the proxy
    #[arg(long = "upstream-url", value_name = "URL", default_value = DEFAULT_UPSTREAM_URL)]
    upstream_url: String,
}

impl From<Args> for ProxyConfig {
    fn from(args: Args) -> Self {
        Self {
            listen_addr: args.listen,
            output_dir: args.output_dir,
            verbose: args.verbose,
            intercept_domain: args.intercept_domain,
            capture_marker: args.capture_marker,
            upstream_url: args.upstream_url,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _guard = init_logging(&args.output_dir, args.verbose)?;

    let proxy = GqlProxy::new(ProxyConfig::from(args))?;
    proxy.run().await
}
