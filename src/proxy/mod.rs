//! HTTP/HTTPS proxy implementation
//!
//! This module contains the listener, the CONNECT dispatcher, TLS interception,
//! transparent tunnelling and request forwarding.

pub mod cert_manager;
pub mod forwarder;
pub mod http;
pub mod server;
pub mod tunnel;

use rustls::crypto::CryptoProvider;
use std::sync::Arc;

pub use server::*;

/// Crypto backend shared by the intercepting server side and the outbound client
pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}
