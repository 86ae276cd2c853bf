//! Public API for embedding the proxy
//!
//! The binary and the integration tests drive the proxy exclusively through
//! this module.

pub mod proxy_api;

pub use proxy_api::*;
