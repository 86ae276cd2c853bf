//! # GQL Proxy
//!
//! Local intercepting proxy that decrypts traffic for one target service and
//! records the GraphQL operations clients send to it.
//!
//! ## Features
//!
//! - HTTP/1.1 forward proxy with CONNECT support
//! - TLS interception for the configured domain via a per-run root CA
//! - Transparent tunnelling for every other host
//! - Capture of single and batched operations to JSON files and `operations.jsonl`
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    client (browser, app)                     │
//! ├──────────────────────────────────────────────────────────────┤
//! │                  ConnectionDispatcher (server)               │
//! │   ┌──────────────┐    ┌──────────────┐    ┌──────────────┐   │
//! │   │ TLS intercept│    │    Tunnel    │    │ Passthrough  │   │
//! │   └──────┬───────┘    └──────────────┘    └──────┬───────┘   │
//! │          │     ┌──────────────┐                  │           │
//! │          ├────▶│   Capture    │◀─────────────────┤           │
//! │          │     │  + Storage   │                  │           │
//! │          │     └──────────────┘                  │           │
//! │          └──────────────▶ Forwarder ◀────────────┘           │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod capture;
pub mod models;
pub mod proxy;
pub mod storage;
