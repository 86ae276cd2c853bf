//! GraphQL capture engine
//!
//! Inspects buffered request bodies on their way upstream, decodes single or
//! batched operation envelopes, and records each one through [`CaptureStore`].
//! Nothing here can fail the request it observes: every error is swallowed and
//! at most reported under verbose logging.

use crate::models::CapturedOperation;
use crate::storage::CaptureStore;
use flate2::read::MultiGzDecoder;
use serde_json::value::RawValue;
use std::collections::HashSet;
use std::io::Read;
use std::sync::RwLock;

/// Upper bound on a decompressed body
const MAX_DECODED_BODY_BYTES: u64 = 32 * 1024 * 1024;

/// The parts of an intercepted request the engine looks at besides the body.
#[derive(Debug, Clone, Copy)]
pub struct CaptureRequest<'a> {
    pub url: &'a str,
    pub host: &'a str,
    pub content_encoding: Option<&'a str>,
}

pub struct CaptureEngine {
    marker: String,
    verbose: bool,
    store: CaptureStore,
    seen: RwLock<HashSet<String>>,
}

impl CaptureEngine {
    pub fn new(marker: impl Into<String>, verbose: bool, store: CaptureStore) -> Self {
        Self {
            marker: marker.into(),
            verbose,
            store,
            seen: RwLock::new(HashSet::new()),
        }
    }

    /// Whether a request with this body is operation traffic at all.
    pub fn applies_to(&self, request: &CaptureRequest<'_>, body: &[u8]) -> bool {
        !body.is_empty()
            && (request.url.contains(&self.marker) || request.host.contains(&self.marker))
    }

    /// Record every operation in `body` and return what was recorded.
    pub async fn capture(
        &self,
        request: &CaptureRequest<'_>,
        body: &[u8],
    ) -> Vec<CapturedOperation> {
        if !self.applies_to(request, body) {
            return Vec::new();
        }

        let elements = match decode_body(body, request.content_encoding) {
            Ok(elements) => elements,
            Err(err) => {
                if self.verbose {
                    tracing::debug!("Failed to parse GQL body from {}: {}", request.url, err);
                }
                return Vec::new();
            }
        };

        let mut recorded = Vec::with_capacity(elements.len());
        for raw in elements {
            let Some(mut op) = CapturedOperation::from_raw(raw) else {
                if self.verbose {
                    tracing::debug!("Skipping non-object GQL element from {}", request.url);
                }
                continue;
            };
            op.first_seen = self.mark_seen(&op.name);
            self.persist(&op).await;
            self.log_capture(&op);
            recorded.push(op);
        }
        recorded
    }

    /// Names observed so far, sorted.
    pub fn seen_operations(&self) -> Vec<String> {
        let seen = self.seen.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut names: Vec<String> = seen.iter().cloned().collect();
        names.sort();
        names
    }

    pub fn seen_count(&self) -> usize {
        self.seen
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Returns true the first time `name` is seen by this engine.
    fn mark_seen(&self, name: &str) -> bool {
        let mut seen = self
            .seen
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        seen.insert(name.to_string())
    }

    async fn persist(&self, op: &CapturedOperation) {
        if let Err(err) = self.store.write_operation_file(op).await {
            if self.verbose {
                tracing::warn!("Failed to write capture file for {}: {}", op.name, err);
            }
        }
        if let Err(err) = self.store.append_operation_log(op).await {
            if self.verbose {
                tracing::warn!("Failed to open operations log: {}", err);
            }
        }
    }

    fn log_capture(&self, op: &CapturedOperation) {
        tracing::info!("{}", op.log_line());
        if self.verbose {
            if let Some(variables) = &op.variables {
                if let Ok(json) = serde_json::to_string(variables) {
                    tracing::info!("  Variables: {}", json);
                }
            }
        }
    }
}

/// Split a body into batch elements. A lone value is a batch of one.
fn decode_body(body: &[u8], content_encoding: Option<&str>) -> anyhow::Result<Vec<Box<RawValue>>> {
    let inflated;
    let body = if content_encoding.is_some_and(|enc| enc.trim().eq_ignore_ascii_case("gzip")) {
        inflated = gunzip(body)?;
        inflated.as_slice()
    } else {
        body
    };

    if let Ok(batch) = serde_json::from_slice::<Vec<Box<RawValue>>>(body) {
        return Ok(batch);
    }
    let single = serde_json::from_slice::<Box<RawValue>>(body)?;
    Ok(vec![single])
}

fn gunzip(body: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut decoded = Vec::new();
    MultiGzDecoder::new(body)
        .take(MAX_DECODED_BODY_BYTES)
        .read_to_end(&mut decoded)?;
    Ok(decoded)
}
