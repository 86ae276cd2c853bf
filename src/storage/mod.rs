//! Capture artifact storage
//!
//! Every captured operation is written twice: as its own pretty-printed JSON
//! file and as one line of the combined `operations.jsonl` log.

use crate::models::CapturedOperation;
use chrono::{DateTime, Local, SecondsFormat};
use serde::Serialize;
use serde_json::ser::{CompactFormatter, Formatter, PrettyFormatter};
use serde_json::value::RawValue;
use std::io;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;

pub const OPERATIONS_LOG_FILE: &str = "operations.jsonl";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OperationLogEntry<'a> {
    timestamp: String,
    operation_name: &'a str,
    request: &'a RawValue,
}

#[derive(Debug, Clone)]
pub struct CaptureStore {
    output_dir: PathBuf,
}

impl CaptureStore {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn operations_log_path(&self) -> PathBuf {
        self.output_dir.join(OPERATIONS_LOG_FILE)
    }

    /// Write `<name>_<YYYYMMDD_HHMMSS>.json`. A second capture of the same
    /// operation within the same second replaces the earlier file.
    pub async fn write_operation_file(&self, op: &CapturedOperation) -> io::Result<PathBuf> {
        let path = self
            .output_dir
            .join(operation_file_name(&op.name, &op.captured_at));
        fs::write(&path, pretty_json(&op.raw)).await?;
        Ok(path)
    }

    /// Append one line to `operations.jsonl`.
    ///
    /// Only failing to open the log is reported; the write itself is best effort.
    pub async fn append_operation_log(&self, op: &CapturedOperation) -> io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.operations_log_path())
            .await?;

        let compact = compact_json(&op.raw);
        let entry = OperationLogEntry {
            timestamp: op.captured_at.to_rfc3339_opts(SecondsFormat::Secs, false),
            operation_name: &op.name,
            request: compact.as_deref().unwrap_or(&*op.raw),
        };
        if let Ok(mut line) = serde_json::to_vec(&entry) {
            line.push(b'\n');
            let _ = file.write_all(&line).await;
            let _ = file.flush().await;
        }
        Ok(())
    }
}

pub fn operation_file_name(name: &str, at: &DateTime<Local>) -> String {
    format!(
        "{}_{}.json",
        sanitize_filename(name),
        at.format("%Y%m%d_%H%M%S")
    )
}

/// Replace characters that are unsafe in file names with `_`.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect()
}

/// Two-space indented rendition of `raw`; raw bytes if it cannot be re-laid.
fn pretty_json(raw: &RawValue) -> Vec<u8> {
    relayout(raw.get(), PrettyFormatter::new())
        .unwrap_or_else(|_| raw.get().as_bytes().to_vec())
}

/// `raw` with insignificant whitespace removed, as a single line.
fn compact_json(raw: &RawValue) -> Option<Box<RawValue>> {
    let bytes = relayout(raw.get(), CompactFormatter).ok()?;
    let text = String::from_utf8(bytes).ok()?;
    RawValue::from_string(text).ok()
}

enum Frame {
    Object { first: bool, expect_key: bool },
    Array { first: bool },
}

/// Re-lay already validated JSON text through a serde_json [`Formatter`].
///
/// Every token is copied as written. Numbers keep their digits and exponent,
/// strings keep their escapes and repeated keys stay repeated; only the
/// whitespace between tokens changes.
fn relayout<F: Formatter>(json: &str, mut fmt: F) -> io::Result<Vec<u8>> {
    let bytes = json.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() + bytes.len() / 2);
    let mut stack: Vec<Frame> = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b' ' | b'\t' | b'\n' | b'\r' | b',' => i += 1,
            b':' => {
                fmt.begin_object_value(&mut out)?;
                i += 1;
            }
            b'{' => {
                before_value(&mut stack, &mut fmt, &mut out)?;
                fmt.begin_object(&mut out)?;
                stack.push(Frame::Object {
                    first: true,
                    expect_key: true,
                });
                i += 1;
            }
            b'[' => {
                before_value(&mut stack, &mut fmt, &mut out)?;
                fmt.begin_array(&mut out)?;
                stack.push(Frame::Array { first: true });
                i += 1;
            }
            b'}' => {
                stack.pop();
                fmt.end_object(&mut out)?;
                after_value(&mut stack, &mut fmt, &mut out)?;
                i += 1;
            }
            b']' => {
                stack.pop();
                fmt.end_array(&mut out)?;
                after_value(&mut stack, &mut fmt, &mut out)?;
                i += 1;
            }
            b'"' => {
                let end = string_end(bytes, i)?;
                let token = &json[i..end];
                if let Some(first) = begin_key(&mut stack) {
                    fmt.begin_object_key(&mut out, first)?;
                    fmt.write_raw_fragment(&mut out, token)?;
                    fmt.end_object_key(&mut out)?;
                } else {
                    before_value(&mut stack, &mut fmt, &mut out)?;
                    fmt.write_raw_fragment(&mut out, token)?;
                    after_value(&mut stack, &mut fmt, &mut out)?;
                }
                i = end;
            }
            _ => {
                let end = bytes[i..]
                    .iter()
                    .position(|b| matches!(b, b',' | b'}' | b']' | b' ' | b'\t' | b'\n' | b'\r'))
                    .map_or(bytes.len(), |n| i + n);
                before_value(&mut stack, &mut fmt, &mut out)?;
                fmt.write_raw_fragment(&mut out, &json[i..end])?;
                after_value(&mut stack, &mut fmt, &mut out)?;
                i = end;
            }
        }
    }

    if !stack.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "unbalanced JSON"));
    }
    Ok(out)
}

/// When the innermost object is waiting for a key, consume that slot and
/// report whether it is the object's first key.
fn begin_key(stack: &mut [Frame]) -> Option<bool> {
    match stack.last_mut() {
        Some(Frame::Object { first, expect_key }) if *expect_key => {
            let was_first = *first;
            *first = false;
            *expect_key = false;
            Some(was_first)
        }
        _ => None,
    }
}

fn before_value<F: Formatter>(stack: &mut [Frame], fmt: &mut F, out: &mut Vec<u8>) -> io::Result<()> {
    if let Some(Frame::Array { first }) = stack.last_mut() {
        fmt.begin_array_value(out, *first)?;
        *first = false;
    }
    Ok(())
}

fn after_value<F: Formatter>(stack: &mut [Frame], fmt: &mut F, out: &mut Vec<u8>) -> io::Result<()> {
    match stack.last_mut() {
        Some(Frame::Object { expect_key, .. }) => {
            fmt.end_object_value(out)?;
            *expect_key = true;
        }
        Some(Frame::Array { .. }) => fmt.end_array_value(out)?,
        None => {}
    }
    Ok(())
}

/// Index just past the closing quote of the string starting at `start`.
fn string_end(bytes: &[u8], start: usize) -> io::Result<usize> {
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return Ok(i + 1),
            _ => i += 1,
        }
    }
    Err(io::Error::new(io::ErrorKind::InvalidData, "unterminated string"))
}
