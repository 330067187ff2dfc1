//! Newline-delimited JSON framing and message classification.

use super::config::DEFAULT_MAX_LINE_LENGTH;
use super::ElectrumError;
use serde_json::{json, Value};

/// Splits a byte stream on `\n`, keeping a trailing partial object buffered.
/// The partial object may not grow past `max_line` bytes.
#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    /// Bytes of `buf` already known to hold no newline.
    scanned: usize,
    max_line: usize,
}

impl Default for LineBuffer {
    fn default() -> Self { Self::with_limit(DEFAULT_MAX_LINE_LENGTH) }
}

impl LineBuffer {
    pub fn new() -> Self { Self::default() }
    pub fn with_limit(max_line: usize) -> Self { Self { buf: Vec::new(), scanned: 0, max_line } }

    /// Append a read and return every complete, non-empty line. Fails once a
    /// line exceeds the limit; the connection should then be dropped.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<String>, ElectrumError> {
        self.buf.extend_from_slice(data);
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buf[self.scanned..].iter().position(|&b| b == b'\n') {
            let end = self.scanned + offset;
            if end - start > self.max_line {
                return Err(self.too_long());
            }
            let text = String::from_utf8_lossy(&self.buf[start..end]);
            let text = text.trim();
            if !text.is_empty() {
                lines.push(text.to_string());
            }
            start = end + 1;
            self.scanned = start;
        }
        self.buf.drain(..start);
        self.scanned = self.buf.len();
        if self.buf.len() > self.max_line {
            return Err(self.too_long());
        }
        Ok(lines)
    }

    pub fn pending(&self) -> usize { self.buf.len() }

    fn too_long(&self) -> ElectrumError {
        ElectrumError::InvalidResponse(format!("line exceeds {} bytes", self.max_line))
    }
}

pub fn encode_request(id: u64, method: &str, params: &Value) -> String {
    let mut line = json!({ "id": id, "method": method, "params": params }).to_string();
    line.push('\n');
    line
}

/// Notification topics the client dispatches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    ScriptHash,
    Address,
    Headers,
    Other(String),
}

impl Topic {
    pub fn from_method(method: &str) -> Self {
        match method {
            "blockchain.scripthash.subscribe" => Topic::ScriptHash,
            "blockchain.address.subscribe" => Topic::Address,
            "blockchain.headers.subscribe" => Topic::Headers,
            other => Topic::Other(other.to_string()),
        }
    }
}

pub fn is_subscription(method: &str) -> bool { method.ends_with(".subscribe") }

#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response { id: u64, result: Result<Value, ElectrumError> },
    Notification { method: String, params: Value },
}

pub fn parse_incoming(line: &str) -> Result<Incoming, ElectrumError> {
    let mut value: Value = serde_json::from_str(line).map_err(|e| ElectrumError::InvalidResponse(e.to_string()))?;
    let obj = value
        .as_object_mut()
        .ok_or_else(|| ElectrumError::InvalidResponse(format!("not an object: {}", line)))?;

    if let Some(id) = obj.get("id").filter(|id| !id.is_null()) {
        let id = id
            .as_u64()
            .or_else(|| id.as_str().and_then(|s| s.parse().ok()))
            .ok_or_else(|| ElectrumError::InvalidResponse(format!("bad id: {}", id)))?;
        let result = match obj.remove("error").filter(|e| !e.is_null()) {
            Some(error) => Err(parse_error(error)),
            None => Ok(obj.remove("result").unwrap_or(Value::Null)),
        };
        return Ok(Incoming::Response { id, result });
    }

    match obj.remove("method") {
        Some(Value::String(method)) => Ok(Incoming::Notification { method, params: obj.remove("params").unwrap_or(Value::Null) }),
        _ => Err(ElectrumError::InvalidResponse(format!("neither response nor notification: {}", line))),
    }
}

/// `{code, message}` envelopes become structured errors; anything else is kept verbatim.
pub fn parse_error(error: Value) -> ElectrumError {
    match error {
        Value::Object(ref obj) if obj.contains_key("message") => ElectrumError::Server {
            code: obj.get("code").and_then(Value::as_i64),
            message: obj.get("message").and_then(Value::as_str).map(str::to_string).unwrap_or_else(|| error.to_string()),
        },
        Value::String(message) => ElectrumError::Server { code: None, message },
        other => ElectrumError::Server { code: None, message: other.to_string() },
    }
}
