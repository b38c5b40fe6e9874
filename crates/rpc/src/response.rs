//! Response side of the batch-execution wire format.
//!
//! Bodies look like:
//!
//! ```text
//! )]}'
//!
//! 104
//! [["wrb.fr","wXbhsf","[[\"nb-1\"]]",null,null,null,"generic"],["di",42]]
//! 25
//! [["e",4,null,null,141]]
//! ```

use nlmkit_core::{Error, Result, RpcStatus};
use serde_json::Value;
use std::fmt::Write as _;

const ANTI_JSON_PREFIX: &str = ")]}'";
const RESULT_TAG: &str = "wrb.fr";
const ERROR_TAG: &str = "er";

/// RPC codes meaning the session was not accepted.
pub const RPC_UNAUTHENTICATED: i64 = 16;
pub const RPC_PERMISSION_DENIED: i64 = 7;

/// True for statuses that should trigger a credential refresh.
pub fn is_auth_rejection(status: &RpcStatus) -> bool {
    match status {
        RpcStatus::Http(code) => *code == 401 || *code == 403,
        RpcStatus::Rpc(code) => *code == RPC_UNAUTHENTICATED || *code == RPC_PERMISSION_DENIED,
        RpcStatus::Rejected => false,
    }
}

/// Split a chunked body into its JSON chunks.
pub fn parse_chunks(body: &str) -> Vec<Value> {
    let body = body.trim_start();
    let body = body.strip_prefix(ANTI_JSON_PREFIX).unwrap_or(body);

    let mut chunks = Vec::new();
    let mut pending = String::new();
    for line in body.lines() {
        let trimmed = line.trim();
        if pending.is_empty() {
            if trimmed.is_empty() || trimmed.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(v) => chunks.push(v),
                Err(_) => pending.push_str(line),
            }
        } else {
            // A chunk spread over several lines.
            pending.push('\n');
            pending.push_str(line);
            if let Ok(v) = serde_json::from_str::<Value>(&pending) {
                chunks.push(v);
                pending.clear();
            }
        }
    }
    chunks
}

fn entries(chunks: &[Value]) -> impl Iterator<Item = &Vec<Value>> {
    chunks.iter().flat_map(|chunk| {
        let items: Vec<&Vec<Value>> = match chunk.as_array() {
            Some(arr) if arr.first().map(|v| v.is_string()).unwrap_or(false) => vec![arr],
            Some(arr) => arr.iter().filter_map(|v| v.as_array()).collect(),
            None => Vec::new(),
        };
        items
    })
}

fn error_code(descriptor: &Value) -> Option<i64> {
    match descriptor {
        Value::Number(n) => n.as_i64(),
        Value::Array(items) => items.first().and_then(error_code),
        _ => None,
    }
}

/// Decode the payload for `operation_id` out of a raw response body.
pub fn decode_response(operation_id: &str, body: &str) -> Result<RpcResponse> {
    let chunks = parse_chunks(body);
    if chunks.is_empty() {
        return Err(Error::malformed(operation_id, "no JSON chunks in response"));
    }

    let mut rejected = false;
    for entry in entries(&chunks) {
        match entry.first().and_then(|v| v.as_str()) {
            Some(RESULT_TAG) if entry.get(1).and_then(|v| v.as_str()) == Some(operation_id) => {
                return match entry.get(2) {
                    Some(Value::String(raw)) => {
                        let payload = serde_json::from_str(raw).map_err(|e| {
                            Error::malformed(operation_id, format!("payload is not JSON: {}", e))
                        })?;
                        Ok(RpcResponse::new(operation_id, payload))
                    }
                    Some(Value::Null) | None => match entry.get(5).and_then(error_code) {
                        Some(code) => Err(Error::Rpc {
                            operation_id: operation_id.to_string(),
                            status: RpcStatus::Rpc(code),
                        }),
                        None => Ok(RpcResponse::new(operation_id, Value::Null)),
                    },
                    Some(other) => Err(Error::malformed(
                        operation_id,
                        format!("payload has unexpected type: {}", type_name(other)),
                    )),
                };
            }
            Some(ERROR_TAG) => rejected = true,
            _ => {}
        }
    }

    if rejected {
        return Err(Error::Rpc {
            operation_id: operation_id.to_string(),
            status: RpcStatus::Rejected,
        });
    }
    Err(Error::malformed(
        operation_id,
        "no result entry for this operation",
    ))
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn render_path(path: &[usize]) -> String {
    let mut s = String::from("[");
    for (i, idx) in path.iter().enumerate() {
        if i > 0 {
            s.push_str(", ");
        }
        let _ = write!(s, "{}", idx);
    }
    s.push(']');
    s
}

/// Walk `path` through nested arrays.
pub fn value_at<'a>(operation_id: &str, root: &'a Value, path: &[usize]) -> Result<&'a Value> {
    let mut current = root;
    for (depth, idx) in path.iter().enumerate() {
        let arr = current.as_array().ok_or_else(|| {
            Error::malformed(
                operation_id,
                format!(
                    "expected array at {}, found {}",
                    render_path(&path[..depth]),
                    type_name(current)
                ),
            )
        })?;
        current = arr.get(*idx).ok_or_else(|| {
            Error::malformed(
                operation_id,
                format!(
                    "index {} out of range at {} (len {})",
                    idx,
                    render_path(&path[..depth]),
                    arr.len()
                ),
            )
        })?;
    }
    Ok(current)
}

pub fn str_at<'a>(operation_id: &str, root: &'a Value, path: &[usize]) -> Result<&'a str> {
    let v = value_at(operation_id, root, path)?;
    v.as_str().ok_or_else(|| {
        Error::malformed(
            operation_id,
            format!("expected string at {}, found {}", render_path(path), type_name(v)),
        )
    })
}

/// Like [`str_at`] but a null (or missing trailing) slot is `None`.
pub fn opt_str_at<'a>(operation_id: &str, root: &'a Value, path: &[usize]) -> Result<Option<&'a str>> {
    let Some((last, parent_path)) = path.split_last() else {
        return match root {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s.as_str())),
            other => Err(Error::malformed(
                operation_id,
                format!("expected string at [], found {}", type_name(other)),
            )),
        };
    };
    let parent = value_at(operation_id, root, parent_path)?;
    let arr = parent.as_array().ok_or_else(|| {
        Error::malformed(
            operation_id,
            format!("expected array at {}, found {}", render_path(parent_path), type_name(parent)),
        )
    })?;
    match arr.get(*last) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(Error::malformed(
            operation_id,
            format!("expected string at {}, found {}", render_path(path), type_name(other)),
        )),
    }
}

pub fn i64_at(operation_id: &str, root: &Value, path: &[usize]) -> Result<i64> {
    let v = value_at(operation_id, root, path)?;
    v.as_i64().ok_or_else(|| {
        Error::malformed(
            operation_id,
            format!("expected integer at {}, found {}", render_path(path), type_name(v)),
        )
    })
}

pub fn array_at<'a>(operation_id: &str, root: &'a Value, path: &[usize]) -> Result<&'a Vec<Value>> {
    let v = value_at(operation_id, root, path)?;
    v.as_array().ok_or_else(|| {
        Error::malformed(
            operation_id,
            format!("expected array at {}, found {}", render_path(path), type_name(v)),
        )
    })
}

/// Decoded payload of one operation with bounds-checked positional access.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponse {
    operation_id: String,
    payload: Value,
}

impl RpcResponse {
    pub fn new(operation_id: impl Into<String>, payload: Value) -> Self {
        Self {
            operation_id: operation_id.into(),
            payload,
        }
    }

    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn into_payload(self) -> Value {
        self.payload
    }

    pub fn get(&self, path: &[usize]) -> Result<&Value> {
        value_at(&self.operation_id, &self.payload, path)
    }

    pub fn str_at(&self, path: &[usize]) -> Result<&str> {
        str_at(&self.operation_id, &self.payload, path)
    }

    pub fn opt_str_at(&self, path: &[usize]) -> Result<Option<&str>> {
        opt_str_at(&self.operation_id, &self.payload, path)
    }

    pub fn i64_at(&self, path: &[usize]) -> Result<i64> {
        i64_at(&self.operation_id, &self.payload, path)
    }

    pub fn array_at(&self, path: &[usize]) -> Result<&Vec<Value>> {
        array_at(&self.operation_id, &self.payload, path)
    }
}
