//! Per-operation decoders for studio responses.
//!
//! Artifact rows share one positional layout across creation, listing and
//! revision: `[artifact_id, title, type_code, sources, status_code, ..]`, with
//! the flashcards/quiz options blob at index 9.

use crate::artifact::{ArtifactKind, ArtifactStatus};
use nlmkit_core::{Error, Result};
use nlmkit_rpc::response::{opt_str_at, str_at};
use nlmkit_rpc::RpcResponse;
use serde_json::Value;

pub const CREATE_ARTIFACT: &str = "R7cb6c";
pub const LIST_ARTIFACTS: &str = "gArtLc";
pub const REVISE_SLIDE_DECK: &str = "KmcKPe";

const OPTIONS_INDEX: usize = 9;

/// One artifact as reported by the service.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactRow {
    pub artifact_id: String,
    pub title: Option<String>,
    pub kind: Option<ArtifactKind>,
    pub status: ArtifactStatus,
}

pub fn artifact_row(operation_id: &str, row: &Value) -> Result<ArtifactRow> {
    let artifact_id = str_at(operation_id, row, &[0])?;
    if artifact_id.is_empty() {
        return Err(Error::malformed(operation_id, "artifact row has an empty id"));
    }
    let title = opt_str_at(operation_id, row, &[1])?
        .filter(|t| !t.is_empty())
        .map(str::to_string);
    let kind = row
        .get(2)
        .and_then(Value::as_i64)
        .map(|code| ArtifactKind::from_code(code, row.get(OPTIONS_INDEX)));
    let status = row
        .get(4)
        .and_then(Value::as_i64)
        .map(ArtifactStatus::from_code)
        .unwrap_or(ArtifactStatus::Unknown);
    Ok(ArtifactRow {
        artifact_id: artifact_id.to_string(),
        title,
        kind,
        status,
    })
}

/// `[[row]]`
pub fn created_artifact(response: &RpcResponse) -> Result<ArtifactRow> {
    artifact_row(response.operation_id(), response.get(&[0])?)
}

/// `[[row, row, ..]]`; an empty notebook may answer `[]`, `[null]` or null.
pub fn artifact_listing(response: &RpcResponse) -> Result<Vec<ArtifactRow>> {
    let op = response.operation_id();
    let rows = match response.payload() {
        Value::Null => return Ok(Vec::new()),
        Value::Array(outer) => match outer.first() {
            None | Some(Value::Null) => return Ok(Vec::new()),
            Some(Value::Array(rows)) => rows,
            Some(_) => return Err(Error::malformed(op, "artifact listing is not an array")),
        },
        _ => return Err(Error::malformed(op, "expected array payload")),
    };
    rows.iter()
        .filter(|row| !row.is_null())
        .map(|row| artifact_row(op, row))
        .collect()
}

/// Same shape as creation; the service must mint a new id.
pub fn revised_artifact(response: &RpcResponse, origin_artifact_id: &str) -> Result<ArtifactRow> {
    let row = created_artifact(response)?;
    if row.artifact_id == origin_artifact_id {
        return Err(Error::malformed(
            response.operation_id(),
            format!("revision echoed the source artifact id {}", origin_artifact_id),
        ));
    }
    Ok(row)
}
