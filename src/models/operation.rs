use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{serde_as, TimestampMilliSeconds};
use uuid::Uuid;

use crate::error::SyncError;

/// A single described edit submitted by a client.
///
/// The payload is kept as raw JSON so the transport never needs to know
/// which edit kinds exist; the convergence engine parses it.
#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub op_id: Uuid,
    pub doc_id: String,
    pub author_id: String,
    pub base_version: u64,
    pub payload: Value,
    #[serde_as(as = "TimestampMilliSeconds<i64>")]
    pub timestamp: DateTime<Utc>,
}

/// An operation accepted into a document's log.
///
/// `sequence` is the version the document reaches once `edits` are applied,
/// and `edits` are expressed against the document at `sequence - 1`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedOperation {
    pub sequence: u64,
    pub operation: Operation,
    pub edits: Vec<Edit>,
}

/// Edit payloads a client may submit. Positions count chars in the
/// document as of the operation's base version.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EditRequest {
    Insert { position: usize, text: String },
    Delete { position: usize, length: usize },
    Replace { position: usize, length: usize, text: String },
}

const KNOWN_KINDS: [&str; 3] = ["insert", "delete", "replace"];

impl EditRequest {
    pub fn parse(payload: &Value) -> Result<Self, SyncError> {
        let kind = payload
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::UnsupportedOperation("payload has no 'kind'".to_string()))?;
        if !KNOWN_KINDS.contains(&kind) {
            return Err(SyncError::UnsupportedOperation(format!("unknown operation kind '{}'", kind)));
        }
        serde_json::from_value(payload.clone())
            .map_err(|e| SyncError::UnsupportedOperation(format!("malformed '{}' payload: {}", kind, e)))
    }

    /// Range of base-version chars this request removes, if any
    pub fn removed_range(&self) -> Option<(usize, usize)> {
        match self {
            EditRequest::Insert { .. } => None,
            EditRequest::Delete { position, length } | EditRequest::Replace { position, length, .. } => {
                Some((*position, *length))
            }
        }
    }

    /// Position and text this request inserts, if any
    pub fn inserted_text(&self) -> Option<(usize, &str)> {
        match self {
            EditRequest::Insert { position, text } | EditRequest::Replace { position, text, .. } => {
                Some((*position, text.as_str()))
            }
            EditRequest::Delete { .. } => None,
        }
    }
}

/// Primitive edit against a concrete document state
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Edit {
    Insert { position: usize, text: String },
    Delete { position: usize, length: usize },
}

impl Edit {
    pub fn apply(&self, content: &mut String) -> Result<(), SyncError> {
        let len = content.chars().count();
        match self {
            Edit::Insert { position, text } => {
                if *position > len {
                    return Err(out_of_range(*position, len));
                }
                let at = byte_offset(content, *position);
                content.insert_str(at, text);
            }
            Edit::Delete { position, length } => {
                if position + length > len {
                    return Err(out_of_range(position + length, len));
                }
                let start = byte_offset(content, *position);
                let end = byte_offset(content, position + length);
                content.replace_range(start..end, "");
            }
        }
        Ok(())
    }
}

/// Apply a resolved edit list in order
pub fn apply_edits(content: &mut String, edits: &[Edit]) -> Result<(), SyncError> {
    for edit in edits {
        edit.apply(content)?;
    }
    Ok(())
}

fn byte_offset(content: &str, char_pos: usize) -> usize {
    content
        .char_indices()
        .nth(char_pos)
        .map(|(i, _)| i)
        .unwrap_or(content.len())
}

fn out_of_range(position: usize, len: usize) -> SyncError {
    SyncError::UnsupportedOperation(format!("position {} is outside a document of {} chars", position, len))
}
