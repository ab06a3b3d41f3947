//! Wire types for the sync endpoints.
//!
//! Field names are part of the server contract and must not be renamed.

use serde::{Deserialize, Serialize};

/// Logical operation type carried by pending changes and server records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Op {
    Insert,
    Update,
    Delete,
}

impl Op {
    pub fn as_str(self) -> &'static str {
        match self {
            Op::Insert => "INSERT",
            Op::Update => "UPDATE",
            Op::Delete => "DELETE",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "INSERT" => Some(Op::Insert),
            "UPDATE" => Some(Op::Update),
            "DELETE" => Some(Op::Delete),
            _ => None,
        }
    }
}

/// One locally authored change inside an upload batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeUpload {
    pub change_id: i64,
    pub table: String,
    pub op: Op,
    pub pk: String,
    pub base_version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// POST /sync/upload request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRequest {
    pub user_id: String,
    pub source_id: String,
    pub changes: Vec<ChangeUpload>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    Applied,
    Conflict,
    Invalid,
    MaterializeError,
}

/// Per-change outcome returned by the server, positionally matching the
/// uploaded batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub status: VerdictStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_server_version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_row: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub verdicts: Vec<Verdict>,
}

/// One record from the server change stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerChange {
    pub seq: i64,
    pub table: String,
    pub op: Op,
    pub pk: String,
    pub server_version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub source_id: String,
}

/// GET /sync/download response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadResponse {
    pub changes: Vec<ServerChange>,
    pub next_after: i64,
}

/// One row from the snapshot stream. A `null` payload marks a tombstone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub table: String,
    pub pk: String,
    pub server_version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// GET /sync/snapshot response body. `watermark_seq` is the consistent
/// cutoff of the snapshot window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub rows: Vec<SnapshotRow>,
    #[serde(default)]
    pub next_cursor: Option<String>,
    pub watermark_seq: i64,
}
