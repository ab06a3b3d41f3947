//! Accessors for the engine-owned shadow rows.
//!
//! Everything here runs inside a critical section on the shared
//! connection; callers own transaction boundaries.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{Result, SyncError};
use crate::protocol::Op;

/// The client-info singleton.
#[derive(Debug, Clone)]
pub(crate) struct ClientInfo {
    pub user_id: String,
    pub source_id: String,
    pub last_server_seq_seen: i64,
}

pub(crate) fn client_info(conn: &Connection) -> Result<ClientInfo> {
    conn.query_row(
        "SELECT user_id, source_id, last_server_seq_seen FROM _sync_client_info WHERE id = 1",
        [],
        |r| {
            Ok(ClientInfo {
                user_id: r.get(0)?,
                source_id: r.get(1)?,
                last_server_seq_seen: r.get(2)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| SyncError::Schema("database is not bootstrapped".into()))
}

/// Advance the download cursor. Never moves backwards.
pub(crate) fn advance_cursor(conn: &Connection, seq: i64) -> Result<()> {
    conn.execute(
        "UPDATE _sync_client_info SET last_server_seq_seen = MAX(last_server_seq_seen, ?1)",
        params![seq],
    )?;
    Ok(())
}

/// One row of the outbound queue. `payload` keeps the exact stored text
/// so verdict processing can tell whether the row was coalesced while
/// the batch was in flight.
#[derive(Debug, Clone)]
pub(crate) struct PendingChange {
    pub change_id: i64,
    pub table_name: String,
    pub pk_uuid: String,
    pub op: Op,
    pub base_version: i64,
    pub payload: Option<String>,
}

impl PendingChange {
    pub fn payload_value(&self) -> Result<Option<serde_json::Value>> {
        match &self.payload {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }
}

fn row_to_pending(r: &rusqlite::Row<'_>) -> rusqlite::Result<PendingChange> {
    let op_str: String = r.get(3)?;
    Ok(PendingChange {
        change_id: r.get(0)?,
        table_name: r.get(1)?,
        pk_uuid: r.get(2)?,
        // The CHECK constraint keeps anything else out of the column.
        op: Op::from_str(&op_str).unwrap_or(Op::Update),
        base_version: r.get(4)?,
        payload: r.get(5)?,
    })
}

const PENDING_COLS: &str = "change_id, table_name, pk_uuid, op, base_version, payload";

/// Oldest `limit` pending changes in authoring order.
pub(crate) fn pending_batch(conn: &Connection, limit: u32) -> Result<Vec<PendingChange>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PENDING_COLS} FROM _sync_pending ORDER BY change_id ASC LIMIT ?1"
    ))?;
    let rows = stmt.query_map(params![limit], row_to_pending)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub(crate) fn pending_for(
    conn: &Connection,
    table: &str,
    pk: &str,
) -> Result<Option<PendingChange>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PENDING_COLS} FROM _sync_pending WHERE table_name = ?1 AND pk_uuid = ?2"
    ))?;
    Ok(stmt
        .query_row(params![table, pk], row_to_pending)
        .optional()?)
}

pub(crate) fn pending_count(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM _sync_pending", [], |r| r.get(0))?)
}

pub(crate) fn remove_pending(conn: &Connection, change_id: i64) -> Result<()> {
    conn.execute(
        "DELETE FROM _sync_pending WHERE change_id = ?1",
        params![change_id],
    )?;
    Ok(())
}

/// Acknowledge an applied upload. The pending row is removed only if it
/// still matches the uploaded snapshot; a row the application coalesced
/// while the batch was in flight is kept and rebased onto the new
/// version so the newer intent is retried.
///
/// Returns true when the row was removed.
pub(crate) fn ack_pending(
    conn: &Connection,
    snapshot: &PendingChange,
    new_version: i64,
) -> Result<bool> {
    let removed = conn.execute(
        "DELETE FROM _sync_pending
         WHERE change_id = ?1 AND op = ?2 AND payload IS ?3",
        params![snapshot.change_id, snapshot.op.as_str(), snapshot.payload],
    )?;
    if removed == 0 {
        conn.execute(
            "UPDATE _sync_pending SET base_version = ?2 WHERE change_id = ?1",
            params![snapshot.change_id, new_version],
        )?;
        tracing::debug!(
            change_id = snapshot.change_id,
            table = %snapshot.table_name,
            "pending row coalesced in flight, rebased instead of removed"
        );
    }
    Ok(removed > 0)
}

/// Rewrite a pending row after a conflict round: new base version and,
/// optionally, a merged payload. The op is normalised so the retry is
/// well-formed against the new base.
pub(crate) fn rebase_pending(
    conn: &Connection,
    change_id: i64,
    current_op: Op,
    new_base: i64,
    merged_payload: Option<&serde_json::Value>,
) -> Result<()> {
    let op = match (current_op, merged_payload) {
        // A resolver that supplies a payload wants the row kept alive.
        (Op::Delete, Some(_)) => Op::Update,
        // A creation rebased onto an existing server row is an update.
        (Op::Insert, _) if new_base > 0 => Op::Update,
        (op, _) => op,
    };
    match merged_payload {
        Some(p) => {
            conn.execute(
                "UPDATE _sync_pending SET op = ?2, base_version = ?3, payload = ?4
                 WHERE change_id = ?1",
                params![change_id, op.as_str(), new_base, p.to_string()],
            )?;
        }
        None => {
            conn.execute(
                "UPDATE _sync_pending SET op = ?2, base_version = ?3 WHERE change_id = ?1",
                params![change_id, op.as_str(), new_base],
            )?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RowMeta {
    pub server_version: i64,
    pub deleted: bool,
}

pub(crate) fn row_meta(conn: &Connection, table: &str, pk: &str) -> Result<Option<RowMeta>> {
    Ok(conn
        .query_row(
            "SELECT server_version, deleted FROM _sync_row_meta
             WHERE table_name = ?1 AND pk_uuid = ?2",
            params![table, pk],
            |r| {
                Ok(RowMeta {
                    server_version: r.get(0)?,
                    deleted: r.get::<_, i64>(1)? != 0,
                })
            },
        )
        .optional()?)
}

/// Upsert row metadata. `server_version` only ever moves forward.
pub(crate) fn advance_row_meta(
    conn: &Connection,
    table: &str,
    pk: &str,
    server_version: i64,
    deleted: bool,
) -> Result<()> {
    let now_ms = Utc::now().timestamp_millis();
    conn.execute(
        "INSERT INTO _sync_row_meta (table_name, pk_uuid, server_version, deleted, updated_ms)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(table_name, pk_uuid) DO UPDATE SET
           server_version = MAX(_sync_row_meta.server_version, excluded.server_version),
           deleted = excluded.deleted,
           updated_ms = excluded.updated_ms",
        params![table, pk, server_version, deleted as i64, now_ms],
    )?;
    Ok(())
}
