//! Shadow-table bootstrap and trigger-driven change capture.
//!
//! Three metadata tables live next to the business tables:
//!
//! - `_sync_client_info`: singleton identity row, change-id allocator,
//!   download cursor and the `apply_mode` trigger guard.
//! - `_sync_row_meta`: per-row last acknowledged server version and
//!   tombstone flag. Rows are never deleted; tombstones persist until a
//!   resurrecting insert clears them.
//! - `_sync_pending`: the outbound queue, at most one row per
//!   `(table_name, pk_uuid)`.
//!
//! Each synced table gets three AFTER triggers whose bodies are guarded
//! by `apply_mode = 0`, so replaying server state never re-captures.

use rusqlite::Connection;
use rusqlite::types::ValueRef;

use crate::error::{Result, SyncError};

/// Declaration of a table to be synchronised.
///
/// Without an explicit key the first primary-key column (in index
/// order) becomes the sync key.
#[derive(Debug, Clone)]
pub struct SyncTable {
    pub name: String,
    pub key: Option<String>,
}

impl SyncTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: None,
        }
    }

    pub fn with_key(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: Some(key.into()),
        }
    }
}

/// A declared table resolved against the live schema.
#[derive(Debug, Clone)]
pub(crate) struct TablePlan {
    pub name: String,
    pub key: String,
    /// All columns in declaration order, key included.
    pub columns: Vec<String>,
}

const SHADOW_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS _sync_client_info (
id INTEGER PRIMARY KEY CHECK (id = 1),
user_id TEXT NOT NULL,
source_id TEXT NOT NULL,
next_change_id INTEGER NOT NULL DEFAULT 1,
last_server_seq_seen INTEGER NOT NULL DEFAULT 0,
apply_mode INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS _sync_row_meta (
table_name TEXT NOT NULL,
pk_uuid TEXT NOT NULL,
server_version INTEGER NOT NULL DEFAULT 0,
deleted INTEGER NOT NULL DEFAULT 0,
updated_ms INTEGER NOT NULL DEFAULT 0,
PRIMARY KEY (table_name, pk_uuid)
);

CREATE TABLE IF NOT EXISTS _sync_pending (
change_id INTEGER PRIMARY KEY,
table_name TEXT NOT NULL,
pk_uuid TEXT NOT NULL,
op TEXT NOT NULL CHECK (op IN ('INSERT','UPDATE','DELETE')),
base_version INTEGER NOT NULL DEFAULT 0,
payload TEXT,
UNIQUE (table_name, pk_uuid)
);
"#;

/// Make the database ready for sync. Idempotent; re-running refreshes
/// the identity singleton and recreates triggers but enqueues nothing
/// for rows that already have metadata.
pub(crate) fn bootstrap(
    conn: &Connection,
    user_id: &str,
    source_id: &str,
    tables: &[SyncTable],
) -> Result<Vec<TablePlan>> {
    // WAL cannot be switched on from inside a transaction.
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;

    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(SHADOW_DDL)?;

    tx.execute(
        "INSERT INTO _sync_client_info (id, user_id, source_id) VALUES (1, ?1, ?2)
         ON CONFLICT(id) DO UPDATE SET user_id = excluded.user_id, source_id = excluded.source_id",
        rusqlite::params![user_id, source_id],
    )?;

    let mut plans = Vec::with_capacity(tables.len());
    for decl in tables {
        let plan = resolve_table(&tx, decl)?;
        install_triggers(&tx, &plan)?;
        let backfilled = backfill(&tx, &plan)?;
        if backfilled > 0 {
            tracing::info!(table = %plan.name, rows = backfilled, "backfilled pre-existing rows");
        }
        plans.push(plan);
    }

    tx.commit()?;
    tracing::debug!(user_id, source_id, tables = plans.len(), "sync schema ready");
    Ok(plans)
}

/// Check the declared table against `pragma_table_info` and pick its
/// sync key.
fn resolve_table(conn: &Connection, decl: &SyncTable) -> Result<TablePlan> {
    // (name, pk index) in declaration order; pk index 0 = not part of the key.
    let mut stmt =
        conn.prepare("SELECT name, pk FROM pragma_table_info(?1) ORDER BY cid")?;
    let cols = stmt
        .query_map([&decl.name], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    if cols.is_empty() {
        return Err(SyncError::Schema(format!(
            "table {:?} does not exist",
            decl.name
        )));
    }

    let key = match &decl.key {
        Some(k) => {
            if !cols.iter().any(|(name, _)| name == k) {
                return Err(SyncError::Schema(format!(
                    "table {:?} has no column {:?}",
                    decl.name, k
                )));
            }
            k.clone()
        }
        None => cols
            .iter()
            .filter(|(_, pk)| *pk > 0)
            .min_by_key(|(_, pk)| *pk)
            .map(|(name, _)| name.clone())
            .ok_or_else(|| {
                SyncError::Schema(format!("table {:?} has no primary key", decl.name))
            })?,
    };

    Ok(TablePlan {
        name: decl.name.clone(),
        key,
        columns: cols.into_iter().map(|(name, _)| name).collect(),
    })
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn sql_str(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Canonical textual form of a sync key inside trigger SQL. Must stay a
/// pure function of the raw key bytes and agree with [`canonical_pk`].
fn canon_expr(row: &str, col: &str) -> String {
    let c = format!("{row}.{}", quote_ident(col));
    format!("CASE WHEN typeof({c}) = 'blob' THEN lower(hex({c})) ELSE CAST({c} AS TEXT) END")
}

/// `json_object(...)` over every declared column of the row. The key
/// column contributes its canonical text so the wire never carries raw
/// key bytes.
fn payload_expr(plan: &TablePlan, row: &str) -> String {
    let parts: Vec<String> = plan
        .columns
        .iter()
        .map(|col| {
            let value = if *col == plan.key {
                canon_expr(row, col)
            } else {
                format!("{row}.{}", quote_ident(col))
            };
            format!("{}, {}", sql_str(col), value)
        })
        .collect();
    format!("json_object({})", parts.join(", "))
}

const NOW_MS: &str = "(CAST(strftime('%s','now') AS INTEGER) * 1000)";

/// Install the three change-capture triggers for one table. Existing
/// triggers are replaced so payload column lists track the live schema.
fn install_triggers(conn: &Connection, plan: &TablePlan) -> Result<()> {
    let table = &plan.name;
    let tbl_lit = sql_str(table);
    let tbl_ident = quote_ident(table);
    let pk_new = canon_expr("NEW", &plan.key);
    let pk_old = canon_expr("OLD", &plan.key);
    let payload_new = payload_expr(plan, "NEW");

    let insert_trigger = format!(
        r#"
DROP TRIGGER IF EXISTS "_sync_{table}_ai";
CREATE TRIGGER "_sync_{table}_ai" AFTER INSERT ON {tbl_ident}
WHEN (SELECT apply_mode FROM _sync_client_info) = 0
BEGIN
INSERT INTO _sync_row_meta (table_name, pk_uuid, server_version, deleted, updated_ms)
VALUES ({tbl_lit}, {pk_new}, 0, 0, {NOW_MS})
ON CONFLICT(table_name, pk_uuid) DO UPDATE SET deleted = 0, updated_ms = excluded.updated_ms;

INSERT INTO _sync_pending (change_id, table_name, pk_uuid, op, base_version, payload)
VALUES (
(SELECT next_change_id FROM _sync_client_info),
{tbl_lit}, {pk_new}, 'INSERT',
COALESCE((SELECT server_version FROM _sync_row_meta
WHERE table_name = {tbl_lit} AND pk_uuid = {pk_new}), 0),
{payload_new}
)
ON CONFLICT(table_name, pk_uuid) DO UPDATE SET
op = CASE _sync_pending.op WHEN 'DELETE' THEN 'UPDATE' ELSE _sync_pending.op END,
payload = excluded.payload;

UPDATE _sync_client_info SET next_change_id = next_change_id + 1;
END;
"#
    );

    let update_trigger = format!(
        r#"
DROP TRIGGER IF EXISTS "_sync_{table}_au";
CREATE TRIGGER "_sync_{table}_au" AFTER UPDATE ON {tbl_ident}
WHEN (SELECT apply_mode FROM _sync_client_info) = 0
BEGIN
INSERT INTO _sync_row_meta (table_name, pk_uuid, server_version, deleted, updated_ms)
VALUES ({tbl_lit}, {pk_new}, 0, 0, {NOW_MS})
ON CONFLICT(table_name, pk_uuid) DO NOTHING;

INSERT INTO _sync_pending (change_id, table_name, pk_uuid, op, base_version, payload)
VALUES (
(SELECT next_change_id FROM _sync_client_info),
{tbl_lit}, {pk_new}, 'UPDATE',
COALESCE((SELECT server_version FROM _sync_row_meta
WHERE table_name = {tbl_lit} AND pk_uuid = {pk_new}), 0),
{payload_new}
)
ON CONFLICT(table_name, pk_uuid) DO UPDATE SET payload = excluded.payload;

UPDATE _sync_client_info SET next_change_id = next_change_id + 1;
END;
"#
    );

    // An INSERT still pending means the row never reached the server;
    // deleting it locally cancels the whole lineage instead of
    // enqueueing a DELETE. The guarded upsert must run before the
    // pending INSERT is removed.
    let delete_trigger = format!(
        r#"
DROP TRIGGER IF EXISTS "_sync_{table}_ad";
CREATE TRIGGER "_sync_{table}_ad" AFTER DELETE ON {tbl_ident}
WHEN (SELECT apply_mode FROM _sync_client_info) = 0
BEGIN
INSERT INTO _sync_pending (change_id, table_name, pk_uuid, op, base_version, payload)
SELECT
(SELECT next_change_id FROM _sync_client_info),
{tbl_lit}, {pk_old}, 'DELETE',
COALESCE((SELECT server_version FROM _sync_row_meta
WHERE table_name = {tbl_lit} AND pk_uuid = {pk_old}), 0),
NULL
WHERE NOT EXISTS (
SELECT 1 FROM _sync_pending
WHERE table_name = {tbl_lit} AND pk_uuid = {pk_old} AND op = 'INSERT'
)
ON CONFLICT(table_name, pk_uuid) DO UPDATE SET op = 'DELETE', payload = NULL;

DELETE FROM _sync_pending
WHERE table_name = {tbl_lit} AND pk_uuid = {pk_old} AND op = 'INSERT';

UPDATE _sync_row_meta SET deleted = 1, updated_ms = {NOW_MS}
WHERE table_name = {tbl_lit} AND pk_uuid = {pk_old};

UPDATE _sync_client_info SET next_change_id = next_change_id + 1;
END;
"#
    );

    conn.execute_batch(&insert_trigger)?;
    conn.execute_batch(&update_trigger)?;
    conn.execute_batch(&delete_trigger)?;
    Ok(())
}

/// Register every business row that has no metadata yet: a row_meta
/// entry at version 0 plus a pending INSERT so the first upload carries
/// the row as a creation.
fn backfill(conn: &Connection, plan: &TablePlan) -> Result<u64> {
    let canon = canon_expr("t", &plan.key);
    let sql = format!(
        "SELECT t.* FROM {} t WHERE NOT EXISTS (
           SELECT 1 FROM _sync_row_meta m
           WHERE m.table_name = ?1 AND m.pk_uuid = {canon}
         )",
        quote_ident(&plan.name)
    );
    let mut stmt = conn.prepare(&sql)?;
    let n_cols = stmt.column_count();
    let col_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let key_idx = col_names
        .iter()
        .position(|c| *c == plan.key)
        .ok_or_else(|| SyncError::Schema(format!("table {:?} lost its key column", plan.name)))?;

    let mut rows = stmt.query([&plan.name])?;
    let mut count = 0u64;
    while let Some(row) = rows.next()? {
        let pk = canonical_pk(row.get_ref(key_idx)?)?;
        let mut payload = serde_json::Map::with_capacity(n_cols);
        for (i, name) in col_names.iter().enumerate() {
            let v = if i == key_idx {
                serde_json::Value::String(pk.clone())
            } else {
                value_to_json(row.get_ref(i)?)
            };
            payload.insert(name.clone(), v);
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        conn.execute(
            "INSERT INTO _sync_row_meta (table_name, pk_uuid, server_version, deleted, updated_ms)
             VALUES (?1, ?2, 0, 0, ?3)",
            rusqlite::params![plan.name, pk, now_ms],
        )?;
        conn.execute(
            "INSERT INTO _sync_pending (change_id, table_name, pk_uuid, op, base_version, payload)
             VALUES ((SELECT next_change_id FROM _sync_client_info), ?1, ?2, 'INSERT', 0, ?3)
             ON CONFLICT(table_name, pk_uuid) DO NOTHING",
            rusqlite::params![
                plan.name,
                pk,
                serde_json::Value::Object(payload).to_string()
            ],
        )?;
        conn.execute(
            "UPDATE _sync_client_info SET next_change_id = next_change_id + 1",
            [],
        )?;
        count += 1;
    }
    Ok(count)
}

/// Rust-side canonicalisation, agreeing byte-for-byte with
/// [`canon_expr`].
pub(crate) fn canonical_pk(v: ValueRef<'_>) -> Result<String> {
    let text = match v {
        ValueRef::Null => {
            return Err(SyncError::Integrity("sync key is NULL".into()));
        }
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
        ValueRef::Blob(b) => hex::encode(b),
    };
    if text.is_empty() {
        return Err(SyncError::Integrity(
            "sync key canonicalises to an empty string".into(),
        ));
    }
    Ok(text)
}

fn value_to_json(v: ValueRef<'_>) -> serde_json::Value {
    match v {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(t) => serde_json::Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => serde_json::Value::String(hex::encode(b)),
    }
}
