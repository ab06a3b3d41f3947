//! Writing server state into business tables.
//!
//! Callers hold an apply-mode transaction, so nothing here is captured
//! by the change triggers. Every write is an upsert keyed on the sync
//! key; re-applying the same record is a no-op.

use rusqlite::{Connection, ErrorCode, params_from_iter};
use serde_json::Value;

use crate::error::{Result, SyncError};
use crate::meta;
use crate::protocol::Op;
use crate::schema::{TablePlan, quote_ident};

/// Apply one server-authored record: write the business row and advance
/// its metadata.
pub(crate) fn apply_record(
    conn: &Connection,
    plan: &TablePlan,
    op: Op,
    pk: &str,
    payload: Option<&Value>,
    server_version: i64,
) -> Result<()> {
    match op {
        Op::Insert | Op::Update => {
            let payload = payload.ok_or_else(|| {
                SyncError::Protocol(format!("{} record for {pk} has no payload", op.as_str()))
            })?;
            upsert_row(conn, plan, pk, payload)?;
            meta::advance_row_meta(conn, &plan.name, pk, server_version, false)?;
        }
        Op::Delete => {
            delete_row(conn, plan, pk)?;
            meta::advance_row_meta(conn, &plan.name, pk, server_version, true)?;
        }
    }
    Ok(())
}

/// INSERT … ON CONFLICT(key) DO UPDATE with one bind per column present
/// in the payload. Absent columns keep their current value on update
/// and their declared default on insert.
pub(crate) fn upsert_row(
    conn: &Connection,
    plan: &TablePlan,
    pk: &str,
    payload: &Value,
) -> Result<()> {
    let body = payload.as_object().ok_or_else(|| {
        SyncError::Integrity(format!("payload for {}/{pk} is not a JSON object", plan.name))
    })?;

    let mut cols: Vec<&str> = Vec::with_capacity(plan.columns.len());
    let mut binds: Vec<rusqlite::types::Value> = Vec::with_capacity(plan.columns.len());
    for col in &plan.columns {
        if *col == plan.key {
            cols.push(col);
            binds.push(rusqlite::types::Value::Text(pk.to_string()));
        } else if let Some(v) = body.get(col) {
            cols.push(col);
            binds.push(json_to_sql(v));
        }
    }

    let col_list = cols
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=cols.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let updates = cols
        .iter()
        .filter(|c| **c != plan.key)
        .map(|c| format!("{0} = excluded.{0}", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");

    let sql = if updates.is_empty() {
        format!(
            "INSERT INTO {} ({col_list}) VALUES ({placeholders})
             ON CONFLICT({}) DO NOTHING",
            quote_ident(&plan.name),
            quote_ident(&plan.key),
        )
    } else {
        format!(
            "INSERT INTO {} ({col_list}) VALUES ({placeholders})
             ON CONFLICT({}) DO UPDATE SET {updates}",
            quote_ident(&plan.name),
            quote_ident(&plan.key),
        )
    };

    conn.execute(&sql, params_from_iter(binds))
        .map_err(integrity_or_sqlite)?;
    Ok(())
}

pub(crate) fn delete_row(conn: &Connection, plan: &TablePlan, pk: &str) -> Result<()> {
    let sql = format!(
        "DELETE FROM {} WHERE {} = ?1",
        quote_ident(&plan.name),
        quote_ident(&plan.key)
    );
    conn.execute(&sql, [pk]).map_err(integrity_or_sqlite)?;
    Ok(())
}

/// Constraint violations are per-record materialisation failures, not
/// operation aborts.
fn integrity_or_sqlite(e: rusqlite::Error) -> SyncError {
    match &e {
        rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation => {
            SyncError::Integrity(e.to_string())
        }
        _ => SyncError::Sqlite(e),
    }
}

fn json_to_sql(v: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match v {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(*b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Sql::Integer(i)
            } else {
                Sql::Real(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => Sql::Text(s.clone()),
        // Nested structures are stored as their JSON text.
        other => Sql::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db_test_util::apply_silently;
    use crate::schema::{self, SyncTable};
    use serde_json::json;

    fn setup() -> (Connection, TablePlan) {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE users (id TEXT PRIMARY KEY, name TEXT, email TEXT NOT NULL DEFAULT '');",
        )
        .unwrap();
        let mut plans =
            schema::bootstrap(&conn, "u1", "dev-a", &[SyncTable::new("users")]).unwrap();
        (conn, plans.remove(0))
    }

    fn user_row(conn: &Connection, pk: &str) -> Option<(String, String)> {
        conn.query_row(
            "SELECT name, email FROM users WHERE id = ?1",
            [pk],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .ok()
    }

    #[test]
    fn insert_then_reapply_is_idempotent() {
        let (conn, plan) = setup();
        let payload = json!({"id": "u-1", "name": "Alice", "email": "a@x"});
        apply_silently(&conn, || {
            apply_record(&conn, &plan, Op::Insert, "u-1", Some(&payload), 3).unwrap();
            apply_record(&conn, &plan, Op::Insert, "u-1", Some(&payload), 3).unwrap();
        });
        assert_eq!(user_row(&conn, "u-1").unwrap(), ("Alice".into(), "a@x".into()));
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);
        let meta = meta::row_meta(&conn, "users", "u-1").unwrap().unwrap();
        assert_eq!(meta.server_version, 3);
        assert!(!meta.deleted);
    }

    #[test]
    fn partial_payload_retains_existing_columns() {
        let (conn, plan) = setup();
        apply_silently(&conn, || {
            apply_record(
                &conn,
                &plan,
                Op::Insert,
                "u-1",
                Some(&json!({"id": "u-1", "name": "Alice", "email": "a@x"})),
                1,
            )
            .unwrap();
            apply_record(
                &conn,
                &plan,
                Op::Update,
                "u-1",
                Some(&json!({"id": "u-1", "name": "Alice2"})),
                2,
            )
            .unwrap();
        });
        assert_eq!(
            user_row(&conn, "u-1").unwrap(),
            ("Alice2".into(), "a@x".into()),
            "email survives an update that does not mention it"
        );
    }

    #[test]
    fn delete_removes_row_and_tombstones_meta() {
        let (conn, plan) = setup();
        apply_silently(&conn, || {
            apply_record(
                &conn,
                &plan,
                Op::Insert,
                "u-1",
                Some(&json!({"id": "u-1", "name": "Alice"})),
                1,
            )
            .unwrap();
            apply_record(&conn, &plan, Op::Delete, "u-1", None, 2).unwrap();
            // Deleting again is harmless.
            apply_record(&conn, &plan, Op::Delete, "u-1", None, 2).unwrap();
        });
        assert!(user_row(&conn, "u-1").is_none());
        let meta = meta::row_meta(&conn, "users", "u-1").unwrap().unwrap();
        assert!(meta.deleted);
        assert_eq!(meta.server_version, 2);
    }

    #[test]
    fn non_object_payload_is_an_integrity_error() {
        let (conn, plan) = setup();
        let err = upsert_row(&conn, &plan, "u-1", &json!([1, 2, 3])).unwrap_err();
        assert!(matches!(err, SyncError::Integrity(_)));
    }

    #[test]
    fn constraint_violation_maps_to_integrity() {
        let (conn, plan) = setup();
        let err = apply_silently_ret(&conn, || {
            upsert_row(&conn, &plan, "u-1", &json!({"id": "u-1", "email": null}))
        })
        .unwrap_err();
        assert!(matches!(err, SyncError::Integrity(_)), "got {err:?}");
    }

    fn apply_silently_ret<R>(conn: &Connection, f: impl FnOnce() -> R) -> R {
        conn.execute("UPDATE _sync_client_info SET apply_mode = 1", [])
            .unwrap();
        let out = f();
        conn.execute("UPDATE _sync_client_info SET apply_mode = 0", [])
            .unwrap();
        out
    }

    #[test]
    fn unsynced_columns_in_payload_are_ignored() {
        let (conn, plan) = setup();
        apply_silently(&conn, || {
            apply_record(
                &conn,
                &plan,
                Op::Insert,
                "u-1",
                Some(&json!({"id": "u-1", "name": "A", "rogue": true})),
                1,
            )
            .unwrap();
        });
        assert!(user_row(&conn, "u-1").is_some());
    }
}
