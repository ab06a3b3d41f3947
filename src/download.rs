//! Download pipeline: page the server change stream from the cursor
//! and apply records in sequence order under the apply-mode guard.

use std::collections::BTreeSet;

use crate::db::Db;
use crate::error::{Result, SyncError};
use crate::materialize;
use crate::meta;
use crate::protocol::{Op, ServerChange};
use crate::resolver::{MergeResult, Resolver, merge_or_keep_local};
use crate::schema::TablePlan;
use crate::transport::Transport;

/// Outcome of one download page.
#[derive(Debug, Clone, Default)]
pub struct DownloadSummary {
    /// Records materialised into business tables.
    pub applied: u64,
    /// Records returned by the server, including ones skipped as
    /// already observed.
    pub fetched: u64,
    /// Cursor position after this page.
    pub next_after: i64,
    /// Per-record failures; the batch continued past them.
    pub materialize_errors: Vec<String>,
}

pub(crate) async fn run(
    db: &Db,
    transport: &dyn Transport,
    resolver: &dyn Resolver,
    plans: &[TablePlan],
    limit: u32,
    include_self: bool,
    advance_cursor_on_materialize_error: bool,
) -> Result<(DownloadSummary, Vec<String>)> {
    let info = db.with_conn(meta::client_info).await?;

    // Suspension point: the application owns the connection while we
    // wait for the page.
    let response = transport
        .download(info.last_server_seq_seen, limit, include_self)
        .await?;

    let fetched = response.changes.len() as u64;
    if response.changes.is_empty() {
        let next_after = response.next_after.max(info.last_server_seq_seen);
        db.with_tx(|tx| meta::advance_cursor(tx, next_after)).await?;
        return Ok((
            DownloadSummary {
                next_after,
                ..Default::default()
            },
            Vec::new(),
        ));
    }

    let (summary, changed) = db
        .with_apply_scope(|tx| {
            let mut summary = DownloadSummary {
                fetched,
                ..Default::default()
            };
            let mut changed: BTreeSet<String> = BTreeSet::new();
            // Cursor position to fall back to when a record fails and
            // the operator opted out of advancing past failures.
            let mut last_ok_seq = info.last_server_seq_seen;
            let mut first_failure_seq: Option<i64> = None;

            for record in &response.changes {
                match apply_one(tx, resolver, plans, &info.source_id, record, &mut changed)? {
                    Applied::Materialised => {
                        summary.applied += 1;
                        if first_failure_seq.is_none() {
                            last_ok_seq = record.seq;
                        }
                    }
                    Applied::Skipped => {
                        if first_failure_seq.is_none() {
                            last_ok_seq = record.seq;
                        }
                    }
                    Applied::Failed(reason) => {
                        tracing::warn!(
                            table = %record.table,
                            pk = %record.pk,
                            seq = record.seq,
                            %reason,
                            "record failed to materialise"
                        );
                        first_failure_seq.get_or_insert(record.seq);
                        summary.materialize_errors.push(reason);
                    }
                }
            }

            let target = if first_failure_seq.is_none() || advance_cursor_on_materialize_error {
                response.next_after
            } else {
                last_ok_seq
            };
            meta::advance_cursor(tx, target)?;
            summary.next_after = target.max(info.last_server_seq_seen);
            Ok((summary, changed.into_iter().collect::<Vec<_>>()))
        })
        .await?;

    tracing::debug!(
        fetched = summary.fetched,
        applied = summary.applied,
        next_after = summary.next_after,
        errors = summary.materialize_errors.len(),
        "download page finished"
    );
    Ok((summary, changed))
}

enum Applied {
    Materialised,
    Skipped,
    Failed(String),
}

fn apply_one(
    tx: &rusqlite::Connection,
    resolver: &dyn Resolver,
    plans: &[TablePlan],
    self_source: &str,
    record: &ServerChange,
    changed: &mut BTreeSet<String>,
) -> Result<Applied> {
    let Some(plan) = plans.iter().find(|p| p.name == record.table) else {
        return Ok(Applied::Failed(format!(
            "table {:?} is not declared for sync",
            record.table
        )));
    };

    // Already-observed versions reconcile as no-ops. Typically these
    // are our own changes echoed back when the server ignores
    // include_self.
    if let Some(m) = meta::row_meta(tx, &record.table, &record.pk)? {
        if record.server_version <= m.server_version {
            if record.source_id != self_source {
                tracing::debug!(
                    table = %record.table,
                    pk = %record.pk,
                    seq = record.seq,
                    "skipping already-observed version"
                );
            }
            return Ok(Applied::Skipped);
        }
    }

    if let Some(pending) = meta::pending_for(tx, &record.table, &record.pk)? {
        let local = pending.payload_value()?;
        let server_row = match record.op {
            Op::Delete => None,
            _ => record.payload.as_ref(),
        };
        let (decision, resolver_err) = merge_or_keep_local(
            resolver,
            &record.table,
            &record.pk,
            server_row,
            local.as_ref(),
        );

        let out = match decision {
            MergeResult::AcceptServer => {
                meta::remove_pending(tx, pending.change_id)?;
                materialise(tx, plan, record, changed)
            }
            MergeResult::KeepLocal(merged) => {
                meta::rebase_pending(
                    tx,
                    pending.change_id,
                    pending.op,
                    record.server_version,
                    merged.as_ref(),
                )?;
                let still_delete = pending.op == Op::Delete && merged.is_none();
                meta::advance_row_meta(
                    tx,
                    &record.table,
                    &record.pk,
                    record.server_version,
                    still_delete,
                )?;
                Ok(Applied::Skipped)
            }
        }?;
        if let Some(e) = resolver_err {
            return Ok(Applied::Failed(e.to_string()));
        }
        return Ok(out);
    }

    materialise(tx, plan, record, changed)
}

fn materialise(
    tx: &rusqlite::Connection,
    plan: &TablePlan,
    record: &ServerChange,
    changed: &mut BTreeSet<String>,
) -> Result<Applied> {
    match materialize::apply_record(
        tx,
        plan,
        record.op,
        &record.pk,
        record.payload.as_ref(),
        record.server_version,
    ) {
        Ok(()) => {
            changed.insert(record.table.clone());
            Ok(Applied::Materialised)
        }
        Err(SyncError::Integrity(reason)) | Err(SyncError::Protocol(reason)) => {
            Ok(Applied::Failed(reason))
        }
        Err(other) => Err(other),
    }
}
