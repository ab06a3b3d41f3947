//! Upload pipeline: batch the pending queue, ship it, walk the
//! verdicts.
//!
//! The connection is released for the whole HTTP round trip; only the
//! batch capture and the verdict walk hold it.

use std::collections::BTreeSet;

use crate::db::Db;
use crate::error::{Result, SyncError};
use crate::materialize;
use crate::meta::{self, PendingChange};
use crate::protocol::{ChangeUpload, Op, UploadRequest, Verdict, VerdictStatus};
use crate::resolver::{MergeResult, Resolver, merge_or_keep_local};
use crate::schema::TablePlan;
use crate::transport::Transport;

/// Outcome counters for one upload round.
/// `total = applied + conflict + invalid + materialize_error` always
/// holds; nothing is dropped without being counted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadSummary {
    pub total: u64,
    pub applied: u64,
    pub conflict: u64,
    pub invalid: u64,
    pub materialize_error: u64,
    pub invalid_reasons: Vec<String>,
    pub first_error_message: Option<String>,
}

impl UploadSummary {
    fn note_error(&mut self, msg: impl Into<String>) {
        if self.first_error_message.is_none() {
            self.first_error_message = Some(msg.into());
        }
    }
}

pub(crate) async fn run(
    db: &Db,
    transport: &dyn Transport,
    resolver: &dyn Resolver,
    plans: &[TablePlan],
    limit: u32,
) -> Result<(UploadSummary, Vec<String>)> {
    let (batch, info) = db
        .with_conn(|c| Ok((meta::pending_batch(c, limit)?, meta::client_info(c)?)))
        .await?;

    if batch.is_empty() {
        return Ok((UploadSummary::default(), Vec::new()));
    }

    let mut changes = Vec::with_capacity(batch.len());
    for p in &batch {
        changes.push(ChangeUpload {
            change_id: p.change_id,
            table: p.table_name.clone(),
            op: p.op,
            pk: p.pk_uuid.clone(),
            base_version: p.base_version,
            payload: p.payload_value()?,
        });
    }
    let request = UploadRequest {
        user_id: info.user_id,
        source_id: info.source_id,
        changes,
    };

    // Suspension point: no lock held while the batch is on the wire.
    let response = transport.upload(&request).await?;
    validate_verdicts(&batch, &response.verdicts)?;

    let (summary, changed) = db
        .with_apply_scope(|tx| {
            let mut summary = UploadSummary {
                total: batch.len() as u64,
                ..Default::default()
            };
            let mut changed: BTreeSet<String> = BTreeSet::new();

            for (change, verdict) in batch.iter().zip(&response.verdicts) {
                match verdict.status {
                    VerdictStatus::Applied => {
                        let version = require_version(verdict, change)?;
                        meta::advance_row_meta(
                            tx,
                            &change.table_name,
                            &change.pk_uuid,
                            version,
                            change.op == Op::Delete,
                        )?;
                        meta::ack_pending(tx, change, version)?;
                        summary.applied += 1;
                    }
                    VerdictStatus::Conflict => {
                        resolve_upload_conflict(
                            tx,
                            resolver,
                            plans,
                            change,
                            verdict,
                            &mut summary,
                            &mut changed,
                        )?;
                        summary.conflict += 1;
                    }
                    VerdictStatus::Invalid => {
                        let reason =
                            verdict.reason.clone().unwrap_or_else(|| "invalid".into());
                        tracing::warn!(
                            table = %change.table_name,
                            pk = %change.pk_uuid,
                            %reason,
                            "server rejected change as invalid"
                        );
                        meta::remove_pending(tx, change.change_id)?;
                        summary.note_error(reason.clone());
                        summary.invalid_reasons.push(reason);
                        summary.invalid += 1;
                    }
                    VerdictStatus::MaterializeError => {
                        let reason = verdict
                            .reason
                            .clone()
                            .unwrap_or_else(|| "materialize error".into());
                        meta::remove_pending(tx, change.change_id)?;
                        summary.note_error(reason);
                        summary.materialize_error += 1;
                    }
                }
            }
            Ok((summary, changed.into_iter().collect::<Vec<_>>()))
        })
        .await?;

    tracing::info!(
        total = summary.total,
        applied = summary.applied,
        conflict = summary.conflict,
        invalid = summary.invalid,
        materialize_error = summary.materialize_error,
        "upload round finished"
    );
    Ok((summary, changed))
}

// Backstop for the same condition validate_verdicts already rejected.
fn require_version(verdict: &Verdict, change: &PendingChange) -> Result<i64> {
    verdict.new_server_version.ok_or_else(|| {
        SyncError::Protocol(format!(
            "{:?} verdict for change {} lacks new_server_version",
            verdict.status, change.change_id
        ))
    })
}

/// The server contract is checked in full before any local state moves.
fn validate_verdicts(batch: &[PendingChange], verdicts: &[Verdict]) -> Result<()> {
    if verdicts.len() != batch.len() {
        return Err(SyncError::Protocol(format!(
            "verdict count {} does not match uploaded batch {}",
            verdicts.len(),
            batch.len()
        )));
    }
    for (change, verdict) in batch.iter().zip(verdicts) {
        let needs_version = matches!(
            verdict.status,
            VerdictStatus::Applied | VerdictStatus::Conflict
        );
        if needs_version && verdict.new_server_version.is_none() {
            return Err(SyncError::Protocol(format!(
                "{:?} verdict for change {} lacks new_server_version",
                verdict.status, change.change_id
            )));
        }
    }
    Ok(())
}

fn resolve_upload_conflict(
    tx: &rusqlite::Connection,
    resolver: &dyn Resolver,
    plans: &[TablePlan],
    change: &PendingChange,
    verdict: &Verdict,
    summary: &mut UploadSummary,
    changed: &mut BTreeSet<String>,
) -> Result<()> {
    let version = require_version(verdict, change)?;
    let local = change.payload_value()?;
    let (decision, resolver_err) = merge_or_keep_local(
        resolver,
        &change.table_name,
        &change.pk_uuid,
        verdict.server_row.as_ref(),
        local.as_ref(),
    );
    if let Some(e) = resolver_err {
        summary.note_error(e.to_string());
    }

    match decision {
        MergeResult::AcceptServer => {
            let Some(plan) = plans.iter().find(|p| p.name == change.table_name) else {
                // Queue rows only ever name declared tables; a missing
                // plan means bootstrap was re-run with fewer tables.
                meta::remove_pending(tx, change.change_id)?;
                summary.note_error(format!(
                    "table {:?} is no longer declared for sync",
                    change.table_name
                ));
                return Ok(());
            };
            let apply = match &verdict.server_row {
                Some(row) => materialize::apply_record(
                    tx,
                    plan,
                    Op::Update,
                    &change.pk_uuid,
                    Some(row),
                    version,
                ),
                // The winning server state is a tombstone.
                None => materialize::apply_record(
                    tx,
                    plan,
                    Op::Delete,
                    &change.pk_uuid,
                    None,
                    version,
                ),
            };
            match apply {
                Ok(()) => {
                    changed.insert(change.table_name.clone());
                }
                Err(SyncError::Integrity(reason)) => {
                    tracing::warn!(
                        table = %change.table_name,
                        pk = %change.pk_uuid,
                        %reason,
                        "could not materialise winning server row"
                    );
                    summary.note_error(reason);
                }
                Err(other) => return Err(other),
            }
            meta::remove_pending(tx, change.change_id)?;
        }
        MergeResult::KeepLocal(merged) => {
            meta::rebase_pending(tx, change.change_id, change.op, version, merged.as_ref())?;
            let still_delete = change.op == Op::Delete && merged.is_none();
            meta::advance_row_meta(
                tx,
                &change.table_name,
                &change.pk_uuid,
                version,
                still_delete,
            )?;
        }
    }
    Ok(())
}
