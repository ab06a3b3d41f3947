//! Cold-start hydration.
//!
//! Imports full server state without re-authoring rows as local
//! changes: every write happens under apply-mode, so the pending queue
//! is untouched. Interrupted runs restart from the beginning of the
//! snapshot window and rely on upsert idempotence.

use crate::db::Db;
use crate::error::Result;
use crate::materialize;
use crate::meta;
use crate::protocol::Op;
use crate::schema::TablePlan;
use crate::transport::Transport;

#[derive(Debug, Clone, Default)]
pub struct HydrateSummary {
    /// Rows imported (tombstones included).
    pub applied: u64,
    /// The snapshot cutoff; the download cursor afterwards.
    pub watermark: i64,
}

pub(crate) async fn run(
    db: &Db,
    transport: &dyn Transport,
    plans: &[TablePlan],
    include_self: bool,
    limit: u32,
    windowed: bool,
) -> Result<HydrateSummary> {
    let summary = if windowed {
        snapshot_hydrate(db, transport, plans, include_self, limit).await?
    } else {
        replay_hydrate(db, transport, plans, include_self, limit).await?
    };

    db.with_tx(|tx| meta::advance_cursor(tx, summary.watermark))
        .await?;
    tracing::info!(
        applied = summary.applied,
        watermark = summary.watermark,
        windowed,
        "hydration finished"
    );
    Ok(summary)
}

/// Stream the server's consistent snapshot window page by page.
async fn snapshot_hydrate(
    db: &Db,
    transport: &dyn Transport,
    plans: &[TablePlan],
    include_self: bool,
    limit: u32,
) -> Result<HydrateSummary> {
    let mut summary = HydrateSummary::default();
    let mut cursor: Option<String> = None;

    loop {
        // Suspension point between pages.
        let page = transport
            .snapshot(cursor.as_deref(), limit, include_self)
            .await?;
        summary.watermark = page.watermark_seq;

        if !page.rows.is_empty() {
            summary.applied += db
                .with_apply_scope(|tx| {
                    let mut applied = 0u64;
                    for row in &page.rows {
                        let Some(plan) = plans.iter().find(|p| p.name == row.table) else {
                            tracing::warn!(table = %row.table, "snapshot row for undeclared table, skipped");
                            continue;
                        };
                        let op = if row.payload.is_some() {
                            Op::Insert
                        } else {
                            Op::Delete
                        };
                        materialize::apply_record(
                            tx,
                            plan,
                            op,
                            &row.pk,
                            row.payload.as_ref(),
                            row.server_version,
                        )?;
                        applied += 1;
                    }
                    Ok(applied)
                })
                .await?;
        }

        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    Ok(summary)
}

/// Fallback without a snapshot endpoint: replay the change stream from
/// the beginning, materialising directly.
async fn replay_hydrate(
    db: &Db,
    transport: &dyn Transport,
    plans: &[TablePlan],
    include_self: bool,
    limit: u32,
) -> Result<HydrateSummary> {
    let mut summary = HydrateSummary::default();
    let mut after = 0i64;

    loop {
        let page = transport.download(after, limit, include_self).await?;
        let fetched = page.changes.len();

        if fetched > 0 {
            summary.applied += db
                .with_apply_scope(|tx| {
                    let mut applied = 0u64;
                    for record in &page.changes {
                        let Some(plan) = plans.iter().find(|p| p.name == record.table) else {
                            tracing::warn!(table = %record.table, "change for undeclared table, skipped");
                            continue;
                        };
                        materialize::apply_record(
                            tx,
                            plan,
                            record.op,
                            &record.pk,
                            record.payload.as_ref(),
                            record.server_version,
                        )?;
                        applied += 1;
                    }
                    Ok(applied)
                })
                .await?;
        }

        after = page.next_after.max(after);
        summary.watermark = after;
        if fetched < limit as usize {
            break;
        }
    }
    Ok(summary)
}
