//! Conflict resolution policies.
//!
//! A conflict is one row, two truths: the server's current row and the
//! local pending payload. The engine owns detection and bookkeeping and
//! delegates only the merge decision; resolvers must be pure functions
//! of their inputs so concurrent devices converge.

use serde_json::Value;

use crate::error::{Result, SyncError};

/// Outcome of a merge decision.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeResult {
    /// Discard the local intent and adopt the server row.
    AcceptServer,
    /// Keep the local intent, retried against the server's version.
    /// `Some(payload)` replaces the pending payload with a merged row;
    /// `None` keeps the pending change exactly as authored (the only
    /// meaningful shape for a local delete).
    KeepLocal(Option<Value>),
}

/// User-supplied merge policy.
///
/// `server_row` is `None` when the row is deleted server-side;
/// `local_payload` is `None` when the local intent is a delete.
pub trait Resolver: Send + Sync {
    fn merge(
        &self,
        table: &str,
        pk: &str,
        server_row: Option<&Value>,
        local_payload: Option<&Value>,
    ) -> Result<MergeResult>;
}

/// Default policy: the server is always right.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerWinsResolver;

impl Resolver for ServerWinsResolver {
    fn merge(
        &self,
        _table: &str,
        _pk: &str,
        _server_row: Option<&Value>,
        _local_payload: Option<&Value>,
    ) -> Result<MergeResult> {
        Ok(MergeResult::AcceptServer)
    }
}

/// Reference policy: local intent always survives, rebased onto the
/// server's version.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientWinsResolver;

impl Resolver for ClientWinsResolver {
    fn merge(
        &self,
        _table: &str,
        _pk: &str,
        _server_row: Option<&Value>,
        local_payload: Option<&Value>,
    ) -> Result<MergeResult> {
        Ok(MergeResult::KeepLocal(local_payload.cloned()))
    }
}

impl<F> Resolver for F
where
    F: Fn(&str, &str, Option<&Value>, Option<&Value>) -> Result<MergeResult> + Send + Sync,
{
    fn merge(
        &self,
        table: &str,
        pk: &str,
        server_row: Option<&Value>,
        local_payload: Option<&Value>,
    ) -> Result<MergeResult> {
        self(table, pk, server_row, local_payload)
    }
}

/// Run the resolver, falling back to keeping the local payload when the
/// policy itself fails. The error is reported, never swallowed into a
/// lost write.
pub(crate) fn merge_or_keep_local(
    resolver: &dyn Resolver,
    table: &str,
    pk: &str,
    server_row: Option<&Value>,
    local_payload: Option<&Value>,
) -> (MergeResult, Option<SyncError>) {
    match resolver.merge(table, pk, server_row, local_payload) {
        Ok(result) => (result, None),
        Err(e) => {
            tracing::warn!(table, pk, error = %e, "resolver failed, keeping local payload");
            let err = SyncError::Resolver(e.to_string());
            (MergeResult::KeepLocal(local_payload.cloned()), Some(err))
        }
    }
}
