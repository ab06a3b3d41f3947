//! Client-side sync engine for SQLite.
//!
//! Rows of user-declared tables are captured by SQL triggers into a
//! pending queue, uploaded as versioned change batches, reconciled
//! against per-row server verdicts, and server changes are paged back
//! down and materialised under an apply-mode guard that keeps the
//! triggers inert. Conflict handling is delegated to a pluggable
//! [`Resolver`].

pub mod db;
pub mod download;
pub mod engine;
pub mod error;
pub mod hydrate;
mod materialize;
mod meta;
pub mod protocol;
pub mod resolver;
pub mod schema;
pub mod transport;
pub mod upload;

pub use download::DownloadSummary;
pub use engine::{SyncEngine, SyncOptions, SyncSummary};
pub use error::{Result, SyncError};
pub use hydrate::HydrateSummary;
pub use protocol::{
    ChangeUpload, DownloadResponse, Op, ServerChange, SnapshotResponse, SnapshotRow,
    UploadRequest, UploadResponse, Verdict, VerdictStatus,
};
pub use resolver::{ClientWinsResolver, MergeResult, Resolver, ServerWinsResolver};
pub use schema::SyncTable;
pub use transport::{HttpTransport, Transport};
pub use upload::UploadSummary;
