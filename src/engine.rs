//! Public facade.
//!
//! One engine per database. All sync operations are serialised by an
//! internal mutex; the SQLite connection itself is shared with the
//! application and only held during short critical sections, never
//! across network awaits.

use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::db::Db;
use crate::download::{self, DownloadSummary};
use crate::error::Result;
use crate::hydrate::{self, HydrateSummary};
use crate::meta;
use crate::resolver::Resolver;
use crate::schema::{self, SyncTable, TablePlan};
use crate::transport::Transport;
use crate::upload::{self, UploadSummary};

/// Tunables for the sync loops.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Maximum pending changes per upload batch.
    pub upload_limit: u32,
    /// Page size for downloads and hydration.
    pub download_limit: u32,
    /// Whether the download cursor moves past a record that failed to
    /// materialise. `true` (the default) keeps a poisoned record from
    /// stalling the client; `false` retries it on the next call.
    pub advance_cursor_on_materialize_error: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            upload_limit: 200,
            download_limit: 500,
            advance_cursor_on_materialize_error: true,
        }
    }
}

/// Result of a full [`SyncEngine::sync_once`] cycle.
#[derive(Debug, Clone, Default)]
pub struct SyncSummary {
    pub upload: UploadSummary,
    pub downloaded: u64,
}

type ChangeListener = Box<dyn Fn(&[String]) + Send + Sync>;

/// The sync engine bound to one SQLite database.
pub struct SyncEngine<T: Transport> {
    db: Db,
    transport: T,
    resolver: Box<dyn Resolver>,
    opts: SyncOptions,
    plans: Vec<TablePlan>,
    gate: Mutex<()>,
    listener: Option<ChangeListener>,
}

impl<T: Transport> SyncEngine<T> {
    /// Bind the engine to a connection. Call [`bootstrap`] before any
    /// sync operation.
    ///
    /// [`bootstrap`]: SyncEngine::bootstrap
    pub fn new(
        conn: Connection,
        transport: T,
        resolver: Box<dyn Resolver>,
        opts: SyncOptions,
    ) -> Self {
        Self {
            db: Db::new(conn),
            transport,
            resolver,
            opts,
            plans: Vec::new(),
            gate: Mutex::new(()),
            listener: None,
        }
    }

    /// Shared handle for application SQL on the same database.
    pub fn db(&self) -> Db {
        self.db.clone()
    }

    /// Register the reactive invalidation hook: called after each
    /// committed engine transaction with the sorted list of business
    /// tables it touched.
    pub fn set_change_listener(&mut self, f: impl Fn(&[String]) + Send + Sync + 'static) {
        self.listener = Some(Box::new(f));
    }

    /// Install the shadow tables and change-capture triggers, register
    /// this device and backfill pre-existing rows. Idempotent; a new
    /// `(user_id, source_id)` refreshes the identity singleton.
    pub async fn bootstrap(
        &mut self,
        user_id: &str,
        source_id: &str,
        tables: &[SyncTable],
    ) -> Result<()> {
        let _gate = self.gate.lock().await;
        let user_id = user_id.to_string();
        let source_id = source_id.to_string();
        let tables = tables.to_vec();
        self.plans = self
            .db
            .with_conn(move |c| schema::bootstrap(c, &user_id, &source_id, &tables))
            .await?;
        Ok(())
    }

    /// Push one batch of pending changes and process the verdicts.
    pub async fn upload_once(&self) -> Result<UploadSummary> {
        let _gate = self.gate.lock().await;
        let (summary, changed) = upload::run(
            &self.db,
            &self.transport,
            self.resolver.as_ref(),
            &self.plans,
            self.opts.upload_limit,
        )
        .await?;
        self.notify(&changed);
        Ok(summary)
    }

    /// Fetch and apply one page of server changes.
    pub async fn download_once(&self, limit: u32, include_self: bool) -> Result<DownloadSummary> {
        let _gate = self.gate.lock().await;
        let (summary, changed) = download::run(
            &self.db,
            &self.transport,
            self.resolver.as_ref(),
            &self.plans,
            limit,
            include_self,
            self.opts.advance_cursor_on_materialize_error,
        )
        .await?;
        self.notify(&changed);
        Ok(summary)
    }

    /// Cold-start import of the full server state. Generates no pending
    /// changes and leaves the queue untouched.
    pub async fn hydrate(
        &self,
        include_self: bool,
        limit: u32,
        windowed: bool,
    ) -> Result<HydrateSummary> {
        let _gate = self.gate.lock().await;
        let summary = hydrate::run(
            &self.db,
            &self.transport,
            &self.plans,
            include_self,
            limit,
            windowed,
        )
        .await?;
        if summary.applied > 0 {
            let tables: Vec<String> = self.plans.iter().map(|p| p.name.clone()).collect();
            self.notify(&tables);
        }
        Ok(summary)
    }

    /// One full cycle: upload, then drain download pages until a short
    /// page signals the end of the stream.
    pub async fn sync_once(&self) -> Result<SyncSummary> {
        let _gate = self.gate.lock().await;
        let mut summary = SyncSummary::default();

        let (upload, changed) = upload::run(
            &self.db,
            &self.transport,
            self.resolver.as_ref(),
            &self.plans,
            self.opts.upload_limit,
        )
        .await?;
        self.notify(&changed);
        summary.upload = upload;

        loop {
            let (page, changed) = download::run(
                &self.db,
                &self.transport,
                self.resolver.as_ref(),
                &self.plans,
                self.opts.download_limit,
                false,
                self.opts.advance_cursor_on_materialize_error,
            )
            .await?;
            self.notify(&changed);
            summary.downloaded += page.applied;
            if page.fetched < self.opts.download_limit as u64 {
                break;
            }
        }
        Ok(summary)
    }

    /// Number of locally authored changes still awaiting upload.
    pub async fn pending_changes(&self) -> Result<i64> {
        self.db.with_conn(meta::pending_count).await
    }

    /// Current download cursor.
    pub async fn server_cursor(&self) -> Result<i64> {
        Ok(self.db.with_conn(meta::client_info).await?.last_server_seq_seen)
    }

    /// Release the engine's handle on the database; closes the
    /// connection if the application holds no other handle.
    pub async fn close(self) -> Result<()> {
        // Wait out any in-flight operation before releasing the handle.
        drop(self.gate.lock().await);
        self.db.close().await
    }

    fn notify(&self, tables: &[String]) {
        if tables.is_empty() {
            return;
        }
        if let Some(listener) = &self.listener {
            listener(tables);
        }
    }
}
