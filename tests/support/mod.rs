//! Shared scenario harness: an in-memory sync server plus device
//! helpers. The server implements the engine's transport trait, so the
//! whole protocol is exercised without sockets.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::Connection;
use serde_json::Value;

use rowsync::{
    ChangeUpload, DownloadResponse, Op, Resolver, Result, ServerChange, ServerWinsResolver,
    SnapshotResponse, SnapshotRow, SyncEngine, SyncError, SyncOptions, SyncTable, Transport,
    UploadRequest, UploadResponse, Verdict, VerdictStatus,
};

pub const BUSINESS_DDL: &str = "
CREATE TABLE users (id TEXT PRIMARY KEY, name TEXT, email TEXT);
CREATE TABLE posts (id TEXT PRIMARY KEY, title TEXT, body TEXT);
";

#[derive(Debug, Clone)]
struct ServerRow {
    version: i64,
    deleted: bool,
    payload: Option<Value>,
}

#[derive(Debug, Default)]
struct ServerState {
    seq: i64,
    rows: BTreeMap<(String, String), ServerRow>,
    log: Vec<ServerChange>,
    /// When set, changes for other tables get an `invalid` verdict.
    allowed_tables: Option<BTreeSet<String>>,
    /// Simulated outage: every call fails with a transport error.
    offline: bool,
    /// Simulated credential expiry: every call fails with an auth error.
    expired: bool,
    /// Artificial network latency per request.
    latency: Option<Duration>,
}

/// The server, shared between devices.
#[derive(Clone, Default)]
pub struct SharedServer {
    state: Arc<Mutex<ServerState>>,
}

impl SharedServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport handle identifying one device, the way a bearer token
    /// would.
    pub fn handle(&self, source_id: &str) -> DeviceTransport {
        DeviceTransport {
            server: self.clone(),
            source_id: source_id.to_string(),
        }
    }

    pub fn restrict_tables(&self, tables: &[&str]) {
        self.state.lock().unwrap().allowed_tables =
            Some(tables.iter().map(|t| t.to_string()).collect());
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().unwrap().offline = offline;
    }

    pub fn set_expired(&self, expired: bool) {
        self.state.lock().unwrap().expired = expired;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().unwrap().latency = Some(latency);
    }

    pub fn live_rows(&self, table: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .rows
            .iter()
            .filter(|((t, _), row)| t == table && !row.deleted)
            .count()
    }

    pub fn head_seq(&self) -> i64 {
        self.state.lock().unwrap().seq
    }

    async fn preamble(&self) -> Result<()> {
        let (latency, offline, expired) = {
            let s = self.state.lock().unwrap();
            (s.latency, s.offline, s.expired)
        };
        if let Some(d) = latency {
            tokio::time::sleep(d).await;
        }
        if offline {
            return Err(SyncError::Transport("connection refused".into()));
        }
        if expired {
            return Err(SyncError::Auth("401: token expired".into()));
        }
        Ok(())
    }

    fn apply_upload(&self, req: &UploadRequest) -> UploadResponse {
        let mut state = self.state.lock().unwrap();
        let mut verdicts = Vec::with_capacity(req.changes.len());
        for change in &req.changes {
            verdicts.push(apply_change(&mut state, &req.source_id, change));
        }
        UploadResponse { verdicts }
    }
}

fn apply_change(state: &mut ServerState, source_id: &str, change: &ChangeUpload) -> Verdict {
    if let Some(allowed) = &state.allowed_tables {
        if !allowed.contains(&change.table) {
            return Verdict {
                status: VerdictStatus::Invalid,
                new_server_version: None,
                server_row: None,
                reason: Some(format!("unknown table {:?}", change.table)),
            };
        }
    }

    let key = (change.table.clone(), change.pk.clone());
    let current_version = state.rows.get(&key).map(|r| r.version).unwrap_or(0);
    if change.base_version != current_version {
        let server_row = state
            .rows
            .get(&key)
            .filter(|r| !r.deleted)
            .and_then(|r| r.payload.clone());
        return Verdict {
            status: VerdictStatus::Conflict,
            new_server_version: Some(current_version),
            server_row,
            reason: None,
        };
    }

    state.seq += 1;
    let version = state.seq;
    let (deleted, payload) = match change.op {
        Op::Delete => (true, None),
        _ => (false, change.payload.clone()),
    };
    state.rows.insert(
        key,
        ServerRow {
            version,
            deleted,
            payload: payload.clone(),
        },
    );
    state.log.push(ServerChange {
        seq: version,
        table: change.table.clone(),
        op: change.op,
        pk: change.pk.clone(),
        server_version: version,
        payload,
        source_id: source_id.to_string(),
    });
    Verdict {
        status: VerdictStatus::Applied,
        new_server_version: Some(version),
        server_row: None,
        reason: None,
    }
}

/// Transport bound to one device identity.
#[derive(Clone)]
pub struct DeviceTransport {
    server: SharedServer,
    source_id: String,
}

#[async_trait]
impl Transport for DeviceTransport {
    async fn upload(&self, req: &UploadRequest) -> Result<UploadResponse> {
        self.server.preamble().await?;
        Ok(self.server.apply_upload(req))
    }

    async fn download(
        &self,
        after: i64,
        limit: u32,
        include_self: bool,
    ) -> Result<DownloadResponse> {
        self.server.preamble().await?;
        let state = self.server.state.lock().unwrap();
        let changes: Vec<ServerChange> = state
            .log
            .iter()
            .filter(|c| c.seq > after)
            .filter(|c| include_self || c.source_id != self.source_id)
            .take(limit as usize)
            .cloned()
            .collect();
        let next_after = match changes.last() {
            Some(last) => last.seq,
            // Nothing visible left; the cursor may jump the elided tail.
            None => state.seq.max(after),
        };
        Ok(DownloadResponse { changes, next_after })
    }

    async fn snapshot(
        &self,
        cursor: Option<&str>,
        limit: u32,
        _include_self: bool,
    ) -> Result<SnapshotResponse> {
        self.server.preamble().await?;
        let state = self.server.state.lock().unwrap();
        let offset: usize = cursor.map(|c| c.parse().unwrap()).unwrap_or(0);
        let live: Vec<SnapshotRow> = state
            .rows
            .iter()
            .filter(|(_, row)| !row.deleted)
            .map(|((table, pk), row)| SnapshotRow {
                table: table.clone(),
                pk: pk.clone(),
                server_version: row.version,
                payload: row.payload.clone(),
            })
            .collect();
        let page: Vec<SnapshotRow> = live.iter().skip(offset).take(limit as usize).cloned().collect();
        let consumed = offset + page.len();
        Ok(SnapshotResponse {
            rows: page,
            next_cursor: (consumed < live.len()).then(|| consumed.to_string()),
            watermark_seq: state.seq,
        })
    }
}

pub const TABLES: [&str; 2] = ["users", "posts"];

fn declared_tables() -> Vec<SyncTable> {
    TABLES.iter().map(|t| SyncTable::new(*t)).collect()
}

/// A bootstrapped device talking to `server`.
pub async fn device(server: &SharedServer, user: &str, source: &str) -> SyncEngine<DeviceTransport> {
    device_with_resolver(server, user, source, Box::new(ServerWinsResolver)).await
}

pub async fn device_with_resolver(
    server: &SharedServer,
    user: &str,
    source: &str,
    resolver: Box<dyn Resolver>,
) -> SyncEngine<DeviceTransport> {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(BUSINESS_DDL).unwrap();
    let mut engine = SyncEngine::new(conn, server.handle(source), resolver, SyncOptions::default());
    engine
        .bootstrap(user, source, &declared_tables())
        .await
        .unwrap();
    engine
}

// Application-side SQL helpers. These run through the shared handle the
// way the embedding application would, so the change triggers see them.

pub async fn exec(engine: &SyncEngine<DeviceTransport>, sql: &str) {
    let sql = sql.to_string();
    engine
        .db()
        .with_conn(move |c| {
            c.execute(&sql, [])?;
            Ok(())
        })
        .await
        .unwrap();
}

pub async fn insert_user(engine: &SyncEngine<DeviceTransport>, id: &str, name: &str) {
    let (id, name) = (id.to_string(), name.to_string());
    engine
        .db()
        .with_conn(move |c| {
            c.execute(
                "INSERT INTO users (id, name) VALUES (?1, ?2)",
                rusqlite::params![id, name],
            )?;
            Ok(())
        })
        .await
        .unwrap();
}

pub async fn update_user(engine: &SyncEngine<DeviceTransport>, id: &str, name: &str) {
    let (id, name) = (id.to_string(), name.to_string());
    engine
        .db()
        .with_conn(move |c| {
            c.execute(
                "UPDATE users SET name = ?2 WHERE id = ?1",
                rusqlite::params![id, name],
            )?;
            Ok(())
        })
        .await
        .unwrap();
}

pub async fn delete_user(engine: &SyncEngine<DeviceTransport>, id: &str) {
    let id = id.to_string();
    engine
        .db()
        .with_conn(move |c| {
            c.execute("DELETE FROM users WHERE id = ?1", rusqlite::params![id])?;
            Ok(())
        })
        .await
        .unwrap();
}

pub async fn user_name(engine: &SyncEngine<DeviceTransport>, id: &str) -> Option<String> {
    let id = id.to_string();
    engine
        .db()
        .with_conn(move |c| {
            Ok(c.query_row(
                "SELECT name FROM users WHERE id = ?1",
                rusqlite::params![id],
                |r| r.get(0),
            )
            .ok())
        })
        .await
        .unwrap()
}

pub async fn count(engine: &SyncEngine<DeviceTransport>, table: &str) -> i64 {
    let sql = format!("SELECT COUNT(*) FROM {table}");
    engine
        .db()
        .with_conn(move |c| Ok(c.query_row(&sql, [], |r| r.get(0))?))
        .await
        .unwrap()
}

/// Full ordered dump of the users table for equality checks between
/// devices.
pub async fn users_dump(
    engine: &SyncEngine<DeviceTransport>,
) -> Vec<(String, Option<String>, Option<String>)> {
    engine
        .db()
        .with_conn(|c| {
            let mut stmt = c.prepare("SELECT id, name, email FROM users ORDER BY id")?;
            let rows = stmt
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
        .unwrap()
}

/// Drain sync cycles on both devices until neither has pending work.
pub async fn quiesce(a: &SyncEngine<DeviceTransport>, b: &SyncEngine<DeviceTransport>) {
    for _ in 0..8 {
        a.sync_once().await.unwrap();
        b.sync_once().await.unwrap();
        if a.pending_changes().await.unwrap() == 0 && b.pending_changes().await.unwrap() == 0 {
            // One more round so both observe the final server state.
            a.sync_once().await.unwrap();
            b.sync_once().await.unwrap();
            return;
        }
    }
    panic!("devices did not quiesce");
}
