//! Shared SQLite handle.
//!
//! The engine and the embedding application use the same connection.
//! All engine database work happens inside short synchronous critical
//! sections; the lock is never held across an await, so application SQL
//! proceeds while the engine waits on the network.

use std::sync::Arc;

use rusqlite::{Connection, Transaction};
use tokio::sync::Mutex;

use crate::error::Result;

/// Cloneable handle over the single shared connection.
#[derive(Clone)]
pub struct Db {
    inner: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn new(conn: Connection) -> Self {
        Self {
            inner: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run `f` with the connection. The lock is released when `f`
    /// returns; `f` must not block.
    pub async fn with_conn<R>(&self, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        let conn = self.inner.lock().await;
        f(&conn)
    }

    /// Execute `f` inside a transaction and commit if it returns Ok.
    pub async fn with_tx<R>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<R>) -> Result<R> {
        let conn = self.inner.lock().await;
        let tx = conn.unchecked_transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Execute `f` inside a transaction with `apply_mode = 1`, so the
    /// change-capture triggers stay inert for every write `f` performs.
    ///
    /// The flag lives on the client-info row and is flipped back inside
    /// the same transaction: a rollback reverts the flag together with
    /// the writes it guarded.
    pub async fn with_apply_scope<R>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<R>,
    ) -> Result<R> {
        let conn = self.inner.lock().await;
        let tx = conn.unchecked_transaction()?;
        tx.execute("UPDATE _sync_client_info SET apply_mode = 1", [])?;
        let out = f(&tx)?;
        tx.execute("UPDATE _sync_client_info SET apply_mode = 0", [])?;
        tx.commit()?;
        Ok(out)
    }

    /// Close the underlying connection if this is the last handle.
    pub async fn close(self) -> Result<()> {
        match Arc::try_unwrap(self.inner) {
            Ok(mutex) => {
                let conn = mutex.into_inner();
                conn.close().map_err(|(_, e)| e.into())
            }
            // Another handle is still alive; it keeps the connection.
            Err(_) => Ok(()),
        }
    }
}
