//! Cursors: statement execution and result traversal.
//!
//! A [`Cursor`] belongs to exactly one transaction for its whole life and
//! carries its own prepared-statement cache, so identical statement text
//! compiles at most once per cursor. Execution always runs under the owning
//! transaction's current physical context, including the fresh context a
//! retaining resolve installs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::connection::ConnInner;
use crate::error::{Error, Result};
use crate::link::{PhysicalLink, Row, StatementKind, Value};
use crate::statement::{normalize_sql, PreparedStatement, StatementCache};
use crate::transaction::{Transaction, TxInner};

/// Buffered result stream of the most recent query on a cursor.
struct ResultBuffer {
    columns: Vec<String>,
    rows: Vec<Row>,
    pos: usize,
    /// Link epoch at execution time; a resumption strands the buffer.
    epoch: u64,
}

pub(crate) struct CursorInner<L: PhysicalLink> {
    id: Uuid,
    tx: Weak<TxInner<L>>,
    closed: AtomicBool,
    name: Mutex<Option<String>>,
    cache: Mutex<StatementCache<L::Stmt>>,
    stream: Mutex<Option<ResultBuffer>>,
}

impl<L: PhysicalLink> CursorInner<L> {
    pub(crate) fn new(tx: Weak<TxInner<L>>, cache_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            tx,
            closed: AtomicBool::new(false),
            name: Mutex::new(None),
            cache: Mutex::new(StatementCache::new(cache_capacity)),
            stream: Mutex::new(None),
        })
    }

    /// Cascade close: drop cached handles and any open stream. Called with
    /// the transaction already shutting down, so no server round trip.
    pub(crate) fn shut(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cache.lock().clear();
        *self.stream.lock() = None;
    }
}

/// A statement-execution handle bound to one [`Transaction`].
///
/// Cheap to clone; clones share the cache, the name, and the result stream.
pub struct Cursor<L: PhysicalLink> {
    inner: Arc<CursorInner<L>>,
}

impl<L: PhysicalLink> Clone for Cursor<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: PhysicalLink> Cursor<L> {
    pub(crate) fn from_inner(inner: Arc<CursorInner<L>>) -> Self {
        Self { inner }
    }

    fn context(&self) -> Result<(Arc<ConnInner<L>>, Arc<TxInner<L>>)> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed("cursor"));
        }
        let tx = self.inner.tx.upgrade().ok_or(Error::Closed("cursor"))?;
        if tx.is_closed() {
            return Err(Error::Closed("transaction"));
        }
        let conn = tx.conn.upgrade().ok_or(Error::Closed("connection"))?;
        Ok((conn, tx))
    }

    /// Compile statement text (or return the cached compilation) without
    /// executing it.
    pub async fn prep(&self, sql: &str) -> Result<Arc<PreparedStatement<L::Stmt>>> {
        let (conn, _tx) = self.context()?;
        let slot = conn.guard().await?;
        let link = slot.require()?;
        self.prepared(&conn, link, sql).await
    }

    /// Execute statement text under the owning transaction's current
    /// context. Returns the affected-row count; for queries the result
    /// stream becomes available through `fetch_one`/`fetch_all`.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let (conn, tx) = self.context()?;
        let slot = conn.guard().await?;
        let link = slot.require()?;
        let handle = tx.active_handle()?;
        let stmt = self.prepared(&conn, link, sql).await?;
        self.run(&conn, link, &handle, &stmt, params).await
    }

    /// Execute an already-prepared statement. The statement must have been
    /// compiled by this cursor and must predate no resumption.
    pub async fn execute_stmt(
        &self,
        stmt: &Arc<PreparedStatement<L::Stmt>>,
        params: &[Value],
    ) -> Result<u64> {
        let (conn, tx) = self.context()?;
        let slot = conn.guard().await?;
        let link = slot.require()?;
        let handle = tx.active_handle()?;
        if stmt.cursor_id != self.inner.id {
            return Err(Error::ForeignStatement);
        }
        if stmt.epoch != conn.epoch() {
            return Err(Error::StaleHandle);
        }
        self.run(&conn, link, &handle, stmt, params).await
    }

    /// Execute the same statement once per parameter row, under a single
    /// link acquisition. Returns the summed affected-row count.
    pub async fn executemany(&self, sql: &str, rows: &[Vec<Value>]) -> Result<u64> {
        let (conn, tx) = self.context()?;
        let slot = conn.guard().await?;
        let link = slot.require()?;
        let handle = tx.active_handle()?;
        let stmt = self.prepared(&conn, link, sql).await?;
        let name = self.inner.name.lock().clone();
        let mut total = 0u64;
        for params in rows {
            let out = link
                .execute(&handle, &stmt.handle, params, name.as_deref())
                .await?;
            total += out.rows_affected;
        }
        Ok(total)
    }

    /// `executemany` over an already-prepared statement, with the same
    /// scope and staleness checks as `execute_stmt`.
    pub async fn executemany_stmt(
        &self,
        stmt: &Arc<PreparedStatement<L::Stmt>>,
        rows: &[Vec<Value>],
    ) -> Result<u64> {
        let (conn, tx) = self.context()?;
        let slot = conn.guard().await?;
        let link = slot.require()?;
        let handle = tx.active_handle()?;
        if stmt.cursor_id != self.inner.id {
            return Err(Error::ForeignStatement);
        }
        if stmt.epoch != conn.epoch() {
            return Err(Error::StaleHandle);
        }
        let name = self.inner.name.lock().clone();
        let mut total = 0u64;
        for params in rows {
            let out = link
                .execute(&handle, &stmt.handle, params, name.as_deref())
                .await?;
            total += out.rows_affected;
        }
        Ok(total)
    }

    /// Next row of the open result stream, or `None` when exhausted.
    pub fn fetch_one(&self) -> Result<Option<Row>> {
        let (conn, _tx) = self.context()?;
        let mut stream = self.inner.stream.lock();
        let buf = stream
            .as_mut()
            .ok_or_else(|| Error::Usage("no open result stream on this cursor".into()))?;
        if buf.epoch != conn.epoch() {
            return Err(Error::StaleHandle);
        }
        if buf.pos >= buf.rows.len() {
            return Ok(None);
        }
        let row = buf.rows[buf.pos].clone();
        buf.pos += 1;
        Ok(Some(row))
    }

    /// All remaining rows of the open result stream.
    pub fn fetch_all(&self) -> Result<Vec<Row>> {
        let (conn, _tx) = self.context()?;
        let mut stream = self.inner.stream.lock();
        let buf = stream
            .as_mut()
            .ok_or_else(|| Error::Usage("no open result stream on this cursor".into()))?;
        if buf.epoch != conn.epoch() {
            return Err(Error::StaleHandle);
        }
        let rest = buf.rows.split_off(buf.pos.min(buf.rows.len()));
        buf.pos = buf.rows.len();
        Ok(rest)
    }

    /// Column names of the open result stream.
    pub fn columns(&self) -> Result<Vec<String>> {
        let (_conn, _tx) = self.context()?;
        let stream = self.inner.stream.lock();
        stream
            .as_ref()
            .map(|buf| buf.columns.clone())
            .ok_or_else(|| Error::Usage("no open result stream on this cursor".into()))
    }

    /// Assign the server-side cursor name used by positioned update/delete
    /// statements that reference this cursor.
    pub fn set_name(&self, name: impl Into<String>) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed("cursor"));
        }
        let name = name.into();
        if name.is_empty() {
            return Err(Error::Usage("cursor name must not be empty".into()));
        }
        *self.inner.name.lock() = Some(name);
        Ok(())
    }

    pub fn name(&self) -> Option<String> {
        self.inner.name.lock().clone()
    }

    /// The owning transaction, while both the cursor and the transaction
    /// are alive.
    pub fn transaction(&self) -> Option<Transaction<L>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return None;
        }
        self.inner.tx.upgrade().map(Transaction::from_inner)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Release the cursor and its cached statements. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cache.lock().clear();
        *self.inner.stream.lock() = None;
        if let Some(tx) = self.inner.tx.upgrade() {
            tx.detach_cursor(&self.inner);
        }
    }

    /// Cache-aware compilation. A cached handle from before a resumption is
    /// recompiled transparently since the text is still on hand.
    async fn prepared(
        &self,
        conn: &ConnInner<L>,
        link: &L,
        sql: &str,
    ) -> Result<Arc<PreparedStatement<L::Stmt>>> {
        let text = normalize_sql(sql);
        let epoch = conn.epoch();
        let hit = {
            let mut cache = self.inner.cache.lock();
            match cache.get(&text) {
                Some(stmt) if stmt.epoch == epoch => Some(stmt),
                Some(_) => {
                    cache.remove(&text);
                    None
                }
                None => None,
            }
        };
        if let Some(stmt) = hit {
            tracing::trace!(text = %stmt.text, "statement cache hit");
            return Ok(stmt);
        }
        let compiled = link.compile(&text).await?;
        let stmt = Arc::new(PreparedStatement {
            text,
            kind: compiled.kind,
            num_params: compiled.num_params,
            columns: compiled.columns,
            plan: compiled.plan,
            handle: compiled.handle,
            cursor_id: self.inner.id,
            epoch,
        });
        self.inner.cache.lock().insert(Arc::clone(&stmt));
        Ok(stmt)
    }

    async fn run(
        &self,
        conn: &ConnInner<L>,
        link: &L,
        tx_handle: &L::Tx,
        stmt: &PreparedStatement<L::Stmt>,
        params: &[Value],
    ) -> Result<u64> {
        let name = self.inner.name.lock().clone();
        let out = link
            .execute(tx_handle, &stmt.handle, params, name.as_deref())
            .await?;
        if stmt.kind == StatementKind::Query {
            *self.inner.stream.lock() = Some(ResultBuffer {
                columns: out.columns,
                rows: out.rows,
                pos: 0,
                epoch: conn.epoch(),
            });
        } else {
            // The stream always reflects the latest statement; rows from
            // an earlier query must not survive a DML.
            *self.inner.stream.lock() = None;
        }
        Ok(out.rows_affected)
    }
}
