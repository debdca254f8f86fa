//! Transaction lifecycle.
//!
//! A [`Transaction`] moves through three states: ACTIVE (a live physical
//! context exists on the server), RESOLVED (the context was committed or
//! rolled back), and CLOSED (terminal; every association is severed). A
//! retaining resolve is the one way to stay ACTIVE across a commit or
//! rollback: the server keeps the snapshot and hands back a fresh context
//! under the same `Transaction` object, bumping its physical-transaction
//! counter.
//!
//! Savepoints travel as opaque statement text through the link; this crate
//! never interprets SQL.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::connection::{ConnInner, Connection};
use crate::cursor::{Cursor, CursorInner};
use crate::error::{Error, Result};
use crate::link::{PhysicalLink, ResolveMode, TransactionParams};

/// Resolution marker: a live physical context exists.
pub const RESOLUTION_OPEN: u8 = 0;
/// Resolution marker: the context was released. Values above 1 are reserved
/// for prepared/limbo states of two-phase resolution.
pub const RESOLUTION_RESOLVED: u8 = 1;

struct TxState<L: PhysicalLink> {
    /// Only meaningful while `resolution == RESOLUTION_OPEN`.
    handle: Option<L::Tx>,
    resolution: u8,
    closed: bool,
}

pub(crate) struct TxInner<L: PhysicalLink> {
    /// Weak back-reference; the connection owns its transactions, never the
    /// other way around.
    pub(crate) conn: Weak<ConnInner<L>>,
    state: Mutex<TxState<L>>,
    /// Count of physical transactions executed through this object. Bumped
    /// on every begin, including each retaining reopen.
    runs: AtomicU64,
    params: Mutex<TransactionParams>,
    /// Set by `prepare()`; commit then skips the implicit first phase.
    prepared: AtomicBool,
    pub(crate) cursors: Mutex<Vec<Arc<CursorInner<L>>>>,
}

impl<L: PhysicalLink> TxInner<L> {
    pub(crate) fn new(conn: Weak<ConnInner<L>>, params: TransactionParams) -> Arc<Self> {
        Arc::new(Self {
            conn,
            state: Mutex::new(TxState {
                handle: None,
                resolution: RESOLUTION_RESOLVED,
                closed: false,
            }),
            runs: AtomicU64::new(0),
            params: Mutex::new(params),
            prepared: AtomicBool::new(false),
            cursors: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn is_active(&self) -> bool {
        let st = self.state.lock();
        !st.closed && st.resolution == RESOLUTION_OPEN
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn resolution(&self) -> u8 {
        self.state.lock().resolution
    }

    pub(crate) fn runs(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }

    /// Current physical context. Statement execution on a non-active
    /// transaction is a usage error, never a silent no-op.
    pub(crate) fn active_handle(&self) -> Result<L::Tx> {
        let st = self.state.lock();
        if st.closed {
            return Err(Error::Closed("transaction"));
        }
        match &st.handle {
            Some(h) if st.resolution == RESOLUTION_OPEN => Ok(h.clone()),
            _ => Err(Error::InactiveTransaction),
        }
    }

    pub(crate) async fn begin_on(
        &self,
        link: &L,
        params: Option<TransactionParams>,
    ) -> Result<()> {
        {
            let st = self.state.lock();
            if st.closed {
                return Err(Error::Closed("transaction"));
            }
            if st.handle.is_some() {
                return Err(Error::Usage("transaction is already active".into()));
            }
        }
        if let Some(p) = params {
            *self.params.lock() = p;
        }
        let p = self.params.lock().clone();
        let handle = link.begin_tx(&p).await?;
        let mut st = self.state.lock();
        st.handle = Some(handle);
        st.resolution = RESOLUTION_OPEN;
        self.prepared.store(false, Ordering::SeqCst);
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) async fn resolve_on(
        &self,
        link: &L,
        mode: ResolveMode,
        retaining: bool,
    ) -> Result<()> {
        let handle = self.active_handle()?;
        let fresh = link.resolve_tx(&handle, mode, retaining).await?;
        let mut st = self.state.lock();
        if retaining {
            let Some(next) = fresh else {
                st.handle = None;
                st.resolution = RESOLUTION_RESOLVED;
                return Err(Error::Operational(
                    "retaining resolve returned no fresh context".into(),
                ));
            };
            st.handle = Some(next);
            self.runs.fetch_add(1, Ordering::SeqCst);
        } else {
            st.handle = None;
            st.resolution = RESOLUTION_RESOLVED;
        }
        self.prepared.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Drop the physical context without talking to the server. Used when
    /// the link is already gone (idle-timeout expiry, dead connection).
    pub(crate) fn force_resolve(&self) {
        let mut st = self.state.lock();
        st.handle = None;
        if st.resolution == RESOLUTION_OPEN {
            st.resolution = RESOLUTION_RESOLVED;
        }
    }

    /// Implicit rollback if still active, cascade close to cursors, then
    /// mark terminal. `link` may be absent when the physical link is gone.
    pub(crate) async fn shutdown_on(&self, link: Option<&L>) {
        if self.is_active() {
            match link {
                Some(link) => {
                    if let Err(e) = self.resolve_on(link, ResolveMode::Rollback, false).await {
                        tracing::warn!(error = %e, "implicit rollback on close failed");
                        self.force_resolve();
                    }
                }
                None => self.force_resolve(),
            }
        }
        let cursors: Vec<Arc<CursorInner<L>>> = std::mem::take(&mut *self.cursors.lock());
        for cur in cursors {
            cur.shut();
        }
        self.state.lock().closed = true;
    }

    pub(crate) fn detach_cursor(&self, cursor: &Arc<CursorInner<L>>) {
        self.cursors.lock().retain(|c| !Arc::ptr_eq(c, cursor));
    }
}

/// Snapshot of a transaction's bookkeeping. Only available while ACTIVE;
/// a resolved transaction never reports stale data.
#[derive(Debug, Clone)]
pub struct TransactionInfo {
    /// Physical transactions executed through this object so far.
    pub physical_transactions: u64,
    pub params: TransactionParams,
    /// Whether the first phase of two-phase resolution has run.
    pub prepared: bool,
}

/// A logical transaction bound to one [`Connection`].
///
/// Cheap to clone; clones share the same underlying transaction.
pub struct Transaction<L: PhysicalLink> {
    pub(crate) inner: Arc<TxInner<L>>,
}

impl<L: PhysicalLink> Clone for Transaction<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: PhysicalLink> Transaction<L> {
    pub(crate) fn from_inner(inner: Arc<TxInner<L>>) -> Self {
        Self { inner }
    }

    fn conn(&self) -> Result<Arc<ConnInner<L>>> {
        if self.inner.is_closed() {
            return Err(Error::Closed("transaction"));
        }
        self.inner
            .conn
            .upgrade()
            .ok_or(Error::Closed("transaction"))
    }

    /// Establish a physical context using the parameters this transaction
    /// was created with. Valid only when no context is open.
    pub async fn begin(&self) -> Result<()> {
        self.begin_with(None).await
    }

    /// Establish a physical context, replacing the transaction-parameter
    /// configuration first.
    pub async fn begin_with(&self, params: Option<TransactionParams>) -> Result<()> {
        let conn = self.conn()?;
        let slot = conn.guard().await?;
        self.inner.begin_on(slot.require()?, params).await
    }

    pub async fn commit(&self) -> Result<()> {
        self.resolve(ResolveMode::Commit, false).await
    }

    /// Commit while immediately reopening a fresh context under this same
    /// object. The transaction stays ACTIVE and the physical-transaction
    /// counter increments by one.
    pub async fn commit_retaining(&self) -> Result<()> {
        self.resolve(ResolveMode::Commit, true).await
    }

    pub async fn rollback(&self) -> Result<()> {
        self.resolve(ResolveMode::Rollback, false).await
    }

    pub async fn rollback_retaining(&self) -> Result<()> {
        self.resolve(ResolveMode::Rollback, true).await
    }

    async fn resolve(&self, mode: ResolveMode, retaining: bool) -> Result<()> {
        let conn = self.conn()?;
        let slot = conn.guard().await?;
        self.inner.resolve_on(slot.require()?, mode, retaining).await
    }

    /// Establish a named rollback point inside the current context.
    /// Reusing a name rebinds it to the new point.
    pub async fn savepoint(&self, name: &str) -> Result<()> {
        validate_savepoint_name(name)?;
        self.exec_text(&format!("SAVEPOINT {name}")).await
    }

    /// Roll back to a named point without resolving the transaction; the
    /// physical context is retained and the state stays ACTIVE.
    pub async fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        validate_savepoint_name(name)?;
        self.exec_text(&format!("ROLLBACK TO {name}")).await
    }

    /// First phase of two-phase resolution. When omitted, `commit` performs
    /// it implicitly on the server.
    pub async fn prepare(&self) -> Result<()> {
        let conn = self.conn()?;
        let slot = conn.guard().await?;
        let handle = self.inner.active_handle()?;
        slot.require()?.prepare_tx(&handle).await?;
        self.inner.prepared.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Create a cursor bound to this transaction for its whole lifetime.
    pub fn cursor(&self) -> Result<Cursor<L>> {
        let conn = self.conn()?;
        if !self.inner.is_active() {
            return Err(Error::InactiveTransaction);
        }
        let cur = CursorInner::new(
            Arc::downgrade(&self.inner),
            conn.statement_cache_capacity(),
        );
        self.inner.cursors.lock().push(Arc::clone(&cur));
        Ok(Cursor::from_inner(cur))
    }

    /// Bookkeeping snapshot. Fails with a usage error when the transaction
    /// is not ACTIVE rather than reporting stale data.
    pub fn info(&self) -> Result<TransactionInfo> {
        if !self.inner.is_active() {
            return Err(Error::InactiveTransaction);
        }
        Ok(TransactionInfo {
            physical_transactions: self.inner.runs(),
            params: self.inner.params.lock().clone(),
            prepared: self.inner.prepared.load(Ordering::SeqCst),
        })
    }

    /// Implicit rollback if active, close all cursors, detach from the
    /// connection. Terminal: every later method call fails.
    pub async fn close(&self) -> Result<()> {
        if self.inner.is_closed() {
            return Ok(());
        }
        let Some(conn) = self.inner.conn.upgrade() else {
            self.inner.shutdown_on(None).await;
            return Ok(());
        };
        // Raw lock on purpose: closing must not trigger a transparent
        // resumption just to roll back.
        let slot = conn.lock_link().await;
        self.inner.shutdown_on(slot.link_ref()).await;
        drop(slot);
        conn.detach_tx(&self.inner);
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Resolution marker: 0 while a physical context is open, 1 after a
    /// non-retaining resolve.
    pub fn resolution(&self) -> u8 {
        self.inner.resolution()
    }

    /// Physical transactions executed through this object.
    pub fn transaction_count(&self) -> u64 {
        self.inner.runs()
    }

    /// The owning connection, while both ends are alive.
    pub fn connection(&self) -> Option<Connection<L>> {
        if self.inner.is_closed() {
            return None;
        }
        self.inner.conn.upgrade().map(Connection::from_inner)
    }

    /// Run transaction-control text (savepoint handling) through the link.
    async fn exec_text(&self, text: &str) -> Result<()> {
        let conn = self.conn()?;
        let slot = conn.guard().await?;
        let link = slot.require()?;
        let handle = self.inner.active_handle()?;
        let compiled = link.compile(text).await?;
        link.execute(&handle, &compiled.handle, &[], None).await?;
        Ok(())
    }
}

/// Savepoint names go into opaque statement text, so only identifier
/// characters are accepted.
fn validate_savepoint_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::Usage(format!("invalid savepoint name: {name:?}")))
    }
}
