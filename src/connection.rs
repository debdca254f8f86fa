//! Connections: link ownership, transaction registry, close cascade.
//!
//! A [`Connection`] owns exactly one physical link and serializes every use
//! of it behind an async mutex, so concurrent transactions interleave at
//! operation granularity without interleaving on the wire. The link slot is
//! also where transparent resumption happens: when the idle-timeout monitor
//! has closed the link under a resumable policy, the next guarded access
//! reconnects with the stored endpoint and credentials, bumps the link
//! epoch, and carries on.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::MutexGuard;

use crate::error::{Error, Result};
use crate::events::{ConduitInner, ConduitOptions, EventConduit};
use crate::link::{Credentials, PhysicalLink, ResolveMode, TransactionParams};
use crate::monitor::{Expirable, ExpiryAction};
use crate::transaction::{Transaction, TxInner};

/// Per-connection configuration beyond endpoint and credentials.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Parameters used by `trans()` when none are given and by the main
    /// (implicit) transaction.
    pub default_params: TransactionParams,
    /// Capacity of each cursor's prepared-statement cache.
    pub statement_cache_capacity: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            default_params: TransactionParams::default(),
            statement_cache_capacity: 100,
        }
    }
}

/// The one mutable slot holding the physical link. `None` after an
/// idle-timeout expiry (and permanently after close).
pub(crate) struct LinkSlot<L> {
    link: Option<L>,
}

impl<L> LinkSlot<L> {
    /// The live link. Guarded access has already ensured presence; this
    /// fails rather than panics if the slot emptied in between.
    pub(crate) fn require(&self) -> Result<&L> {
        self.link.as_ref().ok_or(Error::Closed("connection"))
    }

    pub(crate) fn link_ref(&self) -> Option<&L> {
        self.link.as_ref()
    }
}

pub(crate) struct ConnInner<L: PhysicalLink> {
    endpoint: String,
    credentials: Credentials,
    options: ConnectOptions,
    link: tokio::sync::Mutex<LinkSlot<L>>,
    /// Every transaction created on this connection that has not been
    /// closed or detached yet.
    transactions: Mutex<Vec<Arc<TxInner<L>>>>,
    main_tx: Mutex<Option<Arc<TxInner<L>>>>,
    conduits: Mutex<Vec<Weak<ConduitInner>>>,
    last_activity: Mutex<Instant>,
    connected_since: Mutex<Instant>,
    /// Bumped by every transparent resumption; handles stamped with an
    /// older epoch are stranded.
    epoch: AtomicU64,
    closed: AtomicBool,
    /// The idle monitor dropped the link.
    timed_out: AtomicBool,
    /// Whether a timed-out connection may reconnect transparently.
    resumable: AtomicBool,
}

impl<L: PhysicalLink> ConnInner<L> {
    /// Closed-check, transparent resumption if due, and activity touch, all
    /// under the link mutex. Every user-visible operation funnels through
    /// here.
    pub(crate) async fn guard(&self) -> Result<MutexGuard<'_, LinkSlot<L>>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed("connection"));
        }
        let mut slot = self.link.lock().await;
        if slot.link.is_none() {
            if !self.timed_out.load(Ordering::SeqCst) {
                return Err(Error::Closed("connection"));
            }
            if !self.resumable.load(Ordering::SeqCst) {
                return Err(Error::TimedOut);
            }
            let link = L::connect(&self.endpoint, &self.credentials)
                .await
                .map_err(|e| {
                    Error::Operational(format!("transparent resumption failed: {e}"))
                })?;
            slot.link = Some(link);
            self.epoch.fetch_add(1, Ordering::SeqCst);
            self.timed_out.store(false, Ordering::SeqCst);
            *self.connected_since.lock() = Instant::now();
            tracing::info!(endpoint = %self.endpoint, "resumed connection after idle timeout");
        }
        self.touch();
        Ok(slot)
    }

    /// The link mutex without resumption or closed checks. Close paths use
    /// this so tearing down never reconnects.
    pub(crate) async fn lock_link(&self) -> MutexGuard<'_, LinkSlot<L>> {
        self.link.lock().await
    }

    pub(crate) fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub(crate) fn statement_cache_capacity(&self) -> usize {
        self.options.statement_cache_capacity
    }

    pub(crate) fn last_activity_instant(&self) -> Instant {
        *self.last_activity.lock()
    }

    pub(crate) fn detach_tx(&self, tx: &Arc<TxInner<L>>) {
        self.transactions.lock().retain(|t| !Arc::ptr_eq(t, tx));
        let mut main = self.main_tx.lock();
        if main.as_ref().is_some_and(|m| Arc::ptr_eq(m, tx)) {
            *main = None;
        }
    }
}

impl<L: PhysicalLink> Expirable for ConnInner<L> {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn is_suspended(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    fn connected_since(&self) -> Instant {
        *self.connected_since.lock()
    }

    fn has_open_transaction(&self) -> bool {
        self.transactions.lock().iter().any(|t| t.is_active())
    }

    fn expire(
        self: Arc<Self>,
        action: ExpiryAction,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let mut slot = self.link.lock().await;
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            let Some(link) = slot.link.take() else {
                return;
            };
            let resolve = match action {
                ExpiryAction::Rollback { .. } => Some(ResolveMode::Rollback),
                ExpiryAction::Commit => Some(ResolveMode::Commit),
                ExpiryAction::Detach => None,
            };
            let txs: Vec<Arc<TxInner<L>>> = self.transactions.lock().clone();
            for tx in txs {
                if !tx.is_active() {
                    continue;
                }
                if let Some(mode) = resolve {
                    if let Err(e) = tx.resolve_on(&link, mode, false).await {
                        tracing::warn!(error = %e, "resolving transaction at idle expiry failed");
                    }
                }
                tx.force_resolve();
            }
            if let Err(e) = link.close().await {
                tracing::warn!(error = %e, "closing link at idle expiry failed");
            }
            let resumable = !matches!(action, ExpiryAction::Rollback { resumable: false });
            self.resumable.store(resumable, Ordering::SeqCst);
            self.timed_out.store(true, Ordering::SeqCst);
            tracing::debug!(
                endpoint = %self.endpoint,
                resumable,
                "connection expired by idle timeout"
            );
        })
    }
}

/// A client connection to a remote transactional server, generic over the
/// [`PhysicalLink`] that does the talking.
///
/// Cheap to clone; clones share the same underlying connection.
pub struct Connection<L: PhysicalLink> {
    inner: Arc<ConnInner<L>>,
}

impl<L: PhysicalLink> Clone for Connection<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: PhysicalLink> Connection<L> {
    pub(crate) fn from_inner(inner: Arc<ConnInner<L>>) -> Self {
        Self { inner }
    }

    pub(crate) async fn open(
        endpoint: &str,
        credentials: Credentials,
        options: ConnectOptions,
    ) -> Result<Self> {
        let link = L::connect(endpoint, &credentials).await?;
        let now = Instant::now();
        tracing::debug!(endpoint, user = %credentials.user, "connected");
        Ok(Self {
            inner: Arc::new(ConnInner {
                endpoint: endpoint.to_string(),
                credentials,
                options,
                link: tokio::sync::Mutex::new(LinkSlot { link: Some(link) }),
                transactions: Mutex::new(Vec::new()),
                main_tx: Mutex::new(None),
                conduits: Mutex::new(Vec::new()),
                last_activity: Mutex::new(now),
                connected_since: Mutex::new(now),
                epoch: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                timed_out: AtomicBool::new(false),
                resumable: AtomicBool::new(false),
            }),
        })
    }

    /// Start an explicit transaction with the connection's default
    /// parameters. The physical context begins immediately.
    pub async fn trans(&self) -> Result<Transaction<L>> {
        self.trans_with(self.inner.options.default_params.clone())
            .await
    }

    /// Start an explicit transaction with the given parameters.
    pub async fn trans_with(&self, params: TransactionParams) -> Result<Transaction<L>> {
        let slot = self.inner.guard().await?;
        let link = slot.require()?;
        let tx = TxInner::new(Arc::downgrade(&self.inner), params);
        tx.begin_on(link, None).await?;
        self.inner.transactions.lock().push(Arc::clone(&tx));
        Ok(Transaction::from_inner(tx))
    }

    /// The main (implicit) transaction. Reused while ACTIVE; a fresh object
    /// is created once the previous one was resolved or closed.
    pub async fn main_transaction(&self) -> Result<Transaction<L>> {
        let slot = self.inner.guard().await?;
        let link = slot.require()?;
        let tx = self.ensure_main(link).await?;
        Ok(Transaction::from_inner(tx))
    }

    /// Begin the main transaction explicitly. Fails if it is already
    /// active.
    pub async fn begin(&self) -> Result<()> {
        self.begin_with(None).await
    }

    /// Begin the main transaction with explicit parameters.
    pub async fn begin_with(&self, params: Option<TransactionParams>) -> Result<()> {
        let slot = self.inner.guard().await?;
        let link = slot.require()?;
        let already = {
            let main = self.inner.main_tx.lock();
            main.as_ref().is_some_and(|t| t.is_active())
        };
        if already {
            return Err(Error::Usage("main transaction is already active".into()));
        }
        self.ensure_main_with(link, params).await?;
        Ok(())
    }

    /// Commit the main transaction.
    pub async fn commit(&self) -> Result<()> {
        self.main_existing()?.commit().await
    }

    /// Commit the main transaction while keeping it ACTIVE under a fresh
    /// physical context.
    pub async fn commit_retaining(&self) -> Result<()> {
        self.main_existing()?.commit_retaining().await
    }

    /// Roll back the main transaction.
    pub async fn rollback(&self) -> Result<()> {
        self.main_existing()?.rollback().await
    }

    pub async fn rollback_retaining(&self) -> Result<()> {
        self.main_existing()?.rollback_retaining().await
    }

    /// Establish a savepoint in the main transaction.
    pub async fn savepoint(&self, name: &str) -> Result<()> {
        self.main_existing()?.savepoint(name).await
    }

    /// Roll the main transaction back to a named savepoint.
    pub async fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        self.main_existing()?.rollback_to_savepoint(name).await
    }

    /// First resolution phase of the main transaction.
    pub async fn prepare(&self) -> Result<()> {
        self.main_existing()?.prepare().await
    }

    /// One-shot execution of statement text under the main transaction,
    /// beginning it if necessary. Returns the affected-row count.
    pub async fn execute_immediate(&self, sql: &str) -> Result<u64> {
        let slot = self.inner.guard().await?;
        let link = slot.require()?;
        let tx = self.ensure_main(link).await?;
        let handle = tx.active_handle()?;
        let compiled = link.compile(sql).await?;
        let out = link.execute(&handle, &compiled.handle, &[], None).await?;
        Ok(out.rows_affected)
    }

    /// Subscribe to server events by name. Delivery is decoupled from this
    /// connection's request/response traffic.
    pub async fn event_conduit(
        &self,
        names: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<EventConduit> {
        self.event_conduit_with(names, ConduitOptions::default())
            .await
    }

    pub async fn event_conduit_with(
        &self,
        names: impl IntoIterator<Item = impl Into<String>>,
        options: ConduitOptions,
    ) -> Result<EventConduit> {
        let mut unique: Vec<String> = Vec::new();
        for name in names {
            let name = name.into();
            if !unique.contains(&name) {
                unique.push(name);
            }
        }
        if unique.is_empty() {
            return Err(Error::Usage(
                "event conduit needs at least one event name".into(),
            ));
        }
        let feed = {
            let slot = self.inner.guard().await?;
            slot.require()?.subscribe_events(&unique).await?
        };
        let conduit = EventConduit::spawn(unique, feed, options);
        self.inner.conduits.lock().push(conduit.downgrade());
        Ok(conduit)
    }

    /// Close the connection: implicit rollback of every open transaction,
    /// cascade close of transactions, cursors and event conduits, then link
    /// release. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut slot = self.inner.link.lock().await;
        let txs: Vec<Arc<TxInner<L>>> = std::mem::take(&mut *self.inner.transactions.lock());
        for tx in txs {
            tx.shutdown_on(slot.link_ref()).await;
        }
        *self.inner.main_tx.lock() = None;
        let conduits = std::mem::take(&mut *self.inner.conduits.lock());
        for conduit in conduits {
            if let Some(conduit) = conduit.upgrade() {
                conduit.shut();
            }
        }
        if let Some(link) = slot.link.take() {
            if let Err(e) = link.close().await {
                tracing::warn!(error = %e, "link close failed");
            }
        }
        tracing::debug!(endpoint = %self.inner.endpoint, "connection closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Duration since the last guarded operation on this connection.
    pub fn idle_time(&self) -> std::time::Duration {
        self.inner.last_activity_instant().elapsed()
    }

    pub(crate) fn expirable(&self) -> Weak<dyn Expirable> {
        let strong: Arc<dyn Expirable> = Arc::clone(&self.inner) as Arc<dyn Expirable>;
        Arc::downgrade(&strong)
    }

    pub(crate) fn last_activity_instant(&self) -> Instant {
        self.inner.last_activity_instant()
    }

    /// Main transaction, reusing the active one or beginning a fresh one.
    /// Caller holds the link mutex.
    async fn ensure_main(&self, link: &L) -> Result<Arc<TxInner<L>>> {
        self.ensure_main_with(link, None).await
    }

    async fn ensure_main_with(
        &self,
        link: &L,
        params: Option<TransactionParams>,
    ) -> Result<Arc<TxInner<L>>> {
        let existing = {
            let main = self.inner.main_tx.lock();
            main.as_ref().filter(|t| t.is_active()).map(Arc::clone)
        };
        if let Some(tx) = existing {
            return Ok(tx);
        }
        let tx = TxInner::new(
            Arc::downgrade(&self.inner),
            params.unwrap_or_else(|| self.inner.options.default_params.clone()),
        );
        tx.begin_on(link, None).await?;
        self.inner.transactions.lock().push(Arc::clone(&tx));
        *self.inner.main_tx.lock() = Some(Arc::clone(&tx));
        Ok(tx)
    }

    /// The main transaction object, which must already exist and be ACTIVE.
    fn main_existing(&self) -> Result<Transaction<L>> {
        let main = self.inner.main_tx.lock();
        main.as_ref()
            .filter(|t| t.is_active())
            .map(Arc::clone)
            .map(Transaction::from_inner)
            .ok_or(Error::InactiveTransaction)
    }
}
