//! The physical-link capability.
//!
//! Everything dialect- or wire-specific lives behind [`PhysicalLink`]: txkit
//! only needs a link that can open/close itself, start and resolve a
//! transaction context, execute opaque statement text bound to a context,
//! and push event-occurrence batches. Statement text is forwarded verbatim;
//! this crate never parses SQL.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tokio::sync::mpsc;

use crate::error::Result;

// ============================================================================
// Credentials and transaction parameters
// ============================================================================

/// Identity presented to the remote server.
///
/// Kept by the connection for the whole of its life so that a transparent
/// resumption can reconnect without application involvement.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    pub password: Option<String>,
    /// Optional server-side role to assume after attach.
    pub role: Option<String>,
}

impl Credentials {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: None,
            role: None,
        }
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }
}

/// Isolation level requested for a physical transaction context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    /// Stable snapshot taken at begin time.
    #[default]
    Snapshot,
    ReadCommitted,
    Serializable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    #[default]
    ReadWrite,
    ReadOnly,
}

/// Transaction-parameter configuration (the "tpb" of the external API).
#[derive(Debug, Clone, Default)]
pub struct TransactionParams {
    pub isolation: Isolation,
    pub access: AccessMode,
    /// Seconds to wait on a lock conflict; `None` waits forever.
    pub lock_timeout: Option<u32>,
}

impl TransactionParams {
    pub fn isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn access(mut self, access: AccessMode) -> Self {
        self.access = access;
        self
    }

    pub fn lock_timeout(mut self, seconds: u32) -> Self {
        self.lock_timeout = Some(seconds);
        self
    }
}

/// How a physical transaction context is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    Commit,
    Rollback,
}

// ============================================================================
// Values and execution outcomes
// ============================================================================

/// A statement parameter or result value.
///
/// Deliberately small: richer type translation is a collaborator concern,
/// not part of the lifecycle core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

/// A result row. Inline storage for rows with <=16 columns avoids heap
/// allocation for typical tables.
pub type Row = SmallVec<[Value; 16]>;

/// Classification reported by the statement compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// Returns a result stream.
    Query,
    /// INSERT/UPDATE/DELETE and friends.
    Dml,
    Ddl,
    Other,
}

/// A compiled statement handle plus the metadata the compiler reported.
#[derive(Debug, Clone)]
pub struct CompiledStatement<S> {
    pub handle: S,
    pub kind: StatementKind,
    /// Number of input parameters the statement expects.
    pub num_params: usize,
    /// Output column names; empty for non-queries.
    pub columns: Vec<String>,
    /// Execution plan description, when the server provides one.
    pub plan: Option<String>,
}

/// Result of executing one statement.
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub rows_affected: u64,
}

// ============================================================================
// Event delivery
// ============================================================================

/// One delivered unit of event-occurrence counts. May be a subset of a
/// causing transaction's postings; counts are since the previous batch.
pub type EventBatch = HashMap<String, u64>;

/// A live server-side event subscription as handed out by the link.
///
/// `batches` yields raw batches as the server pushes them; dropping the
/// receiver or calling `cancel` tears the subscription down server-side.
pub struct EventFeed {
    pub batches: mpsc::UnboundedReceiver<EventBatch>,
    pub cancel: Box<dyn FnOnce() + Send>,
}

impl fmt::Debug for EventFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventFeed").finish_non_exhaustive()
    }
}

// ============================================================================
// The link trait
// ============================================================================

/// An abstract physical link to a remote transactional server.
///
/// All futures are `Send` so the timeout monitor can drive resolution from
/// its background task. One link instance is owned by exactly one
/// [`Connection`](crate::Connection), which serializes every call; link
/// implementations do not need internal request ordering.
pub trait PhysicalLink: Sized + Send + Sync + 'static {
    /// Server-side transaction context identifier.
    type Tx: Clone + fmt::Debug + Send + Sync + 'static;
    /// Compiled statement handle.
    type Stmt: Clone + Send + Sync + 'static;

    /// Open a physical link to `endpoint` as `credentials`.
    fn connect(
        endpoint: &str,
        credentials: &Credentials,
    ) -> impl Future<Output = Result<Self>> + Send;

    /// Release the link. Idempotent.
    fn close(&self) -> impl Future<Output = Result<()>> + Send;

    /// Start a physical transaction context.
    fn begin_tx(
        &self,
        params: &TransactionParams,
    ) -> impl Future<Output = Result<Self::Tx>> + Send;

    /// Resolve a context. With `retaining` the server keeps the snapshot and
    /// returns a fresh context under which work continues; otherwise the
    /// context is released and `None` comes back.
    fn resolve_tx(
        &self,
        tx: &Self::Tx,
        mode: ResolveMode,
        retaining: bool,
    ) -> impl Future<Output = Result<Option<Self::Tx>>> + Send;

    /// First phase of two-phase resolution.
    fn prepare_tx(&self, tx: &Self::Tx) -> impl Future<Output = Result<()>> + Send;

    /// Compile opaque statement text into a reusable handle.
    fn compile(
        &self,
        text: &str,
    ) -> impl Future<Output = Result<CompiledStatement<Self::Stmt>>> + Send;

    /// Execute a compiled statement bound to a transaction context.
    /// `cursor_name`, when present, names the server-side cursor so that
    /// positioned update/delete can reference it.
    fn execute(
        &self,
        tx: &Self::Tx,
        stmt: &Self::Stmt,
        params: &[Value],
        cursor_name: Option<&str>,
    ) -> impl Future<Output = Result<ExecOutcome>> + Send;

    /// Register interest in a set of event names and return the delivery
    /// feed. The server only ever sends occurrences of subscribed names.
    fn subscribe_events(
        &self,
        names: &[String],
    ) -> impl Future<Output = Result<EventFeed>> + Send;
}
