//! Idle-timeout monitoring.
//!
//! A single [`TimeoutMonitor`] task watches any number of registered
//! connections. When a connection has seen no activity for its configured
//! period, the monitor commits to that observation, consults the user's
//! policy callback, and either vetoes (re-arms the timer) or expires the
//! connection: resolving open transactions, dropping the physical link, and
//! marking the connection for transparent resumption or permanent failure.
//!
//! Policy callbacks receive plain snapshots, never a connection handle, so
//! reentrant connection use from inside a callback is impossible by
//! construction. A panicking callback is contained and treated as the most
//! conservative decision.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Polling fallback while no registration is armed.
const IDLE_POLL: Duration = Duration::from_millis(500);

// ============================================================================
// Policy surface
// ============================================================================

/// What the policy callback wants done with an idle connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    /// Keep the connection; re-arm the timer for another full period.
    Veto,
    /// Drop the link without resolving; the connection fails permanently.
    Nontransparent,
    /// Roll back open transactions, drop the link, allow transparent
    /// resumption.
    Rollback,
    /// Commit open transactions, drop the link, allow transparent
    /// resumption.
    Commit,
}

/// Snapshot handed to the before-expiry callback. Carries no connection
/// handle on purpose.
#[derive(Debug, Clone)]
pub struct TimeoutInfo {
    pub endpoint: String,
    /// Whether any transaction was open at snapshot time.
    pub has_transaction: bool,
    /// Seconds since the physical link was (re)established.
    pub active_secs: u64,
    /// Seconds since the last operation on the connection.
    pub idle_secs: u64,
}

/// Snapshot handed to the after-expiry callback.
#[derive(Debug, Clone)]
pub struct TimeoutDropInfo {
    pub endpoint: String,
    pub active_secs: u64,
    pub idle_secs: u64,
}

type BeforeCallback = Box<dyn Fn(&TimeoutInfo) -> TimeoutAction + Send + Sync>;
type AfterCallback = Box<dyn Fn(&TimeoutDropInfo) + Send + Sync>;

/// Per-connection idle policy.
pub struct TimeoutConfig {
    period: Duration,
    before: Option<BeforeCallback>,
    after: Option<AfterCallback>,
}

impl TimeoutConfig {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            before: None,
            after: None,
        }
    }

    /// Decide what happens when the period elapses. Without a callback the
    /// default applies: transparent detach when no transaction is open,
    /// nontransparent close otherwise.
    pub fn on_timeout(
        mut self,
        f: impl Fn(&TimeoutInfo) -> TimeoutAction + Send + Sync + 'static,
    ) -> Self {
        self.before = Some(Box::new(f));
        self
    }

    /// Observe an expiry after the link is gone.
    pub fn after_timeout(mut self, f: impl Fn(&TimeoutDropInfo) + Send + Sync + 'static) -> Self {
        self.after = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for TimeoutConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutConfig")
            .field("period", &self.period)
            .field("before", &self.before.is_some())
            .field("after", &self.after.is_some())
            .finish()
    }
}

// ============================================================================
// Monitor-facing connection surface
// ============================================================================

/// How an expiry tears the connection down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExpiryAction {
    /// Roll back open transactions. `resumable: false` is the
    /// nontransparent close.
    Rollback { resumable: bool },
    Commit,
    /// No transactions to resolve; just drop the link, resumable.
    Detach,
}

/// What the monitor needs from a connection, object-safe so one monitor
/// task can watch connections over different link types.
pub(crate) trait Expirable: Send + Sync + 'static {
    fn endpoint(&self) -> String;
    fn is_closed(&self) -> bool;
    /// The link is currently dropped awaiting resumption.
    fn is_suspended(&self) -> bool;
    fn last_activity(&self) -> Instant;
    fn connected_since(&self) -> Instant;
    fn has_open_transaction(&self) -> bool;
    fn expire(self: Arc<Self>, action: ExpiryAction)
        -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

// ============================================================================
// Monitor
// ============================================================================

struct Registration {
    conn: Weak<dyn Expirable>,
    period: Duration,
    before: Option<BeforeCallback>,
    after: Option<AfterCallback>,
    deadline: Mutex<Instant>,
    cancelled: AtomicBool,
}

/// Handle to one monitored connection. Dropping it does not cancel
/// monitoring; call [`TimeoutRegistration::cancel`].
pub struct TimeoutRegistration {
    inner: Arc<Registration>,
}

impl TimeoutRegistration {
    /// Stop watching the connection. The connection itself is untouched.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }
}

struct MonitorInner {
    entries: Mutex<Vec<Arc<Registration>>>,
    changed: Notify,
    shutdown: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Background idle-timeout monitor.
///
/// Cheap to clone; clones share the same watcher task. Must be started
/// from within a tokio runtime.
pub struct TimeoutMonitor {
    inner: Arc<MonitorInner>,
}

impl Clone for TimeoutMonitor {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl TimeoutMonitor {
    pub fn start() -> Self {
        let inner = Arc::new(MonitorInner {
            entries: Mutex::new(Vec::new()),
            changed: Notify::new(),
            shutdown: AtomicBool::new(false),
            task: Mutex::new(None),
        });
        let task = tokio::spawn(run(Arc::clone(&inner)));
        *inner.task.lock() = Some(task);
        Self { inner }
    }

    /// Watch a connection with the given idle policy. The timer arms from
    /// the connection's current last-activity time.
    pub fn register<L: crate::link::PhysicalLink>(
        &self,
        conn: &crate::connection::Connection<L>,
        config: TimeoutConfig,
    ) -> TimeoutRegistration {
        let deadline = conn.last_activity_instant() + config.period;
        let reg = Arc::new(Registration {
            conn: conn.expirable(),
            period: config.period,
            before: config.before,
            after: config.after,
            deadline: Mutex::new(deadline),
            cancelled: AtomicBool::new(false),
        });
        self.inner.entries.lock().push(Arc::clone(&reg));
        self.inner.changed.notify_one();
        TimeoutRegistration { inner: reg }
    }

    /// Stop the watcher task. Registered connections are untouched: the
    /// task observes the flag at the top of its cycle, so an in-flight
    /// expiry always runs to completion rather than being torn down
    /// between dropping a link and marking the connection timed out.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.changed.notify_waiters();
    }

    /// Shut down and wait for the watcher task to finish its in-flight
    /// cycle.
    pub async fn shutdown_and_wait(&self) {
        self.shutdown();
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn run(inner: Arc<MonitorInner>) {
    loop {
        if inner.shutdown.load(Ordering::SeqCst) {
            break;
        }
        let now = Instant::now();
        let due: Vec<Arc<Registration>> = {
            let mut entries = inner.entries.lock();
            entries.retain(|r| {
                !r.cancelled.load(Ordering::SeqCst) && r.conn.strong_count() > 0
            });
            entries
                .iter()
                .filter(|r| *r.deadline.lock() <= now)
                .cloned()
                .collect()
        };
        for reg in due {
            if !fire(&reg).await {
                reg.cancelled.store(true, Ordering::SeqCst);
            }
        }
        let next = {
            let entries = inner.entries.lock();
            entries
                .iter()
                .filter(|r| !r.cancelled.load(Ordering::SeqCst))
                .map(|r| *r.deadline.lock())
                .min()
        };
        let sleep_for = match next {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => IDLE_POLL,
        };
        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = inner.changed.notified() => {}
        }
    }
}

/// Handle one due registration. Returns whether to keep tracking it.
async fn fire(reg: &Registration) -> bool {
    let Some(conn) = reg.conn.upgrade() else {
        return false;
    };
    if conn.is_closed() {
        return false;
    }
    let now = Instant::now();
    if conn.is_suspended() {
        // Link already dropped; nothing to expire until it resumes.
        *reg.deadline.lock() = now + reg.period;
        return true;
    }
    let last = conn.last_activity();
    let idle = now.saturating_duration_since(last);
    if idle < reg.period {
        // Activity happened since the timer armed.
        *reg.deadline.lock() = last + reg.period;
        return true;
    }

    // Committed to this observation: a guarded operation racing past this
    // point waits on the link mutex and sees the expiry outcome.
    let info = TimeoutInfo {
        endpoint: conn.endpoint(),
        has_transaction: conn.has_open_transaction(),
        active_secs: now.saturating_duration_since(conn.connected_since()).as_secs(),
        idle_secs: idle.as_secs(),
    };
    let decision = match &reg.before {
        Some(cb) => match catch_unwind(AssertUnwindSafe(|| cb(&info))) {
            Ok(action) => action,
            Err(_) => {
                tracing::warn!(
                    endpoint = %info.endpoint,
                    "idle-timeout callback panicked; closing nontransparently"
                );
                TimeoutAction::Nontransparent
            }
        },
        None => {
            if info.has_transaction {
                TimeoutAction::Nontransparent
            } else {
                TimeoutAction::Rollback
            }
        }
    };
    let action = match decision {
        TimeoutAction::Veto => {
            tracing::debug!(endpoint = %info.endpoint, "idle timeout vetoed");
            *reg.deadline.lock() = now + reg.period;
            return true;
        }
        TimeoutAction::Nontransparent => ExpiryAction::Rollback { resumable: false },
        TimeoutAction::Rollback => {
            if info.has_transaction {
                ExpiryAction::Rollback { resumable: true }
            } else {
                ExpiryAction::Detach
            }
        }
        TimeoutAction::Commit => {
            if info.has_transaction {
                ExpiryAction::Commit
            } else {
                ExpiryAction::Detach
            }
        }
    };
    conn.expire(action).await;
    if let Some(cb) = &reg.after {
        let drop_info = TimeoutDropInfo {
            endpoint: info.endpoint.clone(),
            active_secs: info.active_secs,
            idle_secs: info.idle_secs,
        };
        if catch_unwind(AssertUnwindSafe(|| cb(&drop_info))).is_err() {
            tracing::warn!(
                endpoint = %info.endpoint,
                "idle-timeout after-callback panicked"
            );
        }
    }
    *reg.deadline.lock() = now + reg.period;
    true
}
