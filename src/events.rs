//! Asynchronous event-notification conduits.
//!
//! An [`EventConduit`] pairs a server-side subscription with a pump task
//! that moves raw occurrence batches into a FIFO queue, normalized over the
//! subscribed names. Consumers block on [`EventConduit::wait`] without
//! holding up the owning connection's request traffic; the server never
//! delivers occurrences from a transaction that has not committed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::link::{EventBatch, EventFeed};

/// Conduit behavior knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConduitOptions {
    /// Make `wait` on a closed conduit fail instead of returning `None`.
    pub error_when_closed: bool,
}

pub(crate) struct ConduitInner {
    names: Vec<String>,
    queue: Mutex<VecDeque<EventBatch>>,
    notify: Notify,
    closed: AtomicBool,
    error_when_closed: bool,
    cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ConduitInner {
    /// Zero-fill over the subscribed names; unsubscribed names never leak
    /// through even if a link misbehaves.
    fn normalize(&self, raw: &EventBatch) -> EventBatch {
        self.names
            .iter()
            .map(|n| (n.clone(), raw.get(n).copied().unwrap_or(0)))
            .collect()
    }

    /// Tear down: cancel the subscription, stop the pump, drop queued
    /// batches, wake every waiter. Idempotent.
    pub(crate) fn shut(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(cancel) = self.cancel.lock().take() {
            cancel();
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.queue.lock().clear();
        self.notify.notify_waiters();
    }
}

/// A live event subscription with FIFO delivery.
///
/// Cheap to clone; clones share the queue, so each batch is delivered to
/// exactly one waiter.
pub struct EventConduit {
    inner: Arc<ConduitInner>,
}

impl Clone for EventConduit {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl EventConduit {
    pub(crate) fn spawn(names: Vec<String>, feed: EventFeed, options: ConduitOptions) -> Self {
        let inner = Arc::new(ConduitInner {
            names,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            error_when_closed: options.error_when_closed,
            cancel: Mutex::new(Some(feed.cancel)),
            pump: Mutex::new(None),
        });
        let pump_inner = Arc::clone(&inner);
        let mut batches = feed.batches;
        let pump = tokio::spawn(async move {
            while let Some(raw) = batches.recv().await {
                if pump_inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                let batch = pump_inner.normalize(&raw);
                pump_inner.queue.lock().push_back(batch);
                pump_inner.notify.notify_one();
            }
        });
        *inner.pump.lock() = Some(pump);
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<ConduitInner> {
        Arc::downgrade(&self.inner)
    }

    /// Dequeue the next batch, blocking until one arrives. `timeout`
    /// bounds the wait; `Ok(None)` means it elapsed with nothing queued.
    ///
    /// On a closed conduit this returns `Ok(None)`, or an error when the
    /// conduit was opened with `error_when_closed`.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<Option<EventBatch>> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            // Register for the wakeup before checking the queue, otherwise
            // a batch arriving in between would be missed.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            if let Some(batch) = self.inner.queue.lock().pop_front() {
                return Ok(Some(batch));
            }
            if self.inner.closed.load(Ordering::SeqCst) {
                return if self.inner.error_when_closed {
                    Err(Error::Closed("event conduit"))
                } else {
                    Ok(None)
                };
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, &mut notified).await.is_err() {
                        return Ok(None);
                    }
                }
                None => notified.as_mut().await,
            }
        }
    }

    /// Drop all queued batches, returning how many were discarded.
    pub fn flush(&self) -> usize {
        let mut queue = self.inner.queue.lock();
        let n = queue.len();
        queue.clear();
        n
    }

    /// Number of batches currently queued.
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Subscribed event names, in subscription order.
    pub fn names(&self) -> &[String] {
        &self.inner.names
    }

    /// Cancel the subscription and wake every waiter. Idempotent.
    pub fn close(&self) {
        self.inner.shut();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}
