//! In-memory [`PhysicalLink`] used by the crate tests.
//!
//! Each endpoint name maps to one shared server holding a committed list of
//! integers. The statement grammar is tiny: `INSERT <n>` (or `INSERT` with
//! one integer parameter), `SELECT`, `SAVEPOINT <name>`, `ROLLBACK TO
//! <name>`, and `POST <name> [count]` for event postings. Events are
//! delivered to subscribers only when the posting transaction commits,
//! matching the delivery guarantee real servers give.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use smallvec::smallvec;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::link::{
    CompiledStatement, Credentials, EventBatch, EventFeed, ExecOutcome, PhysicalLink,
    ResolveMode, Row, StatementKind, TransactionParams, Value,
};

static SERVERS: Lazy<Mutex<HashMap<String, Arc<ServerState>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

struct TxWork {
    rows: Vec<i64>,
    /// Name, row snapshot, and event-log length at savepoint time.
    savepoints: Vec<(String, Vec<i64>, usize)>,
    events: Vec<(String, u64)>,
}

impl TxWork {
    fn fresh(rows: Vec<i64>) -> Self {
        Self {
            rows,
            savepoints: Vec::new(),
            events: Vec::new(),
        }
    }
}

struct Subscriber {
    id: u64,
    names: Vec<String>,
    sender: mpsc::UnboundedSender<EventBatch>,
}

pub(crate) struct ServerState {
    rows: Mutex<Vec<i64>>,
    active: Mutex<HashMap<u64, TxWork>>,
    subscribers: Mutex<Vec<Subscriber>>,
    tx_seq: AtomicU64,
    sub_seq: AtomicU64,
    pub(crate) connects: AtomicU64,
    pub(crate) compiles: AtomicU64,
}

impl ServerState {
    fn deliver(&self, events: &[(String, u64)]) {
        if events.is_empty() {
            return;
        }
        let mut counts: EventBatch = HashMap::new();
        for (name, n) in events {
            *counts.entry(name.clone()).or_insert(0) += n;
        }
        let subscribers = self.subscribers.lock();
        for sub in subscribers.iter() {
            if sub.names.iter().any(|n| counts.contains_key(n)) {
                let _ = sub.sender.send(counts.clone());
            }
        }
    }
}

/// Shared server behind an endpoint, creating it on first use. Tests use
/// this to observe connect/compile counts and committed state.
pub(crate) fn server(endpoint: &str) -> Arc<ServerState> {
    let mut servers = SERVERS.lock();
    Arc::clone(
        servers
            .entry(endpoint.to_string())
            .or_insert_with(|| {
                Arc::new(ServerState {
                    rows: Mutex::new(Vec::new()),
                    active: Mutex::new(HashMap::new()),
                    subscribers: Mutex::new(Vec::new()),
                    tx_seq: AtomicU64::new(0),
                    sub_seq: AtomicU64::new(0),
                    connects: AtomicU64::new(0),
                    compiles: AtomicU64::new(0),
                })
            }),
    )
}

pub(crate) fn connect_count(endpoint: &str) -> u64 {
    server(endpoint).connects.load(Ordering::SeqCst)
}

pub(crate) fn compile_count(endpoint: &str) -> u64 {
    server(endpoint).compiles.load(Ordering::SeqCst)
}

pub(crate) fn committed_rows(endpoint: &str) -> Vec<i64> {
    server(endpoint).rows.lock().clone()
}

pub(crate) struct MemoryLink {
    server: Arc<ServerState>,
    alive: AtomicBool,
}

impl MemoryLink {
    fn check_alive(&self) -> Result<()> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Operational("link is closed".into()))
        }
    }
}

impl PhysicalLink for MemoryLink {
    type Tx = u64;
    type Stmt = String;

    async fn connect(endpoint: &str, _credentials: &Credentials) -> Result<Self> {
        let server = server(endpoint);
        server.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Self {
            server,
            alive: AtomicBool::new(true),
        })
    }

    async fn close(&self) -> Result<()> {
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn begin_tx(&self, _params: &TransactionParams) -> Result<u64> {
        self.check_alive()?;
        let id = self.server.tx_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let rows = self.server.rows.lock().clone();
        self.server.active.lock().insert(id, TxWork::fresh(rows));
        Ok(id)
    }

    async fn resolve_tx(
        &self,
        tx: &u64,
        mode: ResolveMode,
        retaining: bool,
    ) -> Result<Option<u64>> {
        self.check_alive()?;
        let work = self
            .server
            .active
            .lock()
            .remove(tx)
            .ok_or_else(|| Error::Operational("unknown transaction context".into()))?;
        if mode == ResolveMode::Commit {
            *self.server.rows.lock() = work.rows;
            self.server.deliver(&work.events);
        }
        if retaining {
            let id = self.server.tx_seq.fetch_add(1, Ordering::SeqCst) + 1;
            let rows = self.server.rows.lock().clone();
            self.server.active.lock().insert(id, TxWork::fresh(rows));
            Ok(Some(id))
        } else {
            Ok(None)
        }
    }

    async fn prepare_tx(&self, tx: &u64) -> Result<()> {
        self.check_alive()?;
        if self.server.active.lock().contains_key(tx) {
            Ok(())
        } else {
            Err(Error::Operational("unknown transaction context".into()))
        }
    }

    async fn compile(&self, text: &str) -> Result<CompiledStatement<String>> {
        self.check_alive()?;
        self.server.compiles.fetch_add(1, Ordering::SeqCst);
        let mut words = text.split_whitespace();
        let (kind, num_params, columns) = match words.next() {
            Some("SELECT") => (StatementKind::Query, 0, vec!["n".to_string()]),
            Some("INSERT") => {
                let inline = words.next().is_some();
                (StatementKind::Dml, usize::from(!inline), Vec::new())
            }
            Some("SAVEPOINT") | Some("ROLLBACK") | Some("POST") => {
                (StatementKind::Other, 0, Vec::new())
            }
            _ => {
                return Err(Error::Operational(format!(
                    "cannot compile statement: {text:?}"
                )))
            }
        };
        Ok(CompiledStatement {
            handle: text.to_string(),
            kind,
            num_params,
            columns,
            plan: Some("MEMORY".to_string()),
        })
    }

    async fn execute(
        &self,
        tx: &u64,
        stmt: &String,
        params: &[Value],
        _cursor_name: Option<&str>,
    ) -> Result<ExecOutcome> {
        self.check_alive()?;
        let mut active = self.server.active.lock();
        let work = active
            .get_mut(tx)
            .ok_or_else(|| Error::Operational("unknown transaction context".into()))?;
        let words: Vec<&str> = stmt.split_whitespace().collect();
        match words.as_slice() {
            ["SELECT"] => {
                let rows: Vec<Row> = work
                    .rows
                    .iter()
                    .map(|n| -> Row { smallvec![Value::Int(*n)] })
                    .collect();
                Ok(ExecOutcome {
                    columns: vec!["n".to_string()],
                    rows,
                    rows_affected: 0,
                })
            }
            ["INSERT"] => {
                let Some(Value::Int(n)) = params.first() else {
                    return Err(Error::Operational(
                        "INSERT expects one integer parameter".into(),
                    ));
                };
                work.rows.push(*n);
                Ok(ExecOutcome {
                    rows_affected: 1,
                    ..Default::default()
                })
            }
            ["INSERT", n] => {
                let n: i64 = n
                    .parse()
                    .map_err(|_| Error::Operational(format!("bad INSERT literal: {n:?}")))?;
                work.rows.push(n);
                Ok(ExecOutcome {
                    rows_affected: 1,
                    ..Default::default()
                })
            }
            ["SAVEPOINT", name] => {
                work.savepoints
                    .push((name.to_string(), work.rows.clone(), work.events.len()));
                Ok(ExecOutcome::default())
            }
            ["ROLLBACK", "TO", name] => {
                let idx = work
                    .savepoints
                    .iter()
                    .rposition(|(n, _, _)| n == name)
                    .ok_or_else(|| {
                        Error::Operational(format!("unknown savepoint: {name:?}"))
                    })?;
                let (_, rows, events_len) = work.savepoints[idx].clone();
                work.rows = rows;
                work.events.truncate(events_len);
                work.savepoints.truncate(idx + 1);
                Ok(ExecOutcome::default())
            }
            ["POST", name] => {
                work.events.push((name.to_string(), 1));
                Ok(ExecOutcome::default())
            }
            ["POST", name, count] => {
                let count: u64 = count
                    .parse()
                    .map_err(|_| Error::Operational(format!("bad POST count: {count:?}")))?;
                work.events.push((name.to_string(), count));
                Ok(ExecOutcome::default())
            }
            _ => Err(Error::Operational(format!("cannot execute: {stmt:?}"))),
        }
    }

    async fn subscribe_events(&self, names: &[String]) -> Result<EventFeed> {
        self.check_alive()?;
        let (sender, batches) = mpsc::unbounded_channel();
        let id = self.server.sub_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.server.subscribers.lock().push(Subscriber {
            id,
            names: names.to_vec(),
            sender,
        });
        let server = Arc::clone(&self.server);
        let cancel = Box::new(move || {
            server.subscribers.lock().retain(|s| s.id != id);
        });
        Ok(EventFeed { batches, cancel })
    }
}
