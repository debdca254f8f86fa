//! txkit - connection, transaction and event runtime for remote
//! transactional databases.
//!
//! The crate manages object lifecycles and server interaction patterns on
//! top of an abstract [`PhysicalLink`]: explicit and implicit transactions
//! with retaining resolution and savepoints, per-cursor prepared-statement
//! caching, idle-timeout monitoring with user policy and transparent
//! resumption, and asynchronous event-notification conduits.
//!
//! ```no_run
//! # use txkit::{connect, ConnectOptions, Credentials};
//! # async fn demo<L: txkit::PhysicalLink>() -> txkit::Result<()> {
//! let conn = connect::<L>(
//!     "server:employee",
//!     Credentials::new("sysdba").password("masterkey"),
//!     ConnectOptions::default(),
//! )
//! .await?;
//!
//! let tx = conn.trans().await?;
//! let cur = tx.cursor()?;
//! cur.execute("UPDATE accounts SET balance = balance - 10", &[]).await?;
//! tx.commit().await?;
//! conn.close().await?;
//! # Ok(())
//! # }
//! ```

mod connection;
mod cursor;
mod error;
mod events;
mod link;
mod monitor;
mod statement;
mod transaction;

#[cfg(test)]
mod testing;

pub use connection::{ConnectOptions, Connection};
pub use cursor::Cursor;
pub use error::{Error, Result};
pub use events::{ConduitOptions, EventConduit};
pub use link::{
    AccessMode, CompiledStatement, Credentials, EventBatch, EventFeed, ExecOutcome, Isolation,
    PhysicalLink, ResolveMode, Row, StatementKind, TransactionParams, Value,
};
pub use monitor::{
    TimeoutAction, TimeoutConfig, TimeoutDropInfo, TimeoutInfo, TimeoutMonitor,
    TimeoutRegistration,
};
pub use statement::PreparedStatement;
pub use transaction::{Transaction, TransactionInfo, RESOLUTION_OPEN, RESOLUTION_RESOLVED};

/// Open a connection to `endpoint` over the chosen link type.
pub async fn connect<L: PhysicalLink>(
    endpoint: &str,
    credentials: Credentials,
    options: ConnectOptions,
) -> Result<Connection<L>> {
    Connection::open(endpoint, credentials, options).await
}
