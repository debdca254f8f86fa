//! Error types for txkit.
//!
//! Three classes matter to callers: usage errors (a bug in the calling
//! program, never retried), operational errors (the link or the server
//! failed), and the timed-out error raised when the idle monitor closed a
//! connection nontransparently.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Operating on an object that has already been closed.
    #[error("{0} is closed")]
    Closed(&'static str),

    /// Statement execution or info request on a transaction with no
    /// physical context.
    #[error("transaction is not active")]
    InactiveTransaction,

    /// A prepared statement was submitted through a cursor other than the
    /// one that compiled it.
    #[error("prepared statement belongs to a different cursor")]
    ForeignStatement,

    /// A handle that depends on server-side session state from before a
    /// transparent resumption was reused.
    #[error("handle was invalidated by connection resumption")]
    StaleHandle,

    /// Other caller mistakes (double begin, bad savepoint name, ...).
    #[error("usage error: {0}")]
    Usage(String),

    /// The link or the remote server rejected an operation.
    #[error("operational error: {0}")]
    Operational(String),

    /// First use of a connection the idle monitor closed nontransparently.
    #[error("connection was closed by the idle timeout monitor")]
    TimedOut,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Caller bug: surfaced, never retried.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            Error::Closed(_)
                | Error::InactiveTransaction
                | Error::ForeignStatement
                | Error::StaleHandle
                | Error::Usage(_)
        )
    }

    /// Link or server failure.
    pub fn is_operational(&self) -> bool {
        matches!(self, Error::Operational(_) | Error::Io(_))
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Error::TimedOut)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
