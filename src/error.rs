//! Error handling utils.
//!
//! All fallible operations in this crate return [`Result`], whose error type
//! unifies the handful of error kinds the runtime core can surface: promise
//! API misuse, worker pool submission preconditions, and the database
//! daemon's errors once a write has exhausted its retries.

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents all error cases surfaced by the fiber scheduler, the worker
/// pool and the database daemon.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// `Promise::set_success`/`set_exception` called on a promise that has
    /// already transitioned.
    #[error("promise has already been satisfied")]
    PromiseAlreadySatisfied,

    /// `Promise::check_and_rethrow` called before the promise transitioned.
    #[error("promise has not been satisfied")]
    PromiseNotSatisfied,

    /// [`WorkerPool::insert`](crate::worker::WorkerPool::insert) was given a
    /// handle that had already been consumed.
    #[error("job handle is null")]
    JobNullHandle,

    /// [`WorkerPool::insert`](crate::worker::WorkerPool::insert) was given a
    /// handle with more than one outstanding reference.
    #[error("job handle must be uniquely owned")]
    JobNotUnique,

    /// The worker pool has no configured worker threads.
    #[error("no worker threads are available")]
    NoWorkers,

    /// An operation was submitted to a daemon that is shutting down.
    #[error("daemon is shutting down")]
    DaemonShuttingDown,

    /// A database operation failed after exhausting its retry budget.
    #[error("database error {code}: {message}")]
    Db { code: u16, message: String },

    /// A fiber was reclaimed while suspended on a future that could never
    /// have been satisfied (its producer was dropped).
    #[error("the awaited promise was abandoned")]
    Abandoned,

    /// Error returned by the underlying MySQL client.
    #[error("mysql client error: {0}")]
    MySql(String),

    /// I/O error, e.g. while writing a SQL dump file.
    #[error("io error: {0}")]
    Io(String),

    /// A configuration value could not be parsed or the config file could
    /// not be read.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<mysql::Error> for Error {
    fn from(e: mysql::Error) -> Self {
        Error::MySql(e.to_string())
    }
}
