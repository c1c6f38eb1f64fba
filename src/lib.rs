//! Poseidon: a cooperative fiber scheduler, promise/future synchronization,
//! a worker pool, and a sharded MySQL writer daemon.
//!
//! - [Promise/Future](promise): the one-shot rendezvous between background
//!   producers and fibers.
//! - [Timer driver](timer): a single thread firing delayed/periodic
//!   callbacks through a promise.
//! - [Fiber scheduler](fiber): stackless cooperative tasks that suspend at
//!   `yield_on` and resume when their awaited future completes.
//! - [Worker pool](worker): fixed OS-thread workers executing keyed,
//!   fire-and-forget jobs with FIFO ordering per key.
//! - [DB daemon](db): per-shard serialized MySQL writers with delayed
//!   writes, write-combining, retry with backoff, and failure dumping.
//! - [`Runtime`](runtime::Runtime) composes all four into one value with a
//!   single start/shutdown.
//!
//! ### Configuration
//!
//! Every subsystem is parameterized by a flat key/value [`Config`](config::Config),
//! loaded from a simple `key = value` file or built in memory.
//!
//! ### Errors and logging
//!
//! All fallible operations return [`Result<T>`] against a single
//! [`Error`] enum. The crate logs through the [`log`] facade; attach any
//! subscriber (e.g. `env_logger`) in the binary that embeds Poseidon.

pub mod config;
pub mod db;
pub mod error;
pub mod fiber;
pub mod promise;
pub mod route;
pub mod runtime;
pub mod timer;
pub mod worker;

pub use error::{Error, Result};
pub use runtime::Runtime;
