//! Database operation variants and the write-combining primitive.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mysql::prelude::Queryable;
use mysql::{Conn, Row};

use crate::error::{Error, Result};
use crate::promise::{Promise, WeakPromise};

/// Minimal stand-in for the original's `MySql::ObjectBase`: enough for a
/// `Save` operation to build a `REPLACE INTO` statement without a query
/// planner (out of scope).
pub trait DbObject: Send + Sync + 'static {
    /// Table this object is persisted into.
    fn table(&self) -> &'static str;
    /// Column name/value pairs written by `Save`, including the primary key.
    fn write_columns(&self) -> Vec<(&'static str, mysql::Value)>;
}

/// A monotonically increasing sequence-number stamp attached to an object
/// that has a `Save` enqueued for it. Replaces the original's pointer-identity
/// stamp (the address of the queue element) per the design notes: the same
/// semantics, without the pointer-identity hazard.
#[derive(Default)]
pub struct CombineStamp(AtomicU64);

impl CombineStamp {
    pub fn new() -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(0)))
    }

    /// Called at enqueue time: publishes `seq` as the latest pending write.
    pub fn mark_pending(&self, seq: u64) {
        self.0.store(seq, Ordering::SeqCst);
    }

    /// Called at execution time: true if `seq` is still the latest pending
    /// write for this object (so this element should actually execute),
    /// clearing the stamp in that case so a fresh `Save` starts over.
    pub fn take_if_latest(&self, seq: u64) -> bool {
        self.0
            .compare_exchange(seq, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Global source of write-combining sequence numbers, owned by the daemon.
#[derive(Default)]
pub struct SequenceCounter(AtomicU64);

impl SequenceCounter {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Shared broadcast-completion state for a `Wait` submitted to every shard
/// (`submit_operation_all`). Each shard holds one clone; the destructor of
/// the last clone satisfies the caller's promise exactly once, mirroring
/// the original's shared_ptr-destructor broadcast.
pub struct WaitShared {
    promise: Promise<()>,
}

impl WaitShared {
    pub fn new() -> (Arc<Self>, crate::promise::Future<()>) {
        let promise = Promise::new();
        let future = promise.future();
        (Arc::new(Self { promise }), future)
    }
}

impl Drop for WaitShared {
    fn drop(&mut self) {
        // Unconditional: a shard-level `DO 0` failure is logged elsewhere
        // but never fails the broadcast Wait, per the design notes.
        let _ = self.promise.set_success(());
    }
}

type RowCallback = Box<dyn FnOnce(Row) -> Result<()> + Send>;
type BatchRowCallback = Box<dyn FnMut(Row) -> Result<()> + Send>;
type RawCallback = Box<dyn FnOnce(&mut Conn) + Send>;

pub enum OperationKind {
    Save {
        object: Arc<dyn DbObject>,
        stamp: Arc<CombineStamp>,
        seq: u64,
    },
    Load {
        sql: String,
        on_row: Option<RowCallback>,
    },
    Delete {
        sql: String,
    },
    BatchLoad {
        sql: String,
        on_row: Option<BatchRowCallback>,
    },
    LowLevelAccess {
        body: Option<RawCallback>,
    },
    Wait {
        shared: Arc<WaitShared>,
    },
}

impl fmt::Debug for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Save { .. } => "Save",
            OperationKind::Load { .. } => "Load",
            OperationKind::Delete { .. } => "Delete",
            OperationKind::BatchLoad { .. } => "BatchLoad",
            OperationKind::LowLevelAccess { .. } => "LowLevelAccess",
            OperationKind::Wait { .. } => "Wait",
        };
        f.write_str(name)
    }
}

/// A single database operation awaiting execution on a shard.
pub struct Operation {
    pub kind: OperationKind,
    pub table: &'static str,
    pub use_slave: bool,
    promise: WeakPromise<()>,
}

impl Operation {
    /// Builds an operation plus the [`DbFuture`] handed back to the caller.
    /// Per the design notes, weak ownership runs from the queued operation
    /// to the caller's promise: the operation stores only a [`WeakPromise`],
    /// while `DbFuture` keeps the strong `Promise` (and thus the ability to
    /// complete it) alive for as long as the caller holds it. Dropping the
    /// `DbFuture` early makes the queued operation "isolated": its
    /// `set_success`/`set_exception` calls become no-ops and Load/BatchLoad
    /// skip contacting the DB entirely.
    pub fn new(kind: OperationKind, table: &'static str, use_slave: bool) -> (Self, DbFuture<()>) {
        let promise = Promise::new();
        let future = promise.future();
        let weak = promise.downgrade();
        (
            Self {
                kind,
                table,
                use_slave,
                promise: weak,
            },
            DbFuture {
                _promise: promise,
                future,
            },
        )
    }

    /// True if nobody can observe this operation's outcome any more (its
    /// originating promise has been dropped). Load/BatchLoad consult this
    /// immediately before touching the DB to avoid useless queries.
    pub fn is_isolated(&self) -> bool {
        self.promise.is_isolated()
    }

    fn complete_ok(&self) {
        let suppress = matches!(
            self.kind,
            OperationKind::LowLevelAccess { .. } | OperationKind::Wait { .. }
        );
        if !suppress {
            self.promise.set_success(());
        }
    }

    fn complete_err(&self, err: Error) {
        let suppress = matches!(self.kind, OperationKind::Wait { .. });
        if !suppress {
            self.promise.set_exception(err);
        }
    }
}

/// Outcome of attempting to run an operation against a connection.
pub enum ExecOutcome {
    /// The write-combining stamp said a later `Save` supersedes this one,
    /// or the originating promise was already dropped: no SQL was issued.
    Skipped,
    Ran(Result<()>),
}

/// Runs `op` against `conn` to completion (SQL plus any row/raw callback),
/// in a single attempt. Retry bookkeeping is `shard::pump_one_operation`'s
/// job; this function is only ever called once per retry attempt, so the
/// `FnOnce` callbacks on `Load`/`BatchLoad`/`LowLevelAccess` are only ever
/// invoked when the underlying query actually succeeds.
pub fn execute(op: &mut Operation, conn: &mut Conn) -> ExecOutcome {
    match &mut op.kind {
        OperationKind::Save { object, stamp, seq } => {
            if !stamp.take_if_latest(*seq) {
                return ExecOutcome::Skipped;
            }
            ExecOutcome::Ran(run_save(object.as_ref(), conn))
        }
        OperationKind::Load { sql, on_row } => {
            if op.promise.is_isolated() {
                return ExecOutcome::Skipped;
            }
            ExecOutcome::Ran(run_load(sql, on_row, conn))
        }
        OperationKind::Delete { sql } => ExecOutcome::Ran(run_query(sql, conn).map(|_| ())),
        OperationKind::BatchLoad { sql, on_row } => {
            if op.promise.is_isolated() {
                return ExecOutcome::Skipped;
            }
            ExecOutcome::Ran(run_batch_load(sql, on_row, conn))
        }
        OperationKind::LowLevelAccess { body } => {
            ExecOutcome::Ran(match body.take() {
                Some(cb) => {
                    cb(conn);
                    Ok(())
                }
                None => Ok(()),
            })
        }
        OperationKind::Wait { .. } => ExecOutcome::Ran(conn.query_drop("DO 0").map_err(db_error)),
    }
}

/// Converts a client-level MySQL error into the crate's `Db{code, message}`
/// error, extracting the server error code when the client reports one so
/// that retry/dump logic always has a code to work with (`0` stands in for
/// the original's `UNKNOWN_ERROR` when the failure never reached the server).
fn db_error(e: mysql::Error) -> Error {
    match e {
        mysql::Error::MySqlError(ref inner) => Error::Db {
            code: inner.code,
            message: inner.message.clone(),
        },
        other => Error::Db {
            code: 0,
            message: other.to_string(),
        },
    }
}

/// A human-readable rendering of the SQL an operation would run (or did
/// run), used only for the failure-dump file; never re-parsed.
pub fn sql_text(op: &Operation) -> String {
    match &op.kind {
        OperationKind::Save { object, .. } => {
            let cols = object.write_columns();
            let col_list = cols.iter().map(|(c, _)| *c).collect::<Vec<_>>().join(", ");
            format!("REPLACE INTO {} ({col_list}) VALUES (...)", object.table())
        }
        OperationKind::Load { sql, .. } => sql.clone(),
        OperationKind::Delete { sql } => sql.clone(),
        OperationKind::BatchLoad { sql, .. } => sql.clone(),
        OperationKind::LowLevelAccess { .. } => "<low-level access>".to_owned(),
        OperationKind::Wait { .. } => "DO 0".to_owned(),
    }
}

fn run_query(sql: &str, conn: &mut Conn) -> Result<Vec<Row>> {
    conn.query(sql).map_err(db_error)
}

fn run_load(sql: &str, on_row: &mut Option<RowCallback>, conn: &mut Conn) -> Result<()> {
    let rows = run_query(sql, conn)?;
    if let (Some(row), Some(cb)) = (rows.into_iter().next(), on_row.take()) {
        cb(row)?;
    }
    Ok(())
}

fn run_batch_load(sql: &str, on_row: &mut Option<BatchRowCallback>, conn: &mut Conn) -> Result<()> {
    let rows = run_query(sql, conn)?;
    if let Some(cb) = on_row {
        for row in rows {
            cb(row)?;
        }
    }
    Ok(())
}

fn run_save(object: &dyn DbObject, conn: &mut Conn) -> Result<()> {
    let cols = object.write_columns();
    let table = object.table();
    let col_list = cols.iter().map(|(c, _)| *c).collect::<Vec<_>>().join(", ");
    let placeholders = cols.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let sql = format!("REPLACE INTO {table} ({col_list}) VALUES ({placeholders})");
    let values: Vec<mysql::Value> = cols.into_iter().map(|(_, v)| v).collect();
    conn.exec_drop(sql, values).map_err(db_error)
}

/// A read handle on a submitted operation's outcome. Keeps the operation's
/// promise alive (see [`Operation::new`]) for as long as the caller holds
/// this; dropping it early isolates the still-queued operation.
pub struct DbFuture<T> {
    _promise: Promise<T>,
    future: crate::promise::Future<T>,
}

impl<T> DbFuture<T> {
    pub fn try_get(&self) -> crate::promise::PollResult<T> {
        self.future.try_get()
    }
}

impl<T: Send + Sync + 'static> std::future::Future for DbFuture<T> {
    type Output = Result<Arc<T>>;

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        std::pin::Pin::new(&mut self.get_mut().future).poll(cx)
    }
}

/// Queue element: the operation plus its delay-queue scheduling state.
pub struct QueueElement {
    pub op: Operation,
    pub due_time: Instant,
    pub retry_count: u32,
    /// Keeps the router's table→shard binding pinned for as long as this
    /// operation is in flight (queued or retrying). See `db::router`.
    _route_probe: Arc<()>,
}

impl QueueElement {
    pub fn new(op: Operation, delay: Duration, route_probe: Arc<()>) -> Self {
        Self {
            op,
            due_time: Instant::now() + delay,
            retry_count: 0,
            _route_probe: route_probe,
        }
    }

    pub fn complete_ok(&self) {
        self.op.complete_ok();
    }

    pub fn complete_err(&self, err: Error) {
        self.op.complete_err(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Player {
        id: i64,
        name: String,
    }

    impl DbObject for Player {
        fn table(&self) -> &'static str {
            "players"
        }
        fn write_columns(&self) -> Vec<(&'static str, mysql::Value)> {
            vec![
                ("id", mysql::Value::Int(self.id)),
                ("name", mysql::Value::Bytes(self.name.clone().into_bytes())),
            ]
        }
    }

    #[test]
    fn combine_stamp_only_lets_latest_seq_execute() {
        let stamp = CombineStamp::new();
        stamp.mark_pending(1);
        stamp.mark_pending(2);
        stamp.mark_pending(3);
        // Earlier sequence numbers no longer match the latest stamp.
        assert!(!stamp.take_if_latest(1));
        assert!(!stamp.take_if_latest(2));
        assert!(stamp.take_if_latest(3));
        // Once taken, the stamp is cleared; a stale recheck doesn't match.
        assert!(!stamp.take_if_latest(3));
    }

    #[test]
    fn wait_shared_fires_success_on_last_drop() {
        let (shared, future) = WaitShared::new();
        let clone_a = shared.clone();
        let clone_b = shared.clone();
        drop(shared);
        assert!(matches!(future.try_get(), crate::promise::PollResult::NotReady));
        drop(clone_a);
        assert!(matches!(future.try_get(), crate::promise::PollResult::NotReady));
        drop(clone_b);
        assert!(matches!(
            future.try_get(),
            crate::promise::PollResult::Ready(Ok(_))
        ));
    }

    #[test]
    fn operation_reports_isolated_after_future_dropped() {
        let (op, future) =
            Operation::new(OperationKind::Delete { sql: "DELETE FROM t".into() }, "t", false);
        assert!(!op.is_isolated());
        drop(future);
        assert!(op.is_isolated());
    }

    #[test]
    fn player_write_columns_roundtrip_shape() {
        let p = Player { id: 7, name: "zed".into() };
        let cols = p.write_columns();
        assert_eq!(cols.len(), 2);
        assert_eq!(cols[0].0, "id");
    }
}
