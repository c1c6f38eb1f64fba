//! A single database writer shard: one master/slave connection pair and a
//! delay-queue of operations served by a dedicated thread.

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mysql::Conn;

use super::connection::ConnectionSpec;
use super::operation::{execute, sql_text, ExecOutcome, QueueElement};
use crate::error::Error;

/// Shard-wide tunables, read once from `Config` at daemon start.
pub struct ShardConfig {
    pub reconn_delay: Duration,
    pub max_retry_count: u32,
    pub retry_init_delay: Duration,
    pub dump_dir: Option<PathBuf>,
    /// Serializes dump-file writes across every shard, mirroring the
    /// original's single process-wide `g_dump_mutex`. Every `ShardHandle`
    /// is started with the same `Arc<ShardConfig>`, so this one lock is
    /// shared by all of them.
    pub dump_mutex: Mutex<()>,
}

struct State {
    queue: Mutex<VecDeque<QueueElement>>,
    cvar: Condvar,
    urgent: AtomicBool,
    running: AtomicBool,
    len: AtomicUsize,
}

/// Owns the shard's background thread. Kept by the router to push
/// operations onto the shard and query its load for least-loaded routing.
pub struct ShardHandle {
    state: Arc<State>,
    thread: Mutex<Option<JoinHandle<()>>>,
    pub index: usize,
}

impl ShardHandle {
    pub fn start(index: usize, spec: Arc<ConnectionSpec>, config: Arc<ShardConfig>) -> Self {
        let state = Arc::new(State {
            queue: Mutex::new(VecDeque::new()),
            cvar: Condvar::new(),
            urgent: AtomicBool::new(false),
            running: AtomicBool::new(true),
            len: AtomicUsize::new(0),
        });
        let thread_state = state.clone();
        let thread = std::thread::Builder::new()
            .name(format!("db-shard-{index}"))
            .spawn(move || run(index, thread_state, spec, config))
            .expect("failed to spawn db shard thread");
        Self {
            state,
            thread: Mutex::new(Some(thread)),
            index,
        }
    }

    pub fn push(&self, elem: QueueElement, urgent: bool) {
        {
            let mut q = self.state.queue.lock().unwrap();
            q.push_back(elem);
            self.state.len.store(q.len(), Ordering::Relaxed);
        }
        if urgent {
            self.state.urgent.store(true, Ordering::Relaxed);
        }
        self.state.cvar.notify_all();
    }

    pub fn queue_len(&self) -> usize {
        self.state.len.load(Ordering::Relaxed)
    }

    /// Forces the shard to treat its queue as urgent and wakes it; used by
    /// `wait_till_idle`.
    pub fn force_urgent(&self) {
        self.state.urgent.store(true, Ordering::Relaxed);
        self.state.cvar.notify_all();
    }

    pub fn shutdown(&self) {
        self.state.running.store(false, Ordering::Release);
        self.state.cvar.notify_all();
        if let Some(t) = self.thread.lock().unwrap().take() {
            let _ = t.join();
        }
    }
}

fn run(index: usize, state: Arc<State>, spec: Arc<ConnectionSpec>, config: Arc<ShardConfig>) {
    let mut master_conn: Option<Conn> = None;
    let mut slave_conn: Option<Conn> = None;
    let mut timeout = Duration::from_millis(0);

    loop {
        loop {
            match pump_one_operation(
                index,
                &state,
                &mut master_conn,
                &mut slave_conn,
                &spec,
                &config,
            ) {
                PumpResult::Busy => {
                    timeout = Duration::from_millis(0);
                    continue;
                }
                PumpResult::Idle => break,
            }
        }

        let queue_empty = state.queue.lock().unwrap().is_empty();
        if !state.running.load(Ordering::Acquire) && queue_empty {
            return;
        }

        let is_urgent = state.urgent.swap(false, Ordering::Relaxed);
        let wait_for = if is_urgent {
            Duration::from_millis(0)
        } else if queue_empty {
            Duration::from_millis(100)
        } else {
            timeout
        };
        timeout = (timeout * 2 + Duration::from_millis(1)).min(Duration::from_millis(100));

        if !wait_for.is_zero() {
            let guard = state.queue.lock().unwrap();
            let _ = state.cvar.wait_timeout(guard, wait_for).unwrap();
        }
    }
}

enum PumpResult {
    Busy,
    Idle,
}

/// Ensures `slot` holds a live connection, reconnecting via `connect` on
/// demand. On failure, logs and sleeps `reconn_delay` before giving up for
/// this pass (the caller treats that as idle and retries on the next loop).
fn ensure_connected(
    index: usize,
    slot: &mut Option<Conn>,
    connect: impl FnOnce() -> crate::error::Result<Conn>,
    reconn_delay: Duration,
    which: &str,
) -> bool {
    if slot.is_some() {
        return true;
    }
    match connect() {
        Ok(c) => {
            *slot = Some(c);
            true
        }
        Err(e) => {
            log::warn!("db shard {index}: {which} connect failed: {e}");
            std::thread::sleep(reconn_delay);
            false
        }
    }
}

fn pump_one_operation(
    index: usize,
    state: &State,
    master_conn: &mut Option<Conn>,
    slave_conn: &mut Option<Conn>,
    spec: &ConnectionSpec,
    config: &ShardConfig,
) -> PumpResult {
    let is_urgent = state.urgent.load(Ordering::Relaxed);

    let use_slave = {
        let mut guard = state.queue.lock().unwrap();
        let Some(front) = guard.front() else {
            return PumpResult::Idle;
        };
        if !is_urgent && Instant::now() < front.due_time {
            return PumpResult::Idle;
        }
        guard.front_mut().unwrap().op.use_slave
    };

    let connected = if use_slave {
        ensure_connected(index, slave_conn, || spec.connect_slave(), config.reconn_delay, "slave")
    } else {
        ensure_connected(index, master_conn, || spec.connect_master(), config.reconn_delay, "master")
    };
    if !connected {
        return PumpResult::Idle;
    }

    let conn = if use_slave {
        slave_conn.as_mut().unwrap()
    } else {
        master_conn.as_mut().unwrap()
    };

    let mut guard = state.queue.lock().unwrap();
    let front = guard.front_mut().unwrap();
    let outcome = execute(&mut front.op, conn);

    match outcome {
        ExecOutcome::Skipped | ExecOutcome::Ran(Ok(())) => {
            let elem = guard.pop_front().unwrap();
            state.len.store(guard.len(), Ordering::Relaxed);
            drop(guard);
            elem.complete_ok();
            PumpResult::Busy
        }
        ExecOutcome::Ran(Err(err)) => {
            let sql = sql_text(&front.op);
            if front.retry_count + 1 < config.max_retry_count {
                front.retry_count += 1;
                let delay = config.retry_init_delay * 2u32.saturating_pow(front.retry_count);
                front.due_time = Instant::now() + delay;
                log::warn!("db shard {index}: op on `{}` failed ({err}), retrying in {delay:?}", front.op.table);
                // Force a reconnect of whichever slot we used; the error
                // may be connection-level, not just a bad statement.
                if use_slave {
                    *slave_conn = None;
                } else {
                    *master_conn = None;
                }
                drop(guard);
                PumpResult::Idle
            } else {
                let elem = guard.pop_front().unwrap();
                state.len.store(guard.len(), Ordering::Relaxed);
                drop(guard);
                dump_failure(config, index, &sql, &err);
                elem.complete_err(err);
                PumpResult::Busy
            }
        }
    }
}

fn dump_failure(config: &ShardConfig, index: usize, sql: &str, err: &Error) {
    let Some(dir) = &config.dump_dir else {
        return;
    };
    let (code, message) = match err {
        Error::Db { code, message } => (*code, message.clone()),
        other => (0, other.to_string()),
    };
    let date = super::dump_date_string();
    let path = dir.join(format!("{date}_{:05}.log", std::process::id()));
    let _guard = config.dump_mutex.lock().unwrap();
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut f| {
            writeln!(f, "-- {date}: err_code = {code}, err_msg = {message}")?;
            writeln!(f, "{sql};")?;
            writeln!(f)
        });
    if let Err(e) = result {
        log::error!("db shard {index}: failed to write dump file {}: {e}", path.display());
    }
}
