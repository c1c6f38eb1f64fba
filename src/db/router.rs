//! Table-name routing: binds each table to a shard and keeps that binding
//! pinned by a shared probe for as long as any operation for the table is
//! in flight, per `submit_operation_by_table`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::connection::ConnectionSpec;
use super::operation::{DbFuture, Operation, OperationKind, QueueElement, WaitShared};
use super::shard::{ShardConfig, ShardHandle};
use crate::promise::Future as PromiseFuture;

struct RouteEntry {
    probe: Arc<()>,
    shard: usize,
}

struct RouterInner {
    shards: Vec<ShardHandle>,
    routes: Mutex<HashMap<&'static str, RouteEntry>>,
}

/// Owns every shard thread and the table→shard binding table.
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    pub fn new(shard_count: usize, spec: Arc<ConnectionSpec>, config: Arc<ShardConfig>) -> Self {
        let shards = (0..shard_count)
            .map(|i| ShardHandle::start(i, spec.clone(), config.clone()))
            .collect();
        Self {
            inner: Arc::new(RouterInner {
                shards,
                routes: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Binds `table` to a shard, reusing the existing binding while it is
    /// still pinned by an in-flight operation, else rebinding to whichever
    /// shard currently has the smallest queue.
    fn pick_shard(&self, table: &'static str) -> (usize, Arc<()>) {
        let mut routes = self.inner.routes.lock().unwrap();
        if let Some(entry) = routes.get(table) {
            if Arc::strong_count(&entry.probe) > 1 {
                return (entry.shard, entry.probe.clone());
            }
        }
        let shard = self
            .inner
            .shards
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.queue_len())
            .map(|(i, _)| i)
            .unwrap_or(0);
        let probe = Arc::new(());
        routes.insert(
            table,
            RouteEntry {
                probe: probe.clone(),
                shard,
            },
        );
        (shard, probe)
    }

    /// Routes `kind` to the shard bound to `table`, enqueuing it with
    /// `delay` and, if `urgent`, waking the shard immediately regardless of
    /// its current backoff timeout.
    pub fn submit(
        &self,
        table: &'static str,
        kind: OperationKind,
        use_slave: bool,
        urgent: bool,
        delay: Duration,
    ) -> DbFuture<()> {
        let (shard_idx, probe) = self.pick_shard(table);
        let (op, future) = Operation::new(kind, table, use_slave);
        let elem = QueueElement::new(op, delay, probe);
        self.inner.shards[shard_idx].push(elem, urgent);
        future
    }

    /// Broadcasts a `Wait` to every shard (`submit_operation_all`); the
    /// returned future resolves once every shard has processed its copy.
    pub fn submit_wait(&self) -> PromiseFuture<()> {
        let (shared, future) = WaitShared::new();
        for shard in &self.inner.shards {
            let (op, _discarded) =
                Operation::new(OperationKind::Wait { shared: shared.clone() }, "<wait>", false);
            // `Wait` never touches its own promise (success is suppressed,
            // see `Operation::complete_ok`); completion is entirely driven
            // by `WaitShared`'s destructor, so the per-shard future above
            // is never read.
            let elem = QueueElement::new(op, Duration::ZERO, Arc::new(()));
            shard.push(elem, true);
        }
        future
    }

    /// Blocks until every shard's queue has drained, per `wait_till_idle`.
    pub fn wait_till_idle(&self) {
        loop {
            let total: usize = self.inner.shards.iter().map(|s| s.queue_len()).sum();
            if total == 0 {
                return;
            }
            for shard in &self.inner.shards {
                shard.force_urgent();
            }
            std::thread::sleep(Duration::from_millis(500));
        }
    }

    pub fn shutdown(self) {
        for shard in &self.inner.shards {
            shard.shutdown();
        }
    }
}

// `Router` always owns live shard threads that dial a real MySQL server,
// so exercising `submit`/`wait_till_idle`/`shutdown` end to end needs a
// reachable database; that coverage lives in the crate's `tests/` directory
// (gated on a running server) rather than here, matching how this codebase
// keeps anything-requiring-a-live-backend out of plain unit tests. The
// pure routing/combine/backoff logic this module calls into is unit-tested
// in `operation` and `shard` directly.
