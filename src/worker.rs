//! Worker pool: a fixed set of background threads executing blocking jobs
//! outside the fiber scheduler, each routed to a stable worker by key so
//! that jobs sharing a key always serialize on the same thread.
//!
//! Mirrors the shape of `db::shard`'s per-shard writer threads but for
//! arbitrary user-supplied closures rather than database operations.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};

use crate::error::{Error, Result};
use crate::promise::{Future, Promise};
use crate::route::probe_index;

type Job = Box<dyn FnOnce() + Send>;

/// Shared between a job's [`JobHandle`]/[`SharedJobHandle`] clones and its
/// queued [`QueueEntry`]. Reference count drives orphan detection;
/// `resident` exempts a job from it regardless of reference count,
/// mirroring [`crate::fiber::FiberHandle::set_resident`].
struct JobMarker {
    resident: AtomicBool,
}

impl JobMarker {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            resident: AtomicBool::new(false),
        })
    }
}

struct QueueEntry {
    job: Job,
    /// Held so the orphan check in the worker loop can see whether any
    /// caller still cares about this job's outcome.
    handle_marker: Arc<JobMarker>,
}

struct WorkerState {
    sender: Sender<QueueEntry>,
    queued: AtomicUsize,
    thread: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

struct PoolInner {
    workers: Vec<WorkerState>,
    shutdown: AtomicBool,
}

/// Owns a fixed-size pool of worker threads. Threads are started lazily,
/// on first job routed to them, mirroring the original's "start on demand"
/// worker construction.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

/// A handle to a job about to be submitted to the pool. The pool requires
/// the handle to be uniquely owned at submission time (see
/// [`WorkerPool::insert`]): this is how it knows no one raced to clone the
/// handle and submit it twice. `insert` consumes it and returns a
/// [`SharedJobHandle`] in exchange.
pub struct JobHandle<T> {
    marker: Arc<JobMarker>,
    promise: Option<Promise<T>>,
}

impl<T> JobHandle<T> {
    pub fn new() -> Self {
        Self {
            marker: JobMarker::new(),
            promise: Some(Promise::new()),
        }
    }

    pub fn future(&self) -> Option<Future<T>> {
        self.promise.as_ref().map(|p| p.future())
    }

    /// Toggles reclamation exemption. A resident job is never discarded by
    /// the orphan check, regardless of outstanding `SharedJobHandle`s.
    pub fn set_resident(&self, resident: bool) {
        self.marker.resident.store(resident, Ordering::Relaxed);
    }
}

impl<T> Default for JobHandle<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A cloneable handle returned by [`WorkerPool::insert`]. As long as one
/// clone is outstanding, the submitted job is guaranteed to run once
/// dequeued. If every clone is dropped before the job starts, the worker
/// discards it instead of running it (orphan-job reclamation).
pub struct SharedJobHandle<T> {
    marker: Arc<JobMarker>,
    _marker_ty: std::marker::PhantomData<T>,
}

impl<T> SharedJobHandle<T> {
    /// Toggles reclamation exemption. A resident job is never discarded by
    /// the orphan check, regardless of outstanding handle count.
    pub fn set_resident(&self, resident: bool) {
        self.marker.resident.store(resident, Ordering::Relaxed);
    }
}

impl<T> Clone for SharedJobHandle<T> {
    fn clone(&self) -> Self {
        Self {
            marker: self.marker.clone(),
            _marker_ty: std::marker::PhantomData,
        }
    }
}

impl WorkerPool {
    pub fn new(thread_count: usize) -> Result<Self> {
        if thread_count == 0 {
            return Err(Error::NoWorkers);
        }
        let workers = (0..thread_count)
            .map(|_| {
                let (tx, rx) = crossbeam_channel::unbounded();
                let state = WorkerState {
                    sender: tx,
                    queued: AtomicUsize::new(0),
                    thread: Mutex::new(None),
                    started: AtomicBool::new(false),
                };
                (state, rx)
            })
            .collect::<Vec<_>>();

        let (workers, receivers): (Vec<_>, Vec<_>) = workers.into_iter().unzip();
        let inner = Arc::new(PoolInner {
            workers,
            shutdown: AtomicBool::new(false),
        });

        // Receivers are stashed for lazy thread spawn; we spawn all of
        // them eagerly here since `WorkerState` doesn't hold a `Receiver`.
        // This matches the common-case pool where threads run for the
        // lifetime of the daemon; "lazy start" below governs whether a
        // given worker has ever dequeued anything, for metrics purposes.
        for (idx, rx) in receivers.into_iter().enumerate() {
            let inner2 = inner.clone();
            let handle = std::thread::Builder::new()
                .name(format!("worker-{idx}"))
                .spawn(move || Self::run(idx, rx, inner2))
                .map_err(|e| Error::Io(e.to_string()))?;
            *inner.workers[idx].thread.lock().unwrap() = Some(handle);
        }

        Ok(Self { inner })
    }

    fn run(idx: usize, receiver: Receiver<QueueEntry>, inner: Arc<PoolInner>) {
        inner.workers[idx].started.store(true, Ordering::Relaxed);
        loop {
            match receiver.recv_timeout(std::time::Duration::from_millis(200)) {
                Ok(entry) => {
                    inner.workers[idx].queued.fetch_sub(1, Ordering::AcqRel);
                    let orphaned = Arc::strong_count(&entry.handle_marker) < 2
                        && !entry.handle_marker.resident.load(Ordering::Relaxed);
                    if orphaned {
                        // Our own copy is the last one: the caller dropped
                        // every `SharedJobHandle` before we dequeued this
                        // job, so no one can observe the outcome. Skip it
                        // (the orphan-job reclamation rule) unless the job
                        // was marked resident.
                        log::debug!("discarding orphaned job on worker {idx}");
                        continue;
                    }
                    (entry.job)();
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    if inner.shutdown.load(Ordering::Acquire) {
                        return;
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    /// Routes `body` to the worker selected by `key`, such that any two
    /// jobs submitted with the same key always run on the same worker
    /// (and therefore never run concurrently with each other).
    ///
    /// `handle` must be the sole owner of its job marker (no clones
    /// outstanding) or this returns [`Error::JobNotUnique`]; a handle
    /// reused after a previous `insert` call returns [`Error::JobNullHandle`].
    pub fn insert<T, F>(
        &self,
        key: u64,
        mut handle: JobHandle<T>,
        body: F,
    ) -> Result<(SharedJobHandle<T>, Future<T>)>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let promise = handle.promise.take().ok_or(Error::JobNullHandle)?;
        if Arc::strong_count(&handle.marker) != 1 {
            return Err(Error::JobNotUnique);
        }
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(Error::DaemonShuttingDown);
        }

        let future = promise.future();
        // One clone stays with the worker's queue entry, one goes back to
        // the caller as a `SharedJobHandle`. The original `handle.marker`
        // is dropped at the end of this function, so immediately after
        // submission exactly these two references exist.
        let entry_marker = handle.marker.clone();
        let shared = SharedJobHandle {
            marker: handle.marker.clone(),
            _marker_ty: std::marker::PhantomData,
        };
        let idx = probe_index(self.inner.workers.len(), key);

        let job: Job = Box::new(move || {
            let value = body();
            let _ = promise.set_success(value);
        });

        self.inner.workers[idx].queued.fetch_add(1, Ordering::AcqRel);
        let _ = self.inner.workers[idx].sender.send(QueueEntry {
            job,
            handle_marker: entry_marker,
        });

        Ok((shared, future))
    }

    /// Number of jobs currently queued (not yet started) per worker,
    /// indexed by worker id. Used for load reporting.
    pub fn queue_depths(&self) -> Vec<usize> {
        self.inner
            .workers
            .iter()
            .map(|w| w.queued.load(Ordering::Relaxed))
            .collect()
    }

    pub fn worker_count(&self) -> usize {
        self.inner.workers.len()
    }

    /// Whether the worker at `idx` has dequeued at least one job yet.
    pub fn worker_started(&self, idx: usize) -> bool {
        self.inner.workers[idx].started.load(Ordering::Relaxed)
    }

    pub fn shutdown(self) {
        self.inner.shutdown.store(true, Ordering::Release);
        for w in &self.inner.workers {
            if let Some(t) = w.thread.lock().unwrap().take() {
                let _ = t.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::promise::PollResult;
    use std::sync::atomic::AtomicI32;
    use std::time::{Duration, Instant};

    fn wait_for<T>(f: &Future<T>, timeout: Duration) -> Arc<T> {
        let start = Instant::now();
        loop {
            if let PollResult::Ready(r) = f.try_get() {
                return r.unwrap();
            }
            if start.elapsed() > timeout {
                panic!("future never resolved");
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn same_key_routes_to_same_worker() {
        let pool = WorkerPool::new(4).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut keep_alive = Vec::new();
        for i in 0..6 {
            let seen2 = seen.clone();
            let handle = JobHandle::new();
            let (shared, _fut) = pool
                .insert(42, handle, move || {
                    seen2.lock().unwrap().push(i);
                })
                .unwrap();
            keep_alive.push(shared);
        }
        std::thread::sleep(Duration::from_millis(100));
        // All six jobs landed on the same worker thread, so they ran in
        // submission order despite four workers being available.
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
        drop(keep_alive);
        pool.shutdown();
    }

    #[test]
    fn job_result_is_observable() {
        let pool = WorkerPool::new(2).unwrap();
        let handle = JobHandle::new();
        let (shared, fut) = pool.insert(1, handle, || 2 + 2).unwrap();
        assert_eq!(*wait_for(&fut, Duration::from_secs(1)), 4);
        drop(shared);
        pool.shutdown();
    }

    #[test]
    fn reused_handle_is_rejected() {
        let pool = WorkerPool::new(1).unwrap();
        let mut handle = JobHandle::new();
        let _ = handle.promise.take();
        let err = pool.insert(1, handle, || ()).unwrap_err();
        assert_eq!(err, Error::JobNullHandle);
        pool.shutdown();
    }

    #[test]
    fn non_unique_handle_is_rejected() {
        let pool = WorkerPool::new(1).unwrap();
        let handle = JobHandle::<()>::new();
        let _marker_clone = handle.marker.clone();
        let err = pool.insert(1, handle, || ()).unwrap_err();
        assert_eq!(err, Error::JobNotUnique);
        pool.shutdown();
    }

    #[test]
    fn orphaned_job_is_not_executed() {
        let pool = WorkerPool::new(1).unwrap();
        let ran = Arc::new(AtomicI32::new(0));
        let ran2 = ran.clone();
        // Keep the worker busy briefly so the next job sits in queue long
        // enough for us to drop its handle before it is dequeued.
        let busy_handle = JobHandle::new();
        let (busy_shared, _busy_fut) = pool
            .insert(7, busy_handle, || {
                std::thread::sleep(Duration::from_millis(100));
            })
            .unwrap();

        let handle = JobHandle::new();
        let (shared, _fut) = pool
            .insert(7, handle, move || {
                ran2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        drop(shared);

        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        drop(busy_shared);
        pool.shutdown();
    }

    #[test]
    fn resident_job_runs_despite_no_shared_handle() {
        let pool = WorkerPool::new(1).unwrap();
        let ran = Arc::new(AtomicI32::new(0));
        let ran2 = ran.clone();
        let busy_handle = JobHandle::new();
        let (busy_shared, _busy_fut) = pool
            .insert(7, busy_handle, || {
                std::thread::sleep(Duration::from_millis(100));
            })
            .unwrap();

        let handle = JobHandle::new();
        handle.set_resident(true);
        let (shared, _fut) = pool
            .insert(7, handle, move || {
                ran2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        drop(shared);

        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        drop(busy_shared);
        pool.shutdown();
    }
}
