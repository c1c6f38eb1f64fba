//! Cooperative fiber scheduler.
//!
//! Fibers are implemented as model (b) from the design notes: stackless,
//! `Future`-driven tasks rather than real stack-switched coroutines. A
//! fiber body is an `async` closure; [`FiberScheduler::insert`] hands it to
//! a fixed pool of scheduler threads, each of which polls whatever fiber is
//! next in its ready queue to completion or to its next suspension point.
//! `.await`ing a [`crate::promise::Future`] from inside a fiber body *is*
//! `yield(future)`: our `Future` already implements [`std::future::Future`]
//! and registers the polling task's waker with the promise, so when the
//! promise transitions the fiber is re-enqueued on the scheduler thread it
//! last ran on.
use std::cell::RefCell;
use std::future::Future as StdFuture;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::error::Error;
use crate::promise::{Future as PromiseFuture, Promise};

/// A fiber's lifecycle, per the spec's state machine:
/// `pending -> ready -> running -> (suspended -> ready)* -> terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    Pending,
    Ready,
    Running,
    Suspended,
    Terminated,
}

type BoxedFiberFuture = Pin<Box<dyn StdFuture<Output = ()> + Send>>;

struct Task {
    id: u64,
    state: Mutex<FiberState>,
    future: Mutex<Option<BoxedFiberFuture>>,
    sender: Sender<Arc<Task>>,
    resident: AtomicBool,
    insignificant: AtomicBool,
    /// Count of outstanding [`FiberHandle`]s. When it reaches zero for a
    /// non-resident fiber that is suspended on an `insignificant` yield,
    /// the fiber is reclaimed rather than resumed (stand-in for the dead
    /// waiter graph detection described in the spec).
    handle_count: AtomicUsize,
    active_tasks: Arc<AtomicUsize>,
    /// Fails the fiber's own output promise with `Abandoned` when this
    /// task is reclaimed; `None` once run (a task is reclaimed at most
    /// once). Type-erased since `Task` itself isn't generic over the
    /// fiber's return type.
    on_abandon: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl std::task::Wake for Task {
    fn wake(self: Arc<Self>) {
        let _ = self.sender.send(self.clone());
    }
}

thread_local! {
    static CURRENT_TASK: RefCell<Option<Arc<Task>>> = const { RefCell::new(None) };
}

/// Called from inside a fiber body to suspend until `future` is satisfied.
///
/// `insignificant` hints that this fiber may be reclaimed while suspended
/// here if no external [`FiberHandle`] remains and the fiber is not
/// resident (see [`FiberHandle::set_resident`]).
pub async fn yield_on<T: Send + Sync + 'static>(
    future: PromiseFuture<T>,
    insignificant: bool,
) -> crate::error::Result<Arc<T>> {
    CURRENT_TASK.with(|cur| {
        if let Some(task) = cur.borrow().as_ref() {
            task.insignificant.store(insignificant, Ordering::Relaxed);
            *task.state.lock().unwrap() = FiberState::Suspended;
        }
    });
    let result = future.await;
    CURRENT_TASK.with(|cur| {
        if let Some(task) = cur.borrow().as_ref() {
            *task.state.lock().unwrap() = FiberState::Running;
        }
    });
    result
}

/// A handle to a fiber inserted into a [`FiberScheduler`]. Dropping all
/// handles to a non-resident fiber makes it eligible for reclamation the
/// next time it would otherwise be suspended on an insignificant yield.
pub struct FiberHandle<T> {
    task: Arc<Task>,
    output: PromiseFuture<T>,
}

impl<T> FiberHandle<T> {
    /// Toggles reclamation exemption. A resident fiber is never dropped by
    /// the scheduler, regardless of outstanding handles.
    pub fn set_resident(&self, resident: bool) {
        self.task.resident.store(resident, Ordering::Relaxed);
    }

    pub fn id(&self) -> u64 {
        self.task.id
    }

    pub fn state(&self) -> FiberState {
        *self.task.state.lock().unwrap()
    }

    /// A future resolving to the fiber body's return value once it
    /// terminates (or [`Error::Abandoned`] if it is reclaimed first).
    pub fn join(&self) -> PromiseFuture<T> {
        self.output.clone()
    }
}

impl<T> Clone for FiberHandle<T> {
    fn clone(&self) -> Self {
        self.task.handle_count.fetch_add(1, Ordering::Relaxed);
        Self {
            task: self.task.clone(),
            output: self.output.clone(),
        }
    }
}

impl<T> Drop for FiberHandle<T> {
    fn drop(&mut self) {
        self.task.handle_count.fetch_sub(1, Ordering::Relaxed);
    }
}

struct SchedulerInner {
    senders: Vec<Sender<Arc<Task>>>,
    load: Vec<AtomicUsize>,
    shutdown: AtomicBool,
    active_tasks: Arc<AtomicUsize>,
    next_id: AtomicUsize,
}

/// Owns a fixed pool of scheduler threads performing cooperative
/// context-switching between fibers.
pub struct FiberScheduler {
    inner: Arc<SchedulerInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl FiberScheduler {
    pub fn new(thread_count: usize) -> Self {
        let thread_count = thread_count.max(1);
        let active_tasks = Arc::new(AtomicUsize::new(0));
        let mut senders = Vec::with_capacity(thread_count);
        let mut receivers = Vec::with_capacity(thread_count);
        for _ in 0..thread_count {
            let (tx, rx) = crossbeam_channel::unbounded();
            senders.push(tx);
            receivers.push(rx);
        }
        let inner = Arc::new(SchedulerInner {
            senders,
            load: (0..thread_count).map(|_| AtomicUsize::new(0)).collect(),
            shutdown: AtomicBool::new(false),
            active_tasks,
            next_id: AtomicUsize::new(1),
        });
        let mut threads = Vec::with_capacity(thread_count);
        for (idx, rx) in receivers.into_iter().enumerate() {
            let inner = inner.clone();
            threads.push(
                std::thread::Builder::new()
                    .name(format!("fiber-sched-{idx}"))
                    .spawn(move || Self::worker_loop(idx, rx, inner))
                    .expect("failed to spawn fiber scheduler thread"),
            );
        }
        Self {
            inner,
            threads: Mutex::new(threads),
        }
    }

    fn worker_loop(_idx: usize, receiver: Receiver<Arc<Task>>, inner: Arc<SchedulerInner>) {
        loop {
            match receiver.recv_timeout(Duration::from_millis(100)) {
                Ok(task) => Self::poll_task(&task),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    if inner.shutdown.load(Ordering::Acquire)
                        && receiver.is_empty()
                        && inner.active_tasks.load(Ordering::Acquire) == 0
                    {
                        return;
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn poll_task(task: &Arc<Task>) {
        let mut slot = task.future.lock().unwrap();
        let Some(mut fut) = slot.take() else {
            // Already terminated/reclaimed elsewhere.
            return;
        };
        *task.state.lock().unwrap() = FiberState::Running;

        let waker = std::task::Waker::from(task.clone());
        let mut cx = Context::from_waker(&waker);

        CURRENT_TASK.with(|cur| *cur.borrow_mut() = Some(task.clone()));
        let poll = fut.as_mut().poll(&mut cx);
        CURRENT_TASK.with(|cur| *cur.borrow_mut() = None);

        match poll {
            Poll::Ready(()) => {
                *task.state.lock().unwrap() = FiberState::Terminated;
                task.active_tasks.fetch_sub(1, Ordering::AcqRel);
                // future dropped, slot stays None
            }
            Poll::Pending => {
                let reclaim = !task.resident.load(Ordering::Relaxed)
                    && task.insignificant.load(Ordering::Relaxed)
                    && task.handle_count.load(Ordering::Relaxed) == 0;
                if reclaim {
                    log::debug!("reclaiming orphaned fiber {}", task.id);
                    *task.state.lock().unwrap() = FiberState::Terminated;
                    task.active_tasks.fetch_sub(1, Ordering::AcqRel);
                    if let Some(abandon) = task.on_abandon.lock().unwrap().take() {
                        abandon();
                    }
                    // `fut` drops here, cancelling the fiber body. Its
                    // output promise was already failed above, so anyone
                    // awaiting `join()` observes `Abandoned` instead of
                    // hanging.
                } else {
                    *slot = Some(fut);
                }
            }
        }
    }

    /// Inserts a fiber body, placing it on the least-loaded scheduler
    /// thread. Returns a handle; the fiber is `pending` until dequeued.
    pub fn insert<F>(&self, body: F) -> FiberHandle<F::Output>
    where
        F: StdFuture + Send + 'static,
        F::Output: Send + Sync + 'static,
    {
        let idx = self.least_loaded_index();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) as u64;

        let promise: Promise<F::Output> = Promise::new();
        let output = promise.future();
        let abandon_handle = promise.downgrade();

        let wrapped: BoxedFiberFuture = Box::pin(async move {
            let value = body.await;
            let _ = promise.set_success(value);
        });

        self.inner.active_tasks.fetch_add(1, Ordering::AcqRel);
        let task = Arc::new(Task {
            id,
            state: Mutex::new(FiberState::Ready),
            future: Mutex::new(Some(wrapped)),
            sender: self.inner.senders[idx].clone(),
            resident: AtomicBool::new(false),
            insignificant: AtomicBool::new(false),
            handle_count: AtomicUsize::new(1),
            active_tasks: self.inner.active_tasks.clone(),
            on_abandon: Mutex::new(Some(Box::new(move || {
                abandon_handle.set_exception(Error::Abandoned);
            }))),
        });
        self.inner.load[idx].fetch_add(1, Ordering::Relaxed);
        let _ = self.inner.senders[idx].send(task.clone());

        FiberHandle { task, output }
    }

    fn least_loaded_index(&self) -> usize {
        self.inner
            .load
            .iter()
            .enumerate()
            .min_by_key(|(_, l)| l.load(Ordering::Relaxed))
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    /// Signals shutdown and joins every scheduler thread. Fibers still
    /// suspended when this is called keep running until their futures
    /// resolve; `shutdown` blocks until every thread has drained.
    pub fn shutdown(self) {
        self.inner.shutdown.store(true, Ordering::Release);
        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        for t in threads {
            let _ = t.join();
        }
    }
}

/// Convenience for the timer/promise/fiber composition described in the
/// spec: suspends the current fiber until `duration` has elapsed.
pub async fn sleep(timers: &crate::timer::TimerDriver, duration: Duration) {
    let future = timers.after(duration, ());
    let _ = yield_on(future, true).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::TimerDriver;
    use std::sync::atomic::AtomicU64;
    use std::time::Instant;

    #[test]
    fn timer_then_fiber_resumes_with_value() {
        let timers = Arc::new(TimerDriver::new());
        let scheduler = FiberScheduler::new(2);
        let td = timers.clone();

        let handle = scheduler.insert(async move {
            let fut = td.after(Duration::from_millis(50), 99i32);
            let v = yield_on(fut, false).await.unwrap();
            *v
        });

        let started = Instant::now();
        let result = loop {
            match handle.join().try_get() {
                crate::promise::PollResult::Ready(Ok(v)) => break *v,
                _ => {
                    if started.elapsed() > Duration::from_millis(500) {
                        panic!("fiber never resumed");
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
        };
        assert_eq!(result, 99);
        assert!(started.elapsed() >= Duration::from_millis(50));

        scheduler.shutdown();
        timers.shutdown();
    }

    #[test]
    fn resident_fiber_runs_to_completion_without_handle() {
        let timers = Arc::new(TimerDriver::new());
        let scheduler = FiberScheduler::new(1);
        let done = Arc::new(AtomicU64::new(0));
        let done2 = done.clone();
        let td = timers.clone();

        let handle = scheduler.insert(async move {
            let fut = td.after(Duration::from_millis(30), ());
            let _ = yield_on(fut, true).await;
            done2.fetch_add(1, Ordering::SeqCst);
        });
        handle.set_resident(true);
        drop(handle);

        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(done.load(Ordering::SeqCst), 1);

        scheduler.shutdown();
        timers.shutdown();
    }

    #[test]
    fn reclaimed_fiber_fails_join_with_abandoned() {
        let timers = Arc::new(TimerDriver::new());
        let scheduler = FiberScheduler::new(1);
        let td = timers.clone();

        let handle = scheduler.insert(async move {
            let fut = td.after(Duration::from_millis(30), ());
            let _ = yield_on(fut, true).await;
        });
        let join = handle.join();
        drop(handle);

        let started = Instant::now();
        loop {
            match join.try_get() {
                crate::promise::PollResult::Ready(Err(e)) => {
                    assert_eq!(e, crate::error::Error::Abandoned);
                    break;
                }
                crate::promise::PollResult::Ready(Ok(_)) => {
                    panic!("reclaimed fiber must not complete successfully")
                }
                crate::promise::PollResult::NotReady => {
                    if started.elapsed() > Duration::from_millis(500) {
                        panic!("fiber was never reclaimed");
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
        }

        scheduler.shutdown();
        timers.shutdown();
    }
}
