//! Timer Driver: a monotonic-clock min-heap that fires callbacks at their
//! due time on a single dedicated thread. Callbacks must not block; they
//! exist to satisfy promises, nothing more.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::promise::{Future, Promise};

type Callback = Box<dyn FnMut() + Send>;

struct Entry {
    due: Instant,
    seq: u64,
    id: u64,
    period: Option<Duration>,
    cancelled: Arc<AtomicBool>,
    callback: Mutex<Option<Callback>>,
}

// Min-heap on (due, seq): earlier deadlines first, ties broken by
// insertion order as required by spec.
impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest due time
        // (and lowest seq) to sort first.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A handle to a timer previously inserted into a [`TimerDriver`].
#[derive(Clone)]
pub struct TimerHandle {
    id: u64,
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

struct Shared {
    heap: Mutex<BinaryHeap<Entry>>,
    cvar: Condvar,
    shutdown: AtomicBool,
    next_seq: AtomicU64,
    next_id: AtomicU64,
}

/// Owns a pool-of-one background thread driving timer callbacks.
pub struct TimerDriver {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerDriver {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            heap: Mutex::new(BinaryHeap::new()),
            cvar: Condvar::new(),
            shutdown: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
        });
        let thread_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("timer-driver".into())
            .spawn(move || Self::run(thread_shared))
            .expect("failed to spawn timer driver thread");
        Self {
            shared,
            thread: Mutex::new(Some(thread)),
        }
    }

    fn run(shared: Arc<Shared>) {
        let mut guard = shared.heap.lock().unwrap();
        loop {
            if shared.shutdown.load(Ordering::Acquire) && guard.is_empty() {
                return;
            }
            let Some(top) = guard.peek() else {
                let (g, _) = shared
                    .cvar
                    .wait_timeout(guard, Duration::from_millis(200))
                    .unwrap();
                guard = g;
                continue;
            };
            let now = Instant::now();
            if top.due > now {
                let wait_for = top.due - now;
                let (g, _) = shared.cvar.wait_timeout(guard, wait_for).unwrap();
                guard = g;
                continue;
            }

            let mut entry = guard.pop().unwrap();
            drop(guard);

            if !entry.cancelled.load(Ordering::Acquire) {
                if let Some(cb) = entry.callback.lock().unwrap().as_mut() {
                    cb();
                }
            }

            guard = shared.heap.lock().unwrap();
            if let Some(period) = entry.period {
                if !entry.cancelled.load(Ordering::Acquire) {
                    entry.due += period;
                    entry.seq = shared.next_seq.fetch_add(1, Ordering::Relaxed);
                    guard.push(entry);
                }
            }
        }
    }

    /// Inserts a new timer, firing approximately at `now + initial_delay`,
    /// then every `period` thereafter if `period` is `Some` and nonzero.
    pub fn insert(
        &self,
        initial_delay: Duration,
        period: Option<Duration>,
        callback: impl FnMut() + Send + 'static,
    ) -> TimerHandle {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));
        let entry = Entry {
            due: Instant::now() + initial_delay,
            seq: self.shared.next_seq.fetch_add(1, Ordering::Relaxed),
            id,
            period: period.filter(|p| !p.is_zero()),
            cancelled: cancelled.clone(),
            callback: Mutex::new(Some(Box::new(callback))),
        };
        {
            let mut guard = self.shared.heap.lock().unwrap();
            guard.push(entry);
        }
        self.shared.cvar.notify_all();
        TimerHandle { id, cancelled }
    }

    /// Best-effort cancellation: if the callback has already started firing,
    /// this has no effect on that firing.
    pub fn cancel(&self, handle: &TimerHandle) {
        handle.cancelled.store(true, Ordering::Release);
    }

    /// Stops the driver thread, dropping any timers still pending.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.cvar.notify_all();
        if let Some(t) = self.thread.lock().unwrap().take() {
            let _ = t.join();
        }
    }

    /// Returns a future satisfied with `value` after `delay`. The
    /// canonical Timer/Promise/Fiber composition from the spec.
    pub fn after<T: Send + Sync + 'static>(&self, delay: Duration, value: T) -> Future<T> {
        let promise = Promise::new();
        let future = promise.future();
        let mut value = Some(value);
        self.insert(delay, None, move || {
            if let Some(v) = value.take() {
                let _ = promise.set_success(v);
            }
        });
        future
    }
}

impl Default for TimerDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::promise::PollResult;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn poll_now<T>(f: &Future<T>) -> Option<std::sync::Arc<T>> {
        match f.try_get() {
            PollResult::Ready(Ok(v)) => Some(v),
            _ => None,
        }
    }

    #[test]
    fn fires_after_delay() {
        let td = TimerDriver::new();
        let fut = td.after(Duration::from_millis(30), 7i32);
        assert!(poll_now(&fut).is_none());
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(*poll_now(&fut).unwrap(), 7);
        td.shutdown();
    }

    #[test]
    fn equal_deadlines_fire_in_insertion_order() {
        let td = TimerDriver::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let due = Duration::from_millis(20);
        for i in 0..5 {
            let order = order.clone();
            td.insert(due, None, move || order.lock().unwrap().push(i));
        }
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        td.shutdown();
    }

    #[test]
    fn cancel_is_best_effort() {
        let td = TimerDriver::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let handle = td.insert(Duration::from_millis(50), None, move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        td.cancel(&handle);
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        td.shutdown();
    }

    #[test]
    fn periodic_timer_reschedules() {
        let td = TimerDriver::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        td.insert(Duration::from_millis(10), Some(Duration::from_millis(10)), move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(150));
        assert!(fired.load(Ordering::SeqCst) >= 3);
        td.shutdown();
    }
}
