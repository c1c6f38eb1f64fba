//! Promise / Future: the one-shot rendezvous primitive between background
//! producers (timers, worker jobs, database operations) and fibers.
//!
//! A [`Promise<T>`] is written at most once, by [`Promise::set_success`] or
//! [`Promise::set_exception`]. Any number of [`Future<T>`] handles may read
//! the outcome, either by polling synchronously ([`Future::would_throw`],
//! [`Future::check_and_rethrow`]) or by `.await`ing the handle as a
//! [`std::future::Future`] from inside a fiber body.

use std::fmt;
use std::future::Future as StdFuture;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Waker};

use crate::error::{Error, Result};

type Waiter = Box<dyn FnOnce() + Send>;

enum State<T> {
    Pending {
        wakers: Vec<Waker>,
        waiters: Vec<Waiter>,
    },
    Fulfilled(Arc<T>),
    Failed(Arc<Error>),
}

impl<T> Default for State<T> {
    fn default() -> Self {
        State::Pending {
            wakers: Vec::new(),
            waiters: Vec::new(),
        }
    }
}

struct Inner<T> {
    state: Mutex<State<T>>,
}

impl<T> Inner<T> {
    fn would_throw(&self) -> bool {
        match &*self.state.lock().unwrap() {
            State::Pending { .. } => true,
            State::Fulfilled(_) => false,
            State::Failed(_) => true,
        }
    }

    fn check_and_rethrow(&self) -> Result<()> {
        match &*self.state.lock().unwrap() {
            State::Pending { .. } => Err(Error::PromiseNotSatisfied),
            State::Fulfilled(_) => Ok(()),
            State::Failed(e) => Err((**e).clone()),
        }
    }

    /// Transitions from `Pending` to a terminal state, draining and
    /// invoking waiters *after* releasing the lock, per the promise
    /// contract.
    fn transition(&self, new_state: State<T>) -> Result<()> {
        let (wakers, waiters) = {
            let mut guard = self.state.lock().unwrap();
            match &*guard {
                State::Pending { .. } => {
                    let old = std::mem::replace(&mut *guard, new_state);
                    match old {
                        State::Pending { wakers, waiters } => (wakers, waiters),
                        _ => unreachable!(),
                    }
                }
                _ => return Err(Error::PromiseAlreadySatisfied),
            }
        };
        for waker in wakers {
            waker.wake();
        }
        for waiter in waiters {
            waiter();
        }
        Ok(())
    }

    fn add_waiter(&self, waiter: Waiter) {
        let mut guard = self.state.lock().unwrap();
        match &mut *guard {
            State::Pending { waiters, .. } => waiters.push(waiter),
            State::Fulfilled(_) | State::Failed(_) => {
                drop(guard);
                waiter();
            }
        }
    }

    fn poll(&self, cx: &mut Context<'_>) -> Poll<Result<Arc<T>>> {
        let mut guard = self.state.lock().unwrap();
        match &mut *guard {
            State::Pending { wakers, .. } => {
                wakers.push(cx.waker().clone());
                Poll::Pending
            }
            State::Fulfilled(v) => Poll::Ready(Ok(v.clone())),
            State::Failed(e) => Poll::Ready(Err((**e).clone())),
        }
    }
}

/// The write handle of a one-shot value. Not [`Clone`]: there is exactly
/// one producer. Use [`Promise::downgrade`] to give consumers a weak
/// handle that does not keep the promise's eventual producer alive.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Promise<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Returns a new read handle sharing this promise's outcome.
    pub fn future(&self) -> Future<T> {
        Future {
            inner: self.inner.clone(),
        }
    }

    /// A weak handle suitable for holding from a background operation that
    /// should not keep the caller's promise alive (see `db::operation`).
    pub fn downgrade(&self) -> WeakPromise<T> {
        WeakPromise {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn would_throw(&self) -> bool {
        self.inner.would_throw()
    }

    pub fn check_and_rethrow(&self) -> Result<()> {
        self.inner.check_and_rethrow()
    }

    /// Satisfies the promise with a value. Fails with
    /// [`Error::PromiseAlreadySatisfied`] if already transitioned.
    pub fn set_success(&self, value: T) -> Result<()> {
        self.inner.transition(State::Fulfilled(Arc::new(value)))
    }

    /// Fails the promise. Fails with [`Error::PromiseAlreadySatisfied`] if
    /// already transitioned.
    pub fn set_exception(&self, err: Error) -> Result<()> {
        self.inner.transition(State::Failed(Arc::new(err)))
    }

    /// Registers a one-shot callback invoked when the promise transitions.
    /// If already satisfied, the callback runs synchronously.
    pub fn add_waiter<F: FnOnce() + Send + 'static>(&self, callback: F) {
        self.inner.add_waiter(Box::new(callback));
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("would_throw", &self.would_throw())
            .finish()
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if matches!(&*self.inner.state.lock().unwrap(), State::Pending { .. }) {
            log::warn!("destroying an unsatisfied Promise");
        }
    }
}

/// A read handle on a [`Promise`]. Cheaply [`Clone`]-able; many futures may
/// share one promise. Implements [`std::future::Future`] so it can be
/// `.await`ed directly from within a fiber body (see [`crate::fiber`]).
pub struct Future<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Future<T> {
    pub fn would_throw(&self) -> bool {
        self.inner.would_throw()
    }

    pub fn check_and_rethrow(&self) -> Result<()> {
        self.inner.check_and_rethrow()
    }

    pub fn add_waiter<F: FnOnce() + Send + 'static>(&self, callback: F) {
        self.inner.add_waiter(Box::new(callback));
    }

    /// Non-blocking poll returning the three-way state from the spec:
    /// not-ready, ready(value), or ready(error).
    pub fn try_get(&self) -> PollResult<T> {
        match &*self.inner.state.lock().unwrap() {
            State::Pending { .. } => PollResult::NotReady,
            State::Fulfilled(v) => PollResult::Ready(Ok(v.clone())),
            State::Failed(e) => PollResult::Ready(Err((**e).clone())),
        }
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("would_throw", &self.would_throw())
            .finish()
    }
}

impl<T> StdFuture for Future<T> {
    type Output = Result<Arc<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll(cx)
    }
}

/// Result of a non-blocking [`Future::try_get`].
#[derive(Debug)]
pub enum PollResult<T> {
    NotReady,
    Ready(Result<Arc<T>>),
}

/// A weak handle on a promise, used by producers (DB operations) that must
/// not keep a dropped caller's promise alive. Every access re-acquires a
/// strong handle and checks it is still live.
pub struct WeakPromise<T> {
    inner: Weak<Inner<T>>,
}

impl<T> Clone for WeakPromise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> WeakPromise<T> {
    /// True if the originating [`Promise`] has been dropped: the operation
    /// holding this handle is "isolated" and its result is no longer
    /// observable by anyone.
    pub fn is_isolated(&self) -> bool {
        self.inner.upgrade().is_none()
    }

    pub fn is_satisfied(&self) -> bool {
        match self.inner.upgrade() {
            Some(inner) => !inner.would_throw(),
            None => true,
        }
    }

    /// Sets success if the promise is still alive; a no-op otherwise.
    pub fn set_success(&self, value: T) {
        if let Some(inner) = self.inner.upgrade() {
            let _ = inner.transition(State::Fulfilled(Arc::new(value)));
        }
    }

    /// Sets failure if the promise is still alive; a no-op otherwise.
    pub fn set_exception(&self, err: Error) {
        if let Some(inner) = self.inner.upgrade() {
            let _ = inner.transition(State::Failed(Arc::new(err)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn transitions_at_most_once() {
        let p: Promise<i32> = Promise::new();
        assert!(p.would_throw());
        p.set_success(42).unwrap();
        assert!(!p.would_throw());
        assert_eq!(p.set_success(7), Err(Error::PromiseAlreadySatisfied));
        assert_eq!(p.set_exception(Error::Abandoned), Err(Error::PromiseAlreadySatisfied));
    }

    #[test]
    fn all_readers_observe_same_outcome() {
        let p: Promise<i32> = Promise::new();
        let f1 = p.future();
        let f2 = p.future();
        p.set_success(9).unwrap();
        assert_eq!(*futures_poll_now(&f1).unwrap(), 9);
        assert_eq!(*futures_poll_now(&f2).unwrap(), 9);
    }

    #[test]
    fn add_waiter_runs_synchronously_if_already_satisfied() {
        let p: Promise<()> = Promise::new();
        p.set_success(()).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        p.add_waiter(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn add_waiter_runs_once_on_transition() {
        let p: Promise<()> = Promise::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        p.add_waiter(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        p.set_success(()).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn weak_promise_is_isolated_after_drop() {
        let p: Promise<i32> = Promise::new();
        let weak = p.downgrade();
        assert!(!weak.is_isolated());
        drop(p);
        assert!(weak.is_isolated());
        // no-op, must not panic
        weak.set_success(1);
    }

    fn futures_poll_now<T>(f: &Future<T>) -> Option<Arc<T>> {
        match f.try_get() {
            PollResult::Ready(Ok(v)) => Some(v),
            _ => None,
        }
    }
}
