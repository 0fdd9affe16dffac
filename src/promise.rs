use futures::task::{waker, ArcWake, AtomicWaker};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll, Waker};
use std::thread;
use sync_wrapper::SyncWrapper;
use tracing::{debug, error, trace, warn};

use crate::context::Context;
use crate::signal::Signal;
use crate::{Error, Outcome};

const WAITERS_THREAD: &str = "deferred-waiters";
const SUBSCRIBERS_THREAD: &str = "deferred-subscribers";

/// The consumer side of a one-shot result. Cloning is cheap and every clone
/// observes the same outcome.
///
/// # Examples
///
/// ```
/// use deferred_out::Context;
/// use std::thread;
///
/// let deferred = deferred_out::create::<String>();
/// let promise = deferred.promise();
/// let promise2 = promise.clone();
/// let task1 = thread::spawn(move || {
///     println!("Received on task 1 {:?}", promise.wait(&Context::background()));
/// });
/// let task2 = thread::spawn(move || {
///     println!("Received on task 2 {:?}", promise2.wait(&Context::background()));
/// });
/// deferred.resolve("Hi".into()).unwrap();
/// task1.join().expect("The task1 thread has panicked.");
/// task2.join().expect("The task2 thread has panicked.");
/// ```
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

/// A promise that only signals completion.
pub type EmptyPromise = Promise<()>;

struct Inner<T> {
    // Flipped under the write lock, after `outcome` is set. Readers that see
    // it true may take the read lock and find the outcome there.
    resolved: AtomicBool,
    state: RwLock<State<T>>,
}

struct State<T> {
    outcome: Option<Outcome<T>>,
    waiters: Vec<(u64, Waker)>,
    next_waiter: u64,
    subscribers: Vec<Subscriber<T>>,
}

// Callbacks only need `Send`; the wrapper lets them sit behind the `RwLock`.
type Subscriber<T> = SyncWrapper<Box<dyn FnOnce(Outcome<T>) + Send>>;

/// Future returned by [`Promise::wait_async`].
///
/// The first pending poll puts one waker in the promise's waiter list; later
/// polls only swap the task waker it forwards to.
pub struct Wait<T> {
    promise: Promise<T>,
    task: Arc<TaskWaker>,
    waiter: Option<u64>,
}

#[derive(Default)]
struct TaskWaker(AtomicWaker);

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.0.wake();
    }
}

impl<T> Promise<T>
where
    T: Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                resolved: AtomicBool::new(false),
                state: RwLock::new(State {
                    outcome: None,
                    waiters: vec![],
                    next_waiter: 0,
                    subscribers: vec![],
                }),
            }),
        }
    }

    /// Never blocks. May turn true slightly before a concurrent `wait`
    /// returns.
    pub fn is_resolved(&self) -> bool {
        self.inner.resolved.load(Ordering::Acquire)
    }

    /// The outcome if the promise is settled, without waiting.
    pub fn try_get(&self) -> Option<Outcome<T>> {
        if !self.is_resolved() {
            return None;
        }
        self.inner.state.read().outcome.clone()
    }

    /// Blocks until the promise is settled or `ctx` is done, whichever comes
    /// first.
    ///
    /// When `ctx` wins, its reason comes back as [`Error::Context`] and the
    /// promise is untouched; other waiters still get the real outcome.
    pub fn wait(&self, ctx: &Context) -> Outcome<T> {
        if let Some(outcome) = self.try_get() {
            trace!("wait fast path");
            return outcome;
        }

        let signal = Signal::new();
        let waiter = match self.register(signal.waker()) {
            Ok(waiter) => waiter,
            Err(outcome) => return outcome,
        };
        trace!(waiter, "waiter registered");

        let interrupt = Signal::new();
        let _listening = ctx.listen(interrupt.waker());
        loop {
            if signal.is_fired() {
                if let Some(outcome) = self.try_get() {
                    return outcome;
                }
            }
            if let Some(err) = ctx.err() {
                trace!(%err, waiter, "wait abandoned");
                self.unregister(waiter);
                return Err(err.into());
            }
            signal.park_until(ctx.deadline());
        }
    }

    /// Like [`wait`](Promise::wait) for async code. Cancellation is left to
    /// the caller, e.g. by dropping the future.
    ///
    /// ```
    /// use futures::executor::block_on;
    ///
    /// let deferred = deferred_out::create::<u32>();
    /// let promise = deferred.promise();
    /// deferred.resolve(7).unwrap();
    /// assert_eq!(*block_on(promise.wait_async()).unwrap(), 7);
    /// ```
    pub fn wait_async(&self) -> Wait<T> {
        Wait {
            promise: self.clone(),
            task: Arc::default(),
            waiter: None,
        }
    }

    /// Runs `callback` once with the outcome, on a thread of its own.
    /// Callbacks registered before settlement run in registration order.
    pub fn on_resolve<F>(&self, callback: F)
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        let subscriber: Subscriber<T> = SyncWrapper::new(Box::new(callback));
        let outcome = match self.try_get() {
            Some(outcome) => outcome,
            None => {
                let mut state = self.inner.state.write();
                match state.outcome.clone() {
                    Some(outcome) => outcome,
                    None => {
                        state.subscribers.push(subscriber);
                        trace!("subscriber registered");
                        return;
                    }
                }
            }
        };
        trace!("subscribe fast path");
        spawn_detached(SUBSCRIBERS_THREAD, move || deliver(subscriber, outcome));
    }

    /// Runs `callback` only if the promise resolves with a value.
    pub fn on_success<F>(&self, callback: F)
    where
        F: FnOnce(Arc<T>) + Send + 'static,
    {
        self.on_resolve(|outcome| {
            if let Ok(value) = outcome {
                callback(value)
            }
        })
    }

    /// Runs `callback` only if the promise is rejected or cancelled.
    pub fn on_fail<F>(&self, callback: F)
    where
        F: FnOnce(Error) + Send + 'static,
    {
        self.on_resolve(|outcome| {
            if let Err(err) = outcome {
                callback(err)
            }
        })
    }

    /// Settles the promise. Only the first call wins; later ones return
    /// [`Error::AlreadyResolved`] and change nothing.
    pub(crate) fn resolve(&self, outcome: Outcome<T>) -> Result<(), Error> {
        if self.is_resolved() {
            debug!("promise already resolved");
            return Err(Error::AlreadyResolved);
        }

        let (waiters, subscribers) = {
            let mut state = self.inner.state.write();
            if state.outcome.is_some() {
                debug!("promise already resolved");
                return Err(Error::AlreadyResolved);
            }
            state.outcome = Some(outcome.clone());
            self.inner.resolved.store(true, Ordering::Release);
            (
                std::mem::take(&mut state.waiters),
                std::mem::take(&mut state.subscribers),
            )
        };
        debug!(
            ok = outcome.is_ok(),
            waiters = waiters.len(),
            subscribers = subscribers.len(),
            "promise resolved"
        );

        if !waiters.is_empty() {
            spawn_detached(WAITERS_THREAD, move || {
                for (_, waker) in waiters {
                    waker.wake();
                }
            });
        }
        if !subscribers.is_empty() {
            spawn_detached(SUBSCRIBERS_THREAD, move || {
                for subscriber in subscribers {
                    deliver(subscriber, outcome.clone());
                }
            });
        }
        Ok(())
    }
}

impl<T> Promise<T> {
    /// True when both handles point at the same promise.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.inner, &other.inner)
    }

    /// Adds `waker` to the waiter list, or hands back the outcome if the
    /// promise settled in the meantime.
    fn register(&self, waker: Waker) -> Result<u64, Outcome<T>> {
        let mut state = self.inner.state.write();
        if let Some(outcome) = state.outcome.clone() {
            return Err(outcome);
        }
        let id = state.next_waiter;
        state.next_waiter += 1;
        state.waiters.push((id, waker));
        Ok(id)
    }

    /// Drops a waiter that stopped waiting. A no-op once the promise settled.
    fn unregister(&self, waiter: u64) {
        self.inner
            .state
            .write()
            .waiters
            .retain(|(id, _)| *id != waiter);
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("resolved", &self.inner.resolved.load(Ordering::Acquire))
            .finish()
    }
}

impl<T> Future for Wait<T>
where
    T: Send + Sync + 'static,
{
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(outcome) = this.promise.try_get() {
            return Poll::Ready(outcome);
        }
        this.task.0.register(cx.waker());
        if this.waiter.is_none() {
            match this.promise.register(waker(this.task.clone())) {
                Ok(waiter) => this.waiter = Some(waiter),
                Err(outcome) => return Poll::Ready(outcome),
            }
        }
        // Settled between the first check and `register` above.
        match this.promise.try_get() {
            Some(outcome) => Poll::Ready(outcome),
            None => Poll::Pending,
        }
    }
}

impl<T> Drop for Wait<T> {
    fn drop(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            self.promise.unregister(waiter);
        }
    }
}

impl<T> fmt::Debug for Wait<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wait").field("promise", &self.promise).finish()
    }
}

/// A panicking subscriber must not keep the rest from running.
fn deliver<T>(subscriber: Subscriber<T>, outcome: Outcome<T>) {
    let callback = subscriber.into_inner();
    if catch_unwind(AssertUnwindSafe(move || callback(outcome))).is_err() {
        warn!("promise subscriber panicked");
    }
}

/// Runs `job` on a detached, named thread. If the thread cannot be spawned
/// the job runs on the caller so nothing is lost.
pub(crate) fn spawn_detached<F>(name: &str, job: F)
where
    F: FnOnce() + Send + 'static,
{
    let slot = Arc::new(Mutex::new(Some(job)));
    let remote = slot.clone();
    let spawned = thread::Builder::new().name(name.into()).spawn(move || {
        let job = remote.lock().take();
        if let Some(job) = job {
            job()
        }
    });
    if let Err(err) = spawned {
        error!(%err, thread = name, "could not spawn thread, running inline");
        let job = slot.lock().take();
        if let Some(job) = job {
            job()
        }
    }
}
