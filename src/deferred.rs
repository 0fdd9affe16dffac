use std::sync::Arc;
use tracing::debug;

use crate::promise::{spawn_detached, Promise};
use crate::{BoxError, Error};

const LAUNCH_THREAD: &str = "deferred-go";

/// The producer side of a [`Promise`]. Only a `Deferred` can settle its
/// promise, and only once.
///
/// Dropping a `Deferred` that never settled rejects its promise with
/// [`Error::ProducerDropped`] so consumers are not left waiting forever.
///
/// # Examples
///
/// ```
/// use deferred_out::{Context, Deferred};
/// use std::thread;
///
/// let deferred = Deferred::<String>::new();
/// let promise = deferred.promise();
/// let task1 = thread::spawn(move || {
///     println!("Received {:?}", promise.wait(&Context::background()));
/// });
/// deferred.resolve("Hi".into()).unwrap();
/// task1.join().expect("The task1 thread has panicked.");
/// ```
#[derive(Debug)]
pub struct Deferred<T: Send + Sync + 'static> {
    promise: Promise<T>,
}

/// A deferred that only signals completion.
pub type EmptyDeferred = Deferred<()>;

impl<T> Deferred<T>
where
    T: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            promise: Promise::new(),
        }
    }

    /// Settles the promise with `value`.
    pub fn resolve(&self, value: T) -> Result<(), Error> {
        self.promise.resolve(Ok(Arc::new(value)))
    }

    /// Settles the promise with `err`, which consumers receive unchanged.
    ///
    /// ```
    /// use deferred_out::{Context, Deferred, Error};
    ///
    /// let deferred = Deferred::<()>::new();
    /// deferred.reject("💥").unwrap();
    /// let err = deferred.promise().wait(&Context::background()).unwrap_err();
    /// assert_eq!(err.to_string(), "💥");
    /// assert!(matches!(deferred.cancel(), Err(Error::AlreadyResolved)));
    /// ```
    pub fn reject<E>(&self, err: E) -> Result<(), Error>
    where
        E: Into<BoxError>,
    {
        self.promise.resolve(Err(Error::rejected(err)))
    }

    /// Settles the promise with [`Error::Cancelled`].
    pub fn cancel(&self) -> Result<(), Error> {
        self.promise.resolve(Err(Error::Cancelled))
    }

    /// The consumer handle. Every call hands out the same promise.
    pub fn promise(&self) -> Promise<T> {
        self.promise.clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.promise.is_resolved()
    }

    /// Runs `work` on its own thread and settles the promise with what it
    /// returns. The promise is handed back right away.
    ///
    /// A panic in `work` is not caught; the promise then ends up rejected with
    /// [`Error::ProducerDropped`] as the deferred unwinds.
    pub fn go<E, F>(self, work: F) -> Promise<T>
    where
        E: Into<BoxError>,
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        let promise = self.promise();
        spawn_detached(LAUNCH_THREAD, move || {
            let settled = match work() {
                Ok(value) => self.resolve(value),
                Err(err) => self.reject(err),
            };
            if let Err(err) = settled {
                debug!(%err, "launched work finished after its promise was settled");
            }
        });
        promise
    }
}

impl<T> Default for Deferred<T>
where
    T: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Deferred<T>
where
    T: Send + Sync + 'static,
{
    /// If this is an unresolved producer, wake with error.
    fn drop(&mut self) {
        if self.promise.is_resolved() {
            return;
        }
        if self.promise.resolve(Err(Error::ProducerDropped)).is_ok() {
            debug!("deferred dropped before settling its promise");
        }
    }
}
