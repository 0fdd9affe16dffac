//! One-shot promises that hand a single result (or failure) from one producer
//! to any number of consumers.
//!
//! A [`Deferred`] is the producer side: it may [`resolve`](Deferred::resolve),
//! [`reject`](Deferred::reject) or [`cancel`](Deferred::cancel) exactly once.
//! A [`Promise`] is the consumer side: it can be cloned freely, waited on from
//! a blocking thread with a [`Context`], awaited from async code, or given
//! callbacks that run once the outcome is known.
//!
//! # Examples
//!
//! ```
//! use deferred_out::Context;
//!
//! let promise = deferred_out::go(|| Ok::<_, std::io::Error>(String::from("🍓")));
//! let value = promise.wait(&Context::background()).unwrap();
//! assert_eq!(*value, "🍓");
//! ```
use std::error::Error as StdError;
use std::sync::Arc;

pub mod context;
pub mod deferred;
pub mod promise;
mod signal;

pub use context::{CancelHandle, Context, ContextError};
pub use deferred::{Deferred, EmptyDeferred};
pub use promise::{EmptyPromise, Promise, Wait};

/// What every consumer of a promise eventually receives.
pub type Outcome<T> = Result<Arc<T>, Error>;

/// A boxed error a unit of work may reject with.
pub type BoxError = Box<dyn StdError + Send + Sync>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A second resolve, reject or cancel on an already settled promise.
    #[error("promise is already resolved")]
    AlreadyResolved,
    /// The producer cancelled the promise.
    #[error("promise was cancelled")]
    Cancelled,
    /// The producer went away without settling the promise.
    #[error("producer dropped without resolving the promise")]
    ProducerDropped,
    /// The error the producer rejected with, passed through untouched.
    #[error(transparent)]
    Rejected(Arc<dyn StdError + Send + Sync>),
    /// The context given to `wait` finished first. Never stored in a promise.
    #[error(transparent)]
    Context(#[from] ContextError),
}

impl Error {
    /// Wraps an arbitrary failure. `Error::Cancelled` is kept as is, so a
    /// producer may reject with it and consumers still see the sentinel. Any
    /// other error of this crate, e.g. a context error from waiting on another
    /// promise, becomes an ordinary rejection.
    pub fn rejected<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        match err.into().downcast::<Error>() {
            Ok(err) if err.is_cancelled() => Error::Cancelled,
            Ok(err) => Error::Rejected(Arc::new(*err)),
            Err(err) => Error::Rejected(Arc::from(err)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// True when the error came from the waiting context, not the promise.
    pub fn is_context(&self) -> bool {
        matches!(self, Error::Context(_))
    }

    /// Looks inside a rejection for a concrete error type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        match self {
            Error::Rejected(err) => (**err).downcast_ref::<E>(),
            _ => None,
        }
    }
}

/// Creates an unresolved producer carrying a `T`.
pub fn create<T>() -> Deferred<T>
where
    T: Send + Sync + 'static,
{
    Deferred::new()
}

/// Creates an unresolved producer carrying only completion.
pub fn create_empty() -> EmptyDeferred {
    Deferred::new()
}

/// Runs `work` on its own thread and returns the promise of its result.
///
/// ```
/// use deferred_out::{Context, Error};
///
/// let promise = deferred_out::go(|| Err::<u8, _>("boom"));
/// let err = promise.wait(&Context::background()).unwrap_err();
/// assert!(matches!(err, Error::Rejected(_)));
/// assert_eq!(err.to_string(), "boom");
/// ```
pub fn go<T, E, F>(work: F) -> Promise<T>
where
    T: Send + Sync + 'static,
    E: Into<BoxError>,
    F: FnOnce() -> Result<T, E> + Send + 'static,
{
    create().go(work)
}

/// Like [`go`] for work that only reports success or failure.
pub fn go_empty<E, F>(work: F) -> EmptyPromise
where
    E: Into<BoxError>,
    F: FnOnce() -> Result<(), E> + Send + 'static,
{
    create_empty().go(work)
}
