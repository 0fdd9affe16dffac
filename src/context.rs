//! Cancellation contexts handed to [`Promise::wait`](crate::Promise::wait).
//!
//! A context is done once it is cancelled through its [`CancelHandle`], once
//! its deadline passes, or once any ancestor is done. Its reason is then
//! available from [`Context::err`]. Contexts are cheap to clone; clones share
//! state.
//!
//! # Examples
//!
//! ```
//! use deferred_out::{Context, ContextError};
//!
//! let (ctx, cancel) = Context::with_cancel(&Context::background());
//! assert!(ctx.err().is_none());
//! cancel.cancel();
//! assert_eq!(ctx.err(), Some(ContextError::Canceled));
//! ```
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::task::Waker;
use std::time::{Duration, Instant};

/// Why a context is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("context canceled")]
    Canceled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

/// Cancels the context it was created with, and every context derived from it.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    inner: Arc<Inner>,
}

struct Inner {
    parent: Option<Context>,
    // Earliest of our own deadline and every ancestor's.
    deadline: Option<Instant>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    err: Option<ContextError>,
    listeners: Vec<(u64, Waker)>,
    next_listener: u64,
    children: Vec<Weak<Inner>>,
}

/// Keeps a waker registered with a context until dropped.
pub(crate) struct Listening<'a> {
    ctx: &'a Context,
    id: u64,
}

impl Context {
    /// A context that is never done.
    pub fn background() -> Self {
        Self {
            inner: Arc::new(Inner {
                parent: None,
                deadline: None,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// A child of `parent` that can be cancelled on its own.
    pub fn with_cancel(parent: &Context) -> (Context, CancelHandle) {
        parent.child(None)
    }

    /// A child of `parent` that is done at `deadline` at the latest.
    pub fn with_deadline(parent: &Context, deadline: Instant) -> (Context, CancelHandle) {
        parent.child(Some(deadline))
    }

    /// A child of `parent` that is done after `timeout` at the latest.
    pub fn with_timeout(parent: &Context, timeout: Duration) -> (Context, CancelHandle) {
        // An unrepresentable deadline is no deadline at all.
        parent.child(Instant::now().checked_add(timeout))
    }

    /// The reason this context is done, or `None` while it is still live.
    pub fn err(&self) -> Option<ContextError> {
        if let Some(err) = self.inner.state.lock().err {
            return Some(err);
        }
        if let Some(err) = self.inner.parent.as_ref().and_then(Context::err) {
            self.inner.cancel(err);
            return Some(err);
        }
        match self.inner.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                self.inner.cancel(ContextError::DeadlineExceeded);
                Some(ContextError::DeadlineExceeded)
            }
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// The effective deadline, taking ancestors into account.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Registers `waker` to be woken on cancellation. Deadlines do not wake
    /// listeners; blocked waiters time their own park on [`Context::deadline`].
    pub(crate) fn listen(&self, waker: Waker) -> Listening<'_> {
        let mut state = self.inner.state.lock();
        let id = state.next_listener;
        state.next_listener += 1;
        if state.err.is_some() {
            drop(state);
            waker.wake();
        } else {
            state.listeners.push((id, waker));
        }
        Listening { ctx: self, id }
    }

    fn child(&self, deadline: Option<Instant>) -> (Context, CancelHandle) {
        let deadline = match (self.inner.deadline, deadline) {
            (Some(ours), Some(theirs)) => Some(ours.min(theirs)),
            (ours, theirs) => ours.or(theirs),
        };
        let inner = Arc::new(Inner {
            parent: Some(self.clone()),
            deadline,
            state: Mutex::new(State::default()),
        });

        let mut state = self.inner.state.lock();
        let parent_err = state.err;
        match parent_err {
            Some(err) => inner.state.lock().err = Some(err),
            None => {
                state.children.retain(|child| child.strong_count() > 0);
                state.children.push(Arc::downgrade(&inner));
            }
        }
        drop(state);

        (
            Context {
                inner: inner.clone(),
            },
            CancelHandle { inner },
        )
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("deadline", &self.inner.deadline)
            .field("err", &self.err())
            .finish()
    }
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.inner.cancel(ContextError::Canceled);
    }
}

impl Inner {
    fn cancel(&self, err: ContextError) {
        let mut state = self.state.lock();
        if state.err.is_some() {
            return;
        }
        state.err = Some(err);
        let listeners = std::mem::take(&mut state.listeners);
        let children = std::mem::take(&mut state.children);
        drop(state);

        for (_, waker) in listeners {
            waker.wake();
        }
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel(err);
        }
    }
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inner")
            .field("deadline", &self.deadline)
            .field("err", &self.state.lock().err)
            .finish()
    }
}

impl Drop for Listening<'_> {
    fn drop(&mut self) {
        self.ctx
            .inner
            .state
            .lock()
            .listeners
            .retain(|(id, _)| *id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::{Context, ContextError};
    use crate::signal::Signal;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_background_is_never_done() {
        let ctx = Context::background();
        assert!(ctx.err().is_none());
        assert!(ctx.deadline().is_none());
    }

    #[test]
    fn test_cancel_reaches_children() {
        let (parent, cancel) = Context::with_cancel(&Context::background());
        let (child, _child_cancel) = Context::with_cancel(&parent);
        let (grandchild, _) = Context::with_timeout(&child, Duration::from_secs(60));
        cancel.cancel();
        assert_eq!(parent.err(), Some(ContextError::Canceled));
        assert_eq!(child.err(), Some(ContextError::Canceled));
        assert_eq!(grandchild.err(), Some(ContextError::Canceled));
    }

    #[test]
    fn test_child_cancel_leaves_parent_alone() {
        let (parent, _cancel) = Context::with_cancel(&Context::background());
        let (child, child_cancel) = Context::with_cancel(&parent);
        child_cancel.cancel();
        assert!(parent.err().is_none());
        assert_eq!(child.err(), Some(ContextError::Canceled));
    }

    #[test]
    fn test_child_of_done_parent_is_born_done() {
        let (parent, cancel) = Context::with_cancel(&Context::background());
        cancel.cancel();
        let (child, _) = Context::with_cancel(&parent);
        assert_eq!(child.err(), Some(ContextError::Canceled));
    }

    #[test]
    fn test_deadline_expires() {
        let (ctx, _cancel) =
            Context::with_timeout(&Context::background(), Duration::from_millis(50));
        assert!(ctx.err().is_none());
        thread::sleep(Duration::from_millis(100));
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
    }

    #[test]
    fn test_deadline_is_inherited() {
        let soon = Instant::now() + Duration::from_millis(50);
        let (parent, _) = Context::with_deadline(&Context::background(), soon);
        let (child, _) = Context::with_timeout(&parent, Duration::from_secs(60));
        assert_eq!(child.deadline(), Some(soon));
    }

    #[test]
    fn test_first_reason_sticks() {
        let (ctx, cancel) = Context::with_timeout(&Context::background(), Duration::from_millis(1));
        thread::sleep(Duration::from_millis(10));
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
        cancel.cancel();
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
    }

    #[test]
    fn test_cancel_wakes_listener() {
        let (ctx, cancel) = Context::with_cancel(&Context::background());
        let signal = Signal::new();
        let _listening = ctx.listen(signal.waker());
        let task = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            cancel.cancel();
        });
        while !signal.is_fired() {
            signal.park_until(None);
        }
        task.join().expect("The cancel thread has panicked");
    }

    #[test]
    fn test_dropped_listener_is_removed() {
        let (ctx, _cancel) = Context::with_cancel(&Context::background());
        let signal = Signal::new();
        drop(ctx.listen(signal.waker()));
        assert!(ctx.inner.state.lock().listeners.is_empty());
    }
}
