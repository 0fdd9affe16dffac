//! Wake channel for a thread blocked in `Promise::wait`.
//!
//! A `Signal` is turned into a regular [`Waker`], so blocking waiters sit in
//! the same waiter list as async tasks. Waking it records the fact and unparks
//! the thread that created it.
use futures::task::{waker, ArcWake};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Waker;
use std::thread::{self, Thread};
use std::time::Instant;

#[derive(Debug)]
pub(crate) struct Signal {
    fired: AtomicBool,
    thread: Thread,
}

impl Signal {
    /// A signal owned by the calling thread.
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            fired: AtomicBool::new(false),
            thread: thread::current(),
        })
    }

    pub(crate) fn waker(self: &Arc<Self>) -> Waker {
        waker(self.clone())
    }

    pub(crate) fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Parks the current thread until woken, or until `deadline` passes.
    /// May return spuriously; callers re-check their conditions.
    pub(crate) fn park_until(&self, deadline: Option<Instant>) {
        match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if deadline > now {
                    thread::park_timeout(deadline - now);
                }
            }
            None => thread::park(),
        }
    }
}

impl ArcWake for Signal {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.fired.store(true, Ordering::Release);
        arc_self.thread.unpark();
    }
}
