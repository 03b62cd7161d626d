//! # LoopSignal: the driver's wake/abort surface.
//!
//! The run loop parks in exactly one place (`block_if_busy`); every other
//! component reaches it through a shared [`LoopSignal`]:
//!
//! - `resume` — broadcast wake, called whenever a task becomes ready again
//!   (completion arrived, window/commit finished, periodic tick fired).
//! - `abort` — sticky first-writer-wins fatal error; the driver observes it
//!   on its next tick and exits with it.
//! - `request_shutdown` — graceful stop after the current tick.
//!
//! Workers hold the signal as a capability rather than a back-pointer to the
//! run loop, which keeps ownership a tree.
//!
//! ## Rules
//! - `resume` re-checks the coordinator sink first: a shutdown request is
//!   promoted to `shutdown` only once the commit-request set is empty, and
//!   the sink takes both reads under one lock.
//! - Waiters must register (`notified` + `enable`) **before** re-checking
//!   readiness; `notify_waiters` only wakes already-registered waiters.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::trace;

use crate::coordinator::CoordinatorRequests;
use crate::error::LoopError;

/// Shared wake/abort state of one run loop.
pub(crate) struct LoopSignal {
    wake: Notify,
    shutdown: AtomicBool,
    fatal: Mutex<Option<LoopError>>,
    requests: CoordinatorRequests,
}

impl LoopSignal {
    pub(crate) fn new() -> Self {
        Self {
            wake: Notify::new(),
            shutdown: AtomicBool::new(false),
            fatal: Mutex::new(None),
            requests: CoordinatorRequests::new(),
        }
    }

    /// Coordinator request sink shared by all workers.
    pub(crate) fn requests(&self) -> &CoordinatorRequests {
        &self.requests
    }

    /// Wakes the driver so it re-evaluates task readiness.
    ///
    /// Promotes a coordinator shutdown to `shutdown` first, so the driver
    /// observes it on the wake that delivered the last owed commit.
    pub(crate) fn resume(&self) {
        trace!("resume loop driver");
        if self.requests.shutdown_ready() {
            self.shutdown.store(true, Ordering::Release);
        }
        self.wake.notify_waiters();
    }

    /// Records a fatal error; the first writer wins.
    pub(crate) fn abort(&self, error: LoopError) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(error);
        }
    }

    /// Requests a graceful stop after the current tick.
    pub(crate) fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake.notify_waiters();
    }

    pub(crate) fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn aborted(&self) -> bool {
        self.fatal.lock().is_some()
    }

    /// Whether the driver should leave its park wait.
    pub(crate) fn should_exit(&self) -> bool {
        self.shutdown_requested() || self.aborted()
    }

    /// Removes the recorded fatal error for raising.
    pub(crate) fn take_fatal(&self) -> Option<LoopError> {
        self.fatal.lock().take()
    }

    /// Returns a waiter future. Callers pin it and call `enable` before
    /// re-checking readiness.
    pub(crate) fn notified(&self) -> Notified<'_> {
        self.wake.notified()
    }
}
