//! # Per-dispatch coordinator and the request sink.
//!
//! Each process/window dispatch hands the user task a fresh [`Coordinator`].
//! The task can flag a commit request or a shutdown request on it; when the
//! dispatch completes (or the window body finishes), the run loop merges the
//! coordinator into the [`CoordinatorRequests`] sink.
//!
//! ## Rules
//! - Commit requests are per task and consumed when the task's readiness
//!   check folds them into its `need commit` flag.
//! - The shutdown request is global and sticky.
//! - Shutdown is honored only once the commit-request set is empty, so
//!   commits owed to a coordinator are never lost to a concurrent shutdown.
//!   [`shutdown_ready`](CoordinatorRequests::shutdown_ready) takes both
//!   reads under one lock.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::envelope::TaskName;

/// Per-dispatch handle the user task mutates to steer the run loop.
#[derive(Debug)]
pub struct Coordinator {
    task: TaskName,
    commit: AtomicBool,
    shutdown: AtomicBool,
}

impl Coordinator {
    /// Creates a coordinator bound to one task.
    pub fn new(task: TaskName) -> Self {
        Self {
            task,
            commit: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Task this coordinator is bound to.
    pub fn task_name(&self) -> &TaskName {
        &self.task
    }

    /// Requests a commit for this task before further envelopes are
    /// dispatched to it.
    pub fn request_commit(&self) {
        self.commit.store(true, Ordering::Release);
    }

    /// Requests a shutdown of the whole run loop once owed commits drain.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Whether a commit was requested.
    pub fn commit_requested(&self) -> bool {
        self.commit.load(Ordering::Acquire)
    }

    /// Whether a shutdown was requested.
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
struct RequestsInner {
    commits: HashSet<TaskName>,
    shutdown: bool,
}

/// Aggregates coordinator requests across dispatches.
#[derive(Debug, Default)]
pub(crate) struct CoordinatorRequests {
    inner: Mutex<RequestsInner>,
}

impl CoordinatorRequests {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Merges one coordinator's requests into the sink.
    pub(crate) fn update(&self, coordinator: &Coordinator) {
        if !coordinator.commit_requested() && !coordinator.shutdown_requested() {
            return;
        }
        let mut inner = self.inner.lock();
        if coordinator.commit_requested() {
            inner.commits.insert(coordinator.task_name().clone());
        }
        if coordinator.shutdown_requested() {
            inner.shutdown = true;
        }
    }

    /// Consumes a pending commit request for `task`, if any.
    ///
    /// Readiness checks fold the result into the task's `need commit` flag,
    /// so each request triggers exactly one commit.
    pub(crate) fn take_commit_request(&self, task: &TaskName) -> bool {
        self.inner.lock().commits.remove(task)
    }

    /// Whether shutdown was requested and no commit requests are pending.
    ///
    /// Both reads happen under one lock so a commit request that raced the
    /// shutdown request is not dropped.
    pub(crate) fn shutdown_ready(&self) -> bool {
        let inner = self.inner.lock();
        inner.shutdown && inner.commits.is_empty()
    }
}
