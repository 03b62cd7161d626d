//! # Completion callbacks and ordered retirement.
//!
//! Every process dispatch hands the user task a [`Callback`] (obtained from
//! the dispatch's [`CallbackFactory`]). The task completes it exactly once,
//! from any thread; the worker then retires completions **in dispatch
//! order** through the [`CallbackRegistry`] so offsets reach the offset
//! manager strictly increasing per partition.
//!
//! ```text
//! dispatch order:   seq 0   seq 1   seq 2   seq 3
//! completions:              ▲               ▲            (2 completes, then 0)
//! retire(2) → nothing released (0 still pending)
//! retire(0) → releases 0            high-water = seq 0
//! retire(3) → nothing released (1 still pending)
//! retire(1) → releases 1,2,3        high-water = seq 3
//! ```
//!
//! ## Rules
//! - Terminal transitions (`complete` / `fail` / timeout) are single-shot:
//!   the first one wins, later ones are counted and ignored.
//! - Failed and timed-out dispatches are never inserted into the registry,
//!   so the failure point stays the replay position.
//! - A stuck pending callback blocks retirement behind it; the configured
//!   callback timeout bounds how long.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::coordinator::Coordinator;
use crate::core::worker::TaskWorker;
use crate::envelope::Envelope;
use crate::error::TaskError;

const PENDING: u8 = 0;
const COMPLETED: u8 = 1;
const FAILED: u8 = 2;
const TIMED_OUT: u8 = 3;

/// Single-shot completion handle for one dispatched envelope.
pub struct Callback {
    pub(crate) seq: u64,
    pub(crate) envelope: Envelope,
    pub(crate) coordinator: Arc<Coordinator>,
    pub(crate) created_at: Instant,
    state: AtomicU8,
    watchdog: CancellationToken,
    worker: Arc<TaskWorker>,
}

impl Callback {
    /// Envelope this callback acknowledges.
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Dispatch sequence number within the task.
    pub fn sequence(&self) -> u64 {
        self.seq
    }

    /// Signals successful processing of the envelope.
    ///
    /// Duplicate completions are ignored (metrics only).
    pub fn complete(self: &Arc<Self>) {
        if self.transition(COMPLETED) {
            self.watchdog.cancel();
            self.worker.on_complete(self);
        } else {
            self.worker.note_duplicate_completion();
        }
    }

    /// Signals failed processing of the envelope. Aborts the run loop; the
    /// envelope's offset is not committed.
    pub fn fail(self: &Arc<Self>, error: TaskError) {
        if self.transition(FAILED) {
            self.watchdog.cancel();
            self.worker.on_failure(self, error);
        } else {
            self.worker.note_duplicate_completion();
        }
    }

    /// Watchdog path: the deadline expired before any completion.
    ///
    /// Losing the race against a real completion is not a duplicate.
    fn expire(self: &Arc<Self>, timeout: Duration) {
        if self.transition(TIMED_OUT) {
            self.worker.on_failure(self, TaskError::Timeout { timeout });
        }
    }

    fn transition(&self, to: u8) -> bool {
        self.state
            .compare_exchange(PENDING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Creates callbacks for one process dispatch.
///
/// Handed to [`StreamTask::process`](crate::StreamTask::process); each
/// [`create`](CallbackFactory::create) call registers one expected
/// completion with the worker (the contract is exactly one per envelope).
pub struct CallbackFactory {
    worker: Arc<TaskWorker>,
    envelope: Envelope,
    coordinator: Arc<Coordinator>,
}

impl CallbackFactory {
    pub(crate) fn new(
        worker: Arc<TaskWorker>,
        envelope: Envelope,
        coordinator: Arc<Coordinator>,
    ) -> Self {
        Self {
            worker,
            envelope,
            coordinator,
        }
    }

    /// Registers one expected completion and returns its callback.
    ///
    /// Counts the dispatch, takes the next sequence number, and arms the
    /// completion watchdog when a callback timeout is configured.
    pub fn create(&self) -> Arc<Callback> {
        self.worker.state().start_process();
        self.worker.container_metrics().processes.inc();

        let callback = Arc::new(Callback {
            seq: self.worker.callbacks().allocate(),
            envelope: self.envelope.clone(),
            coordinator: self.coordinator.clone(),
            created_at: Instant::now(),
            state: AtomicU8::new(PENDING),
            watchdog: self.worker.timer_token().child_token(),
            worker: self.worker.clone(),
        });

        if let Some(deadline) = self.worker.callback_deadline() {
            let armed = callback.clone();
            let token = callback.watchdog.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(deadline) => {
                        trace!(seq = armed.seq, "callback deadline expired");
                        armed.expire(deadline);
                    }
                }
            });
        }

        callback
    }
}

/// Envelope and coordinator of a retired dispatch.
pub(crate) struct Retired {
    pub(crate) envelope: Envelope,
    pub(crate) coordinator: Arc<Coordinator>,
}

#[derive(Default)]
struct RegistryInner {
    next_seq: u64,
    next_to_retire: u64,
    completed: BTreeMap<u64, Retired>,
}

/// Per-task sequence allocator and reorder buffer.
pub(crate) struct CallbackRegistry {
    inner: Mutex<RegistryInner>,
}

impl CallbackRegistry {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// Allocates the next dispatch sequence number.
    pub(crate) fn allocate(&self) -> u64 {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        seq
    }

    /// Records a successful completion and releases the longest contiguous
    /// completed prefix.
    ///
    /// Returns the last released entry (its offset is the high-water mark
    /// to commit), or `None` when an earlier sequence is still pending.
    pub(crate) fn retire(
        &self,
        seq: u64,
        envelope: Envelope,
        coordinator: Arc<Coordinator>,
    ) -> Option<Retired> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.completed.insert(
            seq,
            Retired {
                envelope,
                coordinator,
            },
        );

        let mut last = None;
        while let Some(entry) = inner.completed.remove(&inner.next_to_retire) {
            inner.next_to_retire += 1;
            last = Some(entry);
        }
        last
    }
}
