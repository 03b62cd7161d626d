//! # Per-task scheduling state.
//!
//! [`TaskState`] tracks what one task is doing (in-flight dispatches,
//! pending window/commit flags, queued envelopes) and computes the next
//! legal operation for it. In summary, a worker has the following states:
//!
//! - **ready** — can start window, commit, or process the next envelope
//! - **busy** — window/commit in flight, or at the in-flight cap
//! - **idle** — nothing queued and no window/commit pending
//!
//! ## Rules
//! - The pending queue is mutated only by the driver (insert during
//!   `run_tasks`, remove during `fetch_envelope`).
//! - Window/commit never starts while messages are in flight, and no
//!   process dispatch starts while window/commit is in flight.
//! - Need flags are cleared when the operation **starts**, so ticks that
//!   fire during a long window/commit coalesce into one follow-up.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::consumer::MultiplexedConsumer;
use crate::coordinator::CoordinatorRequests;
use crate::envelope::{Envelope, TaskName};
use crate::metrics::TaskMetrics;

/// An envelope queued for one or more tasks, tagged with a first-fetch flag.
///
/// A broadcast partition puts the same `PendingEnvelope` on every
/// subscriber's queue; only the first fetch advances the consumer.
pub(crate) struct PendingEnvelope {
    envelope: Envelope,
    processed: AtomicBool,
}

impl PendingEnvelope {
    pub(crate) fn new(envelope: Envelope) -> Arc<Self> {
        Arc::new(Self {
            envelope,
            processed: AtomicBool::new(false),
        })
    }

    /// Flips the processed flag; returns `true` for the first caller only.
    fn mark_processed(&self) -> bool {
        !self.processed.swap(true, Ordering::AcqRel)
    }
}

/// Next operation for a task worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerOp {
    Window,
    Commit,
    Process,
    NoOp,
}

/// Scheduling state of one task.
pub(crate) struct TaskState {
    name: TaskName,
    max_concurrency: usize,
    need_window: AtomicBool,
    need_commit: AtomicBool,
    window_or_commit_in_flight: AtomicBool,
    messages_in_flight: AtomicUsize,
    queue: Mutex<VecDeque<Arc<PendingEnvelope>>>,
    metrics: Arc<TaskMetrics>,
}

impl TaskState {
    pub(crate) fn new(name: TaskName, max_concurrency: usize, metrics: Arc<TaskMetrics>) -> Self {
        Self {
            name,
            max_concurrency,
            need_window: AtomicBool::new(false),
            need_commit: AtomicBool::new(false),
            window_or_commit_in_flight: AtomicBool::new(false),
            messages_in_flight: AtomicUsize::new(0),
            queue: Mutex::new(VecDeque::new()),
            metrics,
        }
    }

    /// Whether the task can start its next operation.
    ///
    /// Pending coordinator commit requests are folded into `need commit`
    /// here (consume-on-read), so a requested commit takes effect on the
    /// very next readiness check.
    pub(crate) fn is_ready(&self, requests: &CoordinatorRequests) -> bool {
        if requests.take_commit_request(&self.name) {
            self.need_commit.store(true, Ordering::Release);
        }
        let in_flight = self.messages_in_flight.load(Ordering::Acquire);
        let flushing = self.window_or_commit_in_flight.load(Ordering::Acquire);
        if self.need_window.load(Ordering::Acquire) || self.need_commit.load(Ordering::Acquire) {
            // Window/commit requires quiescence: nothing in flight at all.
            in_flight == 0 && !flushing
        } else {
            in_flight < self.max_concurrency && !flushing
        }
    }

    /// Whether the task has anything to do once it becomes ready.
    pub(crate) fn has_pending_ops(&self) -> bool {
        !self.queue.lock().is_empty()
            || self.need_commit.load(Ordering::Acquire)
            || self.need_window.load(Ordering::Acquire)
    }

    /// Chooses the next operation.
    ///
    /// Priority when ready: commit, then window, then process. Commits jump
    /// ahead of windows so a coordinator waiting on a commit is not stalled
    /// behind a long window; both jump ahead of process so a continuous
    /// message stream cannot starve them.
    pub(crate) fn next_op(&self, requests: &CoordinatorRequests) -> WorkerOp {
        if self.is_ready(requests) {
            if self.need_commit.load(Ordering::Acquire) {
                return WorkerOp::Commit;
            }
            if self.need_window.load(Ordering::Acquire) {
                return WorkerOp::Window;
            }
            if !self.queue.lock().is_empty() {
                return WorkerOp::Process;
            }
        }
        WorkerOp::NoOp
    }

    pub(crate) fn need_window(&self) {
        self.need_window.store(true, Ordering::Release);
    }

    pub(crate) fn need_commit(&self) {
        self.need_commit.store(true, Ordering::Release);
    }

    pub(crate) fn start_window(&self) {
        self.need_window.store(false, Ordering::Release);
        self.window_or_commit_in_flight.store(true, Ordering::Release);
    }

    pub(crate) fn start_commit(&self) {
        self.need_commit.store(false, Ordering::Release);
        self.window_or_commit_in_flight.store(true, Ordering::Release);
    }

    pub(crate) fn start_process(&self) {
        self.messages_in_flight.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn done_window_or_commit(&self) {
        self.window_or_commit_in_flight.store(false, Ordering::Release);
    }

    pub(crate) fn done_process(&self) {
        self.messages_in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    /// Appends an envelope to the pending queue. Driver only.
    pub(crate) fn insert_envelope(&self, pending: Arc<PendingEnvelope>) {
        let mut queue = self.queue.lock();
        queue.push_back(pending);
        let len = queue.len();
        drop(queue);
        self.metrics.pending_messages.set(len as u64);
        debug!(task = %self.name, pending = len, "envelope queued");
    }

    /// Removes the head of the pending queue. Driver only.
    ///
    /// The first task to fetch a given envelope advances the consumer's
    /// cursor for its partition; later fetches of the same broadcast
    /// envelope do not. Until that first fetch the consumer withholds
    /// further messages for the partition, which is the flow-control seam.
    pub(crate) fn fetch_envelope(&self, consumer: &dyn MultiplexedConsumer) -> Option<Envelope> {
        let mut queue = self.queue.lock();
        let pending = queue.pop_front()?;
        let len = queue.len();
        drop(queue);
        self.metrics.pending_messages.set(len as u64);

        if pending.mark_processed() {
            consumer.try_update(&pending.envelope.partition);
            trace!(partition = %pending.envelope.partition, "advanced consumer cursor");
        }
        Some(pending.envelope.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::coordinator::Coordinator;
    use crate::envelope::Partition;
    use crate::error::LoopError;

    struct CountingConsumer {
        updates: AtomicUsize,
    }

    impl CountingConsumer {
        fn new() -> Self {
            Self {
                updates: AtomicUsize::new(0),
            }
        }
    }

    impl MultiplexedConsumer for CountingConsumer {
        fn choose(&self) -> Result<Option<Envelope>, LoopError> {
            Ok(None)
        }

        fn try_update(&self, _partition: &Partition) {
            self.updates.fetch_add(1, Ordering::SeqCst);
        }

        fn poll_interval(&self) -> Duration {
            Duration::from_millis(10)
        }
    }

    fn state(max_concurrency: usize) -> TaskState {
        TaskState::new(
            TaskName::from("t"),
            max_concurrency,
            Arc::new(TaskMetrics::new()),
        )
    }

    fn envelope(offset: u64) -> Envelope {
        Envelope::new(Partition::new("s", 0), offset, "m")
    }

    #[test]
    fn idle_task_is_ready_but_has_nothing_to_do() {
        let s = state(2);
        let requests = CoordinatorRequests::new();
        assert!(s.is_ready(&requests));
        assert!(!s.has_pending_ops());
        assert_eq!(s.next_op(&requests), WorkerOp::NoOp);
    }

    #[test]
    fn commit_outranks_window_outranks_process() {
        let s = state(2);
        let requests = CoordinatorRequests::new();
        s.insert_envelope(PendingEnvelope::new(envelope(1)));
        s.need_window();
        s.need_commit();

        assert_eq!(s.next_op(&requests), WorkerOp::Commit);
        s.start_commit();
        s.done_window_or_commit();

        assert_eq!(s.next_op(&requests), WorkerOp::Window);
        s.start_window();
        s.done_window_or_commit();

        assert_eq!(s.next_op(&requests), WorkerOp::Process);
    }

    #[test]
    fn window_waits_for_in_flight_drain() {
        let s = state(8);
        let requests = CoordinatorRequests::new();
        s.start_process();
        s.need_window();

        // Not ready while a message is in flight; and no process either.
        assert_eq!(s.next_op(&requests), WorkerOp::NoOp);
        assert!(!s.is_ready(&requests));

        s.done_process();
        assert_eq!(s.next_op(&requests), WorkerOp::Window);
    }

    #[test]
    fn no_process_during_window_or_commit() {
        let s = state(2);
        let requests = CoordinatorRequests::new();
        s.insert_envelope(PendingEnvelope::new(envelope(1)));
        s.need_window();
        s.start_window();

        assert!(!s.is_ready(&requests));
        assert_eq!(s.next_op(&requests), WorkerOp::NoOp);

        s.done_window_or_commit();
        assert_eq!(s.next_op(&requests), WorkerOp::Process);
    }

    #[test]
    fn concurrency_cap_gates_process() {
        let s = state(2);
        let requests = CoordinatorRequests::new();
        s.insert_envelope(PendingEnvelope::new(envelope(1)));

        s.start_process();
        assert!(s.is_ready(&requests));
        s.start_process();
        assert!(!s.is_ready(&requests));

        s.done_process();
        assert!(s.is_ready(&requests));
    }

    #[test]
    fn coordinator_commit_request_folds_into_need_commit() {
        let s = state(2);
        let requests = CoordinatorRequests::new();
        let c = Coordinator::new(TaskName::from("t"));
        c.request_commit();
        requests.update(&c);

        assert_eq!(s.next_op(&requests), WorkerOp::Commit);
        // Consumed from the sink; the flag now lives on the state.
        assert!(!requests.take_commit_request(&TaskName::from("t")));
    }

    #[test]
    fn broadcast_envelope_updates_consumer_once() {
        let a = state(1);
        let b = state(1);
        let consumer = CountingConsumer::new();
        let pending = PendingEnvelope::new(envelope(7));
        a.insert_envelope(pending.clone());
        b.insert_envelope(pending);

        let first = a.fetch_envelope(&consumer).unwrap();
        let second = b.fetch_envelope(&consumer).unwrap();
        assert_eq!(first, second);
        assert_eq!(consumer.updates.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fetch_tracks_pending_gauge() {
        let metrics = Arc::new(TaskMetrics::new());
        let s = TaskState::new(TaskName::from("t"), 1, metrics.clone());
        let consumer = CountingConsumer::new();

        s.insert_envelope(PendingEnvelope::new(envelope(1)));
        s.insert_envelope(PendingEnvelope::new(envelope(2)));
        assert_eq!(metrics.pending_messages.get(), 2);

        s.fetch_envelope(&consumer).unwrap();
        assert_eq!(metrics.pending_messages.get(), 1);
        assert!(s.has_pending_ops());
    }
}
