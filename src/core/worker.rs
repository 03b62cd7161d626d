//! # TaskWorker: drives one user task.
//!
//! Wraps one [`StreamTask`] together with its scheduling state and callback
//! registry. Each driver tick calls [`TaskWorker::run`], which consults the
//! state and dispatches exactly one of process / window / commit / no-op.
//!
//! ## Architecture
//! ```text
//! RunLoop tick ──► worker.run()
//!                    └─► state.next_op()
//!                          ├─► Process: pop queue head, await user dispatch
//!                          │      └─► user obtains Callback via factory
//!                          │            ├─► complete → on_complete:
//!                          │            │     retire prefix, commit offset,
//!                          │            │     merge coordinator, resume
//!                          │            └─► fail/timeout → on_failure:
//!                          │                  sticky abort, no offset, resume
//!                          ├─► Window / Commit: clear need flag, run body
//!                          │     (inline, or spawned when `offload`),
//!                          │     merge coordinator, resume
//!                          └─► NoOp
//! ```
//!
//! ## Rules
//! - Process dispatches run serially on the driver, which is what keeps
//!   callback sequence numbers in dispatch order. The user's `process` must
//!   return promptly; the completion itself may arrive later from any
//!   thread.
//! - The need flags are cleared when window/commit **starts**; a tick firing
//!   during the body re-arms exactly one follow-up.
//! - Completion listeners run on the completer's thread; all their shared
//!   state is atomic or behind the registry lock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

use crate::config::RunLoopConfig;
use crate::consumer::ConsumerRef;
use crate::coordinator::Coordinator;
use crate::core::callback::{Callback, CallbackFactory, CallbackRegistry};
use crate::core::signal::LoopSignal;
use crate::core::state::{TaskState, WorkerOp};
use crate::envelope::{Partition, TaskName};
use crate::error::{LoopError, TaskError};
use crate::metrics::{ContainerMetrics, TaskMetrics};
use crate::offsets::OffsetRef;
use crate::tasks::TaskRef;

#[derive(Clone, Copy)]
enum Tick {
    Window,
    Commit,
}

#[derive(Clone, Copy)]
enum Flush {
    Window,
    Commit,
}

/// Drives one user task: scheduling state, dispatch, completion listeners.
pub(crate) struct TaskWorker {
    task: TaskRef,
    name: TaskName,
    state: TaskState,
    callbacks: CallbackRegistry,
    signal: Arc<LoopSignal>,
    consumer: ConsumerRef,
    offsets: OffsetRef,
    container: Arc<ContainerMetrics>,
    metrics: Arc<TaskMetrics>,
    timers: CancellationToken,
    callback_deadline: Option<Duration>,
    offload: bool,
}

impl TaskWorker {
    pub(crate) fn new(
        task: TaskRef,
        signal: Arc<LoopSignal>,
        consumer: ConsumerRef,
        offsets: OffsetRef,
        container: Arc<ContainerMetrics>,
        timers: CancellationToken,
        config: &RunLoopConfig,
    ) -> Arc<Self> {
        let name = TaskName::from(task.name());
        let metrics = Arc::new(TaskMetrics::new());
        Arc::new(Self {
            state: TaskState::new(name.clone(), config.concurrency_limit(), metrics.clone()),
            callbacks: CallbackRegistry::new(),
            task,
            name,
            signal,
            consumer,
            offsets,
            container,
            metrics,
            timers,
            callback_deadline: config.callback_deadline(),
            offload: config.offload,
        })
    }

    pub(crate) fn name(&self) -> &TaskName {
        &self.name
    }

    pub(crate) fn partitions(&self) -> Vec<Partition> {
        self.task.partitions()
    }

    pub(crate) fn state(&self) -> &TaskState {
        &self.state
    }

    pub(crate) fn callbacks(&self) -> &CallbackRegistry {
        &self.callbacks
    }

    pub(crate) fn container_metrics(&self) -> &ContainerMetrics {
        &self.container
    }

    pub(crate) fn metrics(&self) -> &Arc<TaskMetrics> {
        &self.metrics
    }

    pub(crate) fn timer_token(&self) -> &CancellationToken {
        &self.timers
    }

    pub(crate) fn callback_deadline(&self) -> Option<Duration> {
        self.callback_deadline
    }

    /// Schedules the periodic window/commit ticks for this task.
    pub(crate) fn init(self: &Arc<Self>, config: &RunLoopConfig) {
        if self.task.windowable() {
            if let Some(every) = config.window_period() {
                self.spawn_tick(every, Tick::Window);
            }
        }
        if let Some(every) = config.commit_period() {
            self.spawn_tick(every, Tick::Commit);
        }
    }

    fn spawn_tick(self: &Arc<Self>, every: Duration, tick: Tick) {
        let worker = self.clone();
        let token = self.timers.clone();
        tokio::spawn(async move {
            let mut timer = time::interval_at(time::Instant::now() + every, every);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = timer.tick() => {
                        match tick {
                            Tick::Window => {
                                trace!(task = %worker.name, "need window");
                                worker.state.need_window();
                            }
                            Tick::Commit => {
                                trace!(task = %worker.name, "need commit");
                                worker.state.need_commit();
                            }
                        }
                        worker.signal.resume();
                    }
                }
            }
        });
    }

    /// Invokes the task's next operation, if any. Driver only.
    pub(crate) async fn run(self: &Arc<Self>) {
        match self.state.next_op(self.signal.requests()) {
            WorkerOp::Process => self.process().await,
            WorkerOp::Window => self.flush(Flush::Window).await,
            WorkerOp::Commit => self.flush(Flush::Commit).await,
            WorkerOp::NoOp => {}
        }
    }

    /// Dispatches the head pending envelope to the user task.
    ///
    /// Awaited on the driver: serial dispatch is what keeps callback
    /// sequence numbers aligned with dispatch order per task.
    async fn process(self: &Arc<Self>) {
        let Some(envelope) = self.state.fetch_envelope(self.consumer.as_ref()) else {
            return;
        };
        trace!(
            task = %self.name,
            partition = %envelope.partition,
            offset = envelope.offset,
            "process"
        );

        let coordinator = Arc::new(Coordinator::new(self.name.clone()));
        let callbacks = CallbackFactory::new(self.clone(), envelope.clone(), coordinator.clone());
        self.task.process(envelope, coordinator, callbacks).await;
    }

    /// Runs a window or commit body: inline on the driver, or spawned onto
    /// the runtime's worker pool when `offload` is set.
    async fn flush(self: &Arc<Self>, kind: Flush) {
        match kind {
            Flush::Window => self.state.start_window(),
            Flush::Commit => self.state.start_commit(),
        }

        let worker = self.clone();
        let body = async move { worker.flush_body(kind).await };
        if self.offload {
            tokio::spawn(body);
        } else {
            body.await;
        }
    }

    async fn flush_body(&self, kind: Flush) {
        let result = match kind {
            Flush::Window => {
                self.container.windows.inc();
                let coordinator = Arc::new(Coordinator::new(self.name.clone()));
                let started = Instant::now();
                let result = self.task.window(coordinator.clone()).await;
                self.container.window_ns.record(started.elapsed());
                if result.is_ok() {
                    self.signal.requests().update(&coordinator);
                }
                result.map_err(|source| LoopError::Window {
                    task: self.name.clone(),
                    source,
                })
            }
            Flush::Commit => {
                self.container.commits.inc();
                let started = Instant::now();
                let result = self.task.commit().await;
                self.container.commit_ns.record(started.elapsed());
                result.map_err(|source| LoopError::Commit {
                    task: self.name.clone(),
                    source,
                })
            }
        };

        self.state.done_window_or_commit();
        if let Err(err) = result {
            error!(task = %self.name, error = %err, "window/commit failed");
            self.signal.abort(err);
        }
        self.signal.resume();
    }

    /// Completion listener: success path.
    ///
    /// Retires the contiguous completed prefix and commits the high-water
    /// mark offset, keeping per-partition commits strictly increasing even
    /// when completions arrive out of order.
    pub(crate) fn on_complete(&self, callback: &Arc<Callback>) {
        self.state.done_process();
        self.container.process_ns.record(callback.created_at.elapsed());
        trace!(
            task = %self.name,
            partition = %callback.envelope.partition,
            seq = callback.seq,
            "callback complete"
        );

        if let Some(last) = self.callbacks.retire(
            callback.seq,
            callback.envelope.clone(),
            callback.coordinator.clone(),
        ) {
            trace!(
                partition = %last.envelope.partition,
                offset = last.envelope.offset,
                "update offset"
            );
            self.offsets
                .update(&self.name, &last.envelope.partition, last.envelope.offset);
            self.signal.requests().update(&last.coordinator);
        }
        self.signal.resume();
    }

    /// Completion listener: failure path. No offset advances; the failed
    /// envelope remains the replay position.
    pub(crate) fn on_failure(&self, callback: &Arc<Callback>, error: TaskError) {
        self.state.done_process();
        error!(
            task = %self.name,
            seq = callback.seq,
            error = %error,
            "callback failure"
        );
        self.signal.abort(LoopError::Task {
            task: self.name.clone(),
            source: error,
        });
        self.signal.resume();
    }

    pub(crate) fn note_duplicate_completion(&self) {
        self.metrics.duplicate_callbacks.inc();
        trace!(task = %self.name, "duplicate callback completion ignored");
    }
}
