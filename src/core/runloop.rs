//! # RunLoop: the single-driver scheduling core.
//!
//! One async driver multiplexes envelopes from the consumer across all task
//! workers:
//!
//! ```text
//! loop {
//!   ├─► observe sticky fatal error (raise) / shutdown flag (exit)
//!   ├─► choose_envelope()        non-blocking peek, no cursor advance
//!   ├─► run_tasks(envelope)      fan out to subscriber queues,
//!   │                            then worker.run() in task-name order
//!   └─► block_if_busy(envelope)  park until something can make progress
//! }
//! ```
//!
//! ## Rules
//! - The driver is the only mutator of pending queues and the only caller
//!   of `choose`/`try_update`.
//! - It parks in exactly one place; every wake is a broadcast through the
//!   shared [`LoopSignal`].
//! - With no envelope chosen the park is bounded by the consumer's poll
//!   interval; with an envelope queued somewhere the park is unbounded,
//!   progress can only come from an external wake.
//! - Cancelling the run token while parked surfaces as
//!   [`LoopError::Interrupted`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

use crate::config::RunLoopConfig;
use crate::consumer::ConsumerRef;
use crate::core::signal::LoopSignal;
use crate::core::state::PendingEnvelope;
use crate::core::worker::TaskWorker;
use crate::envelope::{Envelope, Partition, TaskName};
use crate::error::LoopError;
use crate::metrics::{ContainerMetrics, TaskMetrics};
use crate::offsets::OffsetRef;
use crate::tasks::TaskRef;

/// Cheap handle for stopping a running loop from outside.
#[derive(Clone)]
pub struct RunLoopHandle {
    signal: Arc<LoopSignal>,
}

impl RunLoopHandle {
    /// Requests a graceful stop: the loop exits once the current tick's
    /// operations complete.
    pub fn shutdown(&self) {
        self.signal.request_shutdown();
    }
}

/// Per-container run loop over a fixed set of tasks and partitions.
///
/// The assignment (task set and each task's partitions) is immutable for the
/// loop's lifetime; construction validates it and [`RunLoop::run`] drives it
/// to completion.
pub struct RunLoop {
    workers: BTreeMap<TaskName, Arc<TaskWorker>>,
    by_partition: HashMap<Partition, Vec<Arc<TaskWorker>>>,
    consumer: ConsumerRef,
    signal: Arc<LoopSignal>,
    metrics: Arc<ContainerMetrics>,
    config: RunLoopConfig,
    timers: CancellationToken,
}

impl RunLoop {
    /// Builds a run loop over `tasks`.
    ///
    /// ### Errors
    /// - [`LoopError::NoTasks`] for an empty task set
    /// - [`LoopError::DuplicateTask`] when two tasks share a name
    /// - [`LoopError::NoPartitions`] when a task subscribes to nothing
    pub fn new(
        tasks: Vec<TaskRef>,
        consumer: ConsumerRef,
        offsets: OffsetRef,
        metrics: Arc<ContainerMetrics>,
        config: RunLoopConfig,
    ) -> Result<Self, LoopError> {
        if tasks.is_empty() {
            return Err(LoopError::NoTasks);
        }

        let signal = Arc::new(LoopSignal::new());
        let timers = CancellationToken::new();

        let mut workers: BTreeMap<TaskName, Arc<TaskWorker>> = BTreeMap::new();
        for task in tasks {
            let worker = TaskWorker::new(
                task,
                signal.clone(),
                consumer.clone(),
                offsets.clone(),
                metrics.clone(),
                timers.clone(),
                &config,
            );
            let name = worker.name().clone();
            if worker.partitions().is_empty() {
                return Err(LoopError::NoPartitions { task: name });
            }
            if workers.insert(name.clone(), worker).is_some() {
                return Err(LoopError::DuplicateTask { name });
            }
        }

        // Broadcast lists inherit the name order of the worker map, so the
        // first fetch of a shared envelope is deterministic.
        let mut by_partition: HashMap<Partition, Vec<Arc<TaskWorker>>> = HashMap::new();
        for worker in workers.values() {
            for partition in worker.partitions() {
                by_partition.entry(partition).or_default().push(worker.clone());
            }
        }

        Ok(Self {
            workers,
            by_partition,
            consumer,
            signal,
            metrics,
            config,
            timers,
        })
    }

    /// Returns a handle for stopping the loop.
    pub fn handle(&self) -> RunLoopHandle {
        RunLoopHandle {
            signal: self.signal.clone(),
        }
    }

    /// Returns the metrics of one task, if registered.
    pub fn task_metrics(&self, name: &TaskName) -> Option<Arc<TaskMetrics>> {
        self.workers.get(name).map(|w| w.metrics().clone())
    }

    /// Drives the loop until shutdown, a fatal error, or cancellation of
    /// `token` while parked.
    pub async fn run(self, token: CancellationToken) -> Result<(), LoopError> {
        for worker in self.workers.values() {
            worker.init(&self.config);
        }

        let result = self.tick_loop(&token).await;

        // Teardown: stop periodic ticks and outstanding callback watchdogs.
        self.timers.cancel();
        result
    }

    async fn tick_loop(&self, token: &CancellationToken) -> Result<(), LoopError> {
        let mut prev = Instant::now();

        while !self.signal.shutdown_requested() {
            if let Some(err) = self.signal.take_fatal() {
                error!(error = %err, "stopping run loop");
                return Err(err);
            }

            let tick_start = Instant::now();
            let envelope = self.choose_envelope()?;
            let chosen_at = Instant::now();
            self.metrics.choose_ns.record(chosen_at - tick_start);

            let had_envelope = envelope.is_some();
            self.run_tasks(envelope).await?;

            let worked_until = Instant::now();
            self.block_if_busy(had_envelope, token).await?;

            let now = Instant::now();
            self.metrics.block_ns.record(now - worked_until);
            let total = now - prev;
            if !total.is_zero() {
                let active = worked_until - chosen_at;
                self.metrics
                    .utilization
                    .set(active.as_secs_f64() / total.as_secs_f64());
            }
            prev = now;
        }
        Ok(())
    }

    /// Non-blocking peek at the consumer. The partition cursor is advanced
    /// only later, when a task first fetches the envelope from its queue.
    /// That is the flow-control seam that keeps a slow task from being fed.
    fn choose_envelope(&self) -> Result<Option<Envelope>, LoopError> {
        let envelope = self.consumer.choose()?;
        match &envelope {
            Some(env) => {
                trace!(partition = %env.partition, offset = env.offset, "chose envelope");
                self.metrics.envelopes.inc();
            }
            None => {
                trace!("no envelope available");
                self.metrics.null_envelopes.inc();
            }
        }
        Ok(envelope)
    }

    /// Fans the envelope out to every subscribing task, then gives every
    /// worker one chance to start its next operation.
    async fn run_tasks(&self, envelope: Option<Envelope>) -> Result<(), LoopError> {
        if let Some(envelope) = envelope {
            let subscribers = self.by_partition.get(&envelope.partition).ok_or_else(|| {
                LoopError::UnroutablePartition {
                    partition: envelope.partition.clone(),
                }
            })?;
            let pending = PendingEnvelope::new(envelope);
            for worker in subscribers {
                worker.state().insert_envelope(pending.clone());
            }
        }

        for worker in self.workers.values() {
            worker.run().await;
        }
        Ok(())
    }

    /// Parks the driver until there is reason to re-evaluate.
    ///
    /// The waiter is registered before readiness is re-checked, so a resume
    /// arriving in between is not lost.
    async fn block_if_busy(
        &self,
        had_envelope: bool,
        token: &CancellationToken,
    ) -> Result<(), LoopError> {
        loop {
            let notified = self.signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.signal.should_exit() {
                return Ok(());
            }
            if self.any_runnable(had_envelope) {
                return Ok(());
            }

            trace!("block loop driver");
            if had_envelope {
                // Some task holds the envelope; only an external wake can
                // create progress.
                tokio::select! {
                    _ = &mut notified => {}
                    _ = token.cancelled() => return Err(LoopError::Interrupted),
                }
            } else {
                // Empty consumer: bound the wait by the poll interval so the
                // next choose() happens soon, without a busy loop.
                tokio::select! {
                    _ = time::timeout(self.consumer.poll_interval(), &mut notified) => {}
                    _ = token.cancelled() => return Err(LoopError::Interrupted),
                }
                return Ok(());
            }
        }
    }

    fn any_runnable(&self, had_envelope: bool) -> bool {
        self.workers.values().any(|worker| {
            worker.state().is_ready(self.signal.requests())
                && (had_envelope || worker.state().has_pending_ops())
        })
    }
}

impl Drop for RunLoop {
    fn drop(&mut self) {
        self.timers.cancel();
    }
}
