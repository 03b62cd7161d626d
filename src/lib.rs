//! # taskmux
//!
//! **Taskmux** is the scheduling core of a stream-processing worker: a
//! single-driver run loop that multiplexes messages from many input
//! partitions across a fixed set of user-defined asynchronous tasks.
//!
//! It honors per-task concurrency limits, periodic windowing and commits,
//! message-level flow control toward the consumer, and prompt failure
//! propagation, and commits offsets in dispatch order even when
//! completions arrive out of order.
//!
//! ## Features
//!
//! | Area               | Description                                                          | Key types / traits                            |
//! |--------------------|----------------------------------------------------------------------|-----------------------------------------------|
//! | **Run loop**       | Single-driver dispatch, park/wake, graceful shutdown.                | [`RunLoop`], [`RunLoopHandle`]                |
//! | **Tasks**          | User processors bound to partitions, with window/commit hooks.       | [`StreamTask`], [`TaskRef`]                   |
//! | **Completions**    | Single-shot callbacks, out-of-order retirement, offset high-water.   | [`Callback`], [`CallbackFactory`]             |
//! | **Coordination**   | Per-dispatch commit/shutdown requests from task code.                | [`Coordinator`]                               |
//! | **Collaborators**  | Consumer and offset-store seams the loop is driven against.          | [`MultiplexedConsumer`], [`OffsetManager`]    |
//! | **Metrics**        | Atomic counters/histograms readable by embedders and tests.          | [`ContainerMetrics`], [`TaskMetrics`]         |
//! | **Errors**         | Typed runtime and task errors with stable labels.                    | [`LoopError`], [`TaskError`]                  |
//! | **Configuration**  | Concurrency cap, window/commit periods, callback deadline.           | [`RunLoopConfig`]                             |
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use async_trait::async_trait;
//! use tokio_util::sync::CancellationToken;
//! use taskmux::{
//!     CallbackFactory, ContainerMetrics, Coordinator, Envelope, LoopError,
//!     MultiplexedConsumer, OffsetManager, Offset, Partition, RunLoop,
//!     RunLoopConfig, StreamTask, TaskName, TaskRef,
//! };
//!
//! struct Counter;
//!
//! #[async_trait]
//! impl StreamTask for Counter {
//!     fn name(&self) -> &str {
//!         "counter"
//!     }
//!
//!     fn partitions(&self) -> Vec<Partition> {
//!         vec![Partition::new("events", 0)]
//!     }
//!
//!     async fn process(
//!         &self,
//!         envelope: Envelope,
//!         _coordinator: Arc<Coordinator>,
//!         callbacks: CallbackFactory,
//!     ) {
//!         let callback = callbacks.create();
//!         // ... hand envelope to application code ...
//!         callback.complete();
//!     }
//! }
//!
//! # struct MyConsumer;
//! # impl MultiplexedConsumer for MyConsumer {
//! #     fn choose(&self) -> Result<Option<Envelope>, LoopError> { Ok(None) }
//! #     fn try_update(&self, _p: &Partition) {}
//! #     fn poll_interval(&self) -> Duration { Duration::from_millis(10) }
//! # }
//! # struct MyOffsets;
//! # impl OffsetManager for MyOffsets {
//! #     fn update(&self, _t: &TaskName, _p: &Partition, _o: Offset) {}
//! # }
//! #[tokio::main]
//! async fn main() -> Result<(), LoopError> {
//!     let tasks: Vec<TaskRef> = vec![Arc::new(Counter)];
//!     let run_loop = RunLoop::new(
//!         tasks,
//!         Arc::new(MyConsumer),
//!         Arc::new(MyOffsets),
//!         Arc::new(ContainerMetrics::new()),
//!         RunLoopConfig {
//!             max_concurrency: 4,
//!             commit_interval: Duration::from_secs(30),
//!             ..RunLoopConfig::default()
//!         },
//!     )?;
//!
//!     let handle = run_loop.handle();
//!     // handle.shutdown() stops the loop from anywhere.
//!     # drop(handle);
//!     run_loop.run(CancellationToken::new()).await
//! }
//! ```
//!
//! ---

mod config;
mod consumer;
mod coordinator;
mod core;
mod envelope;
mod error;
mod metrics;
mod offsets;
mod tasks;

// ---- Public re-exports ----

pub use config::RunLoopConfig;
pub use consumer::{ConsumerRef, MultiplexedConsumer};
pub use coordinator::Coordinator;
pub use core::{Callback, CallbackFactory, RunLoop, RunLoopHandle};
pub use envelope::{Envelope, Offset, Partition, TaskName};
pub use error::{LoopError, TaskError};
pub use metrics::{ContainerMetrics, Counter, Gauge, Histogram, Ratio, TaskMetrics};
pub use offsets::{OffsetManager, OffsetRef};
pub use tasks::{StreamTask, TaskRef};
