//! # Stream task abstraction.
//!
//! Defines the core [`StreamTask`] trait for user-supplied processors bound
//! to one or more partitions.
//!
//! - **[`StreamTask`]** — async processor with per-envelope completion
//!   callbacks and optional window/commit hooks
//! - **[`TaskRef`]** — shared handle (`Arc<dyn StreamTask>`) for passing
//!   tasks across the runtime
//!
//! ## Completion contract
//! `process` is handed a [`CallbackFactory`]. The task must obtain a callback
//! from it and complete it **exactly once** per dispatched envelope, from
//! any thread, at any time after dispatch. Completions may arrive out of
//! order across envelopes; the run loop reorders them before committing
//! offsets. A missing completion is policed by the configured callback
//! timeout; a duplicate completion is ignored.
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use taskmux::{CallbackFactory, Coordinator, Envelope, Partition, StreamTask};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl StreamTask for Echo {
//!     fn name(&self) -> &str {
//!         "echo"
//!     }
//!
//!     fn partitions(&self) -> Vec<Partition> {
//!         vec![Partition::new("input", 0)]
//!     }
//!
//!     async fn process(
//!         &self,
//!         envelope: Envelope,
//!         _coordinator: Arc<Coordinator>,
//!         callbacks: CallbackFactory,
//!     ) {
//!         let callback = callbacks.create();
//!         println!("{} @ {}", envelope.partition, envelope.offset);
//!         callback.complete();
//!     }
//! }
//! ```

use std::sync::Arc;

use async_trait::async_trait;

use crate::coordinator::Coordinator;
use crate::core::CallbackFactory;
use crate::envelope::{Envelope, Partition};
use crate::error::TaskError;

/// Shared handle to a task object.
pub type TaskRef = Arc<dyn StreamTask>;

/// Asynchronous, partition-bound unit of stream processing.
///
/// ## Rules
/// - `name` must be unique within one run loop and stable for its lifetime.
/// - `partitions` is read once at construction; the assignment is immutable.
/// - `process` receives at most `max_concurrency` concurrent dispatches and
///   is never invoked while a window or commit for the same task is in
///   flight.
/// - `window` is only scheduled when [`windowable`](StreamTask::windowable)
///   returns `true` and a window interval is configured.
#[async_trait]
pub trait StreamTask: Send + Sync + 'static {
    /// Returns the stable task name.
    fn name(&self) -> &str;

    /// Partitions this task subscribes to.
    ///
    /// A partition listed by several tasks is a broadcast partition: every
    /// subscriber sees every envelope.
    fn partitions(&self) -> Vec<Partition>;

    /// Whether the task implements windowing.
    fn windowable(&self) -> bool {
        false
    }

    /// Processes one envelope.
    ///
    /// Must produce exactly one completion through a callback obtained from
    /// `callbacks`. Returning from this method does not signal completion;
    /// only the callback does.
    ///
    /// Dispatch is awaited on the driver, so this method must return
    /// promptly: hand long-running work to a spawned task (or another
    /// thread) and complete the callback when it finishes.
    async fn process(
        &self,
        envelope: Envelope,
        coordinator: Arc<Coordinator>,
        callbacks: CallbackFactory,
    );

    /// Periodic aggregation hook.
    async fn window(&self, coordinator: Arc<Coordinator>) -> Result<(), TaskError> {
        let _ = coordinator;
        Ok(())
    }

    /// Periodic checkpoint hook for user state.
    async fn commit(&self) -> Result<(), TaskError> {
        Ok(())
    }
}
