//! Runtime core: the driver, task workers, and completion plumbing.
//!
//! The public API re-exported from here is [`RunLoop`], [`RunLoopHandle`],
//! and the completion pair [`Callback`] / [`CallbackFactory`]. Everything
//! else is an internal building block the run loop wires together.
//!
//! ## Files & responsibilities
//! - **runloop.rs**: the single async driver; chooses an envelope, fans it
//!   out to subscriber queues, runs every worker once, parks when nothing
//!   can make progress.
//! - **worker.rs**: per-task dispatch of process / window / commit plus the
//!   completion listeners (offset high-water commit on success, sticky abort
//!   on failure).
//! - **state.rs**: per-task scheduling state — need flags, in-flight
//!   counter, pending queue — and the `next_op` decision.
//! - **callback.rs**: single-shot completion handles, the per-dispatch
//!   watchdog, and the reorder buffer that retires completions in dispatch
//!   order.
//! - **signal.rs**: the shared wake/abort/shutdown surface workers use to
//!   reach the parked driver.
//!
//! ## Wiring (module-level flow)
//! ```text
//! consumer.choose() ──► RunLoop.run_tasks
//!                          │  (fan out per partition; broadcast shares one
//!                          │   PendingEnvelope across subscriber queues)
//!                          ▼
//!                    TaskWorker.run ──► TaskState.next_op
//!                          │               commit > window > process
//!                          ├─ process: fetch head (first fetch advances the
//!                          │   consumer cursor), await user dispatch
//!                          ├─ window/commit: body inline or offloaded
//!                          └─ no-op
//!
//! user task ──► Callback.complete / fail   (any thread, any time)
//!                  │
//!                  ▼
//!            TaskWorker.on_complete ──► CallbackRegistry.retire
//!                  │                        └─ contiguous prefix → commit
//!                  │                           high-water offset
//!                  └──► LoopSignal.resume ──► driver re-evaluates
//! ```
//!
//! ## Shutdown timeline
//! ```text
//! RunLoopHandle::shutdown() → driver exits after the current tick
//! coordinator shutdown      → honored once owed commit requests drain
//! fatal error (abort)       → raised from the driver on its next tick
//! teardown                  → periodic ticks and watchdogs cancelled
//! ```

mod callback;
mod runloop;
mod signal;
mod state;
mod worker;

pub use callback::{Callback, CallbackFactory};
pub use runloop::{RunLoop, RunLoopHandle};
