//! # Run loop configuration.
//!
//! Provides [`RunLoopConfig`], the centralized settings for one run loop
//! instance.
//!
//! ## Sentinel values
//! - `window_interval = 0s` → periodic windowing disabled
//! - `commit_interval = 0s` → periodic commits disabled (coordinator-requested
//!   commits still fire)
//! - `callback_timeout = 0s` → no per-callback deadline
//!
//! `max_concurrency` has no disabled state; it is clamped to a minimum of 1
//! by [`RunLoopConfig::concurrency_limit`].

use std::time::Duration;

/// Configuration for the run loop and its task workers.
///
/// ## Field semantics
/// - `max_concurrency`: per-task cap on in-flight process dispatches
/// - `window_interval`: period between `need window` ticks (`0s` = disabled)
/// - `commit_interval`: period between `need commit` ticks (`0s` = disabled)
/// - `callback_timeout`: deadline for each process completion (`0s` = none)
/// - `offload`: run window/commit bodies on the runtime's worker pool instead
///   of inline on the driver
///
/// ## Notes
/// All fields are public for flexibility. Prefer the helper accessors to
/// avoid sprinkling sentinel checks (`0`) across the codebase.
#[derive(Clone, Debug)]
pub struct RunLoopConfig {
    /// Maximum number of in-flight process dispatches per task.
    ///
    /// A task with this many uncompleted callbacks is not ready for further
    /// process dispatch until one completes.
    pub max_concurrency: usize,

    /// Period between window ticks for windowable tasks.
    ///
    /// Each tick sets the task's `need window` flag; rapid ticks coalesce
    /// into at most one pending window.
    pub window_interval: Duration,

    /// Period between commit ticks.
    ///
    /// Each tick sets the task's `need commit` flag; rapid ticks coalesce
    /// into at most one pending commit.
    pub commit_interval: Duration,

    /// Deadline for each process completion.
    ///
    /// A callback that is still pending when the deadline expires fails the
    /// dispatch with [`TaskError::Timeout`](crate::TaskError::Timeout) and
    /// aborts the loop.
    pub callback_timeout: Duration,

    /// Whether window/commit bodies run on the runtime's worker pool.
    ///
    /// When `false` they run inline on the driver, serialized with envelope
    /// dispatch (the single-threaded mode).
    pub offload: bool,
}

impl RunLoopConfig {
    /// Returns the per-task concurrency cap, clamped to a minimum of 1.
    #[inline]
    pub fn concurrency_limit(&self) -> usize {
        self.max_concurrency.max(1)
    }

    /// Returns the window period, or `None` when windowing is disabled.
    #[inline]
    pub fn window_period(&self) -> Option<Duration> {
        if self.window_interval == Duration::ZERO {
            None
        } else {
            Some(self.window_interval)
        }
    }

    /// Returns the commit period, or `None` when periodic commit is disabled.
    #[inline]
    pub fn commit_period(&self) -> Option<Duration> {
        if self.commit_interval == Duration::ZERO {
            None
        } else {
            Some(self.commit_interval)
        }
    }

    /// Returns the per-callback deadline, or `None` when disabled.
    #[inline]
    pub fn callback_deadline(&self) -> Option<Duration> {
        if self.callback_timeout == Duration::ZERO {
            None
        } else {
            Some(self.callback_timeout)
        }
    }
}

impl Default for RunLoopConfig {
    /// Default configuration:
    ///
    /// - `max_concurrency = 1` (strict per-task ordering of dispatches)
    /// - `window_interval = 0s` (disabled)
    /// - `commit_interval = 0s` (disabled)
    /// - `callback_timeout = 0s` (no deadline)
    /// - `offload = false` (window/commit inline on the driver)
    fn default() -> Self {
        Self {
            max_concurrency: 1,
            window_interval: Duration::ZERO,
            commit_interval: Duration::ZERO,
            callback_timeout: Duration::ZERO,
            offload: false,
        }
    }
}
