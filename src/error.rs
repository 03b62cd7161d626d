//! # Error types used by the run loop and user tasks.
//!
//! This module defines two main error enums:
//!
//! - [`LoopError`] errors raised by the run loop itself (or recorded by it
//!   when a collaborator fails).
//! - [`TaskError`] errors raised by user task code: a failed process
//!   completion, a window/commit that returned an error, or a callback that
//!   missed its deadline.
//!
//! Both types provide an `as_label` helper for metrics.
//!
//! Every error is terminal for the run loop: the first one recorded via the
//! loop's sticky abort is the one surfaced from `RunLoop::run`.

use std::time::Duration;

use thiserror::Error;

use crate::envelope::{Partition, TaskName};

/// # Errors produced by a user task.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum TaskError {
    /// Task reported a failure for a dispatched envelope or a window/commit body.
    #[error("execution failed: {reason}")]
    Failed { reason: String },

    /// A process completion did not arrive within the configured deadline.
    #[error("callback timed out after {timeout:?}")]
    Timeout { timeout: Duration },
}

impl TaskError {
    /// Shorthand for [`TaskError::Failed`].
    pub fn failed(reason: impl Into<String>) -> Self {
        TaskError::Failed {
            reason: reason.into(),
        }
    }

    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            TaskError::Failed { .. } => "task_failed",
            TaskError::Timeout { .. } => "task_timeout",
        }
    }
}

/// # Errors that terminate the run loop.
///
/// Construction-time variants (`NoTasks`, `DuplicateTask`, `NoPartitions`)
/// are returned from `RunLoop::new`; everything else is recorded through the
/// sticky abort and surfaced when the loop exits.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum LoopError {
    /// A process completion failed (or timed out) for the given task.
    #[error("task '{task}' process failed: {source}")]
    Task {
        /// Task whose dispatch failed.
        task: TaskName,
        /// Underlying task error.
        source: TaskError,
    },

    /// A window body returned an error.
    #[error("task '{task}' window failed: {source}")]
    Window { task: TaskName, source: TaskError },

    /// A commit body returned an error.
    #[error("task '{task}' commit failed: {source}")]
    Commit { task: TaskName, source: TaskError },

    /// The multiplexed consumer failed while choosing an envelope.
    #[error("consumer failed: {reason}")]
    Consumer { reason: String },

    /// The consumer produced an envelope for a partition no task subscribes
    /// to. The assignment is immutable, so this is a contract violation.
    #[error("no task subscribes to partition '{partition}'")]
    UnroutablePartition { partition: Partition },

    /// The driver was cancelled while parked waiting for work.
    #[error("run loop interrupted while waiting")]
    Interrupted,

    /// Two tasks were registered under the same name.
    #[error("task '{name}' already registered")]
    DuplicateTask { name: TaskName },

    /// The run loop was constructed with no tasks.
    #[error("run loop requires at least one task")]
    NoTasks,

    /// A task advertised an empty partition set.
    #[error("task '{task}' subscribes to no partitions")]
    NoPartitions { task: TaskName },
}

impl LoopError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            LoopError::Task { .. } => "loop_task_failed",
            LoopError::Window { .. } => "loop_window_failed",
            LoopError::Commit { .. } => "loop_commit_failed",
            LoopError::Consumer { .. } => "loop_consumer_failed",
            LoopError::UnroutablePartition { .. } => "loop_unroutable_partition",
            LoopError::Interrupted => "loop_interrupted",
            LoopError::DuplicateTask { .. } => "loop_duplicate_task",
            LoopError::NoTasks => "loop_no_tasks",
            LoopError::NoPartitions { .. } => "loop_no_partitions",
        }
    }
}
