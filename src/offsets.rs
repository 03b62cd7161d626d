//! # Offset manager interface.
//!
//! Progress checkpointing is delegated to an external [`OffsetManager`]. The
//! run loop guarantees that for a given (task, partition) the offsets passed
//! to [`update`](OffsetManager::update) are strictly increasing: completions
//! may arrive out of order, but the reorder buffer only releases the
//! contiguous prefix and commits its high-water mark.

use std::sync::Arc;

use crate::envelope::{Offset, Partition, TaskName};

/// Shared handle to an offset manager implementation.
pub type OffsetRef = Arc<dyn OffsetManager>;

/// Records processed offsets per task and partition.
pub trait OffsetManager: Send + Sync + 'static {
    /// Records `offset` as processed by `task` on `partition`.
    ///
    /// Idempotent for equal offsets; calls for a given (task, partition) are
    /// monotonic.
    fn update(&self, task: &TaskName, partition: &Partition, offset: Offset);
}
