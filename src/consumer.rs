//! # Multiplexed consumer interface.
//!
//! The run loop reads from a single [`MultiplexedConsumer`] that merges all
//! assigned partitions into one stream of envelopes. The consumer is an
//! external collaborator; the run loop only relies on the contract below.
//!
//! ## Flow control contract
//! - [`choose`](MultiplexedConsumer::choose) is a non-blocking peek: it must
//!   return immediately and must **not** advance the partition's internal
//!   cursor.
//! - [`try_update`](MultiplexedConsumer::try_update) advances the cursor for
//!   one partition. The run loop calls it exactly once per envelope, when the
//!   first subscribing task fetches that envelope from its pending queue.
//!   Until then the consumer withholds further messages for the partition;
//!   this is how downstream backpressure reaches the consumer without
//!   blocking the driver.

use std::sync::Arc;
use std::time::Duration;

use crate::envelope::{Envelope, Partition};
use crate::error::LoopError;

/// Shared handle to a consumer implementation.
pub type ConsumerRef = Arc<dyn MultiplexedConsumer>;

/// Non-blocking multiplexed source of envelopes.
pub trait MultiplexedConsumer: Send + Sync + 'static {
    /// Returns the next envelope, or `None` when no partition has a message
    /// ready. Must not block and must not advance any partition cursor.
    ///
    /// An error aborts the run loop.
    fn choose(&self) -> Result<Option<Envelope>, LoopError>;

    /// Advances the partition's cursor, allowing the consumer to serve the
    /// next message for it. Idempotent per chosen envelope.
    fn try_update(&self, partition: &Partition);

    /// Bound on how long the driver parks when the consumer had nothing to
    /// offer. Keeps idle latency bounded without a busy loop.
    fn poll_interval(&self) -> Duration;
}
