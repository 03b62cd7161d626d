//! # Message identity types: tasks, partitions, envelopes.
//!
//! A [`Partition`] is an independent ordered stream of messages. An
//! [`Envelope`] is one inbound message from a partition, identified by its
//! monotonically increasing [`Offset`]. A [`TaskName`] is the stable
//! identifier of one user task bound to one or more partitions.
//!
//! ## Rules
//! - Offsets are per-partition and strictly increasing.
//! - `TaskName` is `Ord` so the run loop can iterate workers in a stable
//!   name order.

use std::fmt;

use bytes::Bytes;

/// Offset of an envelope within its partition.
pub type Offset = u64;

/// Stable identifier of a user task.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskName(String);

impl TaskName {
    /// Creates a task name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// Identity of one ordered input stream.
///
/// A partition is addressed by the stream it belongs to plus a numeric
/// partition id, e.g. `orders-3`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    /// Name of the owning stream.
    pub stream: String,
    /// Partition id within the stream.
    pub id: u32,
}

impl Partition {
    /// Creates a partition identity.
    pub fn new(stream: impl Into<String>, id: u32) -> Self {
        Self {
            stream: stream.into(),
            id,
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.stream, self.id)
    }
}

/// One inbound message chosen from the multiplexed consumer.
///
/// The payload is opaque to the run loop; cloning is cheap ([`Bytes`] is
/// reference counted), which matters because a broadcast partition hands the
/// same envelope to every subscribing task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// Partition this envelope was read from.
    pub partition: Partition,
    /// Offset within the partition.
    pub offset: Offset,
    /// Optional message key.
    pub key: Option<Bytes>,
    /// Message payload.
    pub payload: Bytes,
}

impl Envelope {
    /// Creates an envelope without a key.
    pub fn new(partition: Partition, offset: Offset, payload: impl Into<Bytes>) -> Self {
        Self {
            partition,
            offset,
            key: None,
            payload: payload.into(),
        }
    }

    /// Attaches a message key.
    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }
}
