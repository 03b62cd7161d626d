//! User-facing task abstraction:
//!  - [`StreamTask`] the trait user processors implement;
//!  - [`TaskRef`] shared handle used across the runtime.

mod task;

pub use task::{StreamTask, TaskRef};
