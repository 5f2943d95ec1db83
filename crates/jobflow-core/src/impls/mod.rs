//! Port implementations for development and tests.
//!
//! Durable backends live outside this crate and implement the same traits.

pub mod inmem_queue;

pub use self::inmem_queue::{InMemoryQueue, QueueCounts};
