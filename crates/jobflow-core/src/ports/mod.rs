//! Ports: interfaces to collaborators outside the engine.
//!
//! The engine never owns a durable queue, a clock or an id scheme; it talks
//! to them through these traits so backends can be swapped.

pub mod clock;
pub mod id_generator;
pub mod queue;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::queue::{JobLookup, JobRecord, Queue, QueueError, UnitLease, UnitOfWork, WorkSource};
