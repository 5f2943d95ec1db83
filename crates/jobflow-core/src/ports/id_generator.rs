//! IdGenerator port: job id allocation.
//!
//! Ids are ULIDs so units of work enqueued by different processes never
//! collide and sort by creation time.

use ulid::Ulid;

use crate::domain::JobId;
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn generate_job_id(&self) -> JobId;
}

/// ULID generator whose timestamp part comes from a [`Clock`], so a
/// `FixedClock` yields ids with a deterministic prefix.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_job_id(&self) -> JobId {
        let timestamp_ms = u64::try_from(self.clock.now().timestamp_millis()).unwrap_or(0);
        JobId::from(Ulid::from_parts(timestamp_ms, rand::random()))
    }
}
