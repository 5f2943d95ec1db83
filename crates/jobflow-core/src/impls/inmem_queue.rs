//! In-memory queue: development and test backend for every queue port.
//!
//! Keeps job records, a ready queue, a delay heap for rescheduled units and
//! a permit table keyed by semaphore key. Units carrying a semaphore are only
//! leased once a permit for them is granted; the permit is returned when the
//! lease is reported. Permits expire after their ttl so a crashed holder
//! cannot block a key forever.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::domain::{ContextSnapshot, JobId, JobState, Semaphore};
use crate::ports::{
    Clock, IdGenerator, JobLookup, JobRecord, Queue, QueueError, SystemClock, UlidGenerator,
    UnitLease, UnitOfWork, WorkSource,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub scheduled: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Min-heap entry: earliest `run_at` first.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledUnit {
    run_at: Instant,
    job_id: JobId,
}

impl PartialOrd for ScheduledUnit {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledUnit {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .run_at
            .cmp(&self.run_at)
            .then_with(|| other.job_id.cmp(&self.job_id))
    }
}

#[derive(Debug, Clone)]
struct Permit {
    holder: JobId,
    expires_at: Instant,
}

struct JobEntry {
    record: JobRecord,
    unit: UnitOfWork,
    scheduled: bool,
    /// Bumped by every `reschedule_current`; a lease remembers the value it
    /// was taken at.
    generation: u64,
}

struct QueueState {
    jobs: HashMap<JobId, JobEntry>,
    ready: VecDeque<JobId>,
    scheduled: BinaryHeap<ScheduledUnit>,
    permits: HashMap<String, Vec<Permit>>,
    closed: bool,
}

impl QueueState {
    fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            ready: VecDeque::new(),
            scheduled: BinaryHeap::new(),
            permits: HashMap::new(),
            closed: false,
        }
    }

    fn expire_permits(&mut self, now: Instant) {
        self.permits.retain(|key, held| {
            let before = held.len();
            held.retain(|p| p.expires_at > now);
            if held.len() < before {
                tracing::warn!(key = %key, expired = before - held.len(), "expired leaked permits");
            }
            !held.is_empty()
        });
    }

    fn acquire(&mut self, semaphore: &Semaphore, holder: JobId, now: Instant) -> bool {
        let Some(limit) = semaphore.concurrency_limit else {
            return true;
        };
        self.expire_permits(now);
        let expires_at = now + semaphore.concurrency_duration;
        let held = self
            .permits
            .entry(semaphore.concurrency_key.clone())
            .or_default();
        if let Some(existing) = held.iter_mut().find(|p| p.holder == holder) {
            existing.expires_at = expires_at;
            return true;
        }
        if held.len() >= limit as usize {
            return false;
        }
        held.push(Permit { holder, expires_at });
        true
    }

    fn release(&mut self, semaphore: &Semaphore, holder: JobId) -> bool {
        let Some(held) = self.permits.get_mut(&semaphore.concurrency_key) else {
            return false;
        };
        let before = held.len();
        held.retain(|p| p.holder != holder);
        let released = held.len() < before;
        if held.is_empty() {
            self.permits.remove(&semaphore.concurrency_key);
        }
        released
    }

    fn promote_scheduled(&mut self, now: Instant) {
        while let Some(entry) = self.scheduled.peek() {
            if entry.run_at > now {
                break;
            }
            let Some(entry) = self.scheduled.pop() else {
                break;
            };
            if let Some(job) = self.jobs.get_mut(&entry.job_id)
                && job.scheduled
            {
                job.scheduled = false;
                self.ready.push_back(entry.job_id);
            }
        }
    }

    /// First ready unit whose semaphore admits it, in FIFO order.
    fn take_admissible(&mut self, now: Instant) -> Option<(JobId, UnitOfWork, u64)> {
        let position = (0..self.ready.len()).find(|&i| {
            let job_id = self.ready[i];
            match self.jobs.get(&job_id).and_then(|j| j.unit.concurrency.clone()) {
                Some(semaphore) => self.acquire(&semaphore, job_id, now),
                None => true,
            }
        })?;
        let job_id = self.ready.remove(position)?;
        let job = self.jobs.get_mut(&job_id)?;
        job.record.status = JobState::Running;
        Some((job_id, job.unit.clone(), job.generation))
    }

    fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for job in self.jobs.values() {
            match job.record.status {
                JobState::Pending if job.scheduled => counts.scheduled += 1,
                JobState::Pending => counts.pending += 1,
                JobState::Running => counts.running += 1,
                JobState::Succeeded => counts.succeeded += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        counts
    }
}

pub struct InMemoryQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    ids: Box<dyn IdGenerator>,
    clock: Box<dyn Clock>,
    admission_poll: Duration,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::with_parts(
            Box::new(UlidGenerator::new(SystemClock)),
            Box::new(SystemClock),
            Duration::from_millis(50),
        )
    }

    /// `admission_poll` bounds how long a lease waits before re-checking
    /// throttled units and expired permits.
    pub fn with_parts(
        ids: Box<dyn IdGenerator>,
        clock: Box<dyn Clock>,
        admission_poll: Duration,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::new())),
            notify: Arc::new(Notify::new()),
            ids,
            clock,
            admission_poll,
        }
    }

    /// Submit a top-level unit of work.
    pub async fn enqueue(&self, unit: UnitOfWork) -> Result<JobId, QueueError> {
        let mut ids = self.insert_units(vec![unit]).await?;
        ids.pop()
            .ok_or_else(|| QueueError::Backend("enqueue produced no id".to_string()))
    }

    async fn insert_units(&self, units: Vec<UnitOfWork>) -> Result<Vec<JobId>, QueueError> {
        let count = units.len();
        let ids = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(QueueError::Closed);
            }
            let mut ids = Vec::with_capacity(count);
            for mut unit in units {
                let job_id = self.ids.generate_job_id();
                unit.job_id = Some(job_id);
                let record = JobRecord {
                    job_id,
                    workflow: unit.workflow.clone(),
                    status: JobState::Pending,
                    context: unit.context.clone(),
                    enqueued_at: self.clock.now(),
                    last_error: None,
                };
                state.jobs.insert(
                    job_id,
                    JobEntry {
                        record,
                        unit,
                        scheduled: false,
                        generation: 0,
                    },
                );
                state.ready.push_back(job_id);
                ids.push(job_id);
            }
            ids
        };
        for _ in 0..count {
            self.notify.notify_one();
        }
        Ok(ids)
    }

    pub async fn status(&self, job_id: JobId) -> Option<JobState> {
        let state = self.state.lock().await;
        state.jobs.get(&job_id).map(|j| j.record.status)
    }

    pub async fn counts(&self) -> QueueCounts {
        self.state.lock().await.counts()
    }

    /// Permits currently held under `key`.
    pub async fn permits_held(&self, key: &str) -> usize {
        let mut state = self.state.lock().await;
        state.expire_permits(Instant::now());
        state.permits.get(key).map_or(0, Vec::len)
    }

    /// Stop handing out leases; waiting `lease` calls return `None`.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    async fn acquire_permit(
        &self,
        semaphore: &Semaphore,
        holder: JobId,
    ) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        Ok(state.acquire(semaphore, holder, Instant::now()))
    }

    async fn release_permit(
        &self,
        semaphore: &Semaphore,
        holder: JobId,
    ) -> Result<bool, QueueError> {
        let released = self.state.lock().await.release(semaphore, holder);
        if released {
            self.notify.notify_one();
        }
        Ok(released)
    }

    async fn dispatch_batch(&self, units: Vec<UnitOfWork>) -> Result<Vec<JobId>, QueueError> {
        self.insert_units(units).await
    }

    async fn poll_statuses(&self, ids: &[JobId]) -> Result<HashMap<JobId, JobState>, QueueError> {
        let state = self.state.lock().await;
        ids.iter()
            .map(|id| {
                state
                    .jobs
                    .get(id)
                    .map(|j| (*id, j.record.status))
                    .ok_or(QueueError::UnknownJob(*id))
            })
            .collect()
    }

    async fn fetch_completed_context(&self, id: JobId) -> Result<ContextSnapshot, QueueError> {
        let state = self.state.lock().await;
        let job = state.jobs.get(&id).ok_or(QueueError::UnknownJob(id))?;
        if job.record.status != JobState::Succeeded {
            return Err(QueueError::NotCompleted(id));
        }
        Ok(job.record.context.clone())
    }

    async fn reschedule_current(
        &self,
        unit: UnitOfWork,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let job_id = unit
            .job_id
            .ok_or_else(|| QueueError::Backend("cannot reschedule a unit without id".to_string()))?;
        {
            let mut state = self.state.lock().await;
            let job = state.jobs.get_mut(&job_id).ok_or(QueueError::UnknownJob(job_id))?;
            job.record.context = unit.context.clone();
            job.record.status = JobState::Pending;
            job.unit.context = unit.context;
            job.scheduled = true;
            job.generation += 1;
            state.scheduled.push(ScheduledUnit {
                run_at: Instant::now() + delay,
                job_id,
            });
        }
        self.notify.notify_one();
        Ok(())
    }
}

#[async_trait]
impl WorkSource for InMemoryQueue {
    async fn lease(&self) -> Option<Box<dyn UnitLease>> {
        loop {
            let next_wake = {
                let mut state = self.state.lock().await;
                if state.closed {
                    return None;
                }
                let now = Instant::now();
                state.promote_scheduled(now);

                if let Some((job_id, unit, generation)) = state.take_admissible(now) {
                    return Some(Box::new(InMemoryLease {
                        job_id,
                        unit,
                        generation,
                        state: Arc::clone(&self.state),
                        notify: Arc::clone(&self.notify),
                    }));
                }

                let poll_at = now + self.admission_poll;
                state
                    .scheduled
                    .peek()
                    .map_or(poll_at, |entry| entry.run_at.min(poll_at))
            };

            tokio::select! {
                _ = self.notify.notified() => {},
                _ = tokio::time::sleep_until(next_wake) => {},
            }
        }
    }
}

#[async_trait]
impl JobLookup for InMemoryQueue {
    async fn find_job(&self, id: JobId) -> Result<Option<JobRecord>, QueueError> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(&id).map(|j| j.record.clone()))
    }
}

struct InMemoryLease {
    job_id: JobId,
    unit: UnitOfWork,
    generation: u64,
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
}

impl InMemoryLease {
    /// Apply the final report and give back the admission permit.
    async fn finish(
        &self,
        update: impl FnOnce(&mut JobEntry) -> Result<(), QueueError>,
    ) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock().await;
            let job = state
                .jobs
                .get_mut(&self.job_id)
                .ok_or(QueueError::UnknownJob(self.job_id))?;
            update(job)?;
            // a newer lease of the same unit owns the permit now
            let superseded =
                job.generation > self.generation && job.record.status == JobState::Running;
            if !superseded && let Some(semaphore) = &self.unit.concurrency {
                state.release(semaphore, self.job_id);
            }
        }
        self.notify.notify_one();
        Ok(())
    }
}

#[async_trait]
impl UnitLease for InMemoryLease {
    fn job_id(&self) -> JobId {
        self.job_id
    }

    fn unit(&self) -> &UnitOfWork {
        &self.unit
    }

    async fn ack(self: Box<Self>, context: ContextSnapshot) -> Result<(), QueueError> {
        self.finish(|job| {
            job.record.status = JobState::Succeeded;
            job.record.context = context;
            Ok(())
        })
        .await
    }

    async fn fail(self: Box<Self>, context: ContextSnapshot, error: String) -> Result<(), QueueError> {
        self.finish(|job| {
            job.record.status = JobState::Failed;
            job.record.context = context;
            job.record.last_error = Some(error);
            Ok(())
        })
        .await
    }

    async fn suspended(self: Box<Self>) -> Result<(), QueueError> {
        let job_id = self.job_id;
        let generation = self.generation;
        // The unit may already have been promoted and leased again by the
        // time this lease reports, so compare generations, not the flag.
        self.finish(|job| {
            if job.generation > generation {
                Ok(())
            } else {
                Err(QueueError::Backend(format!(
                    "{job_id} reported suspended without being rescheduled"
                )))
            }
        })
        .await
    }
}
