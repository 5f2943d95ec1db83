//! Queue port: the external job queue the runner coordinates through.
//!
//! Three faces of the same collaborator:
//! - [`Queue`]: what a running workflow needs (permits, fan-out dispatch,
//!   status polling, child context retrieval, self-reschedule).
//! - [`WorkSource`] / [`UnitLease`]: what a worker needs to pull units of
//!   work and report their result.
//! - [`JobLookup`]: read access for the status query surface.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{ContextSnapshot, JobId, JobState, Semaphore};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("unit of work not found: {0}")]
    UnknownJob(JobId),

    #[error("unit of work {0} has not succeeded")]
    NotCompleted(JobId),

    #[error("queue is closed")]
    Closed,

    #[error("queue backend error: {0}")]
    Backend(String),
}

/// One independently executable invocation of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitOfWork {
    /// Assigned by the queue on enqueue; set when re-enqueuing an existing unit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,

    pub workflow: String,

    pub context: ContextSnapshot,

    /// Admission request checked by the queue before the unit is leased.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<Semaphore>,
}

impl UnitOfWork {
    pub fn new(workflow: impl Into<String>, context: ContextSnapshot) -> Self {
        Self {
            job_id: None,
            workflow: workflow.into(),
            context,
            concurrency: None,
        }
    }

    pub fn with_job_id(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn with_concurrency(mut self, semaphore: Semaphore) -> Self {
        self.concurrency = Some(semaphore);
        self
    }
}

/// Collaborator interface consumed by the runner.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Try to take one permit of `semaphore` for `holder`.
    /// Unlimited semaphores always pass.
    async fn acquire_permit(&self, semaphore: &Semaphore, holder: JobId)
    -> Result<bool, QueueError>;

    /// Give back `holder`'s permit. Returns false if it held none, so a
    /// double release is harmless.
    async fn release_permit(&self, semaphore: &Semaphore, holder: JobId)
    -> Result<bool, QueueError>;

    /// Fire-and-forget submission of independent child units.
    async fn dispatch_batch(&self, units: Vec<UnitOfWork>) -> Result<Vec<JobId>, QueueError>;

    async fn poll_statuses(&self, ids: &[JobId]) -> Result<HashMap<JobId, JobState>, QueueError>;

    /// Final context of a succeeded unit.
    async fn fetch_completed_context(&self, id: JobId) -> Result<ContextSnapshot, QueueError>;

    /// Put the current unit back on the queue to resume after `delay`.
    async fn reschedule_current(&self, unit: UnitOfWork, delay: Duration)
    -> Result<(), QueueError>;
}

/// A leased unit of work. The worker owns it and must report exactly one of
/// `ack`, `fail` or `suspended`.
#[async_trait]
pub trait UnitLease: Send {
    fn job_id(&self) -> JobId;

    fn unit(&self) -> &UnitOfWork;

    /// The run completed; `context` is its final state.
    async fn ack(self: Box<Self>, context: ContextSnapshot) -> Result<(), QueueError>;

    /// The run aborted; `context` keeps whatever completed before the error.
    async fn fail(self: Box<Self>, context: ContextSnapshot, error: String)
    -> Result<(), QueueError>;

    /// The run handed itself back through `Queue::reschedule_current`.
    async fn suspended(self: Box<Self>) -> Result<(), QueueError>;
}

#[async_trait]
pub trait WorkSource: Send + Sync {
    /// Wait for the next admissible unit. `None` once the source is closed.
    async fn lease(&self) -> Option<Box<dyn UnitLease>>;
}

/// What the queue knows about one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub workflow: String,
    pub status: JobState,
    pub context: ContextSnapshot,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[async_trait]
pub trait JobLookup: Send + Sync {
    async fn find_job(&self, id: JobId) -> Result<Option<JobRecord>, QueueError>;
}
