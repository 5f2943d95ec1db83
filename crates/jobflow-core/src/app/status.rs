//! Status query: a read-only view of one unit of work for operators and
//! external tooling.

use crate::app::registry::WorkflowRegistry;
use crate::domain::{Context, JobId, JobState, JobStatus, Output, WorkflowError};
use crate::ports::JobLookup;

/// Snapshot of a unit of work as the queue last recorded it.
#[derive(Debug, Clone)]
pub struct WorkflowStatus {
    job_id: JobId,
    workflow: String,
    status: JobState,
    context: Context,
    last_error: Option<String>,
}

impl WorkflowStatus {
    /// Look up `job_id` and rebuild its context.
    ///
    /// Fails with `JobNotFound` for an unknown id and `WorkflowNotFound` when
    /// the job names a workflow this process does not have registered.
    pub async fn find(
        job_id: JobId,
        lookup: &dyn JobLookup,
        registry: &WorkflowRegistry,
    ) -> Result<Self, WorkflowError> {
        let record = lookup
            .find_job(job_id)
            .await?
            .ok_or(WorkflowError::JobNotFound(job_id))?;
        let workflow = registry.get(&record.workflow)?;

        Ok(Self {
            job_id,
            workflow: workflow.name().to_string(),
            status: record.status,
            context: Context::from_snapshot(record.context),
            last_error: record.last_error,
        })
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn workflow(&self) -> &str {
        &self.workflow
    }

    pub fn status(&self) -> JobState {
        self.status
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }

    /// Task the unit was executing or waiting on when it last checkpointed.
    pub fn current_task_name(&self) -> Option<&str> {
        self.context.current_task_name()
    }

    pub fn arguments(&self) -> &serde_json::Map<String, serde_json::Value> {
        self.context.arguments()
    }

    pub fn output(&self) -> &Output {
        self.context.output()
    }

    pub fn job_status(&self) -> &JobStatus {
        self.context.job_status()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ArgumentDef, OutputField, Task, TaskOutput, Workflow};
    use crate::impls::InMemoryQueue;
    use crate::ports::{UnitOfWork, WorkSource};
    use serde_json::json;

    fn registry() -> WorkflowRegistry {
        let mut registry = WorkflowRegistry::new();
        registry
            .register(
                Workflow::builder("Report")
                    .argument(ArgumentDef::new("day", "String"))
                    .task(
                        Task::builder("count")
                            .output(OutputField::new("rows", "Integer"))
                            .body(|_| Ok(json!({"rows": 10})))
                            .build(),
                    )
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
    }

    fn unit(registry: &WorkflowRegistry) -> UnitOfWork {
        let args = json!({"day": "2026-10-17"}).as_object().cloned().unwrap();
        let ctx = registry.get("Report").unwrap().build_context(args).unwrap();
        UnitOfWork::new("Report", ctx.to_snapshot())
    }

    #[tokio::test]
    async fn pending_job_exposes_arguments() {
        let registry = registry();
        let queue = InMemoryQueue::new();
        let id = queue.enqueue(unit(&registry)).await.unwrap();

        let status = WorkflowStatus::find(id, &queue, &registry).await.unwrap();
        assert_eq!(status.status(), JobState::Pending);
        assert_eq!(status.workflow(), "Report");
        assert_eq!(status.arguments()["day"], json!("2026-10-17"));
        assert_eq!(status.current_task_name(), None);
        assert!(status.output().is_empty());
        assert!(!status.is_finished());
    }

    #[tokio::test]
    async fn finished_job_exposes_outputs() {
        let registry = registry();
        let queue = InMemoryQueue::new();
        let id = queue.enqueue(unit(&registry)).await.unwrap();

        let lease = queue.lease().await.unwrap();
        let mut snapshot = lease.unit().context.clone();
        snapshot.task_outputs.push(TaskOutput {
            task_name: "count".into(),
            each_index: None,
            data: json!({"rows": 10}).as_object().cloned().unwrap(),
        });
        lease.ack(snapshot).await.unwrap();

        let status = WorkflowStatus::find(id, &queue, &registry).await.unwrap();
        assert_eq!(status.status(), JobState::Succeeded);
        assert_eq!(status.job_id(), id);
        let rows: i64 = status.output().first("count").unwrap().get_as("rows").unwrap();
        assert_eq!(rows, 10);
        assert_eq!(status.last_error(), None);
    }

    #[tokio::test]
    async fn failed_job_keeps_its_error() {
        let registry = registry();
        let queue = InMemoryQueue::new();
        let id = queue.enqueue(unit(&registry)).await.unwrap();

        let lease = queue.lease().await.unwrap();
        let snapshot = lease.unit().context.clone();
        lease.fail(snapshot, "boom".into()).await.unwrap();

        let status = WorkflowStatus::find(id, &queue, &registry).await.unwrap();
        assert_eq!(status.status(), JobState::Failed);
        assert_eq!(status.last_error(), Some("boom"));
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let id = JobId::from(ulid::Ulid::new());
        let err = WorkflowStatus::find(id, &InMemoryQueue::new(), &registry())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::JobNotFound(missing) if missing == id));
    }

    #[tokio::test]
    async fn unregistered_workflow_is_not_found() {
        let queue = InMemoryQueue::new();
        let id = queue
            .enqueue(UnitOfWork::new("Gone", Default::default()))
            .await
            .unwrap();
        let err = WorkflowStatus::find(id, &queue, &registry()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::WorkflowNotFound(name) if name == "Gone"));
    }
}
