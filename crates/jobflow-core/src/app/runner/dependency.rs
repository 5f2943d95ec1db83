//! Dependency wait: block a task until the dispatched map tasks it depends on
//! have finished, then merge their iteration outputs.

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::Runner;
use crate::domain::{Context, JobState, OnTimeout, Task, WorkflowError};
use crate::ports::UnitOfWork;

pub(super) enum WaitOutcome {
    Ready,
    Suspended(std::time::Duration),
}

impl Runner {
    pub(super) async fn wait_for_dependencies(
        &self,
        task: &Task,
        ctx: &mut Context,
    ) -> Result<WaitOutcome, WorkflowError> {
        for dep_name in task.depends_on() {
            let dependency = self.workflow.fetch_task(dep_name)?;

            // A dependency must have been processed earlier in this run. For a
            // dispatched map that only means its children were submitted.
            if !ctx.is_completed(dep_name) {
                return Err(WorkflowError::DependencyNotFinished {
                    task: task.qualified_name().to_string(),
                    dependency: dep_name.clone(),
                });
            }
            if !dependency.is_dispatched_map() {
                continue;
            }

            if let WaitOutcome::Suspended(delay) = self.poll_until_finished(task, dep_name, ctx).await? {
                return Ok(WaitOutcome::Suspended(delay));
            }
            self.merge_iteration_outputs(dependency, ctx).await?;
        }
        Ok(WaitOutcome::Ready)
    }

    async fn poll_until_finished(
        &self,
        task: &Task,
        dep_name: &str,
        ctx: &mut Context,
    ) -> Result<WaitOutcome, WorkflowError> {
        let policy = task
            .dependency_wait()
            .copied()
            .unwrap_or_else(|| self.config.dependency_wait());
        let started = Instant::now();

        loop {
            let pending = ctx.job_status().unfinished_job_ids(dep_name);
            if pending.is_empty() {
                return Ok(WaitOutcome::Ready);
            }

            let polled = self.queue.poll_statuses(&pending).await?;
            ctx.job_status_mut().apply_polled(&polled);
            if ctx.job_status().finished(dep_name) {
                return Ok(WaitOutcome::Ready);
            }

            let waited = started.elapsed();
            if waited >= policy.poll_timeout {
                return match policy.on_timeout {
                    OnTimeout::Reschedule => {
                        let unit = UnitOfWork::new(self.workflow.name(), ctx.to_snapshot())
                            .with_job_id(self.job_id);
                        self.queue
                            .reschedule_current(unit, policy.reschedule_delay)
                            .await?;
                        info!(
                            job_id = %self.job_id,
                            task = %task.qualified_name(),
                            dependency = %dep_name,
                            delay_ms = policy.reschedule_delay.as_millis() as u64,
                            "dependency still running, rescheduled"
                        );
                        Ok(WaitOutcome::Suspended(policy.reschedule_delay))
                    }
                    OnTimeout::Fail => Err(WorkflowError::DependencyTimeout {
                        task: task.qualified_name().to_string(),
                        dependency: dep_name.to_string(),
                        waited,
                    }),
                };
            }

            debug!(
                job_id = %self.job_id,
                task = %task.qualified_name(),
                dependency = %dep_name,
                remaining = ctx.job_status().unfinished_job_ids(dep_name).len(),
                "waiting for dependency"
            );
            tokio::time::sleep(policy.poll_interval).await;
        }
    }

    /// Pull each succeeded child's output into `ctx`, skipping indices that are
    /// already present.
    async fn merge_iteration_outputs(
        &self,
        dependency: &Task,
        ctx: &mut Context,
    ) -> Result<(), WorkflowError> {
        let name = dependency.qualified_name();
        let statuses = ctx.job_status().get(name).to_vec();

        for status in statuses {
            match status.status {
                JobState::Succeeded => {}
                JobState::Failed => {
                    warn!(
                        job_id = %self.job_id,
                        task = %name,
                        child = %status.job_id,
                        index = status.each_index,
                        "map iteration failed, no output to merge"
                    );
                    continue;
                }
                JobState::Pending | JobState::Running => continue,
            }
            if dependency.output_schema().is_empty() || ctx.output().contains(name, status.each_index) {
                continue;
            }

            let snapshot = self.queue.fetch_completed_context(status.job_id).await?;
            let output = snapshot
                .outputs_for(name)
                .find(|o| o.index() == status.each_index)
                .cloned();
            match output {
                Some(output) => ctx.record_output(output),
                None => warn!(
                    job_id = %self.job_id,
                    task = %name,
                    child = %status.job_id,
                    index = status.each_index,
                    "child context has no output for its iteration"
                ),
            }
        }
        Ok(())
    }
}
