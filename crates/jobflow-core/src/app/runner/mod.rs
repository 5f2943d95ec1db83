//! Runner: drives one unit of work through a workflow.
//!
//! Per task, in order: condition -> dependency wait -> before hooks ->
//! around hooks wrapping the body (retry, throttle, map fan-out) -> after
//! hooks. Outputs produced inside the around chain are collected in a
//! [`Recorded`] slot and merged into the context once the chain returns,
//! whether it succeeded or not, so partial results survive a failure. Inline
//! map elements are checkpointed the same way, so a resumed run only picks
//! up the elements that never finished.
//!
//! A unit of work whose context carries an each-state is one dispatched map
//! iteration: only that task's body runs, once, at that index. Hooks,
//! error hooks included, belong to the parent run.

mod dependency;
#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use crate::app::config::EngineConfig;
use crate::domain::{
    BoxError, Context, EachState, JobId, JobState, Semaphore, Task, TaskCallable, TaskJobStatus,
    TaskOutput, Workflow, WorkflowError,
};
use crate::ports::{Queue, QueueError, UnitOfWork};

use self::dependency::WaitOutcome;

/// How a run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every task was processed.
    Completed,
    /// The unit handed itself back to the queue and resumes after `delay`.
    Suspended { delay: Duration },
}

pub struct Runner {
    workflow: Arc<Workflow>,
    queue: Arc<dyn Queue>,
    job_id: JobId,
    config: EngineConfig,
}

/// Results produced inside the around chain, which only sees `&Context`.
#[derive(Default)]
struct Recorded {
    outputs: Mutex<Vec<TaskOutput>>,
    statuses: Mutex<Vec<TaskJobStatus>>,
    each_done: Mutex<Vec<(String, usize)>>,
}

impl Recorded {
    fn output(&self, output: TaskOutput) {
        self.outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(output);
    }

    fn status(&self, status: TaskJobStatus) {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(status);
    }

    fn each_done(&self, task_name: &str, index: usize) {
        self.each_done
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((task_name.to_string(), index));
    }

    fn drain_into(self, ctx: &mut Context) {
        let outputs = self.outputs.into_inner().unwrap_or_else(PoisonError::into_inner);
        let statuses = self.statuses.into_inner().unwrap_or_else(PoisonError::into_inner);
        for output in outputs {
            ctx.record_output(output);
        }
        for status in statuses {
            ctx.record_job_status(status);
        }
        let each_done = self.each_done.into_inner().unwrap_or_else(PoisonError::into_inner);
        for (task_name, index) in each_done {
            ctx.mark_each_completed(&task_name, index);
        }
    }
}

impl Runner {
    pub fn new(
        workflow: Arc<Workflow>,
        queue: Arc<dyn Queue>,
        job_id: JobId,
        config: EngineConfig,
    ) -> Self {
        Self {
            workflow,
            queue,
            job_id,
            config,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    /// Run (or resume) the workflow on `ctx`.
    ///
    /// On error, `ctx` keeps every output and job status recorded so far.
    pub async fn run(&self, ctx: &mut Context) -> Result<RunOutcome, WorkflowError> {
        if let Some(state) = ctx.each_state().cloned() {
            self.run_each_iteration(ctx, state).await?;
            return Ok(RunOutcome::Completed);
        }

        let workflow = Arc::clone(&self.workflow);
        for task in workflow.execution_order() {
            let name = task.qualified_name();
            if ctx.is_completed(name) {
                debug!(job_id = %self.job_id, task = %name, "already completed, skipping");
                continue;
            }
            ctx.set_current_task(name);

            if !task.condition_holds(ctx) {
                info!(job_id = %self.job_id, task = %name, "condition is false, task skipped");
                ctx.mark_completed(name);
                continue;
            }

            if let WaitOutcome::Suspended(delay) = self.wait_for_dependencies(task, ctx).await? {
                return Ok(RunOutcome::Suspended { delay });
            }

            ctx.set_dry_run(workflow.resolve_dry_run(task, ctx));
            let result = self.execute_task(task, ctx).await;
            ctx.set_dry_run(false);

            if let Err(err) = result {
                self.notify_error(task, ctx, &err);
                return Err(err);
            }
            ctx.mark_completed(name);
        }

        ctx.clear_current_task();
        info!(job_id = %self.job_id, workflow = %workflow.name(), "workflow run completed");
        Ok(RunOutcome::Completed)
    }

    /// Entry point for one dispatched map iteration.
    async fn run_each_iteration(
        &self,
        ctx: &mut Context,
        state: EachState,
    ) -> Result<(), WorkflowError> {
        let workflow = Arc::clone(&self.workflow);
        let task = workflow.fetch_task(&state.task_name)?;
        ctx.set_current_task(task.qualified_name());
        ctx.set_dry_run(workflow.resolve_dry_run(task, ctx));

        let result = match self.invoke_with_retry(task, ctx).await {
            Ok(value) => task.shape_output(Some(state.index), value),
            Err(err) => Err(err),
        };
        ctx.set_dry_run(false);

        match result {
            Ok(output) => {
                if let Some(output) = output {
                    ctx.record_output(output);
                }
                debug!(
                    job_id = %self.job_id,
                    parent_job_id = %state.parent_job_id,
                    task = %state.task_name,
                    index = state.index,
                    "map iteration completed"
                );
                Ok(())
            }
            Err(err) => {
                warn!(
                    job_id = %self.job_id,
                    parent_job_id = %state.parent_job_id,
                    task = %state.task_name,
                    index = state.index,
                    error = %err,
                    "map iteration failed"
                );
                Err(err)
            }
        }
    }

    fn notify_error(&self, task: &Task, ctx: &Context, err: &WorkflowError) {
        if err.is_task_level() {
            warn!(job_id = %self.job_id, task = %task.qualified_name(), error = %err, "routing error to error hooks");
            self.workflow.hooks().run_error(task.qualified_name(), ctx, err);
        }
    }

    /// Hooks around the body, then merge what the body recorded.
    async fn execute_task(&self, task: &Task, ctx: &mut Context) -> Result<(), WorkflowError> {
        let name = task.qualified_name();
        let hooks = self.workflow.hooks();
        hooks.run_before(name, ctx)?;

        let recorded = Recorded::default();
        let around = hooks.around_for(name);
        let flags: Vec<AtomicBool> = around.iter().map(|_| AtomicBool::new(false)).collect();

        let result = {
            let shared: &Context = ctx;
            let mut layer: BoxFuture<'_, Result<(), WorkflowError>> =
                Box::pin(self.run_body(task, shared, &recorded));

            // Build inside out so the first registered hook ends up outermost.
            for (hook, flag) in around.iter().zip(flags.iter()).rev() {
                let callable = TaskCallable::new(name, layer, flag);
                let callback = &hook.callback;
                layer = Box::pin(async move {
                    let result = (**callback)(shared, callable).await;
                    match result {
                        Err(err) => Err(around_error(name, err)),
                        Ok(()) if !flag.load(Ordering::SeqCst) => {
                            Err(WorkflowError::HookNotInvoked {
                                task: name.to_string(),
                            })
                        }
                        Ok(()) => Ok(()),
                    }
                });
            }
            layer.await
        };

        recorded.drain_into(ctx);
        result?;
        hooks.run_after(name, ctx)
    }

    /// Innermost layer: the body itself, or its fan-out.
    async fn run_body(
        &self,
        task: &Task,
        ctx: &Context,
        recorded: &Recorded,
    ) -> Result<(), WorkflowError> {
        if task.is_dispatched_map() {
            return self.dispatch_iterations(task, ctx, recorded).await;
        }

        let name = task.qualified_name();
        if !task.is_map() {
            let value = self.invoke_with_retry(task, ctx).await?;
            if let Some(output) = task.shape_output(None, value)? {
                recorded.output(output);
            }
            return Ok(());
        }

        let values = task.each_values(ctx)?;
        debug!(job_id = %self.job_id, task = %name, items = values.len(), "running map inline");
        for (index, value) in values.into_iter().enumerate() {
            if ctx.is_each_completed(name, index) {
                continue;
            }
            let item = ctx.for_each_iteration(EachState {
                parent_job_id: self.job_id,
                task_name: name.to_string(),
                index,
                value,
            });
            let value = self.invoke_with_retry(task, &item).await?;
            if let Some(output) = task.shape_output(Some(index), value)? {
                recorded.output(output);
            }
            recorded.each_done(name, index);
        }
        Ok(())
    }

    /// Submit one child unit per element and record them as pending.
    async fn dispatch_iterations(
        &self,
        task: &Task,
        ctx: &Context,
        recorded: &Recorded,
    ) -> Result<(), WorkflowError> {
        let name = task.qualified_name();
        if !ctx.job_status().get(name).is_empty() {
            debug!(job_id = %self.job_id, task = %name, "iterations already dispatched");
            return Ok(());
        }

        let workflow = self.workflow.name();
        let semaphore = Semaphore::new(
            format!("{workflow}:{name}:each"),
            task.concurrency_limit(),
            self.config.throttle_ttl(),
        );
        let units: Vec<UnitOfWork> = task
            .each_values(ctx)?
            .into_iter()
            .enumerate()
            .map(|(index, value)| {
                let child = ctx.for_each_iteration(EachState {
                    parent_job_id: self.job_id,
                    task_name: name.to_string(),
                    index,
                    value,
                });
                UnitOfWork::new(workflow, child.to_snapshot()).with_concurrency(semaphore.clone())
            })
            .collect();

        let expected = units.len();
        if expected == 0 {
            return Ok(());
        }
        let ids = self.queue.dispatch_batch(units).await?;
        if ids.len() != expected {
            return Err(QueueError::Backend(format!(
                "dispatched {expected} units but got {} ids",
                ids.len()
            ))
            .into());
        }

        for (index, job_id) in ids.into_iter().enumerate() {
            recorded.status(TaskJobStatus {
                task_name: name.to_string(),
                job_id,
                each_index: index,
                status: JobState::Pending,
            });
        }
        info!(
            job_id = %self.job_id,
            task = %name,
            children = expected,
            concurrency_limit = ?task.concurrency_limit(),
            "dispatched map iterations"
        );
        Ok(())
    }

    /// Invoke the body, retrying per the task's policy.
    async fn invoke_with_retry(
        &self,
        task: &Task,
        ctx: &Context,
    ) -> Result<serde_json::Value, WorkflowError> {
        let retry = task.retry();
        let max_attempts = retry.max_attempts();
        let mut attempt = 1;
        loop {
            match self.invoke_throttled(task, ctx).await? {
                Ok(value) => return Ok(value),
                Err(source) if attempt < max_attempts => {
                    let delay = retry.delay_for(attempt);
                    warn!(
                        job_id = %self.job_id,
                        task = %task.qualified_name(),
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %source,
                        "task body failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(source) => {
                    return Err(WorkflowError::TaskFailed {
                        task: task.qualified_name().to_string(),
                        attempts: attempt,
                        source,
                    });
                }
            }
        }
    }

    /// One body invocation, holding a throttle permit if the task has one.
    ///
    /// The outer result is a coordination failure, the inner one the body's.
    async fn invoke_throttled(
        &self,
        task: &Task,
        ctx: &Context,
    ) -> Result<Result<serde_json::Value, BoxError>, WorkflowError> {
        let Some(throttle) = task.throttle() else {
            return Ok(task.invoke(ctx));
        };

        let default_key = format!("{}:{}", self.workflow.name(), task.qualified_name());
        let semaphore = throttle.semaphore(&default_key, self.config.throttle_ttl());
        self.acquire_permit(task, &semaphore).await?;

        let result = task.invoke(ctx);

        if !self.queue.release_permit(&semaphore, self.job_id).await? {
            warn!(
                job_id = %self.job_id,
                key = %semaphore.concurrency_key,
                "released a permit that was not held"
            );
        }
        Ok(result)
    }

    async fn acquire_permit(&self, task: &Task, semaphore: &Semaphore) -> Result<(), WorkflowError> {
        loop {
            if self.queue.acquire_permit(semaphore, self.job_id).await? {
                return Ok(());
            }
            debug!(
                job_id = %self.job_id,
                task = %task.qualified_name(),
                key = %semaphore.concurrency_key,
                "throttled, waiting for a permit"
            );
            tokio::time::sleep(self.config.throttle_poll_interval()).await;
        }
    }
}

/// Errors raised through an around hook keep their identity when they came
/// from an inner layer.
fn around_error(task: &str, err: BoxError) -> WorkflowError {
    match err.downcast::<WorkflowError>() {
        Ok(inner) => *inner,
        Err(source) => WorkflowError::HookFailed {
            task: task.to_string(),
            stage: "around",
            source,
        },
    }
}
