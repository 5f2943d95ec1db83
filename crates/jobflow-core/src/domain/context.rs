//! Context: per-execution state carried across suspension points.
//!
//! A Context is owned by exactly one unit of work. It is created fresh for a
//! top-level invocation, or rebuilt from a [`ContextSnapshot`] when a unit of
//! work resumes or runs one dispatched map iteration.

use std::collections::{BTreeMap, BTreeSet};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::errors::WorkflowError;
use super::ids::JobId;
use super::job_status::{JobStatus, TaskJobStatus};
use super::output::{Output, TaskOutput};

/// Present only while executing one iteration of a map task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EachState {
    pub parent_job_id: JobId,
    pub task_name: String,
    pub index: usize,
    pub value: serde_json::Value,
}

/// Serialized form of a [`Context`] used for checkpointing and child dispatch.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContextSnapshot {
    #[serde(default)]
    pub arguments: serde_json::Map<String, serde_json::Value>,

    #[serde(default)]
    pub task_outputs: Vec<TaskOutput>,

    #[serde(default)]
    pub task_job_statuses: Vec<TaskJobStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub each_state: Option<EachState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub completed_tasks: Vec<String>,

    /// Inline map elements already processed, per task.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub completed_each_indices: BTreeMap<String, Vec<usize>>,
}

impl ContextSnapshot {
    pub fn to_json(&self) -> Result<String, WorkflowError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self, WorkflowError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Outputs recorded for one task.
    pub fn outputs_for<'a>(&'a self, task_name: &'a str) -> impl Iterator<Item = &'a TaskOutput> {
        self.task_outputs.iter().filter(move |o| o.task_name == task_name)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Context {
    arguments: serde_json::Map<String, serde_json::Value>,
    output: Output,
    job_status: JobStatus,
    current_task: Option<String>,
    each_state: Option<EachState>,
    dry_run: bool,
    completed_tasks: Vec<String>,
    completed_each: BTreeMap<String, BTreeSet<usize>>,
}

impl Context {
    /// Build a context from already-resolved arguments.
    ///
    /// Use `Workflow::build_context` to merge declared defaults and reject
    /// undeclared arguments.
    pub fn new(arguments: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            arguments,
            ..Self::default()
        }
    }

    pub fn from_snapshot(snapshot: ContextSnapshot) -> Self {
        let mut output = Output::new();
        output.extend(snapshot.task_outputs);

        let mut job_status = JobStatus::new();
        for status in snapshot.task_job_statuses {
            job_status.update(status);
        }

        Self {
            arguments: snapshot.arguments,
            output,
            job_status,
            current_task: snapshot.current_task,
            each_state: snapshot.each_state,
            dry_run: false,
            completed_tasks: snapshot.completed_tasks,
            completed_each: snapshot
                .completed_each_indices
                .into_iter()
                .map(|(task, indices)| (task, indices.into_iter().collect()))
                .collect(),
        }
    }

    pub fn to_snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            arguments: self.arguments.clone(),
            task_outputs: self.output.flat_outputs(),
            task_job_statuses: self.job_status.flat_statuses(),
            each_state: self.each_state.clone(),
            current_task: self.current_task.clone(),
            completed_tasks: self.completed_tasks.clone(),
            completed_each_indices: self
                .completed_each
                .iter()
                .map(|(task, indices)| (task.clone(), indices.iter().copied().collect()))
                .collect(),
        }
    }

    pub fn serialize(&self) -> Result<String, WorkflowError> {
        self.to_snapshot().to_json()
    }

    pub fn deserialize(s: &str) -> Result<Self, WorkflowError> {
        Ok(Self::from_snapshot(ContextSnapshot::from_json(s)?))
    }

    // ---- arguments ----

    pub fn arguments(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.arguments
    }

    pub fn argument(&self, name: &str) -> Result<&serde_json::Value, WorkflowError> {
        self.arguments
            .get(name)
            .ok_or_else(|| WorkflowError::ArgumentNotFound(name.to_string()))
    }

    pub fn argument_as<T: DeserializeOwned>(&self, name: &str) -> Result<T, WorkflowError> {
        Ok(serde_json::from_value(self.argument(name)?.clone())?)
    }

    // ---- outputs / statuses ----

    pub fn output(&self) -> &Output {
        &self.output
    }

    pub fn job_status(&self) -> &JobStatus {
        &self.job_status
    }

    pub(crate) fn record_output(&mut self, output: TaskOutput) {
        self.output.add(output);
    }

    pub(crate) fn record_job_status(&mut self, status: TaskJobStatus) {
        self.job_status.update(status);
    }

    pub(crate) fn job_status_mut(&mut self) -> &mut JobStatus {
        &mut self.job_status
    }

    // ---- execution cursor ----

    pub fn current_task_name(&self) -> Option<&str> {
        self.current_task.as_deref()
    }

    pub(crate) fn set_current_task(&mut self, task_name: &str) {
        self.current_task = Some(task_name.to_string());
    }

    pub(crate) fn clear_current_task(&mut self) {
        self.current_task = None;
    }

    pub fn completed_tasks(&self) -> &[String] {
        &self.completed_tasks
    }

    pub fn is_completed(&self, task_name: &str) -> bool {
        self.completed_tasks.iter().any(|t| t == task_name)
    }

    pub(crate) fn mark_completed(&mut self, task_name: &str) {
        if !self.is_completed(task_name) {
            self.completed_tasks.push(task_name.to_string());
        }
    }

    /// Has this inline map element already been processed?
    pub fn is_each_completed(&self, task_name: &str, index: usize) -> bool {
        self.completed_each
            .get(task_name)
            .is_some_and(|indices| indices.contains(&index))
    }

    pub(crate) fn mark_each_completed(&mut self, task_name: &str, index: usize) {
        self.completed_each
            .entry(task_name.to_string())
            .or_default()
            .insert(index);
    }

    // ---- map iteration ----

    pub fn each_state(&self) -> Option<&EachState> {
        self.each_state.as_ref()
    }

    /// True when this context belongs to one dispatched map iteration.
    pub fn is_each_iteration(&self) -> bool {
        self.each_state.is_some()
    }

    pub fn each_value(&self) -> Result<&serde_json::Value, WorkflowError> {
        self.each_state
            .as_ref()
            .map(|s| &s.value)
            .ok_or(WorkflowError::NotInEachIteration)
    }

    pub fn each_value_as<T: DeserializeOwned>(&self) -> Result<T, WorkflowError> {
        Ok(serde_json::from_value(self.each_value()?.clone())?)
    }

    pub fn each_index(&self) -> Option<usize> {
        self.each_state.as_ref().map(|s| s.index)
    }

    /// A copy of this context positioned on one map iteration.
    pub(crate) fn for_each_iteration(&self, state: EachState) -> Self {
        let mut ctx = self.clone();
        ctx.each_state = Some(state);
        ctx
    }

    // ---- dry run ----

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub(crate) fn set_dry_run(&mut self, dry_run: bool) {
        self.dry_run = dry_run;
    }

    /// Run `f` unless the current task is in dry-run mode, in which case
    /// `None` is returned and `f` never executes.
    pub fn skip_in_dry_run<T>(&self, name: &str, f: impl FnOnce() -> T) -> Option<T> {
        if self.dry_run {
            tracing::info!(
                task = self.current_task.as_deref().unwrap_or_default(),
                block = name,
                "dry run: skipped block"
            );
            None
        } else {
            Some(f())
        }
    }

    /// Like [`Context::skip_in_dry_run`], returning `fallback` when skipped.
    pub fn skip_in_dry_run_or<T>(&self, name: &str, fallback: T, f: impl FnOnce() -> T) -> T {
        self.skip_in_dry_run(name, f).unwrap_or(fallback)
    }
}
