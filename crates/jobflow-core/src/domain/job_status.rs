//! Status of dispatched sub-units of work (one per map iteration).

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::ids::JobId;

/// Lifecycle of a unit of work as reported by the queue.
///
/// State transitions:
/// - Pending -> Running -> Succeeded
/// - Pending -> Running -> Failed
/// - Running -> Pending (rescheduled)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_finished(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

/// Status of one dispatched iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskJobStatus {
    pub task_name: String,
    pub job_id: JobId,
    pub each_index: usize,
    pub status: JobState,
}

/// Running store of [`TaskJobStatus`] by task name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobStatus {
    by_task: BTreeMap<String, Vec<TaskJobStatus>>,
}

impl JobStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or replace) the status of one iteration.
    pub fn update(&mut self, status: TaskJobStatus) {
        let entries = self.by_task.entry(status.task_name.clone()).or_default();
        match entries.iter_mut().find(|s| s.each_index == status.each_index) {
            Some(existing) => *existing = status,
            None => {
                entries.push(status);
                entries.sort_by_key(|s| s.each_index);
            }
        }
    }

    /// Apply polled states to every matching job id.
    pub fn apply_polled(&mut self, polled: &HashMap<JobId, JobState>) {
        for entries in self.by_task.values_mut() {
            for entry in entries.iter_mut() {
                if let Some(state) = polled.get(&entry.job_id) {
                    entry.status = *state;
                }
            }
        }
    }

    pub fn get(&self, task_name: &str) -> &[TaskJobStatus] {
        self.by_task.get(task_name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// True when nothing was dispatched for the task, or everything dispatched
    /// has finished.
    pub fn finished(&self, task_name: &str) -> bool {
        self.get(task_name).iter().all(|s| s.status.is_finished())
    }

    pub fn unfinished_job_ids(&self, task_name: &str) -> Vec<JobId> {
        self.get(task_name)
            .iter()
            .filter(|s| !s.status.is_finished())
            .map(|s| s.job_id)
            .collect()
    }

    pub fn with_state(&self, task_name: &str, state: JobState) -> Vec<&TaskJobStatus> {
        self.get(task_name).iter().filter(|s| s.status == state).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.by_task.values().all(Vec::is_empty)
    }

    pub fn flat_statuses(&self) -> Vec<TaskJobStatus> {
        self.by_task.values().flatten().cloned().collect()
    }
}
