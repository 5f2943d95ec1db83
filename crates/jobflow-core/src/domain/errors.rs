//! Errors and their operational classification.

use std::time::Duration;

use thiserror::Error;

use super::ids::JobId;
use crate::ports::QueueError;

/// Error type returned by user task bodies and hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Operational classification of a [`WorkflowError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Raised while building a workflow. Fatal, never retried.
    Definition,
    /// Hook contract violation. Fatal to the current run.
    Control,
    /// Raised by task logic (body, each source, hooks) after retries.
    Body,
    /// Dependency wait gave up.
    Coordination,
    /// Unknown task, argument, output field, workflow or job.
    Lookup,
    /// Queue collaborator or serialization failure.
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("duplicate task name: {0}")]
    DuplicateTask(String),

    #[error("cyclic dependency detected: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: String, dependency: String },

    #[error("invalid retry configuration: {0}")]
    InvalidRetryConfig(String),

    #[error("invalid throttle configuration: {0}")]
    InvalidThrottleConfig(String),

    #[error("invalid dependency wait configuration: {0}")]
    InvalidDependencyWaitConfig(String),

    #[error("invalid task {task}: {reason}")]
    InvalidTask { task: String, reason: String },

    #[error("around hook for task {task} did not invoke its continuation")]
    HookNotInvoked { task: String },

    #[error("around hook for task {task} invoked its continuation twice")]
    HookAlreadyInvoked { task: String },

    #[error("task {task} failed after {attempts} attempt(s): {source}")]
    TaskFailed {
        task: String,
        attempts: u32,
        #[source]
        source: BoxError,
    },

    #[error("each source of task {task} failed: {source}")]
    EachFailed {
        task: String,
        #[source]
        source: BoxError,
    },

    #[error("{stage} hook for task {task} failed: {source}")]
    HookFailed {
        task: String,
        stage: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("task {task} returned output that does not match its schema: {reason}")]
    InvalidOutput { task: String, reason: String },

    #[error("task {task} timed out after {waited:?} waiting for {dependency}")]
    DependencyTimeout {
        task: String,
        dependency: String,
        waited: Duration,
    },

    #[error("task {task} depends on {dependency}, which has not run yet")]
    DependencyNotFinished { task: String, dependency: String },

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("argument not found: {0}")]
    ArgumentNotFound(String),

    #[error("unknown argument: {0}")]
    UnknownArgument(String),

    #[error("output of task {task} has no field {field}")]
    OutputFieldNotFound { task: String, field: String },

    #[error("no output recorded for task {task} at index {index}")]
    OutputNotFound { task: String, index: usize },

    #[error("context is not executing a map iteration")]
    NotInEachIteration,

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WorkflowError {
    pub fn kind(&self) -> ErrorKind {
        use WorkflowError::*;
        match self {
            DuplicateTask(_)
            | CyclicDependency { .. }
            | UnknownDependency { .. }
            | InvalidRetryConfig(_)
            | InvalidThrottleConfig(_)
            | InvalidDependencyWaitConfig(_)
            | InvalidTask { .. } => ErrorKind::Definition,
            HookNotInvoked { .. } | HookAlreadyInvoked { .. } => ErrorKind::Control,
            TaskFailed { .. } | EachFailed { .. } | HookFailed { .. } | InvalidOutput { .. } => {
                ErrorKind::Body
            }
            DependencyTimeout { .. } | DependencyNotFinished { .. } => ErrorKind::Coordination,
            TaskNotFound(_)
            | ArgumentNotFound(_)
            | UnknownArgument(_)
            | OutputFieldNotFound { .. }
            | OutputNotFound { .. }
            | NotInEachIteration
            | WorkflowNotFound(_)
            | JobNotFound(_) => ErrorKind::Lookup,
            Queue(_) | Serialization(_) => ErrorKind::Infrastructure,
        }
    }

    /// Errors that error hooks are notified about.
    pub fn is_task_level(&self) -> bool {
        self.kind() == ErrorKind::Body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_lists_path() {
        let err = WorkflowError::CyclicDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "cyclic dependency detected: a -> b -> a");
        assert_eq!(err.kind(), ErrorKind::Definition);
    }

    #[test]
    fn task_failure_keeps_source() {
        let err = WorkflowError::TaskFailed {
            task: "fetch".into(),
            attempts: 3,
            source: "boom".into(),
        };
        assert!(err.is_task_level());
        assert_eq!(
            std::error::Error::source(&err).map(|s| s.to_string()),
            Some("boom".to_string())
        );
    }

    #[test]
    fn control_errors_are_not_task_level() {
        let err = WorkflowError::HookNotInvoked { task: "t".into() };
        assert_eq!(err.kind(), ErrorKind::Control);
        assert!(!err.is_task_level());
    }
}
