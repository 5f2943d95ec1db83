//! Domain model: workflow definitions, policies and execution state.

pub mod context;
pub mod dependency_wait;
pub mod errors;
pub mod hook;
pub mod ids;
pub mod job_status;
pub mod namespace;
pub mod output;
pub mod retry;
pub mod task;
pub mod throttle;
pub mod workflow;

pub use context::{Context, ContextSnapshot, EachState};
pub use dependency_wait::{DependencyWait, OnTimeout};
pub use errors::{BoxError, ErrorKind, WorkflowError};
pub use hook::{AroundHook, ErrorHook, Hook, HookRegistry, TaskCallable};
pub use ids::JobId;
pub use job_status::{JobState, JobStatus, TaskJobStatus};
pub use namespace::Namespace;
pub use output::{Output, OutputField, TaskOutput};
pub use retry::{RetryStrategy, TaskRetry};
pub use task::{Task, TaskBuilder};
pub use throttle::{Semaphore, TaskThrottle};
pub use workflow::{ArgumentDef, DryRun, Workflow, WorkflowBuilder};
