//! jobflow-core
//!
//! Workflow orchestration: tasks with dependencies, hooks, retry, throttling
//! and map fan-out, executed by a resumable runner over an external queue.
//!
//! - **domain**: workflow model and execution state (Task, Workflow, Context, hooks, errors)
//! - **ports**: collaborator traits (Queue, WorkSource, JobLookup, Clock, IdGenerator)
//! - **app**: runner, runtime, registry, builder, workers, status query, config
//! - **impls**: in-memory queue for development and tests

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;
