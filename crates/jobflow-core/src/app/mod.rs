//! Application layer: wires the domain and ports into a running engine.
//!
//! - **AppBuilder**: registers workflows, checks expectations at startup
//! - **Runtime**: resolves a unit of work to its workflow and runs it
//! - **Runner**: the per-unit state machine
//! - **WorkerGroup**: tokio workers draining a work source
//! - **WorkflowStatus**: read-only status query

pub mod builder;
pub mod config;
pub mod registry;
pub mod runner;
pub mod runtime;
pub mod status;
pub mod worker_loop;

pub use self::builder::{App, AppBuilder, BuildError};
pub use self::config::{ConfigError, EngineConfig};
pub use self::registry::{RegistryError, WorkflowRegistry};
pub use self::runner::{RunOutcome, Runner};
pub use self::runtime::{Execution, Runtime};
pub use self::status::WorkflowStatus;
pub use self::worker_loop::WorkerGroup;
