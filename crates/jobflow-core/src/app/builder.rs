//! AppBuilder: registers workflows and wires the engine together.
//!
//! `build()` fails fast when a workflow the deployment expects is missing, so
//! a misconfigured worker never starts leasing units it cannot run.

use std::sync::Arc;

use crate::app::config::EngineConfig;
use crate::app::registry::{RegistryError, WorkflowRegistry};
use crate::app::runtime::Runtime;
use crate::app::worker_loop::WorkerGroup;
use crate::domain::Workflow;
use crate::ports::{Queue, WorkSource};

/// # Example
/// ```ignore
/// let app = AppBuilder::new()
///     .register(my_workflow)?
///     .expect_workflows(&["Ingest"])
///     .build()?;
/// ```
pub struct AppBuilder {
    registry: WorkflowRegistry,
    config: EngineConfig,
    expected_workflows: Option<Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing workflows: {0:?}. These workflows were expected but not registered.")]
    MissingWorkflows(Vec<String>),
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            registry: WorkflowRegistry::new(),
            config: EngineConfig::default(),
            expected_workflows: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn register(mut self, workflow: Workflow) -> Result<Self, RegistryError> {
        self.registry.register(workflow)?;
        Ok(self)
    }

    pub fn expect_workflows(mut self, names: &[&str]) -> Self {
        self.expected_workflows = Some(names.iter().map(|n| n.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<App, BuildError> {
        if let Some(expected) = &self.expected_workflows {
            let missing: Vec<String> = expected
                .iter()
                .filter(|name| self.registry.get(name).is_err())
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingWorkflows(missing));
            }
        }
        Ok(App {
            registry: Arc::new(self.registry),
            config: self.config,
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Validated workflows plus engine settings, ready to be attached to a queue.
pub struct App {
    registry: Arc<WorkflowRegistry>,
    config: EngineConfig,
}

impl App {
    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn runtime(&self, queue: Arc<dyn Queue>) -> Arc<Runtime> {
        Arc::new(Runtime::new(
            Arc::clone(&self.registry),
            queue,
            self.config.clone(),
        ))
    }

    /// Spawn `config.worker_count` workers pulling from `source`.
    pub fn spawn_workers(&self, source: Arc<dyn WorkSource>, runtime: Arc<Runtime>) -> WorkerGroup {
        WorkerGroup::spawn(self.config.worker_count, source, runtime)
    }
}
