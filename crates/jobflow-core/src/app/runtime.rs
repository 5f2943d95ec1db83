//! Runtime: executes a unit of work by resolving its workflow and driving a
//! [`Runner`] over its context.

use std::sync::Arc;

use crate::app::config::EngineConfig;
use crate::app::registry::WorkflowRegistry;
use crate::app::runner::{RunOutcome, Runner};
use crate::domain::{Context, ContextSnapshot, JobId, WorkflowError};
use crate::ports::{Queue, UnitOfWork};

/// Result of one execution together with the context it left behind.
///
/// The context is returned on failure too, so the queue can keep partial
/// outputs for inspection or a later retry.
#[derive(Debug)]
pub struct Execution {
    pub result: Result<RunOutcome, WorkflowError>,
    pub context: ContextSnapshot,
}

pub struct Runtime {
    registry: Arc<WorkflowRegistry>,
    queue: Arc<dyn Queue>,
    config: EngineConfig,
}

impl Runtime {
    pub fn new(registry: Arc<WorkflowRegistry>, queue: Arc<dyn Queue>, config: EngineConfig) -> Self {
        Self {
            registry,
            queue,
            config,
        }
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    /// Build the top-level unit of work for `workflow` from caller arguments.
    pub fn prepare(
        &self,
        workflow: &str,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> Result<UnitOfWork, WorkflowError> {
        let workflow = self.registry.get(workflow)?;
        let ctx = workflow.build_context(arguments)?;
        Ok(UnitOfWork::new(workflow.name(), ctx.to_snapshot()))
    }

    /// Execute one leased unit of work.
    pub async fn execute(&self, job_id: JobId, unit: &UnitOfWork) -> Execution {
        let workflow = match self.registry.get(&unit.workflow) {
            Ok(workflow) => workflow,
            Err(err) => {
                return Execution {
                    result: Err(err),
                    context: unit.context.clone(),
                };
            }
        };

        let runner = Runner::new(workflow, Arc::clone(&self.queue), job_id, self.config.clone());
        let mut ctx = Context::from_snapshot(unit.context.clone());
        let result = runner.run(&mut ctx).await;
        Execution {
            result,
            context: ctx.to_snapshot(),
        }
    }
}
