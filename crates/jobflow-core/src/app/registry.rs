//! Registry of workflows, built once at startup and shared read-only.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::domain::{Workflow, WorkflowError};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("workflow already registered: {0}")]
    DuplicateWorkflow(String),

    #[error("workflow {name} is invalid: {source}")]
    InvalidWorkflow {
        name: String,
        #[source]
        source: WorkflowError,
    },
}

#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: BTreeMap<String, Arc<Workflow>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow under its name. It is validated again here so a
    /// workflow assembled without the builder cannot slip through.
    pub fn register(&mut self, workflow: Workflow) -> Result<Arc<Workflow>, RegistryError> {
        let name = workflow.name().to_string();
        if self.workflows.contains_key(&name) {
            return Err(RegistryError::DuplicateWorkflow(name));
        }
        workflow
            .validate()
            .map_err(|source| RegistryError::InvalidWorkflow {
                name: name.clone(),
                source,
            })?;
        let workflow = Arc::new(workflow);
        self.workflows.insert(name, Arc::clone(&workflow));
        Ok(workflow)
    }

    pub fn get(&self, name: &str) -> Result<Arc<Workflow>, WorkflowError> {
        self.workflows
            .get(name)
            .cloned()
            .ok_or_else(|| WorkflowError::WorkflowNotFound(name.to_string()))
    }

    /// Registered workflow names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.workflows.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Workflow>> {
        self.workflows.values()
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}
