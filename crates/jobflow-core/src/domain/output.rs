//! Task outputs: per-task, per-each-index results.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::errors::WorkflowError;

/// One declared output field (`name: type`).
///
/// The type name is informational; values are stored as JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputField {
    pub name: String,
    pub type_name: String,
}

impl OutputField {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// The recorded result of one task execution (or one map iteration).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub task_name: String,
    pub each_index: Option<usize>,
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl TaskOutput {
    /// Shape a body's return value according to the declared schema.
    ///
    /// Only declared fields are kept; missing ones are recorded as `null`.
    pub fn from_value(
        task_name: &str,
        each_index: Option<usize>,
        schema: &[OutputField],
        value: serde_json::Value,
    ) -> Result<Self, WorkflowError> {
        let mut returned = match value {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                return Err(WorkflowError::InvalidOutput {
                    task: task_name.to_string(),
                    reason: format!("expected an object, got {other}"),
                });
            }
        };

        let mut data = serde_json::Map::new();
        for field in schema {
            let v = returned.remove(&field.name).unwrap_or(serde_json::Value::Null);
            data.insert(field.name.clone(), v);
        }

        Ok(Self {
            task_name: task_name.to_string(),
            each_index,
            data,
        })
    }

    /// Position in the task's output array (0 for non-map tasks).
    pub fn index(&self) -> usize {
        self.each_index.unwrap_or(0)
    }

    pub fn get(&self, field: &str) -> Result<&serde_json::Value, WorkflowError> {
        self.data
            .get(field)
            .ok_or_else(|| WorkflowError::OutputFieldNotFound {
                task: self.task_name.clone(),
                field: field.to_string(),
            })
    }

    pub fn get_as<T: DeserializeOwned>(&self, field: &str) -> Result<T, WorkflowError> {
        let v = self.get(field)?;
        Ok(serde_json::from_value(v.clone())?)
    }
}

/// Running store of task outputs: `task_name -> each_index -> TaskOutput`.
///
/// Dispatched iterations can finish out of order, so indices may be missing
/// until every iteration has been merged. Indices come off the wire, so they
/// are keys, never offsets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Output {
    by_task: BTreeMap<String, BTreeMap<usize, TaskOutput>>,
}

impl Output {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or overwrite) an output at its each-index.
    pub fn add(&mut self, output: TaskOutput) {
        self.by_task
            .entry(output.task_name.clone())
            .or_default()
            .insert(output.index(), output);
    }

    pub fn extend(&mut self, outputs: impl IntoIterator<Item = TaskOutput>) {
        for o in outputs {
            self.add(o);
        }
    }

    /// Recorded outputs of a task in index order.
    pub fn get(&self, task_name: &str) -> Vec<&TaskOutput> {
        self.by_task
            .get(task_name)
            .map(|slots| slots.values().collect())
            .unwrap_or_default()
    }

    pub fn get_at(&self, task_name: &str, index: usize) -> Result<&TaskOutput, WorkflowError> {
        self.by_task
            .get(task_name)
            .and_then(|slots| slots.get(&index))
            .ok_or_else(|| WorkflowError::OutputNotFound {
                task: task_name.to_string(),
                index,
            })
    }

    /// Shortcut for a non-map task's single output.
    pub fn first(&self, task_name: &str) -> Result<&TaskOutput, WorkflowError> {
        self.get_at(task_name, 0)
    }

    pub fn contains(&self, task_name: &str, index: usize) -> bool {
        self.get_at(task_name, index).is_ok()
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.by_task.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.by_task.values().all(BTreeMap::is_empty)
    }

    /// Flat list of every recorded output (wire format order).
    pub fn flat_outputs(&self) -> Vec<TaskOutput> {
        self.by_task
            .values()
            .flat_map(|slots| slots.values().cloned())
            .collect()
    }
}
