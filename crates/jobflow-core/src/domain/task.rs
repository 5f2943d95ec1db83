//! Task definition: an immutable, named unit of work inside a workflow.

use std::sync::Arc;

use super::context::Context;
use super::dependency_wait::DependencyWait;
use super::errors::{BoxError, WorkflowError};
use super::namespace::Namespace;
use super::output::{OutputField, TaskOutput};
use super::retry::TaskRetry;
use super::throttle::TaskThrottle;

pub type TaskBody = Arc<dyn Fn(&Context) -> Result<serde_json::Value, BoxError> + Send + Sync>;

pub type EachSource =
    Arc<dyn Fn(&Context) -> Result<Vec<serde_json::Value>, BoxError> + Send + Sync>;

pub type Condition = Arc<dyn Fn(&Context) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct Task {
    name: String,
    namespace: Namespace,
    qualified_name: String,
    body: TaskBody,
    each: Option<EachSource>,
    depends_on: Vec<String>,
    condition: Option<Condition>,
    retry: TaskRetry,
    throttle: Option<TaskThrottle>,
    dependency_wait: Option<DependencyWait>,
    output_schema: Vec<OutputField>,
    concurrency_limit: Option<u32>,
    dry_run: Option<bool>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("qualified_name", &self.qualified_name)
            .field("depends_on", &self.depends_on)
            .field("is_map", &self.is_map())
            .field("concurrency_limit", &self.concurrency_limit)
            .finish_non_exhaustive()
    }
}

impl Task {
    pub fn builder(name: impl Into<String>) -> TaskBuilder {
        TaskBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// `namespace:name`, or just `name` in the default namespace.
    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    pub fn depends_on(&self) -> &[String] {
        &self.depends_on
    }

    pub fn retry(&self) -> &TaskRetry {
        &self.retry
    }

    pub fn throttle(&self) -> Option<&TaskThrottle> {
        self.throttle.as_ref()
    }

    pub fn dependency_wait(&self) -> Option<&DependencyWait> {
        self.dependency_wait.as_ref()
    }

    pub fn output_schema(&self) -> &[OutputField] {
        &self.output_schema
    }

    pub fn concurrency_limit(&self) -> Option<u32> {
        self.concurrency_limit
    }

    /// Task-level dry-run override; wins over the workflow setting.
    pub fn dry_run_override(&self) -> Option<bool> {
        self.dry_run
    }

    pub fn is_map(&self) -> bool {
        self.each.is_some()
    }

    /// Map task whose iterations run as independent child units of work.
    pub fn is_dispatched_map(&self) -> bool {
        self.is_map() && self.concurrency_limit.is_some()
    }

    pub fn condition_holds(&self, ctx: &Context) -> bool {
        self.condition.as_ref().is_none_or(|c| c(ctx))
    }

    pub fn invoke(&self, ctx: &Context) -> Result<serde_json::Value, BoxError> {
        (self.body)(ctx)
    }

    /// Evaluate the each-source. Non-map tasks yield an empty sequence.
    pub fn each_values(&self, ctx: &Context) -> Result<Vec<serde_json::Value>, WorkflowError> {
        let Some(each) = &self.each else {
            return Ok(Vec::new());
        };
        each(ctx).map_err(|source| WorkflowError::EachFailed {
            task: self.qualified_name.clone(),
            source,
        })
    }

    /// Shape a body result into a [`TaskOutput`].
    ///
    /// Tasks without a declared output shape record nothing.
    pub fn shape_output(
        &self,
        each_index: Option<usize>,
        value: serde_json::Value,
    ) -> Result<Option<TaskOutput>, WorkflowError> {
        if self.output_schema.is_empty() {
            return Ok(None);
        }
        TaskOutput::from_value(&self.qualified_name, each_index, &self.output_schema, value)
            .map(Some)
    }
}

pub struct TaskBuilder {
    name: String,
    namespace: Namespace,
    body: Option<TaskBody>,
    each: Option<EachSource>,
    depends_on: Vec<String>,
    condition: Option<Condition>,
    retry: TaskRetry,
    throttle: Option<TaskThrottle>,
    dependency_wait: Option<DependencyWait>,
    output_schema: Vec<OutputField>,
    concurrency_limit: Option<u32>,
    dry_run: Option<bool>,
}

impl TaskBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Namespace::default(),
            body: None,
            each: None,
            depends_on: Vec::new(),
            condition: None,
            retry: TaskRetry::none(),
            throttle: None,
            dependency_wait: None,
            output_schema: Vec::new(),
            concurrency_limit: None,
            dry_run: None,
        }
    }

    pub fn namespace(mut self, namespace: Namespace) -> Self {
        self.namespace = namespace;
        self
    }

    pub fn body<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context) -> Result<serde_json::Value, BoxError> + Send + Sync + 'static,
    {
        self.body = Some(Arc::new(f));
        self
    }

    pub fn each<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context) -> Result<Vec<serde_json::Value>, BoxError> + Send + Sync + 'static,
    {
        self.each = Some(Arc::new(f));
        self
    }

    /// Qualified names of the tasks this one depends on.
    pub fn depends_on<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            let name = name.into();
            if !self.depends_on.contains(&name) {
                self.depends_on.push(name);
            }
        }
        self
    }

    pub fn condition<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(f));
        self
    }

    pub fn retry(mut self, retry: TaskRetry) -> Self {
        self.retry = retry;
        self
    }

    pub fn throttle(mut self, throttle: TaskThrottle) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn dependency_wait(mut self, wait: DependencyWait) -> Self {
        self.dependency_wait = Some(wait);
        self
    }

    pub fn output(mut self, field: OutputField) -> Self {
        self.output_schema.push(field);
        self
    }

    pub fn concurrency_limit(mut self, limit: u32) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = Some(dry_run);
        self
    }

    pub fn build(self) -> Result<Task, WorkflowError> {
        let qualified_name = self.namespace.qualify(&self.name);
        let invalid = |reason: &str| WorkflowError::InvalidTask {
            task: qualified_name.clone(),
            reason: reason.to_string(),
        };

        if self.name.is_empty() {
            return Err(invalid("task name must not be empty"));
        }
        let Some(body) = self.body else {
            return Err(invalid("task has no body"));
        };
        match self.concurrency_limit {
            Some(_) if self.each.is_none() => {
                return Err(invalid("concurrency_limit requires an each source"));
            }
            Some(0) => return Err(invalid("concurrency_limit must be greater than zero")),
            _ => {}
        }
        if let Some(throttle) = &self.throttle
            && throttle.limit == 0
        {
            return Err(WorkflowError::InvalidThrottleConfig(format!(
                "throttle limit of task {qualified_name} must be greater than zero"
            )));
        }
        if self.depends_on.iter().any(|d| *d == qualified_name) {
            return Err(invalid("task cannot depend on itself"));
        }
        let mut seen = std::collections::HashSet::new();
        for field in &self.output_schema {
            if !seen.insert(field.name.as_str()) {
                return Err(invalid(&format!("duplicate output field {}", field.name)));
            }
        }

        Ok(Task {
            name: self.name,
            namespace: self.namespace,
            qualified_name,
            body,
            each: self.each,
            depends_on: self.depends_on,
            condition: self.condition,
            retry: self.retry,
            throttle: self.throttle,
            dependency_wait: self.dependency_wait,
            output_schema: self.output_schema,
            concurrency_limit: self.concurrency_limit,
            dry_run: self.dry_run,
        })
    }
}
