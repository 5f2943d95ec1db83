//! Workflow (task graph): the ordered task registry of one job type.
//!
//! Declaration order is the execution order. `depends_on` edges are used for
//! cycle validation and gate the runner's dependency wait; tasks are never
//! reordered topologically.

use std::collections::HashMap;
use std::sync::Arc;

use super::context::Context;
use super::errors::WorkflowError;
use super::hook::{AroundHook, ErrorHook, Hook, HookRegistry};
use super::task::Task;

/// Declared workflow argument.
#[derive(Debug, Clone, PartialEq)]
pub struct ArgumentDef {
    pub name: String,
    pub type_name: String,
    pub default: Option<serde_json::Value>,
}

impl ArgumentDef {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            default: None,
        }
    }

    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// Workflow-level dry-run setting.
#[derive(Clone, Default)]
pub enum DryRun {
    #[default]
    Disabled,
    Enabled,
    /// Resolved per task from the running context.
    Resolve(Arc<dyn Fn(&Context) -> bool + Send + Sync>),
}

impl DryRun {
    fn resolve(&self, ctx: &Context) -> bool {
        match self {
            DryRun::Disabled => false,
            DryRun::Enabled => true,
            DryRun::Resolve(f) => f(ctx),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Gray,
    Black,
}

pub struct Workflow {
    name: String,
    arguments: Vec<ArgumentDef>,
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
    hooks: HookRegistry,
    dry_run: DryRun,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: Vec::new(),
            tasks: Vec::new(),
            index: HashMap::new(),
            hooks: HookRegistry::new(),
            dry_run: DryRun::Disabled,
        }
    }

    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder {
            workflow: Self::new(name),
            error: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arguments(&self) -> &[ArgumentDef] {
        &self.arguments
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut HookRegistry {
        &mut self.hooks
    }

    pub fn set_dry_run(&mut self, dry_run: DryRun) {
        self.dry_run = dry_run;
    }

    pub fn add_argument(&mut self, def: ArgumentDef) {
        match self.arguments.iter_mut().find(|a| a.name == def.name) {
            Some(existing) => *existing = def,
            None => self.arguments.push(def),
        }
    }

    /// Register a task. Qualified names must be unique.
    pub fn add_task(&mut self, task: Task) -> Result<(), WorkflowError> {
        let name = task.qualified_name().to_string();
        if self.index.contains_key(&name) {
            return Err(WorkflowError::DuplicateTask(name));
        }
        self.index.insert(name, self.tasks.len());
        self.tasks.push(task);
        Ok(())
    }

    /// Tasks in declaration order.
    pub fn execution_order(&self) -> &[Task] {
        &self.tasks
    }

    pub fn fetch_task(&self, qualified_name: &str) -> Result<&Task, WorkflowError> {
        self.index
            .get(qualified_name)
            .map(|&i| &self.tasks[i])
            .ok_or_else(|| WorkflowError::TaskNotFound(qualified_name.to_string()))
    }

    pub fn contains(&self, qualified_name: &str) -> bool {
        self.index.contains_key(qualified_name)
    }

    /// Check dependency references and reject cycles.
    ///
    /// A dependency declared after its dependent passes validation but fails
    /// at run time with `DependencyNotFinished`, so it is logged here.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        for (position, task) in self.tasks.iter().enumerate() {
            for dep in task.depends_on() {
                let Some(&dep_position) = self.index.get(dep) else {
                    return Err(WorkflowError::UnknownDependency {
                        task: task.qualified_name().to_string(),
                        dependency: dep.clone(),
                    });
                };
                if dep_position > position {
                    tracing::warn!(
                        workflow = %self.name,
                        task = %task.qualified_name(),
                        dependency = %dep,
                        "dependency is declared after its dependent"
                    );
                }
            }
        }

        if let Some(cycle) = self.detect_cycle() {
            return Err(WorkflowError::CyclicDependency { cycle });
        }

        for name in self.hooks.referenced_task_names() {
            if !self.contains(name) {
                return Err(WorkflowError::TaskNotFound(name.clone()));
            }
        }
        Ok(())
    }

    /// First cycle found by a depth-first walk over `depends_on`, as a path
    /// that starts and ends on the same task.
    fn detect_cycle(&self) -> Option<Vec<String>> {
        let mut marks = vec![Mark::White; self.tasks.len()];
        let mut path = Vec::new();
        for start in 0..self.tasks.len() {
            if marks[start] == Mark::White
                && let Some(cycle) = self.visit(start, &mut marks, &mut path)
            {
                return Some(cycle);
            }
        }
        None
    }

    fn visit(&self, node: usize, marks: &mut [Mark], path: &mut Vec<usize>) -> Option<Vec<String>> {
        marks[node] = Mark::Gray;
        path.push(node);

        for dep in self.tasks[node].depends_on() {
            let Some(&next) = self.index.get(dep) else {
                continue;
            };
            match marks[next] {
                Mark::Gray => {
                    let from = path.iter().position(|&n| n == next).unwrap_or(0);
                    let mut cycle: Vec<String> = path[from..]
                        .iter()
                        .map(|&n| self.tasks[n].qualified_name().to_string())
                        .collect();
                    cycle.push(self.tasks[next].qualified_name().to_string());
                    return Some(cycle);
                }
                Mark::White => {
                    if let Some(cycle) = self.visit(next, marks, path) {
                        return Some(cycle);
                    }
                }
                Mark::Black => {}
            }
        }

        path.pop();
        marks[node] = Mark::Black;
        None
    }

    /// Fresh top-level context: declared defaults merged with `arguments`.
    pub fn build_context(
        &self,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Context, WorkflowError> {
        if let Some(unknown) = arguments
            .keys()
            .find(|k| !self.arguments.iter().any(|a| &a.name == *k))
        {
            return Err(WorkflowError::UnknownArgument(unknown.clone()));
        }

        let mut merged = serde_json::Map::new();
        for def in &self.arguments {
            if let Some(default) = &def.default {
                merged.insert(def.name.clone(), default.clone());
            }
        }
        merged.extend(arguments);
        Ok(Context::new(merged))
    }

    /// Effective dry-run flag for a task: the task override wins.
    pub fn resolve_dry_run(&self, task: &Task, ctx: &Context) -> bool {
        task.dry_run_override()
            .unwrap_or_else(|| self.dry_run.resolve(ctx))
    }
}

pub struct WorkflowBuilder {
    workflow: Workflow,
    error: Option<WorkflowError>,
}

impl WorkflowBuilder {
    pub fn argument(mut self, def: ArgumentDef) -> Self {
        self.workflow.add_argument(def);
        self
    }

    /// Add a task; the first registration error is reported by `build`.
    pub fn task(mut self, task: Result<Task, WorkflowError>) -> Self {
        if self.error.is_some() {
            return self;
        }
        if let Err(e) = task.and_then(|t| self.workflow.add_task(t)) {
            self.error = Some(e);
        }
        self
    }

    pub fn before(mut self, hook: Hook) -> Self {
        self.workflow.hooks.add_before(hook);
        self
    }

    pub fn after(mut self, hook: Hook) -> Self {
        self.workflow.hooks.add_after(hook);
        self
    }

    pub fn around(mut self, hook: AroundHook) -> Self {
        self.workflow.hooks.add_around(hook);
        self
    }

    pub fn on_error(mut self, hook: ErrorHook) -> Self {
        self.workflow.hooks.add_error(hook);
        self
    }

    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.workflow.dry_run = if enabled { DryRun::Enabled } else { DryRun::Disabled };
        self
    }

    pub fn dry_run_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context) -> bool + Send + Sync + 'static,
    {
        self.workflow.dry_run = DryRun::Resolve(Arc::new(f));
        self
    }

    pub fn build(self) -> Result<Workflow, WorkflowError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        self.workflow.validate()?;
        Ok(self.workflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::BoxError;
    use rstest::rstest;
    use serde_json::json;

    fn noop(_: &Context) -> Result<serde_json::Value, BoxError> {
        Ok(json!(null))
    }

    fn task(name: &str, deps: &[&str]) -> Result<Task, WorkflowError> {
        Task::builder(name).body(noop).depends_on(deps.iter().copied()).build()
    }

    fn graph(edges: &[(&str, &[&str])]) -> Workflow {
        let mut wf = Workflow::new("G");
        for (name, deps) in edges {
            wf.add_task(task(name, deps).unwrap()).unwrap();
        }
        wf
    }

    #[rstest]
    #[case::empty(vec![], false)]
    #[case::chain(vec![("a", vec![]), ("b", vec!["a"]), ("c", vec!["b"])], false)]
    #[case::diamond(vec![("a", vec![]), ("b", vec!["a"]), ("c", vec!["a"]), ("d", vec!["b", "c"])], false)]
    #[case::two_cycle(vec![("a", vec!["b"]), ("b", vec!["a"])], true)]
    #[case::three_cycle(vec![("a", vec!["c"]), ("b", vec!["a"]), ("c", vec!["b"])], true)]
    #[case::cycle_behind_dag(vec![("x", vec![]), ("a", vec!["x", "c"]), ("b", vec!["a"]), ("c", vec!["b"])], true)]
    fn validate_fails_only_on_cycles(
        #[case] edges: Vec<(&'static str, Vec<&'static str>)>,
        #[case] cyclic: bool,
    ) {
        let edges: Vec<(&str, &[&str])> = edges.iter().map(|(n, d)| (*n, d.as_slice())).collect();
        let result = graph(&edges).validate();
        assert_eq!(
            matches!(result, Err(WorkflowError::CyclicDependency { .. })),
            cyclic
        );
        if !cyclic {
            assert!(result.is_ok());
        }
    }

    #[test]
    fn cycle_path_starts_and_ends_on_same_task() {
        let err = graph(&[("a", &["b"]), ("b", &["a"])]).validate().unwrap_err();
        let WorkflowError::CyclicDependency { cycle } = err else {
            panic!("expected a cycle");
        };
        assert_eq!(cycle, vec!["a", "b", "a"]);
    }

    #[test]
    fn duplicate_task_is_rejected() {
        let mut wf = Workflow::new("W");
        wf.add_task(task("a", &[]).unwrap()).unwrap();
        let err = wf.add_task(task("a", &[]).unwrap()).unwrap_err();
        assert!(matches!(err, WorkflowError::DuplicateTask(name) if name == "a"));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let err = graph(&[("a", &["missing"])]).validate().unwrap_err();
        assert!(matches!(err, WorkflowError::UnknownDependency { .. }));
    }

    #[test]
    fn execution_order_is_declaration_order() {
        let wf = graph(&[("b", &[]), ("a", &["b"]), ("c", &[])]);
        let names: Vec<_> = wf.execution_order().iter().map(Task::qualified_name).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
        assert!(wf.fetch_task("a").is_ok());
        assert!(matches!(wf.fetch_task("z"), Err(WorkflowError::TaskNotFound(_))));
    }

    #[test]
    fn builder_reports_first_error() {
        let result = Workflow::builder("W")
            .task(task("a", &[]))
            .task(task("a", &[]))
            .build();
        assert!(matches!(result, Err(WorkflowError::DuplicateTask(_))));
    }

    #[test]
    fn hook_for_unknown_task_fails_build() {
        let result = Workflow::builder("W")
            .task(task("a", &[]))
            .before(Hook::for_tasks(["nope"], |_| Ok(())))
            .build();
        assert!(matches!(result, Err(WorkflowError::TaskNotFound(name)) if name == "nope"));
    }

    #[test]
    fn build_context_merges_defaults_and_rejects_unknown() {
        let wf = Workflow::builder("W")
            .argument(ArgumentDef::new("region", "String").with_default(json!("eu")))
            .argument(ArgumentDef::new("user_id", "Integer"))
            .build()
            .unwrap();

        let args = json!({"user_id": 3}).as_object().cloned().unwrap();
        let ctx = wf.build_context(args).unwrap();
        assert_eq!(ctx.argument("region").unwrap(), &json!("eu"));
        assert_eq!(ctx.argument("user_id").unwrap(), &json!(3));

        let args = json!({"region": "us"}).as_object().cloned().unwrap();
        assert_eq!(wf.build_context(args).unwrap().argument("region").unwrap(), &json!("us"));

        let bad = json!({"nope": 1}).as_object().cloned().unwrap();
        assert!(matches!(wf.build_context(bad), Err(WorkflowError::UnknownArgument(_))));
    }

    #[test]
    fn task_dry_run_override_wins() {
        let wf = Workflow::builder("W").dry_run(true).build().unwrap();
        let ctx = Context::default();
        let plain = task("a", &[]).unwrap();
        let live = Task::builder("b").body(noop).dry_run(false).build().unwrap();
        assert!(wf.resolve_dry_run(&plain, &ctx));
        assert!(!wf.resolve_dry_run(&live, &ctx));

        let resolved = Workflow::builder("W")
            .dry_run_with(|ctx| ctx.argument("preview").is_ok())
            .build()
            .unwrap();
        assert!(!resolved.resolve_dry_run(&plain, &ctx));
    }
}
