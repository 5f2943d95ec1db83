//! Lifecycle hooks (before / around / after / on-error) and their registry.
//!
//! Order per task:
//! before(global -> specific) -> around(outer -> inner) -> body
//! -> around(inner -> outer) -> after(specific -> global).
//! Error hooks run global -> specific once a task-level error is final.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;

use super::context::Context;
use super::errors::{BoxError, WorkflowError};

pub type HookFn = Arc<dyn Fn(&Context) -> Result<(), BoxError> + Send + Sync>;

pub type ErrorHookFn = Arc<dyn Fn(&Context, &WorkflowError) -> Result<(), BoxError> + Send + Sync>;

pub type AroundFn = Arc<
    dyn for<'a> Fn(&'a Context, TaskCallable<'a>) -> BoxFuture<'a, Result<(), BoxError>>
        + Send
        + Sync,
>;

/// Call-once handle given to an around hook to run the next layer
/// (an inner around hook, or ultimately the task body).
pub struct TaskCallable<'a> {
    task_name: &'a str,
    next: Option<BoxFuture<'a, Result<(), WorkflowError>>>,
    invoked: &'a AtomicBool,
}

impl<'a> TaskCallable<'a> {
    pub(crate) fn new(
        task_name: &'a str,
        next: BoxFuture<'a, Result<(), WorkflowError>>,
        invoked: &'a AtomicBool,
    ) -> Self {
        Self {
            task_name,
            next: Some(next),
            invoked,
        }
    }

    pub fn task_name(&self) -> &str {
        self.task_name
    }

    pub fn is_invoked(&self) -> bool {
        self.invoked.load(Ordering::SeqCst)
    }

    /// Run the next layer. A second call fails with `HookAlreadyInvoked`.
    pub async fn call(&mut self) -> Result<(), WorkflowError> {
        let next = self.next.take().ok_or_else(|| WorkflowError::HookAlreadyInvoked {
            task: self.task_name.to_string(),
        })?;
        self.invoked.store(true, Ordering::SeqCst);
        next.await
    }
}

/// A before/after hook. Empty `task_names` means global.
#[derive(Clone)]
pub struct Hook {
    pub task_names: Vec<String>,
    pub callback: HookFn,
}

impl Hook {
    pub fn global<F>(f: F) -> Self
    where
        F: Fn(&Context) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        Self::for_tasks(Vec::<String>::new(), f)
    }

    pub fn for_tasks<I, S, F>(task_names: I, f: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&Context) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        Self {
            task_names: task_names.into_iter().map(Into::into).collect(),
            callback: Arc::new(f),
        }
    }
}

#[derive(Clone)]
pub struct AroundHook {
    pub task_names: Vec<String>,
    pub callback: AroundFn,
}

impl AroundHook {
    pub fn global<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a Context, TaskCallable<'a>) -> BoxFuture<'a, Result<(), BoxError>>
            + Send
            + Sync
            + 'static,
    {
        Self::for_tasks(Vec::<String>::new(), f)
    }

    pub fn for_tasks<I, S, F>(task_names: I, f: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: for<'a> Fn(&'a Context, TaskCallable<'a>) -> BoxFuture<'a, Result<(), BoxError>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            task_names: task_names.into_iter().map(Into::into).collect(),
            callback: Arc::new(f),
        }
    }
}

#[derive(Clone)]
pub struct ErrorHook {
    pub task_names: Vec<String>,
    pub callback: ErrorHookFn,
}

impl ErrorHook {
    pub fn global<F>(f: F) -> Self
    where
        F: Fn(&Context, &WorkflowError) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        Self::for_tasks(Vec::<String>::new(), f)
    }

    pub fn for_tasks<I, S, F>(task_names: I, f: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&Context, &WorkflowError) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        Self {
            task_names: task_names.into_iter().map(Into::into).collect(),
            callback: Arc::new(f),
        }
    }
}

/// Hooks of one stage, indexed by task name.
struct Scoped<H> {
    global: Vec<H>,
    by_task: HashMap<String, Vec<H>>,
}

impl<H: Clone> Scoped<H> {
    fn new() -> Self {
        Self {
            global: Vec::new(),
            by_task: HashMap::new(),
        }
    }

    fn add(&mut self, task_names: &[String], hook: H) {
        if task_names.is_empty() {
            self.global.push(hook);
            return;
        }
        for name in task_names {
            self.by_task.entry(name.clone()).or_default().push(hook.clone());
        }
    }

    fn global(&self) -> &[H] {
        &self.global
    }

    fn specific(&self, task_name: &str) -> &[H] {
        self.by_task.get(task_name).map(Vec::as_slice).unwrap_or(&[])
    }

    fn task_names(&self) -> impl Iterator<Item = &String> {
        self.by_task.keys()
    }
}

pub struct HookRegistry {
    before: Scoped<Hook>,
    after: Scoped<Hook>,
    around: Scoped<AroundHook>,
    error: Scoped<ErrorHook>,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            before: Scoped::new(),
            after: Scoped::new(),
            around: Scoped::new(),
            error: Scoped::new(),
        }
    }

    pub fn add_before(&mut self, hook: Hook) {
        let names = hook.task_names.clone();
        self.before.add(&names, hook);
    }

    pub fn add_after(&mut self, hook: Hook) {
        let names = hook.task_names.clone();
        self.after.add(&names, hook);
    }

    pub fn add_around(&mut self, hook: AroundHook) {
        let names = hook.task_names.clone();
        self.around.add(&names, hook);
    }

    pub fn add_error(&mut self, hook: ErrorHook) {
        let names = hook.task_names.clone();
        self.error.add(&names, hook);
    }

    /// Every task name some hook is scoped to.
    pub fn referenced_task_names(&self) -> impl Iterator<Item = &String> {
        self.before
            .task_names()
            .chain(self.after.task_names())
            .chain(self.around.task_names())
            .chain(self.error.task_names())
    }

    pub fn run_before(&self, task_name: &str, ctx: &Context) -> Result<(), WorkflowError> {
        let hooks = self.before.global().iter().chain(self.before.specific(task_name));
        for hook in hooks {
            (hook.callback)(ctx).map_err(|source| WorkflowError::HookFailed {
                task: task_name.to_string(),
                stage: "before",
                source,
            })?;
        }
        Ok(())
    }

    pub fn run_after(&self, task_name: &str, ctx: &Context) -> Result<(), WorkflowError> {
        let hooks = self.after.specific(task_name).iter().chain(self.after.global());
        for hook in hooks {
            (hook.callback)(ctx).map_err(|source| WorkflowError::HookFailed {
                task: task_name.to_string(),
                stage: "after",
                source,
            })?;
        }
        Ok(())
    }

    /// Notify error hooks. A failing error hook is only logged; the caller
    /// still re-raises `error`.
    pub fn run_error(&self, task_name: &str, ctx: &Context, error: &WorkflowError) {
        let hooks = self.error.global().iter().chain(self.error.specific(task_name));
        for hook in hooks {
            if let Err(e) = (hook.callback)(ctx, error) {
                tracing::error!(task = task_name, error = %e, "error hook failed");
            }
        }
    }

    /// Around hooks outermost first.
    pub fn around_for(&self, task_name: &str) -> Vec<&AroundHook> {
        self.around
            .global()
            .iter()
            .chain(self.around.specific(task_name))
            .collect()
    }
}
