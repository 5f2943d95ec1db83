//! Hierarchical task namespaces (`parent:child`).

use std::fmt;

/// A namespace a task is declared in.
///
/// The default namespace has an empty name and no parent; tasks declared in
/// it keep their bare name.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Namespace {
    name: String,
    parent: Option<Box<Namespace>>,
}

impl Namespace {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
        }
    }

    /// Create a namespace nested under `self`.
    pub fn child(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: Some(Box::new(self.clone())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&Namespace> {
        self.parent.as_deref()
    }

    pub fn is_default(&self) -> bool {
        self.full_name().is_empty()
    }

    /// Colon-joined chain from the root to this namespace.
    pub fn full_name(&self) -> String {
        let mut parts = Vec::new();
        let mut current = Some(self);
        while let Some(ns) = current {
            if !ns.name.is_empty() {
                parts.push(ns.name.as_str());
            }
            current = ns.parent.as_deref();
        }
        parts.reverse();
        parts.join(":")
    }

    /// Qualify a task name with this namespace.
    pub fn qualify(&self, task_name: &str) -> String {
        let full = self.full_name();
        if full.is_empty() {
            task_name.to_string()
        } else {
            format!("{full}:{task_name}")
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name())
    }
}
