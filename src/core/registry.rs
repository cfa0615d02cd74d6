//! Explicit `typeName → constructor` registry used to resolve work specs.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::core::builtin::{EchoWork, FailWork, SleepWork};
use crate::core::work::{Work, WorkSpec};
use crate::core::{AppResult, SchedulerError};
use crate::util::WorkId;

/// Constructor stored in the registry. Receives the item's uuid followed by its args.
pub type WorkConstructor =
    Arc<dyn Fn(&WorkId, &[Value]) -> AppResult<Box<dyn Work>> + Send + Sync>;

/// Mapping from stable type names to work constructors, populated at startup.
#[derive(Clone, Default)]
pub struct WorkRegistry {
    constructors: HashMap<String, WorkConstructor>,
}

impl WorkRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with `Echo`, `Fail`, and `Sleep`.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register("Echo", EchoWork::construct)
            .register("Fail", FailWork::construct)
            .register("Sleep", SleepWork::construct);
        registry
    }

    /// Register (or replace) the constructor for `type_name`.
    pub fn register<F>(&mut self, type_name: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(&WorkId, &[Value]) -> AppResult<Box<dyn Work>> + Send + Sync + 'static,
    {
        self.constructors
            .insert(type_name.into(), Arc::new(constructor));
        self
    }

    /// True if `type_name` resolves.
    #[must_use]
    pub fn contains(&self, type_name: &str) -> bool {
        self.constructors.contains_key(type_name)
    }

    /// Registered type names, sorted.
    #[must_use]
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }

    /// Instantiate the work described by `spec`.
    ///
    /// # Errors
    ///
    /// `UnknownWorkType` if nothing is registered under `spec.type_name`, and
    /// `Construct` if the constructor rejects the arguments.
    pub fn resolve(&self, spec: &WorkSpec) -> Result<Box<dyn Work>, SchedulerError> {
        let constructor = self
            .constructors
            .get(&spec.type_name)
            .ok_or_else(|| SchedulerError::UnknownWorkType(spec.type_name.clone()))?;
        constructor(&spec.uuid, &spec.args).map_err(|e| SchedulerError::Construct {
            type_name: spec.type_name.clone(),
            reason: format!("{e:#}"),
        })
    }
}

impl fmt::Debug for WorkRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkRegistry")
            .field("types", &self.type_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered() {
        let registry = WorkRegistry::with_builtins();
        assert_eq!(registry.type_names(), vec!["Echo", "Fail", "Sleep"]);
    }

    #[test]
    fn unknown_type_is_reported_by_name() {
        let registry = WorkRegistry::with_builtins();
        let err = registry
            .resolve(&WorkSpec::new("a", "Nope"))
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "unknown work type: Nope");
    }

    #[test]
    fn constructor_errors_become_construct_errors() {
        let mut registry = WorkRegistry::new();
        registry.register("Picky", |_, args| {
            anyhow::bail!("expected 2 args, got {}", args.len())
        });
        let err = registry
            .resolve(&WorkSpec::new("a", "Picky"))
            .err()
            .unwrap();
        assert!(matches!(err, SchedulerError::Construct { .. }));
        assert!(err.to_string().contains("expected 2 args, got 0"));
    }
}
