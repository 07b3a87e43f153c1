//! Variable scopes and operation dispatch.
//!
//! Every script runs against an [`OperationContext`]. A context owns a variable map
//! and resolves operations through three tiers, highest priority first:
//!
//! 1. internal functions of the module currently executing (never inherited),
//! 2. operations registered on the context family (shared by reference),
//! 3. the process-wide [`builtins`](crate::functions::builtins) registry.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use crate::errors::{IslError, Result};
use crate::functions::{
    builtins, AnnotationFn, ConditionalFn, ExtensionFn, FunctionTable, StatementFn,
};

mod base;
mod local;
mod parallel;

pub use base::BaseContext;
pub use local::LocalContext;
pub use parallel::ParallelContext;

pub type ContextRef = Arc<dyn OperationContext>;

/// A bound variable.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub value: Value,
    pub read_only: bool,
    /// Global variables are copied into every function child context.
    pub global: bool,
}

impl Variable {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            read_only: false,
            global: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn global(mut self) -> Self {
        self.global = true;
        self
    }
}

impl From<Value> for Variable {
    fn from(value: Value) -> Self {
        Variable::new(value)
    }
}

/// Validates the `$` prefix and lowercases the name.
pub fn normalize_variable_name(name: &str) -> Result<String> {
    if !name.starts_with('$') || name.len() < 2 {
        return Err(IslError::InvalidVariableName {
            name: name.to_string(),
        });
    }
    Ok(name.to_lowercase())
}

pub trait OperationContext: Send + Sync {
    /// Short name of the variant, used in diagnostics.
    fn kind(&self) -> &'static str;

    /// Number of function frames between this context and the root.
    fn depth(&self) -> usize;

    fn set_record(&self, name: &str, variable: Variable) -> Result<()>;

    fn record(&self, name: &str) -> Option<Variable>;

    fn remove_variable(&self, name: &str);

    /// Snapshot of the variables visible in this scope, sorted by name.
    fn variables(&self) -> Vec<(String, Variable)>;

    fn register_extension(&self, name: &str, f: ExtensionFn) -> Result<()>;
    fn register_annotation(&self, name: &str, f: AnnotationFn) -> Result<()>;
    fn register_statement(&self, name: &str, f: StatementFn) -> Result<()>;
    fn register_conditional(&self, name: &str, f: ConditionalFn) -> Result<()>;

    fn extension(&self, name: &str) -> Option<ExtensionFn>;
    fn annotation(&self, name: &str) -> Option<AnnotationFn>;
    fn statement_extension(&self, name: &str) -> Option<StatementFn>;
    fn conditional_extension(&self, name: &str) -> Option<ConditionalFn>;

    /// Context for a call into a module function: shares the registries,
    /// swaps in `internals` and carries only global variables.
    fn create_function_child_context(&self, internals: Arc<FunctionTable>) -> Result<ContextRef>;

    /// Re-points the internal tier at another module's functions.
    fn use_module_functions(&self, internals: Arc<FunctionTable>) -> Result<()>;

    fn set_variable(&self, name: &str, value: Value) -> Result<()> {
        self.set_record(name, Variable::new(value))
    }

    fn set_variable_with(&self, name: &str, value: Value, read_only: bool, global: bool) -> Result<()> {
        self.set_record(
            name,
            Variable {
                value,
                read_only,
                global,
            },
        )
    }

    fn variable(&self, name: &str) -> Option<Value> {
        self.record(name).map(|v| v.value)
    }
}

/// Registries shared by every context created from the same root.
#[derive(Clone, Default)]
pub struct Registries {
    pub(crate) extensions: Arc<DashMap<String, ExtensionFn>>,
    pub(crate) annotations: Arc<DashMap<String, AnnotationFn>>,
    pub(crate) statements: Arc<DashMap<String, StatementFn>>,
    pub(crate) conditionals: Arc<DashMap<String, ConditionalFn>>,
}

impl Registries {
    /// Resolves an extension method through all three tiers.
    pub(crate) fn extension(&self, internals: &FunctionTable, name: &str) -> Option<ExtensionFn> {
        resolve(
            name,
            Some(internals),
            &self.extensions,
            &builtins().extensions,
        )
    }

    pub(crate) fn annotation(&self, name: &str) -> Option<AnnotationFn> {
        resolve(name, None, &self.annotations, &builtins().annotations)
    }

    pub(crate) fn statement(&self, name: &str) -> Option<StatementFn> {
        resolve(name, None, &self.statements, &builtins().statements)
    }

    pub(crate) fn conditional(&self, name: &str) -> Option<ConditionalFn> {
        resolve(name, None, &self.conditionals, &builtins().conditionals)
    }
}

/// Three-tier lookup: internal, then context-registered, then process-wide builtin.
/// `name` must already be lowercase.
pub fn resolve<T: Clone>(
    name: &str,
    internal: Option<&HashMap<String, T>>,
    registered: &DashMap<String, T>,
    builtin: &HashMap<String, T>,
) -> Option<T> {
    if let Some(found) = internal.and_then(|m| m.get(name)) {
        return Some(found.clone());
    }
    if let Some(found) = registered.get(name) {
        return Some(found.value().clone());
    }
    builtin.get(name).cloned()
}
