use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use super::{normalize_variable_name, ContextRef, OperationContext, Registries, Variable};
use crate::errors::{IslError, Result};
use crate::functions::{AnnotationFn, ConditionalFn, ExtensionFn, FunctionTable, StatementFn};

/// The full context: owns its variables, shares registries with its family and
/// carries the internal function tier of the module being executed.
pub struct BaseContext {
    variables: RwLock<HashMap<String, Variable>>,
    registries: Registries,
    internals: RwLock<Arc<FunctionTable>>,
    // Only successful lookups land here so later registrations stay visible.
    cache: DashMap<String, ExtensionFn>,
    depth: usize,
}

impl Default for BaseContext {
    fn default() -> Self {
        Self::new()
    }
}

impl BaseContext {
    /// A fresh root with empty registries.
    pub fn new() -> Self {
        Self::with_registries(Registries::default(), Arc::new(FunctionTable::new()), 0)
    }

    /// Builds a context over existing shared registries and its own internal tier.
    pub fn with_registries(registries: Registries, internals: Arc<FunctionTable>, depth: usize) -> Self {
        Self {
            variables: RwLock::new(HashMap::new()),
            registries,
            internals: RwLock::new(internals),
            cache: DashMap::new(),
            depth,
        }
    }

    pub fn into_ref(self) -> ContextRef {
        Arc::new(self)
    }

    pub(crate) fn registries(&self) -> &Registries {
        &self.registries
    }

    /// Same registries, new internals, globals copied.
    pub fn child(&self, internals: Arc<FunctionTable>) -> BaseContext {
        let child = BaseContext::with_registries(self.registries.clone(), internals, self.depth + 1);
        {
            let source = self.variables.read();
            let mut target = child.variables.write();
            for (name, variable) in source.iter().filter(|(_, v)| v.global) {
                target.insert(name.clone(), variable.clone());
            }
        }
        child
    }

    pub(crate) fn cached_lookups(&self) -> usize {
        self.cache.len()
    }
}

impl OperationContext for BaseContext {
    fn kind(&self) -> &'static str {
        "full"
    }

    fn depth(&self) -> usize {
        self.depth
    }

    fn set_record(&self, name: &str, variable: Variable) -> Result<()> {
        let key = normalize_variable_name(name)?;
        let mut variables = self.variables.write();
        if variables.get(&key).is_some_and(|existing| existing.read_only) {
            return Err(IslError::ReadOnlyVariable {
                name: name.to_string(),
            });
        }
        variables.insert(key, variable);
        Ok(())
    }

    fn record(&self, name: &str) -> Option<Variable> {
        self.variables.read().get(&name.to_lowercase()).cloned()
    }

    fn remove_variable(&self, name: &str) {
        self.variables.write().remove(&name.to_lowercase());
    }

    fn variables(&self) -> Vec<(String, Variable)> {
        let mut all: Vec<_> = self
            .variables
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    fn register_extension(&self, name: &str, f: ExtensionFn) -> Result<()> {
        self.registries.extensions.insert(name.to_lowercase(), f);
        Ok(())
    }

    fn register_annotation(&self, name: &str, f: AnnotationFn) -> Result<()> {
        self.registries.annotations.insert(name.to_lowercase(), f);
        Ok(())
    }

    fn register_statement(&self, name: &str, f: StatementFn) -> Result<()> {
        self.registries.statements.insert(name.to_lowercase(), f);
        Ok(())
    }

    fn register_conditional(&self, name: &str, f: ConditionalFn) -> Result<()> {
        self.registries.conditionals.insert(name.to_lowercase(), f);
        Ok(())
    }

    fn extension(&self, name: &str) -> Option<ExtensionFn> {
        let key = name.to_lowercase();
        if let Some(hit) = self.cache.get(&key) {
            return Some(hit.value().clone());
        }
        let internals = self.internals.read().clone();
        let found = self.registries.extension(&internals, &key)?;
        self.cache.insert(key, found.clone());
        Some(found)
    }

    fn annotation(&self, name: &str) -> Option<AnnotationFn> {
        self.registries.annotation(&name.to_lowercase())
    }

    fn statement_extension(&self, name: &str) -> Option<StatementFn> {
        self.registries.statement(&name.to_lowercase())
    }

    fn conditional_extension(&self, name: &str) -> Option<ConditionalFn> {
        self.registries.conditional(&name.to_lowercase())
    }

    fn create_function_child_context(&self, internals: Arc<FunctionTable>) -> Result<ContextRef> {
        Ok(Arc::new(self.child(internals)))
    }

    fn use_module_functions(&self, internals: Arc<FunctionTable>) -> Result<()> {
        *self.internals.write() = internals;
        self.cache.clear();
        Ok(())
    }
}
