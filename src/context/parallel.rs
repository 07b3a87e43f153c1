use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use super::{normalize_variable_name, ContextRef, OperationContext, Variable};
use crate::errors::{IslError, Result};
use crate::functions::{AnnotationFn, ConditionalFn, ExtensionFn, FunctionTable, StatementFn};

/// Per-iteration scope for parallel fan-out.
///
/// Reads see the parent's variables plus local ones; writes stay local and are
/// refused when the parent already holds the name, so iterations never race on
/// shared state.
pub struct ParallelContext {
    parent: ContextRef,
    variables: RwLock<HashMap<String, Variable>>,
}

impl ParallelContext {
    pub fn new(parent: ContextRef) -> Self {
        Self {
            parent,
            variables: RwLock::new(HashMap::new()),
        }
    }

    fn unsupported(operation: &'static str) -> IslError {
        IslError::Unsupported {
            operation,
            kind: "parallel",
        }
    }
}

impl OperationContext for ParallelContext {
    fn kind(&self) -> &'static str {
        "parallel"
    }

    fn depth(&self) -> usize {
        self.parent.depth()
    }

    fn set_record(&self, name: &str, variable: Variable) -> Result<()> {
        let key = normalize_variable_name(name)?;
        let mut variables = self.variables.write();
        if variables.get(&key).is_some_and(|existing| existing.read_only) {
            return Err(IslError::ReadOnlyVariable {
                name: name.to_string(),
            });
        }
        // Only the immediate parent's visible scope is checked.
        if self.parent.record(&key).is_some() {
            return Err(IslError::OutsideScope {
                name: name.to_string(),
            });
        }
        variables.insert(key, variable);
        Ok(())
    }

    fn record(&self, name: &str) -> Option<Variable> {
        let key = name.to_lowercase();
        if let Some(local) = self.variables.read().get(&key) {
            return Some(local.clone());
        }
        self.parent.record(&key)
    }

    fn remove_variable(&self, name: &str) {
        self.variables.write().remove(&name.to_lowercase());
    }

    fn variables(&self) -> Vec<(String, Variable)> {
        let mut merged: BTreeMap<String, Variable> = self.parent.variables().into_iter().collect();
        for (k, v) in self.variables.read().iter() {
            merged.insert(k.clone(), v.clone());
        }
        merged.into_iter().collect()
    }

    fn register_extension(&self, _: &str, _: ExtensionFn) -> Result<()> {
        Err(Self::unsupported("registering an extension"))
    }

    fn register_annotation(&self, _: &str, _: AnnotationFn) -> Result<()> {
        Err(Self::unsupported("registering an annotation"))
    }

    fn register_statement(&self, _: &str, _: StatementFn) -> Result<()> {
        Err(Self::unsupported("registering a statement extension"))
    }

    fn register_conditional(&self, _: &str, _: ConditionalFn) -> Result<()> {
        Err(Self::unsupported("registering a conditional extension"))
    }

    fn extension(&self, name: &str) -> Option<ExtensionFn> {
        self.parent.extension(name)
    }

    fn annotation(&self, name: &str) -> Option<AnnotationFn> {
        self.parent.annotation(name)
    }

    fn statement_extension(&self, name: &str) -> Option<StatementFn> {
        self.parent.statement_extension(name)
    }

    fn conditional_extension(&self, name: &str) -> Option<ConditionalFn> {
        self.parent.conditional_extension(name)
    }

    fn create_function_child_context(&self, internals: Arc<FunctionTable>) -> Result<ContextRef> {
        self.parent.create_function_child_context(internals)
    }

    fn use_module_functions(&self, _: Arc<FunctionTable>) -> Result<()> {
        Err(Self::unsupported("switching module functions"))
    }
}
