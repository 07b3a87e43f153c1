use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{normalize_variable_name, ContextRef, OperationContext, Variable};
use crate::errors::{IslError, Result};
use crate::functions::{AnnotationFn, ConditionalFn, ExtensionFn, FunctionTable, StatementFn};

/// Cheap per-call scratch scope over a long-lived parent.
///
/// Operation lookups are forwarded to the parent; variables are private and
/// never fall through to the parent.
pub struct LocalContext {
    parent: ContextRef,
    variables: RwLock<HashMap<String, Variable>>,
}

impl LocalContext {
    pub fn new(parent: ContextRef) -> Self {
        Self {
            parent,
            variables: RwLock::new(HashMap::new()),
        }
    }

    pub fn parent(&self) -> &ContextRef {
        &self.parent
    }

    fn unsupported(operation: &'static str) -> IslError {
        IslError::Unsupported {
            operation,
            kind: "local",
        }
    }
}

impl OperationContext for LocalContext {
    fn kind(&self) -> &'static str {
        "local"
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

    fn create_function_child_context(&self, _: Arc<FunctionTable>) -> Result<ContextRef> {
        Ok(Arc::new(LocalContext::new(self.parent.clone())))
    }

    fn use_module_functions(&self, _: Arc<FunctionTable>) -> Result<()> {
        Err(Self::unsupported("switching module functions"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BaseContext;
    use crate::functions::sync_extension;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn variables_stay_local() {
        let parent: ContextRef = Arc::new(BaseContext::new());
        parent.set_variable("$shared", json!(1)).unwrap();

        let local = LocalContext::new(parent.clone());
        local.set_variable("$scratch", json!("x")).unwrap();

        assert_eq!(local.variable("$shared"), None);
        assert_eq!(parent.variable("$scratch"), None);
        assert_eq!(local.variable("$SCRATCH"), Some(json!("x")));
    }

    #[test]
    fn lookups_forward_but_registration_is_refused() {
        let parent: ContextRef = Arc::new(BaseContext::new());
        parent
            .register_extension("Util.Echo", sync_extension(|c| Ok(c.first().clone())))
            .unwrap();
        let local = LocalContext::new(parent);
        assert!(local.extension("util.echo").is_some());

        let err = local
            .register_extension("Util.Other", sync_extension(|_| Ok(json!(null))))
            .unwrap_err();
        assert!(matches!(err, IslError::Unsupported { kind: "local", .. }));
    }
}
