use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;

use crate::context::ContextRef;
use crate::errors::{Position, Result};

pub mod builtins;

pub use builtins::{builtins, Registry};

/// Runs a statement block (or a decorated function body) exactly once.
pub type StatementBlock = Arc<dyn Fn() -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Named callable operation: `@.Service.Method(...)`, modifiers, module functions.
pub type ExtensionFn = Arc<dyn Fn(FunctionCall) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Decorator around a function declaration.
pub type AnnotationFn = Arc<dyn Fn(AnnotationCall) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Extension handed a block it may run any number of times.
pub type StatementFn =
    Arc<dyn Fn(FunctionCall, StatementBlock) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Custom comparison operator usable inside conditions.
pub type ConditionalFn = Arc<dyn Fn(ConditionCall) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Module-local functions keyed by lowercase name (bare, `this.` and `modifier.` aliases).
pub type FunctionTable = HashMap<String, ExtensionFn>;

/// Arguments and environment of one extension invocation.
#[derive(Clone)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: Vec<Value>,
    /// Variable name for each argument that was a bare `$variable` reference.
    pub variables: Vec<Option<String>>,
    pub context: ContextRef,
    pub position: Option<Position>,
}

static NULL: Value = Value::Null;

impl FunctionCall {
    pub fn new(name: impl Into<String>, arguments: Vec<Value>, context: ContextRef) -> Self {
        Self {
            name: name.into(),
            arguments,
            variables: Vec::new(),
            context,
            position: None,
        }
    }

    pub fn with_variables(mut self, variables: Vec<Option<String>>) -> Self {
        self.variables = variables;
        self
    }

    pub fn at(mut self, position: Option<Position>) -> Self {
        self.position = position;
        self
    }

    /// Argument `index`, or null when the caller passed fewer arguments.
    pub fn argument(&self, index: usize) -> &Value {
        self.arguments.get(index).unwrap_or(&NULL)
    }

    pub fn first(&self) -> &Value {
        self.argument(0)
    }

    pub fn second(&self) -> &Value {
        self.argument(1)
    }

    pub fn third(&self) -> &Value {
        self.argument(2)
    }

    /// Name of the variable passed at `index`: either a bare `$variable` argument
    /// or a string value spelled `"$name"`.
    pub fn variable_name(&self, index: usize) -> Option<String> {
        if let Some(Some(name)) = self.variables.get(index) {
            return Some(name.clone());
        }
        match self.arguments.get(index) {
            Some(Value::String(s)) if s.starts_with('$') => Some(s.clone()),
            _ => None,
        }
    }
}

/// One annotation invocation wrapping `function`.
#[derive(Clone)]
pub struct AnnotationCall {
    pub annotation: String,
    pub function: String,
    pub module: String,
    pub arguments: Vec<Value>,
    pub context: ContextRef,
    pub position: Option<Position>,
    pub next: StatementBlock,
}

impl AnnotationCall {
    pub async fn run_next(&self) -> Result<Value> {
        (self.next)().await
    }

    /// Values of the variables bound in the decorated function's scope.
    pub fn function_parameters(&self) -> Vec<Value> {
        self.context
            .variables()
            .into_iter()
            .filter(|(_, v)| !v.global)
            .map(|(_, v)| v.value)
            .collect()
    }
}

#[derive(Clone)]
pub struct ConditionCall {
    pub operator: String,
    pub left: Value,
    pub right: Value,
    pub context: ContextRef,
}

pub fn extension<F, Fut>(f: F) -> ExtensionFn
where
    F: Fn(FunctionCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(move |call| f(call).boxed())
}

/// Wraps a synchronous closure as an extension.
pub fn sync_extension<F>(f: F) -> ExtensionFn
where
    F: Fn(&FunctionCall) -> Result<Value> + Send + Sync + 'static,
{
    Arc::new(move |call| {
        let result = f(&call);
        async move { result }.boxed()
    })
}

pub fn annotation<F, Fut>(f: F) -> AnnotationFn
where
    F: Fn(AnnotationCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(move |call| f(call).boxed())
}

pub fn statement<F, Fut>(f: F) -> StatementFn
where
    F: Fn(FunctionCall, StatementBlock) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(move |call, block| f(call, block).boxed())
}

pub fn conditional<F, Fut>(f: F) -> ConditionalFn
where
    F: Fn(ConditionCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(move |call| f(call).boxed())
}
