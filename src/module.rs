//! Compiled modules and the runner that executes their functions.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};

use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, info};

use crate::commands::{evaluate, CommandRef, Native, NativeFn};
use crate::context::ContextRef;
use crate::errors::{IslError, Position, Result};
use crate::functions::{extension, AnnotationCall, ExtensionFn, FunctionCall, FunctionTable, StatementBlock};
use crate::settings;

const STACK_RED_ZONE: usize = 256 * 1024;
const STACK_PER_CALL: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Function,
    Modifier,
}

/// `@name(args)` placed on a function declaration.
#[derive(Clone)]
pub struct AnnotationUse {
    pub name: String,
    pub arguments: Vec<CommandRef>,
    pub position: Option<Position>,
}

pub struct FunctionDeclaration {
    pub name: String,
    pub kind: FunctionKind,
    pub parameters: Vec<String>,
    /// Outermost first.
    pub annotations: Vec<AnnotationUse>,
    pub body: CommandRef,
    pub position: Option<Position>,
}

impl FunctionDeclaration {
    pub fn new(name: impl Into<String>, body: CommandRef) -> Self {
        Self {
            name: name.into(),
            kind: FunctionKind::Function,
            parameters: Vec::new(),
            annotations: Vec::new(),
            body,
            position: None,
        }
    }

    /// A function whose body is implemented by the host.
    pub fn native(name: impl Into<String>, f: NativeFn) -> Self {
        Self::new(name, Arc::new(Native(f)))
    }

    pub fn with_parameters<I, S>(mut self, parameters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parameters = parameters.into_iter().map(Into::into).collect();
        self
    }

    pub fn modifier(mut self) -> Self {
        self.kind = FunctionKind::Modifier;
        self
    }

    pub fn with_annotation(mut self, annotation: AnnotationUse) -> Self {
        self.annotations.push(annotation);
        self
    }

    pub fn has_annotation(&self, name: &str) -> bool {
        self.annotations.iter().any(|a| a.name.eq_ignore_ascii_case(name))
    }
}

/// One compiled script. Functions are addressed case-insensitively and exposed
/// to the internal dispatch tier under their bare name plus `this.` and
/// `modifier.` aliases.
pub struct Module {
    name: String,
    imports: Vec<String>,
    functions: HashMap<String, Arc<FunctionDeclaration>>,
    table: Arc<FunctionTable>,
}

impl Module {
    pub fn new(
        name: impl Into<String>,
        imports: Vec<String>,
        declarations: Vec<FunctionDeclaration>,
    ) -> Arc<Module> {
        let name = name.into();
        Arc::new_cyclic(|this: &Weak<Module>| {
            let mut functions = HashMap::new();
            let mut table = FunctionTable::new();
            for declaration in declarations {
                let key = declaration.name.to_lowercase();
                let run = runner(this.clone(), key.clone());
                table.insert(format!("this.{key}"), run.clone());
                table.insert(format!("modifier.{key}"), run.clone());
                table.insert(key.clone(), run);
                functions.insert(key, Arc::new(declaration));
            }
            Module {
                name,
                imports,
                functions,
                table: Arc::new(table),
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Names of the modules this one imports.
    pub fn imports(&self) -> &[String] {
        &self.imports
    }

    pub fn function(&self, name: &str) -> Option<&Arc<FunctionDeclaration>> {
        self.functions.get(&name.to_lowercase())
    }

    /// Declarations sorted by name.
    pub fn functions(&self) -> Vec<&Arc<FunctionDeclaration>> {
        let mut all: Vec<_> = self.functions.values().collect();
        all.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        all
    }

    pub fn function_table(&self) -> Arc<FunctionTable> {
        self.table.clone()
    }

    /// Callable handle for `name`, suitable for registering elsewhere.
    pub fn runner(&self, name: &str) -> Option<ExtensionFn> {
        self.table.get(&name.to_lowercase()).cloned()
    }

    /// Calls `name` as a nested function: new child frame, positional
    /// parameters bound from `arguments`.
    pub async fn call(&self, name: &str, arguments: Vec<Value>, ctx: &ContextRef) -> Result<Value> {
        let declaration = self.function(name).cloned().ok_or_else(|| {
            IslError::transform(
                format!("Unknown Function @.{}.{}", self.name, name),
                Some(Position::module(&self.name)),
            )
        })?;

        let limit = settings::max_call_depth();
        if ctx.depth() >= limit {
            return Err(IslError::CallDepthExceeded {
                function: format!("{}.{}", self.name, declaration.name),
                limit,
            });
        }

        let child = ctx.create_function_child_context(self.table.clone())?;
        for (parameter, value) in declaration.parameters.iter().zip(arguments) {
            child.set_variable(parameter, value)?;
        }
        // Nested calls deepen the poll chain; grow the stack as it is polled.
        let mut run = self.run_declaration(declaration, child).boxed();
        futures::future::poll_fn(move |cx| {
            stacker::maybe_grow(STACK_RED_ZONE, STACK_PER_CALL, || run.as_mut().poll(cx))
        })
        .await
    }

    /// Runs the annotation chain and body of `declaration` inside `ctx`.
    pub async fn run_declaration(
        &self,
        declaration: Arc<FunctionDeclaration>,
        ctx: ContextRef,
    ) -> Result<Value> {
        let body = declaration.body.clone();
        let body_ctx = ctx.clone();
        let mut next: StatementBlock = Arc::new(move || {
            let body = body.clone();
            let ctx = body_ctx.clone();
            async move { Ok(body.execute(&ctx).await?.into_value()) }.boxed()
        });

        for annotation in declaration.annotations.iter().rev() {
            next = wrap(
                annotation.clone(),
                self.name.clone(),
                declaration.name.clone(),
                ctx.clone(),
                next,
            );
        }
        next().await
    }
}

fn wrap(
    annotation: AnnotationUse,
    module: String,
    function: String,
    ctx: ContextRef,
    inner: StatementBlock,
) -> StatementBlock {
    Arc::new(move || {
        let annotation = annotation.clone();
        let module = module.clone();
        let function = function.clone();
        let ctx = ctx.clone();
        let inner = inner.clone();
        async move {
            let f = ctx.annotation(&annotation.name).ok_or_else(|| {
                IslError::transform(
                    format!("Unknown Annotation: {}", annotation.name),
                    annotation.position.clone(),
                )
            })?;
            let mut arguments = Vec::with_capacity(annotation.arguments.len());
            for argument in &annotation.arguments {
                arguments.push(evaluate(argument, &ctx).await?);
            }
            f(AnnotationCall {
                annotation: annotation.name.clone(),
                function,
                module,
                arguments,
                context: ctx,
                position: annotation.position.clone(),
                next: inner,
            })
            .await
        }
        .boxed()
    })
}

fn runner(module: Weak<Module>, function: String) -> ExtensionFn {
    extension(move |call: FunctionCall| {
        let module = module.upgrade();
        let function = function.clone();
        async move {
            let module = module.ok_or_else(|| {
                IslError::transform(format!("Module owning {function} is no longer loaded"), None)
            })?;
            module.call(&function, call.arguments, &call.context).await
        }
    })
}

/// Runs top-level functions of one module.
#[derive(Clone)]
pub struct Transformer {
    module: Arc<Module>,
}

impl Transformer {
    pub fn new(module: Arc<Module>) -> Self {
        Self { module }
    }

    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }

    /// Runs `function` directly in `ctx`: variables already bound there (such as
    /// `$input`) are visible to the function body.
    pub async fn run(&self, function: &str, ctx: &ContextRef) -> Result<Value> {
        let declaration = self.module.function(function).cloned().ok_or_else(|| {
            IslError::transform(
                format!("Unknown Function @.{}.{}", self.module.name(), function),
                Some(Position::module(self.module.name())),
            )
        })?;

        if ctx.record("$isl").is_none() {
            ctx.set_variable_with("$isl", settings::isl_info(), true, true)?;
        }
        ctx.use_module_functions(self.module.function_table())?;

        info!(module = self.module.name(), function, "running transform");
        let result = self.module.run_declaration(declaration, ctx.clone()).await;
        debug!(module = self.module.name(), function, ok = result.is_ok(), "transform finished");
        result
    }
}
