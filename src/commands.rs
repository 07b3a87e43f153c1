//! Executable command graph produced by a front end.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{stream, FutureExt, StreamExt};
use serde_json::{Map, Value};
use tracing::debug;

use crate::comparison::{self, is_valid};
use crate::context::{ContextRef, ParallelContext};
use crate::errors::{IslError, Position, Result};
use crate::functions::{ConditionCall, ExtensionFn, FunctionCall, StatementBlock};
use crate::module::Module;
use crate::settings;

const DEFAULT_PARALLEL_WORKERS: usize = 6;

/// How a command finished.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Normal(Value),
    /// A `return` was hit; enclosing blocks stop and the function yields this value.
    Return(Value),
}

impl Completion {
    pub fn into_value(self) -> Value {
        match self {
            Completion::Normal(v) | Completion::Return(v) => v,
        }
    }
}

#[async_trait]
pub trait Command: Send + Sync {
    async fn execute(&self, ctx: &ContextRef) -> Result<Completion>;

    /// Set when this command is a bare `$variable` reference.
    fn variable_name(&self) -> Option<&str> {
        None
    }

    /// Assignments do not contribute to a block's value.
    fn is_assignment(&self) -> bool {
        false
    }
}

pub type CommandRef = Arc<dyn Command>;

/// Host-provided body for natively built module functions.
pub type NativeFn = Arc<dyn Fn(ContextRef) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

pub async fn evaluate(command: &CommandRef, ctx: &ContextRef) -> Result<Value> {
    Ok(command.execute(ctx).await?.into_value())
}

async fn evaluate_arguments(
    arguments: &[CommandRef],
    ctx: &ContextRef,
) -> Result<(Vec<Value>, Vec<Option<String>>)> {
    let mut values = Vec::with_capacity(arguments.len());
    let mut variables = Vec::with_capacity(arguments.len());
    for argument in arguments {
        values.push(evaluate(argument, ctx).await?);
        variables.push(argument.variable_name().map(str::to_string));
    }
    Ok((values, variables))
}

async fn invoke(f: ExtensionFn, call: FunctionCall) -> Result<Value> {
    let name = call.name.clone();
    let position = call.position.clone();
    f(call)
        .await
        .map_err(|e| IslError::execution(name, position, e))
}

#[derive(Debug, Clone, PartialEq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Reads `path` out of `value`; missing steps yield null.
pub fn select(value: &Value, path: &[PathSegment]) -> Value {
    let mut current = value;
    for segment in path {
        let next = match (segment, current) {
            (PathSegment::Key(k), Value::Object(map)) => map.get(k),
            (PathSegment::Index(i), Value::Array(items)) => items.get(*i),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}

/// Writes `value` at `path`, creating intermediate objects and padding arrays.
pub fn assign(target: &mut Value, path: &[PathSegment], value: Value) {
    let Some((segment, rest)) = path.split_first() else {
        *target = value;
        return;
    };
    match segment {
        PathSegment::Key(k) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            if let Value::Object(map) = target {
                assign(map.entry(k.clone()).or_insert(Value::Null), rest, value);
            }
        }
        PathSegment::Index(i) => {
            if !target.is_array() {
                *target = Value::Array(Vec::new());
            }
            if let Value::Array(items) = target {
                if items.len() <= *i {
                    items.resize(*i + 1, Value::Null);
                }
                assign(&mut items[*i], rest, value);
            }
        }
    }
}

pub struct Literal(pub Value);

#[async_trait]
impl Command for Literal {
    async fn execute(&self, _: &ContextRef) -> Result<Completion> {
        Ok(Completion::Normal(self.0.clone()))
    }
}

/// `$name.path[0].to`
pub struct VariableSelector {
    pub name: String,
    pub path: Vec<PathSegment>,
}

#[async_trait]
impl Command for VariableSelector {
    async fn execute(&self, ctx: &ContextRef) -> Result<Completion> {
        let value = ctx.variable(&self.name).unwrap_or(Value::Null);
        Ok(Completion::Normal(select(&value, &self.path)))
    }

    fn variable_name(&self) -> Option<&str> {
        self.path.is_empty().then_some(self.name.as_str())
    }
}

pub struct ObjectBuild(pub Vec<(String, CommandRef)>);

#[async_trait]
impl Command for ObjectBuild {
    async fn execute(&self, ctx: &ContextRef) -> Result<Completion> {
        let mut map = Map::new();
        for (key, value) in &self.0 {
            map.insert(key.clone(), evaluate(value, ctx).await?);
        }
        Ok(Completion::Normal(Value::Object(map)))
    }
}

pub struct ArrayBuild(pub Vec<CommandRef>);

#[async_trait]
impl Command for ArrayBuild {
    async fn execute(&self, ctx: &ContextRef) -> Result<Completion> {
        let mut items = Vec::with_capacity(self.0.len());
        for item in &self.0 {
            items.push(evaluate(item, ctx).await?);
        }
        Ok(Completion::Normal(Value::Array(items)))
    }
}

/// `@.Service.Method(args)` resolved through the context at run time.
pub struct Call {
    pub name: String,
    pub arguments: Vec<CommandRef>,
    pub position: Option<Position>,
}

#[async_trait]
impl Command for Call {
    async fn execute(&self, ctx: &ContextRef) -> Result<Completion> {
        let f = ctx.extension(&self.name).ok_or_else(|| {
            IslError::transform(format!("Unknown Function @.{}", self.name), self.position.clone())
        })?;
        let (arguments, variables) = evaluate_arguments(&self.arguments, ctx).await?;
        let call = FunctionCall::new(self.name.clone(), arguments, ctx.clone())
            .with_variables(variables)
            .at(self.position.clone());
        Ok(Completion::Normal(invoke(f, call).await?))
    }
}

/// Call into an imported module, linked at compile time.
pub struct ModuleCall {
    pub module: Arc<Module>,
    pub function: String,
    pub arguments: Vec<CommandRef>,
    pub position: Option<Position>,
}

#[async_trait]
impl Command for ModuleCall {
    async fn execute(&self, ctx: &ContextRef) -> Result<Completion> {
        let (arguments, _) = evaluate_arguments(&self.arguments, ctx).await?;
        let name = format!("{}.{}", self.module.name(), self.function);
        let value = self
            .module
            .call(&self.function, arguments, ctx)
            .await
            .map_err(|e| IslError::execution(name, self.position.clone(), e))?;
        Ok(Completion::Normal(value))
    }
}

/// `@.Pagination.Page($page) { ... }`: a statement extension owning a block.
pub struct StatementCall {
    pub name: String,
    pub arguments: Vec<CommandRef>,
    pub block: CommandRef,
    pub position: Option<Position>,
}

#[async_trait]
impl Command for StatementCall {
    async fn execute(&self, ctx: &ContextRef) -> Result<Completion> {
        let f = ctx.statement_extension(&self.name).ok_or_else(|| {
            IslError::transform(
                format!("Unknown Statement Function @.{}", self.name),
                self.position.clone(),
            )
        })?;
        let (arguments, variables) = evaluate_arguments(&self.arguments, ctx).await?;
        let call = FunctionCall::new(self.name.clone(), arguments, ctx.clone())
            .with_variables(variables)
            .at(self.position.clone());

        let block_ctx = ctx.clone();
        let body = self.block.clone();
        let block: StatementBlock = Arc::new(move || {
            let ctx = block_ctx.clone();
            let body = body.clone();
            async move { Ok(body.execute(&ctx).await?.into_value()) }.boxed()
        });

        let value = f(call, block)
            .await
            .map_err(|e| IslError::execution(self.name.clone(), self.position.clone(), e))?;
        Ok(Completion::Normal(value))
    }
}

/// `input | name(args)`: the piped value becomes the first argument.
pub struct ModifierCall {
    pub input: CommandRef,
    pub name: String,
    pub arguments: Vec<CommandRef>,
    pub position: Option<Position>,
}

#[async_trait]
impl Command for ModifierCall {
    async fn execute(&self, ctx: &ContextRef) -> Result<Completion> {
        let qualified = format!("modifier.{}", self.name);
        let f = ctx
            .extension(&qualified)
            .or_else(|| ctx.extension(&self.name))
            .ok_or_else(|| {
                IslError::transform(format!("Unknown Modifier | {}", self.name), self.position.clone())
            })?;
        let input = evaluate(&self.input, ctx).await?;
        let (mut arguments, mut variables) = evaluate_arguments(&self.arguments, ctx).await?;
        arguments.insert(0, input);
        variables.insert(0, self.input.variable_name().map(str::to_string));
        let call = FunctionCall::new(qualified, arguments, ctx.clone())
            .with_variables(variables)
            .at(self.position.clone());
        Ok(Completion::Normal(invoke(f, call).await?))
    }
}

/// `$name = value` or `$name.a.b = value`.
pub struct Assign {
    pub name: String,
    pub path: Vec<PathSegment>,
    pub value: CommandRef,
}

#[async_trait]
impl Command for Assign {
    async fn execute(&self, ctx: &ContextRef) -> Result<Completion> {
        let value = evaluate(&self.value, ctx).await?;
        if self.path.is_empty() {
            ctx.set_variable(&self.name, value)?;
        } else {
            let mut target = ctx.variable(&self.name).unwrap_or(Value::Null);
            assign(&mut target, &self.path, value);
            ctx.set_variable(&self.name, target)?;
        }
        Ok(Completion::Normal(Value::Null))
    }

    fn is_assignment(&self) -> bool {
        true
    }
}

pub struct Return(pub Option<CommandRef>);

#[async_trait]
impl Command for Return {
    async fn execute(&self, ctx: &ContextRef) -> Result<Completion> {
        let value = match &self.0 {
            Some(command) => evaluate(command, ctx).await?,
            None => Value::Null,
        };
        Ok(Completion::Return(value))
    }
}

/// Statements run in order; the value is the last non-null statement result.
pub struct Statements(pub Vec<CommandRef>);

#[async_trait]
impl Command for Statements {
    async fn execute(&self, ctx: &ContextRef) -> Result<Completion> {
        let mut last = Value::Null;
        for statement in &self.0 {
            match statement.execute(ctx).await? {
                Completion::Return(v) => return Ok(Completion::Return(v)),
                Completion::Normal(v) => {
                    if !statement.is_assignment() && !v.is_null() {
                        last = v;
                    }
                }
            }
        }
        Ok(Completion::Normal(last))
    }
}

pub enum Condition {
    /// `left <op> right`; `right` is absent for `exists`/`notexists`.
    Compare {
        left: CommandRef,
        operator: String,
        right: Option<CommandRef>,
    },
    Truthy(CommandRef),
    Not(Box<Condition>),
    All(Vec<Condition>),
    Any(Vec<Condition>),
}

impl Condition {
    pub fn check<'a>(&'a self, ctx: &'a ContextRef) -> BoxFuture<'a, Result<bool>> {
        async move {
            match self {
                Condition::Truthy(command) => Ok(is_valid(&evaluate(command, ctx).await?)),
                Condition::Not(inner) => Ok(!inner.check(ctx).await?),
                Condition::All(parts) => {
                    for part in parts {
                        if !part.check(ctx).await? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                Condition::Any(parts) => {
                    for part in parts {
                        if part.check(ctx).await? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                Condition::Compare {
                    left,
                    operator,
                    right,
                } => {
                    let left = evaluate(left, ctx).await?;
                    let right = match right {
                        Some(r) => evaluate(r, ctx).await?,
                        None => Value::Null,
                    };
                    if let Some(result) = comparison::evaluate(&left, operator, &right) {
                        return Ok(result);
                    }
                    let custom = ctx.conditional_extension(operator).ok_or_else(|| {
                        IslError::transform(format!("Unknown condition operator {operator}"), None)
                    })?;
                    let result = custom(ConditionCall {
                        operator: operator.clone(),
                        left,
                        right,
                        context: ctx.clone(),
                    })
                    .await?;
                    Ok(is_valid(&result))
                }
            }
        }
        .boxed()
    }
}

pub struct If {
    pub condition: Condition,
    pub then: CommandRef,
    pub otherwise: Option<CommandRef>,
}

#[async_trait]
impl Command for If {
    async fn execute(&self, ctx: &ContextRef) -> Result<Completion> {
        if self.condition.check(ctx).await? {
            self.then.execute(ctx).await
        } else if let Some(otherwise) = &self.otherwise {
            otherwise.execute(ctx).await
        } else {
            Ok(Completion::Normal(Value::Null))
        }
    }
}

fn items_of(source: Value) -> Vec<Value> {
    match source {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

/// `foreach $it in <source> { ... }`: binds `$it` and `$itindex` per item and
/// collects the non-null iteration values.
pub struct ForEach {
    pub iterator: String,
    pub source: CommandRef,
    pub body: CommandRef,
}

impl ForEach {
    async fn run(&self, items: Vec<Value>, ctx: &ContextRef) -> Result<Completion> {
        let index_name = format!("{}index", self.iterator);
        let mut results = Vec::new();
        for (i, item) in items.into_iter().enumerate() {
            ctx.set_variable(&self.iterator, item)?;
            ctx.set_variable(&index_name, Value::from(i))?;
            match self.body.execute(ctx).await? {
                Completion::Return(v) => return Ok(Completion::Return(v)),
                Completion::Normal(Value::Null) => {}
                Completion::Normal(v) => results.push(v),
            }
        }
        Ok(Completion::Normal(Value::Array(results)))
    }
}

#[async_trait]
impl Command for ForEach {
    async fn execute(&self, ctx: &ContextRef) -> Result<Completion> {
        let items = items_of(evaluate(&self.source, ctx).await?);
        self.run(items, ctx).await
    }
}

/// `parallel {workers: n} foreach $it in <source> { ... }`: one Parallel context
/// per item, results in source order.
pub struct ParallelForEach {
    pub inner: ForEach,
    pub options: Option<CommandRef>,
}

#[async_trait]
impl Command for ParallelForEach {
    async fn execute(&self, ctx: &ContextRef) -> Result<Completion> {
        let items = items_of(evaluate(&self.inner.source, ctx).await?);
        let options = match &self.options {
            Some(options) => evaluate(options, ctx).await?,
            None => Value::Null,
        };
        let requested = options
            .get("workers")
            .and_then(|w| w.as_u64().or_else(|| w.as_str()?.trim().parse().ok()))
            .map_or(DEFAULT_PARALLEL_WORKERS, |w| w as usize);
        let workers = requested.clamp(1, settings::max_parallel_workers());

        if workers == 1 {
            return self.inner.run(items, ctx).await;
        }
        debug!(items = items.len(), workers, "parallel foreach");

        let iterator = self.inner.iterator.clone();
        let index_name = format!("{iterator}index");
        let body = &self.inner.body;
        let outcomes: Vec<Result<Value>> = stream::iter(items.into_iter().enumerate())
            .map(|(i, item)| {
                let local: ContextRef = Arc::new(ParallelContext::new(ctx.clone()));
                let iterator = iterator.clone();
                let index_name = index_name.clone();
                async move {
                    local.set_variable(&iterator, item)?;
                    local.set_variable(&index_name, Value::from(i))?;
                    Ok::<Value, IslError>(body.execute(&local).await?.into_value())
                }
            })
            .buffered(workers)
            .collect()
            .await;

        let mut results = Vec::new();
        for outcome in outcomes {
            let value = outcome?;
            if !value.is_null() {
                results.push(value);
            }
        }
        Ok(Completion::Normal(Value::Array(results)))
    }
}

/// Body implemented by the host.
pub struct Native(pub NativeFn);

#[async_trait]
impl Command for Native {
    async fn execute(&self, ctx: &ContextRef) -> Result<Completion> {
        Ok(Completion::Return((self.0)(ctx.clone()).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{BaseContext, OperationContext};
    use crate::functions::sync_extension;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn lit(v: Value) -> CommandRef {
        Arc::new(Literal(v))
    }

    fn var(name: &str) -> CommandRef {
        Arc::new(VariableSelector {
            name: name.into(),
            path: vec![],
        })
    }

    #[test]
    fn property_paths() {
        let mut target = Value::Null;
        assign(
            &mut target,
            &[PathSegment::Key("a".into()), PathSegment::Index(1), PathSegment::Key("b".into())],
            json!(5),
        );
        assert_eq!(target, json!({"a": [null, {"b": 5}]}));
        assert_eq!(
            select(&target, &[PathSegment::Key("a".into()), PathSegment::Index(1)]),
            json!({"b": 5})
        );
        assert_eq!(select(&target, &[PathSegment::Key("zzz".into())]), Value::Null);
    }

    #[tokio::test]
    async fn return_stops_the_block() {
        let ctx: ContextRef = Arc::new(BaseContext::new());
        let block = Statements(vec![
            Arc::new(Assign {
                name: "$a".into(),
                path: vec![],
                value: lit(json!(1)),
            }),
            Arc::new(Return(Some(var("$a")))),
            Arc::new(Assign {
                name: "$a".into(),
                path: vec![],
                value: lit(json!(2)),
            }),
        ]);
        assert_eq!(block.execute(&ctx).await.unwrap(), Completion::Return(json!(1)));
        assert_eq!(ctx.variable("$a"), Some(json!(1)));
    }

    #[tokio::test]
    async fn unknown_call_is_an_error() {
        let ctx: ContextRef = Arc::new(BaseContext::new());
        let call = Call {
            name: "Nope.Missing".into(),
            arguments: vec![],
            position: None,
        };
        let err = call.execute(&ctx).await.unwrap_err();
        assert_eq!(err.to_string(), "Unknown Function @.Nope.Missing");
    }

    #[tokio::test]
    async fn modifiers_receive_the_piped_value() {
        let ctx: ContextRef = Arc::new(BaseContext::new());
        let piped = ModifierCall {
            input: lit(json!("Hello")),
            name: "upper".into(),
            arguments: vec![],
            position: None,
        };
        assert_eq!(evaluate(&(Arc::new(piped) as CommandRef), &ctx).await.unwrap(), json!("HELLO"));
    }

    #[tokio::test]
    async fn custom_conditional_operator() {
        let ctx: ContextRef = Arc::new(BaseContext::new());
        ctx.register_conditional(
            "between",
            crate::functions::conditional(|c: ConditionCall| async move {
                let lo = c.right[0].as_f64().unwrap_or(0.0);
                let hi = c.right[1].as_f64().unwrap_or(0.0);
                let v = c.left.as_f64().unwrap_or(f64::NAN);
                Ok(Value::Bool(v >= lo && v <= hi))
            }),
        )
        .unwrap();
        let condition = Condition::Compare {
            left: lit(json!(5)),
            operator: "between".into(),
            right: Some(lit(json!([1, 10]))),
        };
        assert!(condition.check(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn parallel_foreach_keeps_order() {
        settings::set_max_parallel_workers(8);
        let ctx: ContextRef = Arc::new(BaseContext::new());
        ctx.set_variable("$factor", json!(10)).unwrap();
        ctx.register_extension(
            "Math.Times",
            sync_extension(|c| {
                let a = c.first().as_i64().unwrap_or(0);
                let b = c.second().as_i64().unwrap_or(0);
                Ok(json!(a * b))
            }),
        )
        .unwrap();

        let body: CommandRef = Arc::new(Statements(vec![
            Arc::new(Assign {
                name: "$scaled".into(),
                path: vec![],
                value: Arc::new(Call {
                    name: "Math.Times".into(),
                    arguments: vec![var("$it"), var("$factor")],
                    position: None,
                }),
            }),
            var("$scaled"),
        ]));
        let command = ParallelForEach {
            inner: ForEach {
                iterator: "$it".into(),
                source: lit(json!([1, 2, 3, 4])),
                body,
            },
            options: Some(lit(json!({"workers": 4}))),
        };
        let result = command.execute(&ctx).await.unwrap().into_value();
        assert_eq!(result, json!([10, 20, 30, 40]));
    }
}
