//! The process-wide registry every context falls back to.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use itertools::Itertools;
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use super::{
    annotation, extension, statement, sync_extension, AnnotationCall, AnnotationFn, ConditionalFn,
    ExtensionFn, FunctionCall, StatementFn,
};
use crate::comparison::to_text;
use crate::errors::Result;
use crate::pagination;

/// Operation tables keyed by lowercase name.
///
/// Built once and never mutated afterwards; contexts only read from it.
#[derive(Clone, Default)]
pub struct Registry {
    pub(crate) extensions: HashMap<String, ExtensionFn>,
    pub(crate) annotations: HashMap<String, AnnotationFn>,
    pub(crate) statements: HashMap<String, StatementFn>,
    pub(crate) conditionals: HashMap<String, ConditionalFn>,
}

static BUILTINS: Lazy<Registry> = Lazy::new(Registry::with_builtins);

/// Shared builtin registry, constructed on first use.
pub fn builtins() -> &'static Registry {
    &BUILTINS
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        registry.register_statement("Pagination.Page", statement(pagination::page));
        registry.register_statement("Pagination.Cursor", statement(pagination::cursor));
        registry.register_statement("Pagination.Date", statement(pagination::date));

        registry.register_annotation("defaultCache", annotation(default_cache));

        registry.register_extension("Run.Sleep", extension(sleep));
        registry.register_extension(
            "UUID.New",
            sync_extension(|_| Ok(Value::String(uuid::Uuid::new_v4().to_string()))),
        );
        registry.register_extension(
            "Date.Now",
            sync_extension(|_| Ok(Value::String(pagination::format_date(&Utc::now())))),
        );

        registry.register_extension("Log.Debug", sync_extension(|c| log(c, tracing::Level::DEBUG)));
        registry.register_extension("Log.Info", sync_extension(|c| log(c, tracing::Level::INFO)));
        registry.register_extension("Log.Warn", sync_extension(|c| log(c, tracing::Level::WARN)));
        registry.register_extension("Log.Error", sync_extension(|c| log(c, tracing::Level::ERROR)));

        registry.register_extension("modifier.lower", sync_extension(|c| Ok(lower(c.first()))));
        registry.register_extension("modifier.upper", sync_extension(|c| Ok(upper(c.first()))));
        registry.register_extension("modifier.first", sync_extension(|c| Ok(first(c.first()))));
        registry.register_extension("modifier.unique", sync_extension(|c| Ok(unique(c.first()))));
        registry.register_extension(
            "modifier.default",
            sync_extension(|c| Ok(or_default(c.first(), c.second()))),
        );
        registry.register_extension("modifier.length", sync_extension(|c| Ok(length(c.first()))));

        registry
    }

    pub fn register_extension(&mut self, name: &str, f: ExtensionFn) {
        self.extensions.insert(name.to_lowercase(), f);
    }

    pub fn register_annotation(&mut self, name: &str, f: AnnotationFn) {
        self.annotations.insert(name.to_lowercase(), f);
    }

    pub fn register_statement(&mut self, name: &str, f: StatementFn) {
        self.statements.insert(name.to_lowercase(), f);
    }

    pub fn register_conditional(&mut self, name: &str, f: ConditionalFn) {
        self.conditionals.insert(name.to_lowercase(), f);
    }

    pub fn extension(&self, name: &str) -> Option<ExtensionFn> {
        self.extensions.get(&name.to_lowercase()).cloned()
    }

    pub fn annotation(&self, name: &str) -> Option<AnnotationFn> {
        self.annotations.get(&name.to_lowercase()).cloned()
    }

    pub fn statement(&self, name: &str) -> Option<StatementFn> {
        self.statements.get(&name.to_lowercase()).cloned()
    }
}

async fn sleep(call: FunctionCall) -> Result<Value> {
    let millis = match call.first() {
        Value::Number(n) => n.as_u64().unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    };
    tokio::time::sleep(Duration::from_millis(millis)).await;
    Ok(Value::Null)
}

fn log(call: &FunctionCall, level: tracing::Level) -> Result<Value> {
    let message = call
        .arguments
        .iter()
        .map(|a| to_text(a).unwrap_or_else(|| "null".to_string()))
        .join(" ");
    match level {
        tracing::Level::DEBUG => debug!(target: "isl::script", "{message}"),
        tracing::Level::INFO => info!(target: "isl::script", "{message}"),
        tracing::Level::WARN => warn!(target: "isl::script", "{message}"),
        _ => error!(target: "isl::script", "{message}"),
    }
    Ok(Value::Null)
}

static RESULT_CACHE: Lazy<DashMap<String, Value>> = Lazy::new(DashMap::new);

/// Memoises the decorated function per module, function and arguments.
async fn default_cache(call: AnnotationCall) -> Result<Value> {
    let parameters = if call.arguments.is_empty() {
        call.function_parameters()
    } else {
        call.arguments.clone()
    };
    let key = json!({
        "fn": format!("{}:@{}->{}", call.module, call.annotation, call.function),
        "param": parameters,
    })
    .to_string();

    if let Some(hit) = RESULT_CACHE.get(&key) {
        return Ok(hit.value().clone());
    }
    let result = call.run_next().await?;
    RESULT_CACHE.insert(key, result.clone());
    Ok(result)
}

pub fn lower(value: &Value) -> Value {
    match value {
        Value::String(t) => Value::String(t.to_lowercase()),
        other => other.clone(),
    }
}

pub fn upper(value: &Value) -> Value {
    match value {
        Value::String(t) => Value::String(t.to_uppercase()),
        other => other.clone(),
    }
}

/// First element of an array; null otherwise.
pub fn first(value: &Value) -> Value {
    match value {
        Value::Array(a) => a.first().cloned().unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

/// Deduplicates an array; identity for anything else.
pub fn unique(value: &Value) -> Value {
    match value {
        Value::Array(a) => Value::Array(
            a.iter()
                .cloned()
                .unique_by(|x| serde_json::to_string(x).unwrap_or_default())
                .collect(),
        ),
        other => other.clone(),
    }
}

/// `fallback` when `value` is null, an empty string or an empty array.
pub fn or_default(value: &Value, fallback: &Value) -> Value {
    match value {
        Value::Null => fallback.clone(),
        Value::String(s) if s.is_empty() => fallback.clone(),
        Value::Array(a) if a.is_empty() => fallback.clone(),
        other => other.clone(),
    }
}

pub fn length(value: &Value) -> Value {
    match value {
        Value::String(s) => json!(s.chars().count()),
        Value::Array(a) => json!(a.len()),
        Value::Object(o) => json!(o.len()),
        Value::Null => json!(0),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{BaseContext, ContextRef};
    use futures::FutureExt;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn registry_holds_pagination_and_modifiers() {
        let registry = builtins();
        for name in ["Pagination.Page", "pagination.cursor", "PAGINATION.DATE"] {
            assert!(registry.statement(name).is_some(), "{name}");
        }
        assert!(registry.annotation("defaultcache").is_some());
        assert!(registry.extension("modifier.unique").is_some());
        assert!(registry.extension("Log.Info").is_some());
    }

    #[test]
    fn modifiers() {
        assert_eq!(unique(&json!([1, 1, 2, "2", 3])), json!([1, 2, "2", 3]));
        assert_eq!(first(&json!(["a", "b"])), json!("a"));
        assert_eq!(first(&json!("a")), Value::Null);
        assert_eq!(or_default(&json!([]), &json!({"fallback": true})), json!({"fallback": true}));
        assert_eq!(or_default(&json!(0), &json!(1)), json!(0));
        assert_eq!(length(&json!("héllo")), json!(5));
        assert_eq!(upper(&json!("abc")), json!("ABC"));
    }

    #[tokio::test]
    async fn uuid_is_random() {
        let ctx: ContextRef = Arc::new(BaseContext::new());
        let f = builtins().extension("uuid.new").unwrap();
        let a = f(FunctionCall::new("UUID.New", vec![], ctx.clone())).await.unwrap();
        let b = f(FunctionCall::new("UUID.New", vec![], ctx)).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(a.as_str().map(str::len), Some(36));
    }

    #[tokio::test]
    async fn default_cache_runs_body_once_per_arguments() {
        let ctx: ContextRef = Arc::new(BaseContext::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let cache = builtins().annotation("defaultCache").unwrap();

        let invoke = |arg: Value| {
            let runs = runs.clone();
            let call = AnnotationCall {
                annotation: "defaultCache".into(),
                function: "lookup".into(),
                module: "cache_test".into(),
                arguments: vec![arg],
                context: ctx.clone(),
                position: None,
                next: Arc::new(move || {
                    let runs = runs.clone();
                    async move { Ok(json!(runs.fetch_add(1, Ordering::SeqCst) + 1)) }.boxed()
                }),
            };
            cache(call)
        };

        assert_eq!(invoke(json!("a")).await.unwrap(), json!(1));
        assert_eq!(invoke(json!("a")).await.unwrap(), json!(1));
        assert_eq!(invoke(json!("b")).await.unwrap(), json!(2));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
