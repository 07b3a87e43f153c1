//! `@.Assert.*` extensions.

use serde_json::Value;

use crate::comparison::{deep_equal, evaluate, to_text};
use crate::context::OperationContext;
use crate::errors::{AssertionFailure, IslError, Result};
use crate::functions::{sync_extension, FunctionCall};

/// Two-argument assertions and the operator each one checks.
const COMPARISONS: [(&str, &str); 18] = [
    ("Equal", "=="),
    ("NotEqual", "!="),
    ("LessThan", "<"),
    ("LessThanOrEqual", "<="),
    ("GreaterThan", ">"),
    ("GreaterThanOrEqual", ">="),
    ("Matches", "matches"),
    ("NotMatches", "!matches"),
    ("Contains", "contains"),
    ("NotContains", "!contains"),
    ("StartsWith", "startswith"),
    ("NotStartsWith", "!startswith"),
    ("EndsWith", "endswith"),
    ("NotEndsWith", "!endswith"),
    ("In", "in"),
    ("NotIn", "!in"),
    ("IsType", "is"),
    ("IsNotType", "!is"),
];

pub fn register(ctx: &dyn OperationContext) -> Result<()> {
    for (name, operator) in COMPARISONS {
        ctx.register_extension(
            &format!("Assert.{name}"),
            sync_extension(move |call| compare(call, operator)),
        )?;
    }
    ctx.register_extension("Assert.NotNull", sync_extension(|call| presence(call, true)))?;
    ctx.register_extension("Assert.IsNull", sync_extension(|call| presence(call, false)))?;
    Ok(())
}

fn readable(value: &Value) -> String {
    match to_text(value) {
        None => "<null>".to_string(),
        Some(s) if s.is_empty() => "\"\"".to_string(),
        Some(s) if s.trim().is_empty() => format!("\"{s}\""),
        Some(s) => s,
    }
}

fn suffix(message: &Value) -> String {
    match to_text(message) {
        Some(m) => format!(". Additional message: {m}"),
        None => String::new(),
    }
}

fn compare(call: &FunctionCall, operator: &str) -> Result<Value> {
    let expected = call.first();
    let actual = call.second();
    let passed = match operator {
        "==" => deep_equal(expected, actual),
        "!=" => !deep_equal(expected, actual),
        other => evaluate(expected, other, actual).unwrap_or(false),
    };
    if passed {
        return Ok(Value::Null);
    }
    Err(IslError::Assertion(Box::new(AssertionFailure {
        function: call.name.clone(),
        message: format!(
            "{} failed. Expected: \n{}\nReceived: \n{}\n{}",
            call.name,
            readable(expected),
            readable(actual),
            suffix(call.third())
        ),
        expected: Some(expected.clone()),
        actual: Some(actual.clone()),
        position: call.position.clone(),
    })))
}

fn presence(call: &FunctionCall, should_exist: bool) -> Result<Value> {
    let value = call.first();
    let operator = if should_exist { "exists" } else { "notexists" };
    if evaluate(value, operator, &Value::Null).unwrap_or(false) {
        return Ok(Value::Null);
    }
    let problem = if should_exist { "is null" } else { "is not null" };
    Err(IslError::Assertion(Box::new(AssertionFailure {
        function: call.name.clone(),
        message: format!(
            "{} failed. Input value {problem}. Value: {}{}",
            call.name,
            readable(value),
            suffix(call.second())
        ),
        expected: None,
        actual: Some(value.clone()),
        position: call.position.clone(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{BaseContext, ContextRef};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    async fn assert_call(ctx: &ContextRef, name: &str, arguments: Vec<Value>) -> Result<Value> {
        let f = ctx.extension(name).expect("assertion is registered");
        f(FunctionCall::new(name, arguments, ctx.clone())).await
    }

    fn context() -> ContextRef {
        let ctx: ContextRef = Arc::new(BaseContext::new());
        register(ctx.as_ref()).unwrap();
        ctx
    }

    #[tokio::test]
    async fn equality_is_deep_and_ignores_key_order() {
        let ctx = context();
        assert_call(&ctx, "Assert.Equal", vec![json!({"a": 1, "b": [1, "2"]}), json!({"b": [1, 2], "a": "1"})])
            .await
            .unwrap();
        let err = assert_call(&ctx, "Assert.Equal", vec![json!([1, 2]), json!([2, 1]), json!("order")])
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Assert.Equal failed. Expected: \n[1,2]\nReceived: \n[2,1]\n. Additional message: order"
        );
    }

    #[tokio::test]
    async fn operator_assertions() {
        let ctx = context();
        for (name, arguments) in [
            ("Assert.LessThan", vec![json!(1), json!(2)]),
            ("Assert.Contains", vec![json!("Hello World"), json!("world")]),
            ("Assert.NotContains", vec![json!([1, 2]), json!(3)]),
            ("Assert.StartsWith", vec![json!("abc"), json!("ab")]),
            ("Assert.Matches", vec![json!("A-100"), json!("^a-\\d+$")]),
            ("Assert.In", vec![json!("b"), json!(["a", "b"])]),
            ("Assert.IsType", vec![json!([1]), json!("array")]),
            ("Assert.NotNull", vec![json!(0)]),
            ("Assert.IsNull", vec![Value::Null]),
        ] {
            assert!(assert_call(&ctx, name, arguments).await.is_ok(), "{name}");
        }
    }

    #[tokio::test]
    async fn null_checks_report_the_value() {
        let ctx = context();
        let err = assert_call(&ctx, "Assert.NotNull", vec![Value::Null, json!("needed")])
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Assert.NotNull failed. Input value is null. Value: <null>. Additional message: needed"
        );
        let err = assert_call(&ctx, "Assert.IsNull", vec![json!(" ")]).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Assert.IsNull failed. Input value is not null. Value: \" \""
        );
    }
}
