//! Coercing comparisons shared by conditions, assertions and mock matching.

use std::cmp::Ordering;

use chrono::{DateTime, FixedOffset};
use regex::RegexBuilder;
use serde_json::{Number, Value};

/// Text form of a scalar; `None` for null.
pub fn to_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn to_number(value: &Value) -> Option<Number> {
    match value {
        Value::Number(n) => Some(n.clone()),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<Number>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(Number::from_f64))
        }
        _ => None,
    }
}

fn as_integer(n: &Number) -> Option<i128> {
    n.as_i64().map(i128::from).or_else(|| n.as_u64().map(i128::from))
}

/// Integers compare exactly; anything else compares as f64.
fn compare_numbers(a: &Number, b: &Number) -> Ordering {
    if let (Some(x), Some(y)) = (as_integer(a), as_integer(b)) {
        return x.cmp(&y);
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => Ordering::Equal,
    }
}

fn to_instant(value: &Value) -> Option<DateTime<FixedOffset>> {
    match value {
        Value::String(s) if s.len() >= 20 && s.contains('T') => DateTime::parse_from_rfc3339(s).ok(),
        _ => None,
    }
}

/// Loose equality: nulls only equal nulls, instants compare by epoch second,
/// numbers compare numerically when either side is a number, everything else
/// compares by text.
pub fn equalish(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => return true,
        (Value::Null, _) | (_, Value::Null) => return false,
        _ => {}
    }
    if let (Some(a), Some(b)) = (to_instant(left), to_instant(right)) {
        return a.timestamp() == b.timestamp();
    }
    if left.is_number() || right.is_number() {
        if let (Some(a), Some(b)) = (to_number(left), to_number(right)) {
            return compare_numbers(&a, &b) == Ordering::Equal;
        }
    }
    to_text(left) == to_text(right)
}

/// Ordering used by `<`, `<=`, `>` and `>=`; `None` when one side is null.
pub fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (to_instant(left), to_instant(right)) {
        return Some(a.timestamp().cmp(&b.timestamp()));
    }
    if let (Some(a), Some(b)) = (to_number(left), to_number(right)) {
        return Some(compare_numbers(&a, &b));
    }
    match (to_text(left), to_text(right)) {
        (None, None) => Some(Ordering::Equal),
        (Some(a), Some(b)) => Some(a.cmp(&b)),
        _ => None,
    }
}

/// Truthiness: null, false, empty strings and empty arrays are not valid.
pub fn is_valid(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        _ => true,
    }
}

/// Same as [`is_valid`] but for a value that may be absent.
pub fn is_present(value: Option<&Value>) -> bool {
    value.is_some_and(is_valid)
}

pub fn contains(left: &Value, right: &Value) -> bool {
    if let Value::Array(items) = left {
        return items.iter().any(|item| equalish(item, right));
    }
    match (to_text(left), to_text(right)) {
        (Some(a), Some(b)) => a.to_lowercase().contains(&b.to_lowercase()),
        _ => false,
    }
}

pub fn starts_with(left: &Value, right: &Value) -> Option<bool> {
    let (a, b) = (to_text(left)?, to_text(right)?);
    Some(a.to_lowercase().starts_with(&b.to_lowercase()))
}

pub fn ends_with(left: &Value, right: &Value) -> Option<bool> {
    let (a, b) = (to_text(left)?, to_text(right)?);
    Some(a.to_lowercase().ends_with(&b.to_lowercase()))
}

/// Case-insensitive regex search; an invalid pattern never matches.
pub fn matches(left: &Value, pattern: &Value) -> bool {
    let Some(text) = to_text(left) else {
        return false;
    };
    let pattern = to_text(pattern).unwrap_or_default();
    RegexBuilder::new(&pattern)
        .case_insensitive(true)
        .build()
        .map(|re| re.is_match(&text))
        .unwrap_or(false)
}

/// Type test by name: `number`, `string`, `node`, `array`, `date`, `boolean`.
pub fn is_type(left: &Value, type_name: &Value) -> bool {
    let name = to_text(type_name).unwrap_or_default().to_lowercase();
    match name.as_str() {
        "number" => left.is_number(),
        "string" => left.is_string(),
        "node" | "object" => left.is_object(),
        "array" => left.is_array(),
        "boolean" => left.is_boolean(),
        "date" => to_instant(left).is_some(),
        _ => false,
    }
}

/// Evaluates a built-in operator. `None` means the operator is not built in.
pub fn evaluate(left: &Value, operator: &str, right: &Value) -> Option<bool> {
    let op = operator.to_lowercase();
    let result = match op.as_str() {
        "exists" => is_valid(left),
        "notexists" => !is_valid(left),
        "==" => equalish(left, right),
        "!=" => !equalish(left, right),
        "<" => compare(left, right) == Some(Ordering::Less),
        "<=" => equalish(left, right) || compare(left, right) == Some(Ordering::Less),
        ">" => compare(left, right) == Some(Ordering::Greater),
        ">=" => equalish(left, right) || compare(left, right) == Some(Ordering::Greater),
        "matches" => matches(left, right),
        "!matches" => !matches(left, right),
        "contains" => contains(left, right),
        "!contains" => !contains(left, right),
        "startswith" => starts_with(left, right).unwrap_or(false),
        "!startswith" => starts_with(left, right).map(|b| !b).unwrap_or(false),
        "endswith" => ends_with(left, right).unwrap_or(false),
        "!endswith" => ends_with(left, right).map(|b| !b).unwrap_or(false),
        "in" => contains(right, left),
        "!in" => !contains(right, left),
        "is" => is_type(left, right),
        "!is" => !is_type(left, right),
        _ => return None,
    };
    Some(result)
}

/// Deep equality for assertions: objects ignore key order, arrays are ordered
/// and scalars use [`equalish`].
pub fn deep_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter().all(|(k, v)| b.get(k).is_some_and(|other| deep_equal(v, other)))
        }
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| deep_equal(x, y))
        }
        (Value::Object(_), _) | (_, Value::Object(_)) | (Value::Array(_), _) | (_, Value::Array(_)) => false,
        _ => equalish(left, right),
    }
}
