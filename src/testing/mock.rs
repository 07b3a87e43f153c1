//! Structural mock matching and call accounting.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::warn;

use crate::comparison::equalish;
use crate::errors::{IslError, Result};

/// Expected shape of one argument.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuralMatcher {
    expected: Value,
}

impl StructuralMatcher {
    pub fn new(expected: Value) -> Self {
        Self { expected }
    }

    /// Loose matching ignores target fields the matcher does not name; strict
    /// matching refuses them.
    pub fn matches(&self, target: &Value, loose: bool) -> bool {
        shape_matches(&self.expected, target, loose)
    }
}

fn shape_matches(expected: &Value, target: &Value, loose: bool) -> bool {
    match (expected, target) {
        (Value::Object(fields), Value::Object(actual)) => {
            if !loose && actual.keys().any(|k| !fields.contains_key(k)) {
                return false;
            }
            fields
                .iter()
                .all(|(k, v)| actual.get(k).is_some_and(|a| shape_matches(v, a, loose)))
        }
        (Value::Array(items), Value::Array(actual)) => {
            if !loose && actual.len() != items.len() {
                return false;
            }
            items.len() <= actual.len()
                && items.iter().zip(actual).all(|(e, a)| shape_matches(e, a, loose))
        }
        (Value::Object(_) | Value::Array(_), _) | (_, Value::Object(_) | Value::Array(_)) => false,
        _ => equalish(expected, target),
    }
}

/// Positional argument matcher. Every argument the caller passed must satisfy
/// the matcher at its position; in strict mode an argument with no matcher
/// fails. Matchers beyond the last argument are not checked.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamsMatcher {
    params: Vec<StructuralMatcher>,
}

impl ParamsMatcher {
    pub fn new(params: Vec<Value>) -> Self {
        Self {
            params: params.into_iter().map(StructuralMatcher::new).collect(),
        }
    }

    pub fn matches(&self, arguments: &[Value], loose: bool) -> bool {
        arguments
            .iter()
            .enumerate()
            .all(|(i, argument)| match self.params.get(i) {
                Some(matcher) => matcher.matches(argument, loose),
                None => loose,
            })
    }
}

#[derive(Debug)]
struct Matched {
    id: u64,
    matcher: ParamsMatcher,
    value: Value,
    captures: Vec<Vec<Value>>,
}

#[derive(Debug)]
struct Sequenced {
    id: u64,
    matcher: ParamsMatcher,
    values: Vec<Value>,
    calls: usize,
    captures: Vec<Vec<Value>>,
}

/// Pops the next value of an indexed sequence.
fn next_in_sequence(values: &[Value], calls: &mut usize) -> Result<Value> {
    if *calls >= values.len() {
        warn!(expected = values.len(), actual = *calls + 1, "mock exhausted");
        return Err(IslError::MockExhausted {
            expected: values.len(),
            actual: *calls + 1,
        });
    }
    let value = values[*calls].clone();
    *calls += 1;
    Ok(value)
}

fn set_at(values: &mut Vec<Value>, index: usize, value: Value) {
    if values.len() < index {
        values.resize(index, Value::Null);
    }
    values[index - 1] = value;
}

/// Everything registered for one mocked name.
#[derive(Debug, Default)]
pub struct MockObject {
    matched: Vec<Matched>,
    sequenced: Vec<Sequenced>,
    default: Option<Value>,
    default_sequence: Vec<Value>,
    default_calls: usize,
    default_captures: Vec<Vec<Value>>,
    next_id: u64,
}

impl MockObject {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Registers a return value. `index` is 1-based and places the value in a
    /// call sequence. Returns the matcher instance id, or `None` for defaults.
    pub fn add(&mut self, value: Value, params: Vec<Value>, index: Option<usize>) -> Option<u64> {
        if params.is_empty() {
            match index {
                Some(i) => set_at(&mut self.default_sequence, i, value),
                None => self.default = Some(value),
            }
            return None;
        }

        let matcher = ParamsMatcher::new(params);
        match index {
            Some(i) => {
                if let Some(existing) = self.sequenced.iter_mut().find(|s| s.matcher == matcher) {
                    set_at(&mut existing.values, i, value);
                    return Some(existing.id);
                }
                let id = self.allocate_id();
                let mut values = Vec::new();
                set_at(&mut values, i, value);
                self.sequenced.push(Sequenced {
                    id,
                    matcher,
                    values,
                    calls: 0,
                    captures: Vec::new(),
                });
                Some(id)
            }
            None => {
                if let Some(existing) = self.matched.iter_mut().find(|m| m.matcher == matcher) {
                    existing.value = value;
                    return Some(existing.id);
                }
                let id = self.allocate_id();
                self.matched.push(Matched {
                    id,
                    matcher,
                    value,
                    captures: Vec::new(),
                });
                Some(id)
            }
        }
    }

    /// Resolves one call: plain matchers, then sequenced matchers, then defaults.
    pub fn resolve(&mut self, arguments: &[Value]) -> Result<Value> {
        self.resolve_with(arguments, true)
    }

    pub fn resolve_with(&mut self, arguments: &[Value], loose: bool) -> Result<Value> {
        if let Some(hit) = self
            .matched
            .iter_mut()
            .find(|m| m.matcher.matches(arguments, loose))
        {
            hit.captures.push(arguments.to_vec());
            return Ok(hit.value.clone());
        }

        if let Some(hit) = self
            .sequenced
            .iter_mut()
            .find(|s| s.matcher.matches(arguments, loose))
        {
            hit.captures.push(arguments.to_vec());
            return next_in_sequence(&hit.values, &mut hit.calls);
        }

        self.default_captures.push(arguments.to_vec());
        if !self.default_sequence.is_empty() {
            return next_in_sequence(&self.default_sequence, &mut self.default_calls);
        }
        Ok(self.default.clone().unwrap_or(Value::Null))
    }

    /// Captured argument lists: one matcher's when `instance` is given, otherwise
    /// every matcher's followed by the default's. Null when nothing was captured.
    pub fn captures(&self, instance: Option<u64>) -> Value {
        let mut all: Vec<Value> = Vec::new();
        let mut collect = |captures: &[Vec<Value>]| {
            all.extend(captures.iter().map(|args| Value::Array(args.clone())));
        };
        match instance {
            Some(id) => {
                self.matched
                    .iter()
                    .filter(|m| m.id == id)
                    .for_each(|m| collect(&m.captures));
                self.sequenced
                    .iter()
                    .filter(|s| s.id == id)
                    .for_each(|s| collect(&s.captures));
            }
            None => {
                let mut by_id: Vec<(u64, &[Vec<Value>])> = self
                    .matched
                    .iter()
                    .map(|m| (m.id, m.captures.as_slice()))
                    .chain(self.sequenced.iter().map(|s| (s.id, s.captures.as_slice())))
                    .collect();
                by_id.sort_by_key(|(id, _)| *id);
                for (_, captures) in by_id {
                    collect(captures);
                }
                collect(&self.default_captures);
            }
        }
        if all.is_empty() {
            Value::Null
        } else {
            Value::Array(all)
        }
    }
}

/// Which dispatch table a mock replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockKind {
    Function,
    Annotation,
    Statement,
}

pub type SharedMock = Arc<Mutex<MockObject>>;

/// Mocks of one test context family, keyed by lowercase base name.
#[derive(Default)]
pub struct MockTables {
    functions: DashMap<String, SharedMock>,
    annotations: DashMap<String, SharedMock>,
    statements: DashMap<String, SharedMock>,
}

impl MockTables {
    fn table(&self, kind: MockKind) -> &DashMap<String, SharedMock> {
        match kind {
            MockKind::Function => &self.functions,
            MockKind::Annotation => &self.annotations,
            MockKind::Statement => &self.statements,
        }
    }

    pub fn get(&self, kind: MockKind, name: &str) -> Option<SharedMock> {
        self.table(kind)
            .get(&name.to_lowercase())
            .map(|m| m.value().clone())
    }

    pub fn get_or_create(&self, kind: MockKind, name: &str) -> SharedMock {
        self.table(kind)
            .entry(name.to_lowercase())
            .or_default()
            .value()
            .clone()
    }
}

/// Highest `#n` sequence position a mock name may carry.
pub const MAX_SEQUENCE_INDEX: usize = 10_000;

/// Splits an optional `#n` suffix (n >= 1) off a mock name.
pub fn split_index(name: &str) -> (String, Option<usize>) {
    if let Some((base, index)) = name.rsplit_once('#') {
        if let Ok(i) = index.parse::<usize>() {
            if i >= 1 {
                return (base.to_string(), Some(i));
            }
        }
    }
    (name.to_string(), None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn loose_objects_ignore_extra_fields() {
        let m = StructuralMatcher::new(json!({"result": "yes"}));
        assert!(m.matches(&json!({"result": "yes", "other": "ignored"}), true));
        assert!(!m.matches(&json!({"result": "no"}), true));
        assert!(!m.matches(&json!({"result": "yes", "other": "ignored"}), false));
        assert!(!m.matches(&json!({}), true));
    }

    #[test]
    fn scalars_are_coerced_and_shapes_must_agree() {
        assert!(StructuralMatcher::new(json!(1)).matches(&json!("1"), true));
        assert!(!StructuralMatcher::new(json!("x")).matches(&json!({"x": 1}), true));
        assert!(!StructuralMatcher::new(json!([1])).matches(&json!(1), true));
        assert!(StructuralMatcher::new(json!({})).matches(&json!({"any": true}), true));
    }

    #[test]
    fn arrays_match_by_position() {
        let m = StructuralMatcher::new(json!([{"id": 1}, 2]));
        assert!(m.matches(&json!([{"id": 1, "x": 0}, 2, 3]), true));
        assert!(!m.matches(&json!([{"id": 1}, 2, 3]), false));
        assert!(!m.matches(&json!([{"id": 1}]), true));
    }

    #[test]
    fn params_match_positionally() {
        let params = ParamsMatcher::new(vec![json!({"result": "yes"})]);
        assert!(params.matches(&[json!({"result": "yes", "other": "ignored"})], true));
        assert!(!params.matches(&[json!({"result": "no"})], true));
        // unmatched trailing matchers are skipped
        assert!(ParamsMatcher::new(vec![json!(1), json!(2)]).matches(&[json!(1)], true));
        assert!(ParamsMatcher::new(vec![json!(1), Value::Null]).matches(&[json!(1)], true));
        assert!(ParamsMatcher::new(vec![json!(1)]).matches(&[], false));
        assert!(ParamsMatcher::new(vec![json!(1)]).matches(&[json!(1), json!(2)], true));
        assert!(!ParamsMatcher::new(vec![json!(1)]).matches(&[json!(1), json!(2)], false));
        assert!(!ParamsMatcher::new(vec![json!(1), json!(2)]).matches(&[json!(1), json!(3)], true));
    }

    #[test]
    fn indexed_defaults_exhaust() {
        let mut mock = MockObject::new();
        assert_eq!(mock.add(json!(5), vec![], Some(1)), None);
        mock.add(json!(3), vec![], Some(2));
        assert_eq!(mock.resolve(&[]).unwrap(), json!(5));
        assert_eq!(mock.resolve(&[]).unwrap(), json!(3));
        let err = mock.resolve(&[]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Mock exhausted: expected at most 2 call(s), but got call #3"
        );
    }

    #[test]
    fn plain_matchers_win_then_sequences_then_default() {
        let mut mock = MockObject::new();
        mock.add(json!("fallback"), vec![], None);
        let seq = mock.add(json!("first"), vec![json!("b")], Some(1)).unwrap();
        let plain = mock.add(json!("a!"), vec![json!("a")], None).unwrap();
        assert_ne!(seq, plain);
        assert_eq!(mock.add(json!("a!!"), vec![json!("a")], None), Some(plain));

        assert_eq!(mock.resolve(&[json!("a")]).unwrap(), json!("a!!"));
        assert_eq!(mock.resolve(&[json!("b")]).unwrap(), json!("first"));
        assert!(mock.resolve(&[json!("b")]).is_err());
        assert_eq!(mock.resolve(&[json!("c")]).unwrap(), json!("fallback"));
        assert_eq!(mock.resolve(&[json!("d")]).unwrap(), json!("fallback"));
    }

    #[test]
    fn unset_default_returns_null() {
        let mut mock = MockObject::new();
        mock.add(json!(1), vec![json!("only")], None);
        assert_eq!(mock.resolve(&[json!("other")]).unwrap(), Value::Null);
    }

    #[test]
    fn captures_by_instance_and_overall() {
        let mut mock = MockObject::new();
        assert_eq!(mock.captures(None), Value::Null);
        let id = mock.add(json!(1), vec![json!("x")], None).unwrap();
        mock.resolve(&[json!("x"), json!(2)]).unwrap();
        mock.resolve(&[json!("y")]).unwrap();

        assert_eq!(mock.captures(Some(id)), json!([["x", 2]]));
        assert_eq!(mock.captures(None), json!([["x", 2], ["y"]]));
        assert_eq!(mock.captures(Some(99)), Value::Null);
    }

    #[test]
    fn tables_are_case_insensitive() {
        let tables = MockTables::default();
        tables
            .get_or_create(MockKind::Function, "Data.Get")
            .lock()
            .add(json!(1), vec![], None);
        assert!(tables.get(MockKind::Function, "data.get").is_some());
        assert!(tables.get(MockKind::Annotation, "data.get").is_none());
    }

    #[test]
    fn index_suffix() {
        assert_eq!(split_index("data.get#2"), ("data.get".to_string(), Some(2)));
        assert_eq!(split_index("data.get#0"), ("data.get#0".to_string(), None));
        assert_eq!(split_index("data.get"), ("data.get".to_string(), None));
    }
}
