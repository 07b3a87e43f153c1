//! `@.Mock.*` and `@.Load.From` extensions, plus the mocked stand-ins handed out
//! by [`TestContext`](super::TestContext) lookups.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use super::mock::{split_index, MockKind, MockTables, SharedMock, MAX_SEQUENCE_INDEX};
use crate::comparison::to_text;
use crate::context::OperationContext;
use crate::errors::{IslError, Result};
use crate::functions::{
    annotation, statement, sync_extension, AnnotationCall, AnnotationFn, ExtensionFn, FunctionCall,
    StatementFn,
};

static FUNCTION_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_]+\.[A-Za-z0-9_]+(#[0-9]+)?$").expect("function name pattern is valid")
});

static ANNOTATION_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+(#[0-9]+)?$").expect("annotation name pattern is valid"));

fn name_pattern(kind: MockKind) -> &'static Regex {
    match kind {
        MockKind::Function | MockKind::Statement => &FUNCTION_NAME,
        MockKind::Annotation => &ANNOTATION_NAME,
    }
}

/// Lowercased mock name, checked against the pattern for `kind`.
pub fn validate_name(name: &Value, kind: MockKind) -> Result<String> {
    let name = to_text(name)
        .map(|n| n.trim().to_lowercase())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| IslError::transform("Function name to mock is not provided.", None))?;
    if !name_pattern(kind).is_match(&name) {
        return Err(IslError::InvalidMockName { name });
    }
    if name.contains('#') && !matches!(split_index(&name).1, Some(i) if i <= MAX_SEQUENCE_INDEX) {
        return Err(IslError::InvalidMockName { name });
    }
    Ok(name)
}

/// Registers one mock; `name` may carry a `#n` sequence index.
pub fn add_mock(
    mocks: &MockTables,
    kind: MockKind,
    name: &str,
    value: Value,
    params: Vec<Value>,
) -> Result<Option<u64>> {
    let name = validate_name(&Value::String(name.to_string()), kind)?;
    let (base, index) = split_index(&name);
    let id = mocks.get_or_create(kind, &base).lock().add(value, params, index);
    debug!(mock = %base, ?kind, ?index, ?id, "registered mock");
    Ok(id)
}

/// Applies a mock document: `{"func": [{name, return, params}], "annotation": [...]}`.
pub fn load_mocks(mocks: &MockTables, document: &Value) -> Result<()> {
    let root = document.as_object().ok_or_else(|| {
        IslError::transform(
            "Mock file must have a root object with 'func' and/or 'annotation' keys",
            None,
        )
    })?;
    for (key, kind) in [("func", MockKind::Function), ("annotation", MockKind::Annotation)] {
        let Some(Value::Array(entries)) = root.get(key) else {
            continue;
        };
        for entry in entries.iter().filter_map(Value::as_object) {
            let name = entry
                .get("name")
                .ok_or_else(|| IslError::transform("Mock entry must have 'name' field", None))?;
            let name = to_text(name)
                .filter(|n| !n.trim().is_empty())
                .ok_or_else(|| IslError::transform("Mock 'name' must be a non-empty string", None))?;
            let value = entry.get("return").cloned().unwrap_or(Value::Null);
            let params = match entry.get("params") {
                Some(Value::Array(params)) => params.clone(),
                _ => Vec::new(),
            };
            add_mock(mocks, kind, &name, value, params)?;
        }
    }
    Ok(())
}

fn register_call(call: &FunctionCall, mocks: &MockTables, kind: MockKind) -> Result<Value> {
    let name = validate_name(call.first(), kind)?;
    let params = call.arguments.iter().skip(2).cloned().collect();
    let id = add_mock(mocks, kind, &name, call.second().clone(), params)?;
    Ok(id.map_or(Value::Null, Value::from))
}

fn captures_call(call: &FunctionCall, mocks: &MockTables, kind: MockKind) -> Result<Value> {
    let name = validate_name(call.first(), kind)?;
    let (base, _) = split_index(&name);
    let mock = mocks.get(kind, &base).ok_or_else(|| {
        IslError::transform(format!("Mock function {base} is not registered."), call.position.clone())
    })?;
    let instance = match call.second() {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    let captures = mock.lock().captures(instance);
    Ok(captures)
}

/// Where relative resource paths are resolved from.
#[derive(Debug, Clone, Default)]
pub struct FileScope {
    pub current_file: Option<String>,
    pub base_path: Option<PathBuf>,
}

impl FileScope {
    fn resolve(&self, call: &FunctionCall, file: &str) -> Result<PathBuf> {
        let base = self.base_path.as_deref().ok_or_else(|| {
            IslError::transform(
                format!("@.{} requires a base path; run tests through `isl test`", call.name),
                call.position.clone(),
            )
        })?;
        let current = self.current_file.as_deref().ok_or_else(|| {
            IslError::transform(
                format!("@.{} requires the current file; run tests through `isl test`", call.name),
                call.position.clone(),
            )
        })?;
        let dir = base
            .join(current)
            .parent()
            .map_or_else(|| base.to_path_buf(), Path::to_path_buf);
        Ok(dir.join(file))
    }

    /// Reads a data file named by the first argument, relative to the current
    /// file. `formats` lists the accepted extensions.
    fn read(&self, call: &FunctionCall, formats: &[DataFormat]) -> Result<Value> {
        let file = to_text(call.first()).ok_or_else(|| {
            IslError::transform(
                format!("@.{} requires a file name (string)", call.name),
                call.position.clone(),
            )
        })?;
        let path = self.resolve(call, &file)?;
        if !path.is_file() {
            return Err(IslError::transform(
                format!("File not found: {} (resolved from {file})", path.display()),
                call.position.clone(),
            ));
        }
        let format = DataFormat::of(&path)
            .filter(|f| formats.contains(f))
            .ok_or_else(|| {
                let supported = formats
                    .iter()
                    .flat_map(|f| f.extensions())
                    .map(|e| format!(".{e}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                IslError::transform(
                    format!("@.{} supports {supported}; got: {file}", call.name),
                    call.position.clone(),
                )
            })?;
        let text = std::fs::read_to_string(&path)?;
        debug!(file = %path.display(), ?format, "loading data file");
        format.parse(&text)
    }
}

/// File formats `@.Mock.Load` and `@.Load.From` understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataFormat {
    Json,
    Yaml,
    Csv,
}

impl DataFormat {
    fn of(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?.to_lowercase();
        match extension.as_str() {
            "json" => Some(Self::Json),
            "yaml" | "yml" => Some(Self::Yaml),
            "csv" => Some(Self::Csv),
            _ => None,
        }
    }

    fn extensions(self) -> &'static [&'static str] {
        match self {
            Self::Json => &["json"],
            Self::Yaml => &["yaml", "yml"],
            Self::Csv => &["csv"],
        }
    }

    fn parse(self, text: &str) -> Result<Value> {
        match self {
            Self::Json => Ok(serde_json::from_str(text)?),
            Self::Yaml => Ok(serde_yaml::from_str(text)?),
            Self::Csv => parse_csv(text),
        }
    }
}

/// First row names the columns; every later row becomes an object of strings.
/// Cells past the header row are keyed `Col{n}`.
fn parse_csv(text: &str) -> Result<Value> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .double_quote(false)
        .escape(Some(b'\\'))
        .from_reader(text.as_bytes());
    let mut records = reader.records();
    let headers = match records.next() {
        Some(record) => record?,
        None => return Ok(Value::Array(Vec::new())),
    };
    let mut rows = Vec::new();
    for record in records {
        let record = record?;
        let row = record
            .iter()
            .enumerate()
            .map(|(i, cell)| {
                let key = headers
                    .get(i)
                    .map_or_else(|| format!("Col{i}"), str::to_string);
                (key, Value::String(cell.to_string()))
            })
            .collect();
        rows.push(Value::Object(row));
    }
    Ok(Value::Array(rows))
}

pub(crate) fn register(
    ctx: &dyn OperationContext,
    mocks: Arc<MockTables>,
    scope: FileScope,
) -> Result<()> {
    for (name, kind) in [
        ("Mock.Func", MockKind::Function),
        ("Mock.Annotation", MockKind::Annotation),
        ("Mock.StatementFunc", MockKind::Statement),
    ] {
        let mocks = mocks.clone();
        ctx.register_extension(name, sync_extension(move |call| register_call(call, &mocks, kind)))?;
    }
    for (name, kind) in [
        ("Mock.GetFuncCaptures", MockKind::Function),
        ("Mock.GetAnnotationCaptures", MockKind::Annotation),
        ("Mock.GetStatementFuncCaptures", MockKind::Statement),
    ] {
        let mocks = mocks.clone();
        ctx.register_extension(name, sync_extension(move |call| captures_call(call, &mocks, kind)))?;
    }

    let load_scope = scope.clone();
    ctx.register_extension(
        "Mock.Load",
        sync_extension(move |call| {
            let document = load_scope.read(call, &[DataFormat::Json, DataFormat::Yaml])?;
            load_mocks(&mocks, &document)?;
            Ok(Value::Null)
        }),
    )?;
    ctx.register_extension(
        "Load.From",
        sync_extension(move |call| {
            scope.read(call, &[DataFormat::Json, DataFormat::Yaml, DataFormat::Csv])
        }),
    )?;
    Ok(())
}

pub(crate) fn mocked_extension(mock: SharedMock) -> ExtensionFn {
    sync_extension(move |call| mock.lock().resolve(&call.arguments))
}

/// Records the annotation arguments, then runs the decorated function.
pub(crate) fn mocked_annotation(mock: SharedMock) -> AnnotationFn {
    annotation(move |call: AnnotationCall| {
        let captured = mock.lock().resolve(&call.arguments);
        async move {
            captured?;
            call.run_next().await
        }
    })
}

/// Records the arguments, runs the block once and yields null.
pub(crate) fn mocked_statement(mock: SharedMock) -> StatementFn {
    statement(move |call: FunctionCall, block| {
        let captured = mock.lock().resolve(&call.arguments);
        async move {
            captured?;
            block().await?;
            Ok(Value::Null)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn names_are_validated_per_kind() {
        assert_eq!(validate_name(&json!("Data.GetData#2"), MockKind::Function).unwrap(), "data.getdata#2");
        assert!(matches!(
            validate_name(&json!("getdata"), MockKind::Function),
            Err(IslError::InvalidMockName { .. })
        ));
        assert_eq!(validate_name(&json!("cache"), MockKind::Annotation).unwrap(), "cache");
        assert!(validate_name(&json!("a.b"), MockKind::Annotation).is_err());
        assert!(validate_name(&Value::Null, MockKind::Function).is_err());
    }

    #[test]
    fn sequence_positions_are_capped() {
        assert!(validate_name(&json!("Api.Get#10000"), MockKind::Function).is_ok());
        for name in ["Api.Get#10001", "Api.Get#4000000000", "Api.Get#0"] {
            assert!(
                matches!(
                    validate_name(&json!(name), MockKind::Function),
                    Err(IslError::InvalidMockName { .. })
                ),
                "{name}"
            );
        }
        let mocks = MockTables::default();
        assert!(add_mock(&mocks, MockKind::Function, "Api.Get#99999999999", json!(1), vec![]).is_err());
        assert!(mocks.get(MockKind::Function, "api.get").is_none());
    }

    #[test]
    fn csv_rows_are_keyed_by_header() {
        let rows = parse_csv("id,name\n1,Ann\n2,\"Bo, Jr\",extra\n").unwrap();
        assert_eq!(
            rows,
            json!([
                {"id": "1", "name": "Ann"},
                {"id": "2", "name": "Bo, Jr", "Col2": "extra"}
            ])
        );
        assert_eq!(parse_csv("").unwrap(), json!([]));
    }

    #[test]
    fn formats_follow_the_extension() {
        assert_eq!(DataFormat::of(Path::new("a/b.YML")), Some(DataFormat::Yaml));
        assert_eq!(DataFormat::of(Path::new("rows.csv")), Some(DataFormat::Csv));
        assert_eq!(DataFormat::of(Path::new("notes.txt")), None);
        assert_eq!(DataFormat::Yaml.parse("a: [1, two]").unwrap(), json!({"a": [1, "two"]}));
    }

    #[test]
    fn documents_register_functions_and_annotations() {
        let mocks = MockTables::default();
        let document = json!({
            "func": [
                {"name": "Api.Get#1", "return": "one"},
                {"name": "Api.Get#2", "return": "two"},
                {"name": "Api.Find", "return": {"id": 7}, "params": [{"kind": "user"}]}
            ],
            "annotation": [{"name": "audit"}]
        });
        load_mocks(&mocks, &document).unwrap();

        let get = mocks.get(MockKind::Function, "api.get").unwrap();
        assert_eq!(get.lock().resolve(&[]).unwrap(), json!("one"));
        assert_eq!(get.lock().resolve(&[]).unwrap(), json!("two"));
        let find = mocks.get(MockKind::Function, "API.FIND").unwrap();
        assert_eq!(find.lock().resolve(&[json!({"kind": "user", "x": 1})]).unwrap(), json!({"id": 7}));
        assert!(mocks.get(MockKind::Annotation, "audit").is_some());
    }

    #[test]
    fn bad_documents_are_rejected() {
        let mocks = MockTables::default();
        assert!(load_mocks(&mocks, &json!([1])).is_err());
        assert!(load_mocks(&mocks, &json!({"func": [{"return": 1}]})).is_err());
        let err = load_mocks(&mocks, &json!({"func": [{"name": "nodot"}]})).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Valid function name to mock must be provided. Invalid function name: nodot"
        );
    }
}
