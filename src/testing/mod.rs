//! Script test runner: a mock-aware context, `@test`/`@setup` annotations,
//! assertions, and package-wide test discovery.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::comparison::to_text;
use crate::context::{BaseContext, ContextRef, OperationContext, Variable};
use crate::errors::{IslError, Position, Result};
use crate::functions::{
    annotation, AnnotationCall, AnnotationFn, ConditionalFn, ExtensionFn, FunctionTable, StatementFn,
};
use crate::package::Package;

pub mod assert;
pub mod mock;
pub mod mock_functions;

pub use mock::{MockKind, MockObject, MockTables, ParamsMatcher, StructuralMatcher};
pub use mock_functions::{load_mocks, FileScope};

pub const TEST_ANNOTATION: &str = "test";
pub const SETUP_ANNOTATION: &str = "setup";

/// Outcome of one `@test` function.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub test_file: String,
    pub function_name: String,
    pub test_name: String,
    pub test_group: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

/// Results collected across a test run.
pub type TestResults = Arc<Mutex<Vec<TestResult>>>;

/// A full context whose lookups consult registered mocks first.
pub struct TestContext {
    inner: BaseContext,
    mocks: Arc<MockTables>,
    scope: FileScope,
}

impl TestContext {
    /// A fresh root carrying `@test`, `@setup`, `Assert.*`, `Mock.*` and `Load.From`.
    pub fn create(
        results: TestResults,
        current_file: Option<String>,
        base_path: Option<PathBuf>,
    ) -> Result<Arc<TestContext>> {
        let scope = FileScope {
            current_file,
            base_path,
        };
        let ctx = Arc::new(TestContext {
            inner: BaseContext::new(),
            mocks: Arc::new(MockTables::default()),
            scope: scope.clone(),
        });
        ctx.register_annotation(SETUP_ANNOTATION, annotation(|call: AnnotationCall| async move {
            call.run_next().await
        }))?;
        ctx.register_annotation(TEST_ANNOTATION, test_annotation(results))?;
        assert::register(ctx.as_ref())?;
        mock_functions::register(ctx.as_ref(), ctx.mocks.clone(), scope)?;
        Ok(ctx)
    }

    pub fn mocks(&self) -> &Arc<MockTables> {
        &self.mocks
    }

    pub fn scope(&self) -> &FileScope {
        &self.scope
    }

    /// Applies a parsed mock document to this context family.
    pub fn load_mocks(&self, document: &Value) -> Result<()> {
        load_mocks(&self.mocks, document)
    }
}

impl OperationContext for TestContext {
    fn kind(&self) -> &'static str {
        "test"
    }

    fn depth(&self) -> usize {
        self.inner.depth()
    }

    fn set_record(&self, name: &str, variable: Variable) -> Result<()> {
        self.inner.set_record(name, variable)
    }

    fn record(&self, name: &str) -> Option<Variable> {
        self.inner.record(name)
    }

    fn remove_variable(&self, name: &str) {
        self.inner.remove_variable(name)
    }

    fn variables(&self) -> Vec<(String, Variable)> {
        self.inner.variables()
    }

    fn register_extension(&self, name: &str, f: ExtensionFn) -> Result<()> {
        self.inner.register_extension(name, f)
    }

    fn register_annotation(&self, name: &str, f: AnnotationFn) -> Result<()> {
        self.inner.register_annotation(name, f)
    }

    fn register_statement(&self, name: &str, f: StatementFn) -> Result<()> {
        self.inner.register_statement(name, f)
    }

    fn register_conditional(&self, name: &str, f: ConditionalFn) -> Result<()> {
        self.inner.register_conditional(name, f)
    }

    fn extension(&self, name: &str) -> Option<ExtensionFn> {
        match self.mocks.get(MockKind::Function, name) {
            Some(mock) => Some(mock_functions::mocked_extension(mock)),
            None => self.inner.extension(name),
        }
    }

    fn annotation(&self, name: &str) -> Option<AnnotationFn> {
        match self.mocks.get(MockKind::Annotation, name) {
            Some(mock) => Some(mock_functions::mocked_annotation(mock)),
            None => self.inner.annotation(name),
        }
    }

    fn statement_extension(&self, name: &str) -> Option<StatementFn> {
        match self.mocks.get(MockKind::Statement, name) {
            Some(mock) => Some(mock_functions::mocked_statement(mock)),
            None => self.inner.statement_extension(name),
        }
    }

    fn conditional_extension(&self, name: &str) -> Option<ConditionalFn> {
        self.inner.conditional_extension(name)
    }

    fn create_function_child_context(&self, internals: Arc<FunctionTable>) -> Result<ContextRef> {
        Ok(Arc::new(TestContext {
            inner: self.inner.child(internals),
            mocks: self.mocks.clone(),
            scope: self.scope.clone(),
        }))
    }

    fn use_module_functions(&self, internals: Arc<FunctionTable>) -> Result<()> {
        self.inner.use_module_functions(internals)
    }
}

/// `@test()`, `@test(name)`, `@test(name, group)` or `@test({name, group})`.
fn test_naming(call: &AnnotationCall) -> (String, Option<String>) {
    let default_group = call
        .module
        .rsplit(['/', '\\'])
        .next()
        .map(str::to_string);
    match call.arguments.as_slice() {
        [] => (call.function.clone(), default_group),
        [Value::Object(options)] => (
            options
                .get("name")
                .and_then(to_text)
                .unwrap_or_else(|| call.function.clone()),
            options.get("group").and_then(to_text),
        ),
        [name] => (to_text(name).unwrap_or_else(|| call.function.clone()), default_group),
        [name, group, ..] => (
            to_text(name).unwrap_or_else(|| call.function.clone()),
            to_text(group),
        ),
    }
}

/// Runs the test body and records its outcome; failures do not propagate.
fn test_annotation(results: TestResults) -> AnnotationFn {
    annotation(move |call: AnnotationCall| {
        let results = results.clone();
        async move {
            let (test_name, test_group) = test_naming(&call);
            let mut result = TestResult {
                test_file: call.module.clone(),
                function_name: call.function.clone(),
                test_name,
                test_group,
                success: true,
                message: None,
                position: None,
            };
            let output = match call.run_next().await {
                Ok(value) => value,
                Err(e) => {
                    result.success = false;
                    result.message = Some(match e.root() {
                        root @ IslError::Assertion(_) => root.to_string(),
                        _ => e.to_string(),
                    });
                    result.position = e.position().cloned();
                    Value::Null
                }
            };
            debug!(test = %result.test_name, success = result.success, "test finished");
            results.lock().push(result);
            Ok(output)
        }
    })
}

/// `@test` functions of one module and its optional `@setup`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestFile {
    pub tests: Vec<String>,
    pub setup: Option<String>,
}

/// Discovers and runs the tests of a package.
pub struct TestPackage {
    package: Package,
    base_path: Option<PathBuf>,
    files: BTreeMap<String, TestFile>,
}

impl TestPackage {
    /// Fails when a module declares more than one `@setup` function.
    pub fn new(package: Package) -> Result<Self> {
        let mut files = BTreeMap::new();
        for name in package.modules() {
            let Some(transformer) = package.module(name) else {
                continue;
            };
            let module = transformer.module();
            let mut file = TestFile::default();
            for function in module.functions() {
                if function.has_annotation(TEST_ANNOTATION) {
                    file.tests.push(function.name.clone());
                }
                if function.has_annotation(SETUP_ANNOTATION) {
                    if let Some(existing) = &file.setup {
                        return Err(IslError::compilation(
                            format!(
                                "Multiple setUp functions found. File: {}, Function: {} and {}",
                                module.name(),
                                existing,
                                function.name
                            ),
                            function.position.clone(),
                            None,
                        ));
                    }
                    file.setup = Some(function.name.clone());
                }
            }
            if !file.tests.is_empty() {
                files.insert(module.name().to_string(), file);
            }
        }
        Ok(Self {
            package,
            base_path: None,
            files,
        })
    }

    pub fn with_base_path(mut self, base_path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(base_path.into());
        self
    }

    /// Test files keyed by module name.
    pub fn files(&self) -> &BTreeMap<String, TestFile> {
        &self.files
    }

    pub async fn run_all_tests(&self) -> Vec<TestResult> {
        let results: TestResults = Arc::default();
        for (file, tests) in &self.files {
            for test in &tests.tests {
                self.run_into(file, test, tests.setup.as_deref(), &results).await;
            }
        }
        let results = results.lock().clone();
        let failed = results.iter().filter(|r| !r.success).count();
        info!(total = results.len(), failed, "test run finished");
        results
    }

    pub async fn run_test(&self, file: &str, function: &str) -> Vec<TestResult> {
        let results: TestResults = Arc::default();
        let setup = self
            .files
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(file))
            .and_then(|(_, f)| f.setup.clone());
        self.run_into(file, function, setup.as_deref(), &results).await;
        let collected = results.lock().clone();
        collected
    }

    /// Each test gets a fresh context; setup runs in it first.
    async fn run_into(&self, file: &str, function: &str, setup: Option<&str>, results: &TestResults) {
        let failure = |message: String, position: Option<Position>| TestResult {
            test_file: file.to_string(),
            function_name: function.to_string(),
            test_name: function.to_string(),
            test_group: Some(file.to_string()),
            success: false,
            message: Some(message),
            position,
        };

        let ctx: ContextRef = match TestContext::create(
            results.clone(),
            Some(format!("{file}.isl")),
            self.base_path.clone(),
        ) {
            Ok(ctx) => ctx,
            Err(e) => {
                results.lock().push(failure(e.to_string(), None));
                return;
            }
        };

        if let Some(setup) = setup {
            let full = Package::to_full_function_name(file, setup);
            if let Err(e) = self.package.run_transform(&full, &ctx).await {
                warn!(test = function, setup, error = %e, "setup failed");
                results
                    .lock()
                    .push(failure(format!("Setup {setup} failed: {e}"), e.position().cloned()));
                return;
            }
        }

        let before = results.lock().len();
        let full = Package::to_full_function_name(file, function);
        match self.package.run_transform(&full, &ctx).await {
            Err(e) => results.lock().push(failure(e.to_string(), e.position().cloned())),
            Ok(_) if results.lock().len() == before => {
                results
                    .lock()
                    .push(failure(format!("{full} did not record a test result"), None));
            }
            Ok(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{Call, CommandRef, Literal, Statements};
    use crate::module::{AnnotationUse, FunctionDeclaration, Module};
    use futures::FutureExt;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn call(name: &str, arguments: Vec<Value>) -> CommandRef {
        Arc::new(Call {
            name: name.into(),
            arguments: arguments
                .into_iter()
                .map(|v| Arc::new(Literal(v)) as CommandRef)
                .collect(),
            position: None,
        })
    }

    fn annotated(name: &str, arguments: Vec<Value>) -> AnnotationUse {
        AnnotationUse {
            name: name.into(),
            arguments: arguments
                .into_iter()
                .map(|v| Arc::new(Literal(v)) as CommandRef)
                .collect(),
            position: None,
        }
    }

    #[tokio::test]
    async fn mocks_shadow_registered_extensions() {
        let ctx = TestContext::create(Arc::default(), None, None).unwrap();
        let ctx_ref: ContextRef = ctx.clone();
        ctx.register_extension(
            "Api.Get",
            crate::functions::sync_extension(|_| Ok(json!("real"))),
        )
        .unwrap();
        ctx.mocks()
            .get_or_create(MockKind::Function, "api.get")
            .lock()
            .add(json!("mocked"), vec![], None);

        let f = ctx_ref.extension("API.GET").unwrap();
        let value = f(crate::functions::FunctionCall::new("Api.Get", vec![], ctx_ref.clone()))
            .await
            .unwrap();
        assert_eq!(value, json!("mocked"));

        let child = ctx_ref
            .create_function_child_context(Arc::new(FunctionTable::new()))
            .unwrap();
        assert_eq!(child.kind(), "test");
        assert!(child.extension("api.get").is_some());
    }

    fn sample_package() -> Package {
        let module = Module::new(
            "tests/orders",
            vec![],
            vec![
                FunctionDeclaration::new(
                    "prepare",
                    call("Mock.Func", vec![json!("Api.Total"), json!(42)]),
                )
                .with_annotation(annotated("setup", vec![])),
                FunctionDeclaration::new(
                    "totalIsMocked",
                    Arc::new(Statements(vec![call(
                        "Assert.Equal",
                        vec![json!(42), json!(42)],
                    )])),
                )
                .with_annotation(annotated("test", vec![json!("total"), json!("orders")])),
                FunctionDeclaration::new(
                    "fails",
                    call("Assert.Equal", vec![json!(1), json!(2), json!("nope")]),
                )
                .with_annotation(annotated("test", vec![json!({"name": "failing"})])),
                FunctionDeclaration::new("helper", call("Api.Total", vec![])),
            ],
        );
        Package::new(vec![module])
    }

    #[tokio::test]
    async fn discovers_and_runs_tests() {
        let tests = TestPackage::new(sample_package()).unwrap();
        assert_eq!(
            tests.files().get("tests/orders"),
            Some(&TestFile {
                tests: vec!["fails".into(), "totalIsMocked".into()],
                setup: Some("prepare".into()),
            })
        );

        let results = tests.run_all_tests().await;
        assert_eq!(results.len(), 2);
        let failing = &results[0];
        assert_eq!(failing.test_name, "failing");
        assert_eq!(failing.test_group, None);
        assert!(!failing.success);
        assert!(failing
            .message
            .as_deref()
            .unwrap_or_default()
            .starts_with("Assert.Equal failed."));

        let passing = &results[1];
        assert_eq!(passing.test_name, "total");
        assert_eq!(passing.test_group.as_deref(), Some("orders"));
        assert!(passing.success, "{:?}", passing.message);
    }

    #[test]
    fn two_setups_are_rejected() {
        let body = call("Log.Info", vec![]);
        let module = Module::new(
            "dup",
            vec![],
            vec![
                FunctionDeclaration::new("a", body.clone()).with_annotation(annotated("setup", vec![])),
                FunctionDeclaration::new("b", body.clone()).with_annotation(annotated("setup", vec![])),
                FunctionDeclaration::new("t", body).with_annotation(annotated("test", vec![])),
            ],
        );
        let err = TestPackage::new(Package::new(vec![module])).err().unwrap();
        assert!(err.to_string().starts_with("Multiple setUp functions found. File: dup"));
    }

    #[test]
    fn default_group_is_the_file_name() {
        let ctx: ContextRef = Arc::new(BaseContext::new());
        let call = AnnotationCall {
            annotation: "test".into(),
            function: "checks".into(),
            module: "suite/orders".into(),
            arguments: vec![],
            context: ctx,
            position: None,
            next: Arc::new(|| async { Ok::<Value, IslError>(Value::Null) }.boxed()),
        };
        assert_eq!(test_naming(&call), ("checks".to_string(), Some("orders".to_string())));
    }
}
