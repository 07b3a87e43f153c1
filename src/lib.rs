//! Runtime core for ISL transformation scripts: scoped contexts with tiered
//! operation dispatch, module/package linking, pagination statements and a
//! mock-aware test layer.

pub mod commands;
pub mod comparison;
pub mod compiler;
pub mod context;
pub mod errors;
pub mod functions;
pub mod module;
pub mod package;
pub mod pagination;
pub mod parser;
pub mod settings;
pub mod testing;

pub use compiler::ScriptCompiler;
pub use context::{BaseContext, ContextRef, LocalContext, OperationContext, ParallelContext};
pub use errors::{IslError, Position, Result};
pub use functions::{builtins, FunctionCall, Registry};
pub use module::{FunctionDeclaration, Module, Transformer};
pub use package::{ExecutionOutcome, FileInfo, Package, PackageBuilder};
pub use settings::RuntimeSettings;
pub use testing::{TestContext, TestPackage, TestResult};

/// Compiles `files` with the script front end.
pub fn compile(files: Vec<FileInfo>) -> Result<Package> {
    PackageBuilder::new(&ScriptCompiler).build(files)
}
