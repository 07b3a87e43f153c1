//! Multi-module linking.
//!
//! A [`PackageBuilder`] compiles a set of files once, pulling in referenced
//! modules on demand (from the known files first, then from an external
//! resolver) and refusing circular imports.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::context::ContextRef;
use crate::errors::{IslError, Position, Result};
use crate::module::{Module, Transformer};

/// One unit of compilation input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub source: String,
}

impl FileInfo {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }
}

/// Hands compiled dependencies to a compiler while it runs.
pub trait ModuleLinker {
    /// The compiled module `name`, imported by `requested_by`.
    fn link(&mut self, requested_by: &str, name: &str) -> Result<Arc<Module>>;
}

/// Turns a source file into a module. Imports must be requested through `linker`.
pub trait ModuleCompiler {
    fn compile(&self, file: &FileInfo, linker: &mut dyn ModuleLinker) -> Result<Arc<Module>>;
}

/// Supplies source text for modules that are not part of the initial file set.
pub trait ModuleResolver {
    fn resolve(&self, requested_by: &str, name: &str) -> Option<String>;
}

impl<F> ModuleResolver for F
where
    F: Fn(&str, &str) -> Option<String>,
{
    fn resolve(&self, requested_by: &str, name: &str) -> Option<String> {
        self(requested_by, name)
    }
}

pub struct PackageBuilder<'a> {
    compiler: &'a dyn ModuleCompiler,
    resolver: Option<&'a dyn ModuleResolver>,
}

impl<'a> PackageBuilder<'a> {
    pub fn new(compiler: &'a dyn ModuleCompiler) -> Self {
        Self {
            compiler,
            resolver: None,
        }
    }

    pub fn with_resolver(mut self, resolver: &'a dyn ModuleResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn build(&self, files: Vec<FileInfo>) -> Result<Package> {
        let names: Vec<String> = files.iter().map(|f| f.name.clone()).collect();
        let mut linking = Linking {
            compiler: self.compiler,
            resolver: self.resolver,
            files,
            modules: BTreeMap::new(),
            stack: Vec::new(),
        };
        for name in &names {
            linking.compile(name)?;
        }
        info!(modules = linking.modules.len(), "package built");
        Ok(Package::new(linking.modules.into_values()))
    }
}

struct Linking<'a> {
    compiler: &'a dyn ModuleCompiler,
    resolver: Option<&'a dyn ModuleResolver>,
    files: Vec<FileInfo>,
    modules: BTreeMap<String, Arc<Module>>,
    /// Modules currently being compiled, outermost first.
    stack: Vec<String>,
}

impl Linking<'_> {
    fn compile(&mut self, name: &str) -> Result<Arc<Module>> {
        let key = name.to_lowercase();
        if let Some(module) = self.modules.get(&key) {
            return Ok(module.clone());
        }
        if self.stack.iter().any(|s| s.eq_ignore_ascii_case(name)) {
            let chain = format!("{} > {}", self.stack.join(" > "), name);
            warn!(%chain, "circular module dependency");
            return Err(IslError::compilation(
                format!("Circular Dependency Between Modules: {chain}."),
                None,
                None,
            ));
        }
        let file = self
            .files
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
            .cloned()
            .ok_or_else(|| IslError::compilation(format!("Unknown Module: {name}"), None, None))?;

        debug!(module = %file.name, "compiling module");
        self.stack.push(file.name.clone());
        let compiler = self.compiler;
        let compiled = compiler.compile(&file, self);
        self.stack.pop();

        let module = compiled?;
        self.modules.insert(key, module.clone());
        Ok(module)
    }

    fn knows(&self, name: &str) -> bool {
        self.modules.contains_key(&name.to_lowercase())
            || self.files.iter().any(|f| f.name.eq_ignore_ascii_case(name))
    }
}

impl ModuleLinker for Linking<'_> {
    fn link(&mut self, requested_by: &str, name: &str) -> Result<Arc<Module>> {
        if !self.knows(name) {
            let source = self
                .resolver
                .and_then(|r| r.resolve(requested_by, name))
                .ok_or_else(|| {
                    IslError::compilation(
                        format!("Could not find referenced module {name} from {requested_by}"),
                        Some(Position::module(requested_by)),
                        None,
                    )
                })?;
            debug!(module = name, requested_by, "resolved external module");
            self.files.push(FileInfo::new(name, source));
        }
        self.compile(name)
    }
}

/// Result of running a function at the package boundary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub result: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

/// A linked set of modules addressed as `module:function`.
pub struct Package {
    modules: BTreeMap<String, Transformer>,
}

impl Package {
    pub fn new(modules: impl IntoIterator<Item = Arc<Module>>) -> Self {
        let modules = modules
            .into_iter()
            .map(|m| (m.name().to_lowercase(), Transformer::new(m)))
            .collect();
        Self { modules }
    }

    pub fn to_full_function_name(module: &str, function: &str) -> String {
        format!("{module}:{function}")
    }

    /// Splits at the last `:`; the function defaults to `run`.
    pub fn split_full_function_name(full: &str) -> (String, String) {
        match full.rsplit_once(':') {
            Some((module, function)) => (module.to_string(), function.to_string()),
            None => (full.to_string(), "run".to_string()),
        }
    }

    /// Module names, sorted.
    pub fn modules(&self) -> Vec<&str> {
        self.modules.values().map(|t| t.module().name()).collect()
    }

    pub fn module(&self, name: &str) -> Option<&Transformer> {
        self.modules.get(&name.to_lowercase())
    }

    pub async fn run_transform(&self, full_name: &str, ctx: &ContextRef) -> Result<Value> {
        let (module, function) = Self::split_full_function_name(full_name);
        let transformer = self.module(&module).ok_or_else(|| {
            IslError::transform(
                format!("Unknown Module: {module}"),
                Some(Position::module(&module)),
            )
        })?;
        transformer.run(&function, ctx).await
    }

    /// Like [`run_transform`](Self::run_transform) but never fails: errors are
    /// turned into an unsuccessful outcome.
    pub async fn execute(&self, full_name: &str, ctx: &ContextRef) -> ExecutionOutcome {
        match self.run_transform(full_name, ctx).await {
            Ok(result) => ExecutionOutcome {
                success: true,
                result,
                message: None,
                position: None,
            },
            Err(e) => {
                warn!(function = full_name, error = %e, "transform failed");
                ExecutionOutcome {
                    success: false,
                    result: Value::Null,
                    position: e.position().cloned(),
                    message: Some(e.to_string()),
                }
            }
        }
    }
}
