use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use isl_runtime::{
    BaseContext, ContextRef, FileInfo, IslError, PackageBuilder, Result, RuntimeSettings,
    ScriptCompiler, TestPackage,
};

/// Compile and run ISL transformation scripts.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Runtime settings JSON (maxParallelWorkers, maxCallDepth)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one function of a script and print its result
    Run {
        file: PathBuf,
        /// Function to run
        #[arg(long, short, default_value = "run")]
        function: String,
        /// JSON bound to `$input` (a literal, or @path to read a file)
        #[arg(long, short)]
        input: Option<String>,
        /// Extra variables as name=json; non-JSON values are bound as strings
        #[arg(long = "var")]
        vars: Vec<String>,
        /// Directory searched for imported modules (defaults to the script's directory)
        #[arg(long)]
        modules: Option<PathBuf>,
    },
    /// Run every @test function found under a file or directory
    Test {
        path: PathBuf,
        /// Write the results as JSON to this file
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "isl failed");
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    if let Some(config) = &args.config {
        let settings = RuntimeSettings::from_json_file(config)?;
        debug!(?settings, "loaded settings");
        settings.apply();
    }

    match args.command {
        Command::Run {
            file,
            function,
            input,
            vars,
            modules,
        } => {
            let result = run_script(&file, &function, input, &vars, modules).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Test { path, output } => run_tests(&path, output.as_deref()).await,
    }
}

fn module_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn read_file(path: &Path) -> Result<FileInfo> {
    Ok(FileInfo::new(module_name(path), std::fs::read_to_string(path)?))
}

/// Looks for `<name>.isl` inside `dir`.
fn sibling_resolver(dir: PathBuf) -> impl Fn(&str, &str) -> Option<String> {
    move |requested_by: &str, name: &str| {
        let candidate = dir.join(format!("{name}.isl"));
        debug!(requested_by, module = name, path = %candidate.display(), "resolving import");
        std::fs::read_to_string(candidate).ok()
    }
}

/// Parses a JSON literal, falling back to a plain string.
fn json_or_string(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

async fn run_script(
    file: &Path,
    function: &str,
    input: Option<String>,
    vars: &[String],
    modules: Option<PathBuf>,
) -> Result<Value> {
    let main = read_file(file)?;
    let name = main.name.clone();
    let dir = modules.unwrap_or_else(|| file.parent().map(Path::to_path_buf).unwrap_or_default());
    let resolver = sibling_resolver(dir);
    let package = PackageBuilder::new(&ScriptCompiler)
        .with_resolver(&resolver)
        .build(vec![main])?;

    let ctx: ContextRef = Arc::new(BaseContext::new());
    if let Some(input) = input {
        let value = match input.strip_prefix('@') {
            Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
            None => json_or_string(&input),
        };
        ctx.set_variable("$input", value)?;
    }
    for var in vars {
        let (key, value) = var.split_once('=').ok_or_else(|| {
            IslError::transform(format!("Expected name=value for --var, got {var}"), None)
        })?;
        let key = if key.starts_with('$') {
            key.to_string()
        } else {
            format!("${key}")
        };
        ctx.set_variable(&key, json_or_string(value))?;
    }

    let full = isl_runtime::Package::to_full_function_name(&name, function);
    info!(function = %full, "running");
    package.run_transform(&full, &ctx).await
}

fn collect_scripts(path: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    if path.is_file() {
        out.push(path.to_path_buf());
        return Ok(());
    }
    let mut entries: Vec<PathBuf> = std::fs::read_dir(path)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    entries.sort();
    for entry in entries {
        if entry.is_dir() {
            collect_scripts(&entry, out)?;
        } else if entry.extension().is_some_and(|e| e == "isl") {
            out.push(entry);
        }
    }
    Ok(())
}

async fn run_tests(path: &Path, output: Option<&Path>) -> Result<ExitCode> {
    let mut scripts = Vec::new();
    collect_scripts(path, &mut scripts)?;
    let files = scripts
        .iter()
        .map(|p| read_file(p))
        .collect::<Result<Vec<_>>>()?;

    let base = if path.is_file() {
        path.parent().map(Path::to_path_buf).unwrap_or_default()
    } else {
        path.to_path_buf()
    };
    let resolver = sibling_resolver(base.clone());
    let package = PackageBuilder::new(&ScriptCompiler)
        .with_resolver(&resolver)
        .build(files)?;

    let tests = TestPackage::new(package)?.with_base_path(base);
    let results = tests.run_all_tests().await;

    for result in &results {
        let status = if result.success { "PASS" } else { "FAIL" };
        let group = result.test_group.as_deref().unwrap_or(&result.test_file);
        println!("{status} {group} > {}", result.test_name);
        if let Some(message) = result.message.as_deref().filter(|_| !result.success) {
            for line in message.lines() {
                println!("    {line}");
            }
        }
    }
    let failed = results.iter().filter(|r| !r.success).count();
    println!("{} tests, {} passed, {failed} failed", results.len(), results.len() - failed);

    if let Some(output) = output {
        std::fs::write(output, serde_json::to_string_pretty(&results)?)?;
    }
    Ok(if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
