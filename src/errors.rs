use std::fmt;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// A location inside a script file.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Position {
    pub file: String,
    pub line: usize,
    pub column: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_column: Option<usize>,
}

impl Position {
    pub fn new(file: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            file: file.into(),
            line,
            column,
            end_line: None,
            end_column: None,
        }
    }

    /// Position pointing at the start of a module, used when no finer location exists.
    pub fn module(file: impl Into<String>) -> Self {
        Self::new(file, 0, 0)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// Failed `Assert.*` call raised from a test script.
#[derive(Debug, Clone)]
pub struct AssertionFailure {
    pub function: String,
    pub message: String,
    pub expected: Option<Value>,
    pub actual: Option<Value>,
    pub position: Option<Position>,
}

#[derive(Debug, Error)]
pub enum IslError {
    #[error("parse error: {message} at {position}")]
    Parse { message: String, position: Position },

    /// Compile-time failure. The message already carries the caret snippet when one was available.
    #[error("{message}")]
    Compilation {
        message: String,
        position: Option<Position>,
    },

    #[error("{message}{}", at(.position))]
    Transform {
        message: String,
        position: Option<Position>,
    },

    #[error("Could not set readonly variable={name}.")]
    ReadOnlyVariable { name: String },

    #[error("Could not set readonly outside scope variable={name}.")]
    OutsideScope { name: String },

    #[error("Invalid variable name `{name}`: variable names must start with `$`.")]
    InvalidVariableName { name: String },

    #[error("Mock exhausted: expected at most {expected} call(s), but got call #{actual}")]
    MockExhausted { expected: usize, actual: usize },

    #[error("Valid function name to mock must be provided. Invalid function name: {name}")]
    InvalidMockName { name: String },

    #[error("{}", .0.message)]
    Assertion(Box<AssertionFailure>),

    #[error("{operation} is not supported on a {kind} context")]
    Unsupported {
        operation: &'static str,
        kind: &'static str,
    },

    #[error("Maximum call depth of {limit} exceeded while calling {function}")]
    CallDepthExceeded { function: String, limit: usize },

    #[error("Could not execute '@.{name}'{}: {source}", at(.position))]
    Execution {
        name: String,
        position: Option<Position>,
        source: Box<IslError>,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn at(position: &Option<Position>) -> String {
    match position {
        Some(p) => format!(" at {p}"),
        None => String::new(),
    }
}

impl IslError {
    pub fn transform(message: impl Into<String>, position: Option<Position>) -> Self {
        IslError::Transform {
            message: message.into(),
            position,
        }
    }

    /// Builds a compilation error, pointing a caret at `position` inside `source` when possible.
    pub fn compilation(
        message: impl Into<String>,
        position: Option<Position>,
        source: Option<&str>,
    ) -> Self {
        let message = message.into();
        let message = match (&position, source) {
            (Some(p), Some(text)) => {
                let annotated = annotate(&message, p, text);
                format!("{annotated}\nat {p}.")
            }
            (Some(p), None) => format!("{message}\nat {p}."),
            _ => message,
        };
        IslError::Compilation { message, position }
    }

    /// Wraps an error raised inside the operation `name`.
    pub fn execution(name: impl Into<String>, position: Option<Position>, source: IslError) -> Self {
        IslError::Execution {
            name: name.into(),
            position,
            source: Box::new(source),
        }
    }

    /// The innermost error, skipping call-site wrappers.
    pub fn root(&self) -> &IslError {
        match self {
            IslError::Execution { source, .. } => source.root(),
            other => other,
        }
    }

    /// Most specific known position: the innermost one that exists.
    pub fn position(&self) -> Option<&Position> {
        match self {
            IslError::Execution {
                position, source, ..
            } => source.position().or(position.as_ref()),
            IslError::Parse { position, .. } => Some(position),
            IslError::Compilation { position, .. } | IslError::Transform { position, .. } => {
                position.as_ref()
            }
            IslError::Assertion(failure) => failure.position.as_ref(),
            _ => None,
        }
    }
}

fn annotate(message: &str, position: &Position, source: &str) -> String {
    if position.line == 0 {
        return message.to_string();
    }
    match source.lines().nth(position.line - 1) {
        Some(line) if position.column > 0 && position.column < line.len() => {
            let marker = format!("{:>width$}", "^", width = position.column + 1);
            format!("{message}\n{line}\n{marker}")
        }
        _ => message.to_string(),
    }
}

pub type Result<T> = std::result::Result<T, IslError>;
