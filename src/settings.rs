//! Process-wide runtime knobs.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Deserialize;
use serde_json::{json, Value};

use crate::errors::Result;

pub const MIN_PARALLEL_WORKERS: usize = 1;
pub const MAX_PARALLEL_WORKERS: usize = 50;
pub const DEFAULT_MAX_CALL_DEPTH: usize = 512;

static PARALLEL_WORKERS: AtomicUsize = AtomicUsize::new(MIN_PARALLEL_WORKERS);
static CALL_DEPTH: AtomicUsize = AtomicUsize::new(DEFAULT_MAX_CALL_DEPTH);

/// Settings a host can load once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeSettings {
    pub max_parallel_workers: usize,
    pub max_call_depth: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            max_parallel_workers: MIN_PARALLEL_WORKERS,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }
}

impl RuntimeSettings {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Publishes these settings process-wide.
    pub fn apply(&self) {
        set_max_parallel_workers(self.max_parallel_workers);
        set_max_call_depth(self.max_call_depth);
    }
}

pub fn max_parallel_workers() -> usize {
    PARALLEL_WORKERS.load(Ordering::Relaxed)
}

/// Sets the upper bound for `parallel foreach` workers, clamped to `[1, 50]`.
pub fn set_max_parallel_workers(value: usize) -> usize {
    let clamped = value.clamp(MIN_PARALLEL_WORKERS, MAX_PARALLEL_WORKERS);
    PARALLEL_WORKERS.store(clamped, Ordering::Relaxed);
    clamped
}

pub fn max_call_depth() -> usize {
    CALL_DEPTH.load(Ordering::Relaxed)
}

pub fn set_max_call_depth(value: usize) {
    CALL_DEPTH.store(value.max(1), Ordering::Relaxed);
}

/// Content of the readonly `$isl` variable.
pub(crate) fn isl_info() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "maxParallelWorkers": max_parallel_workers(),
    })
}
