use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

pub const DEFAULT_PARALLELISM: usize = 4;

/// Execution environment shipped by the controller in the init blob.
///
/// Decoded once at `init` time; everything the agent and its workers need to
/// set themselves up lives here. Sink addresses are optional: when absent,
/// captured output is passed through to the agent's own console instead of a
/// remote collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvironment {
    /// Human-readable name of the driving application, used in log context.
    pub script_name: String,
    /// Working directory for the agent and spill files. A directory that
    /// cannot be entered is a warning, not a fatal error.
    pub working_dir: PathBuf,
    /// Directories prepended to the worker processes' search path.
    pub search_paths: Vec<PathBuf>,
    /// Number of worker processes. Fixed for the lifetime of the agent.
    pub parallelism: usize,
    /// Remote sink address for captured stdout, `host:port`.
    pub stdout_sink: Option<String>,
    /// Remote sink address for captured stderr, `host:port`.
    pub stderr_sink: Option<String>,
    /// Tag prepended to every forwarded stdout chunk.
    pub stdout_tag: String,
    /// Tag prepended to every forwarded stderr chunk.
    pub stderr_tag: String,
    /// Opaque bootstrap arguments handed to each worker process.
    pub worker_args: Vec<String>,
}

impl Default for TaskEnvironment {
    fn default() -> Self {
        Self {
            script_name: String::new(),
            working_dir: std::env::temp_dir(),
            search_paths: Vec::new(),
            parallelism: DEFAULT_PARALLELISM,
            stdout_sink: None,
            stderr_sink: None,
            stdout_tag: String::new(),
            stderr_tag: String::new(),
            worker_args: Vec::new(),
        }
    }
}

impl TaskEnvironment {
    pub fn new(script_name: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            script_name: script_name.into(),
            working_dir: working_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_sinks(mut self, stdout: Option<String>, stderr: Option<String>) -> Self {
        self.stdout_sink = stdout;
        self.stderr_sink = stderr;
        self
    }

    pub fn with_tags(mut self, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        self.stdout_tag = stdout.into();
        self.stderr_tag = stderr.into();
        self
    }

    pub fn with_search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.search_paths.push(path.into());
        self
    }

    pub fn with_worker_arg(mut self, arg: impl Into<String>) -> Self {
        self.worker_args.push(arg.into());
        self
    }

    /// Decode an init blob as received from the controller.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(AgentError::Decode)
    }

    /// Encode into the controller's init-blob form.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| AgentError::Internal(e.to_string()))
    }
}
