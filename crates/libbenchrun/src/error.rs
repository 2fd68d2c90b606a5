//! Error types for benchrun

use thiserror::Error;

/// Main error type for benchmark runs
#[derive(Debug, Error)]
pub enum BenchError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("workload {phase} failed: {source}")]
    Lifecycle {
        phase: &'static str,
        #[source]
        source: WorkloadError,
    },

    #[error("agent {agent} of group '{group}' failed: {message}")]
    Agent {
        group: String,
        agent: usize,
        message: String,
    },

    #[error("{reporter} reporter failed: {message}")]
    Reporter {
        reporter: &'static str,
        message: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl BenchError {
    /// Wrap a workload hook failure with the phase it happened in
    pub fn lifecycle(phase: &'static str, source: WorkloadError) -> Self {
        BenchError::Lifecycle { phase, source }
    }

    /// Stable identifier used in logs and JSON output
    pub fn error_code(&self) -> &'static str {
        match self {
            BenchError::Config(_) => "config_error",
            BenchError::Lifecycle { .. } => "lifecycle_error",
            BenchError::Agent { .. } => "agent_error",
            BenchError::Reporter { .. } => "reporter_error",
            BenchError::Io(_) => "io_error",
            BenchError::Json(_) => "internal_error",
            BenchError::Toml(_) => "config_error",
        }
    }

    /// Process exit code for the CLI
    pub fn exit_code(&self) -> i32 {
        match self {
            BenchError::Config(_) | BenchError::Toml(_) => 2,
            BenchError::Lifecycle { .. } => 3,
            _ => 1,
        }
    }
}

/// Errors raised by workload hooks and per-agent tasks
#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("{0}")]
    Failed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkloadError {
    pub fn failed(message: impl Into<String>) -> Self {
        WorkloadError::Failed(message.into())
    }
}

pub type Result<T> = std::result::Result<T, BenchError>;
