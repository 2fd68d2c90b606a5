//! Load and benchmark execution engine
//!
//! This crate provides:
//! - Agent groups: cohorts of agent threads running a workload task
//! - Per-group metric stores and latency histograms
//! - Periodic reporters with console, file and telemetry sinks
//! - The benchmark runner that drives a workload through one run
//! - A registry of built-in workloads

pub mod agent;
pub mod config;
pub mod error;
pub mod group;
pub mod metrics;
pub mod registry;
pub mod reporter;
pub mod runner;
pub mod workload;
pub mod workloads;

pub use agent::{Agent, AgentLimits, AgentReport, AgentStatus};
pub use config::{Configuration, ConfigurationBuilder, ParsedArgs};
pub use error::{BenchError, Result, WorkloadError};
pub use group::{AgentGroup, GroupInfo};
pub use metrics::{LatencyPercentiles, LatencyRecorder, MetricSnapshot, MetricStore};
pub use registry::WorkloadRegistry;
pub use reporter::{MetricTransport, ReportSink, TcpTransport};
pub use runner::{BenchmarkRunner, Configured, GroupOutcome, ReporterStopPolicy, RunOutcome};
pub use workload::{AgentInfo, Step, Task, Workload};
