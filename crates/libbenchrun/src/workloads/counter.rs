//! `counter`: the smallest useful workload

use crate::config::Configuration;
use crate::error::{BenchError, WorkloadError};
use crate::group::AgentGroup;
use crate::metrics::MetricStore;
use crate::workload::{AgentInfo, Step, Task, Workload};

/// Counter incremented once per run
pub const OPS: &str = "ops";

/// One group, `counter`, whose agents bump [`OPS`] once per run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterWorkload {
    pub agents: usize,
    pub runs: u64,
    pub seconds: u64,
    pub rate: u64,
}

impl Default for CounterWorkload {
    fn default() -> Self {
        Self {
            agents: 2,
            runs: 1000,
            seconds: 0,
            rate: 0,
        }
    }
}

pub fn create() -> Box<dyn Workload> {
    Box::new(CounterWorkload::default())
}

fn to_workload_error(e: BenchError) -> WorkloadError {
    WorkloadError::failed(e.to_string())
}

impl Workload for CounterWorkload {
    fn name(&self) -> &str {
        "counter"
    }

    fn usage(&self) -> Vec<(String, String)> {
        vec![
            ("--agents <n>".to_string(), "number of agents (default 2)".to_string()),
            ("--runs <n>".to_string(), "total runs, 0 = unlimited (default 1000)".to_string()),
            ("--seconds <n>".to_string(), "time limit, 0 = none (default 0)".to_string()),
            (
                "--rate <n>".to_string(),
                "max runs per second, 0 = unlimited (default 0)".to_string(),
            ),
        ]
    }

    fn configure(&mut self, config: &Configuration) -> Result<(), WorkloadError> {
        self.agents = config.get_usize_or("agents", self.agents).map_err(to_workload_error)?;
        self.runs = config.get_u64_or("runs", self.runs).map_err(to_workload_error)?;
        self.seconds = config.get_u64_or("seconds", self.seconds).map_err(to_workload_error)?;
        self.rate = config.get_u64_or("rate", self.rate).map_err(to_workload_error)?;
        if self.runs == 0 && self.seconds == 0 {
            return Err(WorkloadError::failed(
                "counter never terminates with both --runs and --seconds set to 0",
            ));
        }
        Ok(())
    }

    fn agent_groups(&self) -> Result<Vec<AgentGroup>, BenchError> {
        let group = AgentGroup::new("counter", self.agents, |_: &AgentInfo| -> Box<dyn Task> {
            Box::new(|_: u64, metrics: &MetricStore| {
                metrics.increment(OPS, 1);
                Ok::<_, WorkloadError>(Step::Ran(1))
            })
        })?
        .with_total_runs(self.runs)
        .with_duration_secs(self.seconds)
        .with_max_runs_per_second(self.rate);
        Ok(vec![group])
    }
}
