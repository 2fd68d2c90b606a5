//! Workload contract: lifecycle hooks plus the per-agent task

use std::sync::Arc;

use crate::config::Configuration;
use crate::error::{BenchError, WorkloadError};
use crate::group::AgentGroup;
use crate::metrics::MetricStore;

/// Outcome of one `run_once` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Completed this many runs
    Ran(u64),
    /// The workload has no more work for this agent
    Exhausted,
}

/// Identity of the agent a task is created for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInfo {
    /// Run-wide agent id
    pub id: usize,
    /// Group the agent belongs to
    pub group: String,
    /// Index within the group (0-based)
    pub index: usize,
    /// Number of agents in the group
    pub agent_count: usize,
}

/// Per-agent unit of work, called repeatedly by the agent's run loop.
///
/// `iteration` starts at 1 and counts completed runs plus one. The store is
/// the owning group's; counters are incremented here, never read back.
pub trait Task: Send {
    fn run_once(&mut self, iteration: u64, metrics: &MetricStore) -> Result<Step, WorkloadError>;
}

impl<F> Task for F
where
    F: FnMut(u64, &MetricStore) -> Result<Step, WorkloadError> + Send,
{
    fn run_once(&mut self, iteration: u64, metrics: &MetricStore) -> Result<Step, WorkloadError> {
        self(iteration, metrics)
    }
}

/// Creates the task for each agent of a group
pub type TaskFactory = Arc<dyn Fn(&AgentInfo) -> Box<dyn Task> + Send + Sync>;

/// Pluggable benchmark logic driven by the orchestrator.
///
/// Hooks are called from the orchestrator's control thread in this order:
/// `configure`, `initialize`, `warmup`, `agent_groups`, and after the run
/// (successful or not) `shutdown`.
pub trait Workload: Send {
    fn name(&self) -> &str;

    /// Workload-specific options as `(option, description)` pairs
    fn usage(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    fn configure(&mut self, _config: &Configuration) -> Result<(), WorkloadError> {
        Ok(())
    }

    fn initialize(&mut self) -> Result<(), WorkloadError> {
        Ok(())
    }

    fn warmup(&mut self) -> Result<(), WorkloadError> {
        Ok(())
    }

    /// Groups to run, in order. Group names must be unique; a group that
    /// fails construction fails the run with its configuration error.
    fn agent_groups(&self) -> Result<Vec<AgentGroup>, BenchError>;

    fn shutdown(&mut self) -> Result<(), WorkloadError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_is_a_task() {
        let mut task = |iteration: u64, metrics: &MetricStore| {
            metrics.increment("ops", 1);
            if iteration >= 3 {
                Ok::<_, WorkloadError>(Step::Exhausted)
            } else {
                Ok(Step::Ran(1))
            }
        };
        let store = MetricStore::new();
        assert_eq!(task.run_once(1, &store).unwrap(), Step::Ran(1));
        assert_eq!(task.run_once(3, &store).unwrap(), Step::Exhausted);
        assert_eq!(store.get("ops"), 2);
    }
}
