//! Agent groups: homogeneous cohorts of agents

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::{Agent, AgentLimits};
use crate::error::{BenchError, Result};
use crate::metrics::{LatencyRecorder, MetricStore};
use crate::workload::{AgentInfo, Task, TaskFactory};

/// Declarative description of a group of agents.
///
/// Zero for `total_runs`, `duration_secs` or `max_runs_per_second` means
/// unlimited.
#[derive(Clone)]
pub struct AgentGroup {
    name: String,
    agent_count: usize,
    total_runs: u64,
    duration_secs: u64,
    max_runs_per_second: u64,
    factory: TaskFactory,
}

impl AgentGroup {
    /// Create a group of `agent_count` agents whose tasks come from `factory`
    pub fn new<F>(name: impl Into<String>, agent_count: usize, factory: F) -> Result<Self>
    where
        F: Fn(&AgentInfo) -> Box<dyn Task> + Send + Sync + 'static,
    {
        let name = name.into();
        if name.is_empty() {
            return Err(BenchError::Config("agent group name must not be empty".to_string()));
        }
        if agent_count < 1 {
            return Err(BenchError::Config(format!(
                "number of agents for group {} must be at least one but is {}",
                name, agent_count
            )));
        }
        Ok(Self {
            name,
            agent_count,
            total_runs: 0,
            duration_secs: 0,
            max_runs_per_second: 0,
            factory: Arc::new(factory),
        })
    }

    pub fn with_total_runs(mut self, total_runs: u64) -> Self {
        self.total_runs = total_runs;
        self
    }

    pub fn with_duration_secs(mut self, duration_secs: u64) -> Self {
        self.duration_secs = duration_secs;
        self
    }

    pub fn with_max_runs_per_second(mut self, max_runs_per_second: u64) -> Self {
        self.max_runs_per_second = max_runs_per_second;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn agent_count(&self) -> usize {
        self.agent_count
    }

    pub fn total_runs(&self) -> u64 {
        self.total_runs
    }

    pub fn duration_secs(&self) -> u64 {
        self.duration_secs
    }

    pub fn max_runs_per_second(&self) -> u64 {
        self.max_runs_per_second
    }

    pub fn info(&self) -> GroupInfo {
        GroupInfo {
            name: self.name.clone(),
            agent_count: self.agent_count,
        }
    }

    /// Runs assigned to each agent; `None` is unlimited.
    ///
    /// The remainder of `total_runs / agent_count` is not distributed.
    pub fn runs_per_agent(&self) -> Option<u64> {
        if self.total_runs == 0 {
            None
        } else {
            Some(self.total_runs / self.agent_count as u64)
        }
    }

    /// Even split of the group's rate ceiling across its agents
    pub fn rate_per_agent(&self) -> Option<f64> {
        if self.max_runs_per_second == 0 {
            None
        } else {
            Some(self.max_runs_per_second as f64 / self.agent_count as f64)
        }
    }

    pub fn time_limit(&self) -> Option<Duration> {
        if self.duration_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.duration_secs))
        }
    }

    /// One-line summary logged when the group is started
    pub fn describe(&self) -> String {
        format!(
            "{} {} agents ({} runs per agent, {} time limit, {} runs per second)",
            self.agent_count,
            self.name,
            self.runs_per_agent()
                .map(|r| r.to_string())
                .unwrap_or_else(|| "unlimited".to_string()),
            if self.duration_secs > 0 {
                format!("{} seconds", self.duration_secs)
            } else {
                "no".to_string()
            },
            if self.max_runs_per_second > 0 {
                format!("max {}", self.max_runs_per_second)
            } else {
                "unlimited".to_string()
            },
        )
    }

    /// Instantiate this group's agents, numbering them from `first_id`
    pub fn create_agents(&self, first_id: usize) -> Vec<Agent> {
        let limits = AgentLimits {
            runs: self.runs_per_agent(),
            time_limit: self.time_limit(),
            rate: self.rate_per_agent(),
        };
        (0..self.agent_count)
            .map(|index| {
                let info = AgentInfo {
                    id: first_id + index,
                    group: self.name.clone(),
                    index,
                    agent_count: self.agent_count,
                };
                let task = (self.factory)(&info);
                Agent::new(info, limits, task)
            })
            .collect()
    }
}

impl fmt::Debug for AgentGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentGroup")
            .field("name", &self.name)
            .field("agent_count", &self.agent_count)
            .field("total_runs", &self.total_runs)
            .field("duration_secs", &self.duration_secs)
            .field("max_runs_per_second", &self.max_runs_per_second)
            .finish_non_exhaustive()
    }
}

/// Name and size of a group, as reporters and outcomes see it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub name: String,
    pub agent_count: usize,
}

/// Live state of a started group: its counters and latency histogram.
///
/// Written only by the group's own agents; reporters hold it weakly.
#[derive(Debug)]
pub struct GroupRuntime {
    info: GroupInfo,
    metrics: MetricStore,
    latency: LatencyRecorder,
}

impl GroupRuntime {
    pub fn new(info: GroupInfo) -> Self {
        Self {
            info,
            metrics: MetricStore::new(),
            latency: LatencyRecorder::new(),
        }
    }

    pub fn info(&self) -> &GroupInfo {
        &self.info
    }

    pub fn metrics(&self) -> &MetricStore {
        &self.metrics
    }

    pub fn latency(&self) -> &LatencyRecorder {
        &self.latency
    }
}

/// Check a workload's groups before anything is started
pub fn validate_groups(groups: &[AgentGroup]) -> Result<()> {
    if groups.is_empty() {
        return Err(BenchError::Config("workload defines no agent groups".to_string()));
    }
    let mut seen = std::collections::HashSet::new();
    for group in groups {
        if !seen.insert(group.name()) {
            return Err(BenchError::Config(format!(
                "duplicate agent group name '{}'",
                group.name()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkloadError;
    use crate::metrics::MetricStore;
    use crate::workload::Step;

    fn noop_group(name: &str, agents: usize) -> Result<AgentGroup> {
        AgentGroup::new(name, agents, |_: &AgentInfo| -> Box<dyn Task> {
            Box::new(|_: u64, _: &MetricStore| Ok::<_, WorkloadError>(Step::Ran(1)))
        })
    }

    #[test]
    fn test_zero_agents_rejected() {
        let err = noop_group("writers", 0).unwrap_err();
        assert!(matches!(err, BenchError::Config(ref msg) if msg.contains("writers")));
    }

    #[test]
    fn test_runs_per_agent_even_split() {
        let group = noop_group("writers", 2).unwrap().with_total_runs(100);
        assert_eq!(group.runs_per_agent(), Some(50));
    }

    #[test]
    fn test_runs_per_agent_drops_remainder() {
        let group = noop_group("writers", 3).unwrap().with_total_runs(100);
        assert_eq!(group.runs_per_agent(), Some(33));
    }

    #[test]
    fn test_unlimited_defaults() {
        let group = noop_group("readers", 4).unwrap();
        assert_eq!(group.runs_per_agent(), None);
        assert_eq!(group.rate_per_agent(), None);
        assert_eq!(group.time_limit(), None);
        assert_eq!(
            group.describe(),
            "4 readers agents (unlimited runs per agent, no time limit, unlimited runs per second)"
        );
    }

    #[test]
    fn test_rate_split_across_agents() {
        let group = noop_group("readers", 4).unwrap().with_max_runs_per_second(10);
        assert_eq!(group.rate_per_agent(), Some(2.5));
    }

    #[test]
    fn test_create_agents_numbering() {
        let group = noop_group("readers", 3).unwrap().with_total_runs(9);
        let agents = group.create_agents(5);
        assert_eq!(agents.len(), 3);
        let ids: Vec<_> = agents.iter().map(|a| a.info().id).collect();
        assert_eq!(ids, vec![5, 6, 7]);
        assert!(agents.iter().all(|a| a.limits().runs == Some(3)));
        assert_eq!(agents[2].info().index, 2);
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let groups = vec![noop_group("a", 1).unwrap(), noop_group("a", 2).unwrap()];
        assert!(validate_groups(&groups).is_err());
        assert!(validate_groups(&[]).is_err());
        assert!(validate_groups(&[noop_group("a", 1).unwrap()]).is_ok());
    }
}
