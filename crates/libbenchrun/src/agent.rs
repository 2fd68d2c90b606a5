//! Agents: one thread of workload execution

use std::collections::VecDeque;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::metrics::{LatencyRecorder, MetricStore};
use crate::workload::{AgentInfo, Step, Task};

/// Bounds applied to a single agent's run loop
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AgentLimits {
    /// Runs to execute; `None` is unlimited
    pub runs: Option<u64>,
    /// Wall-clock limit measured from the start of the loop
    pub time_limit: Option<Duration>,
    /// Maximum runs per second for this agent
    pub rate: Option<f64>,
}

/// How an agent's run loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    /// Executed all assigned runs
    Complete,
    /// Hit the group's time limit
    TimedOut,
    /// The workload reported no more work
    Exhausted,
    /// The workload returned an error
    Failed,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Complete => "Complete",
            AgentStatus::TimedOut => "TimedOut",
            AgentStatus::Exhausted => "Exhausted",
            AgentStatus::Failed => "Failed",
        }
    }
}

/// What an agent thread hands back when it is joined
#[derive(Debug, Clone)]
pub struct AgentReport {
    pub info: AgentInfo,
    pub status: AgentStatus,
    pub runs: u64,
    pub error: Option<String>,
    pub elapsed: Duration,
}

/// A single agent: task plus limits
pub struct Agent {
    info: AgentInfo,
    limits: AgentLimits,
    task: Box<dyn Task>,
}

impl Agent {
    pub fn new(info: AgentInfo, limits: AgentLimits, task: Box<dyn Task>) -> Self {
        Self { info, limits, task }
    }

    pub fn info(&self) -> &AgentInfo {
        &self.info
    }

    pub fn limits(&self) -> &AgentLimits {
        &self.limits
    }

    /// Run the loop until the run limit, the time limit, workload
    /// exhaustion or a workload error, whichever comes first.
    pub fn run(mut self, metrics: &MetricStore, latency: &LatencyRecorder) -> AgentReport {
        let start = Instant::now();
        let deadline = self.limits.time_limit.map(|limit| start + limit);
        let mut pacer = self.limits.rate.map(Pacer::new);
        let mut runs: u64 = 0;
        let mut error = None;

        debug!(agent = self.info.id, group = %self.info.group, "Agent started");

        let status = loop {
            if self.limits.runs.is_some_and(|limit| runs >= limit) {
                break AgentStatus::Complete;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break AgentStatus::TimedOut;
            }
            if let Some(ref mut pacer) = pacer {
                if !pacer.wait_for_slot(deadline) {
                    break AgentStatus::TimedOut;
                }
            }

            let op_start = Instant::now();
            match self.task.run_once(runs + 1, metrics) {
                Ok(Step::Ran(n)) => {
                    latency.record(op_start.elapsed());
                    runs += n;
                    if let Some(ref mut pacer) = pacer {
                        pacer.charge_extra(n.saturating_sub(1), op_start);
                    }
                }
                Ok(Step::Exhausted) => break AgentStatus::Exhausted,
                Err(e) => {
                    warn!(
                        agent = self.info.id,
                        group = %self.info.group,
                        runs,
                        "Agent failed: {}", e
                    );
                    error = Some(e.to_string());
                    break AgentStatus::Failed;
                }
            }
        };

        debug!(
            agent = self.info.id,
            group = %self.info.group,
            runs,
            status = status.as_str(),
            "Agent finished"
        );

        AgentReport {
            info: self.info,
            status,
            runs,
            error,
            elapsed: start.elapsed(),
        }
    }
}

/// Most recent run starts a pacer remembers; faster ceilings are spaced
/// evenly instead of allowing a burst
const MAX_BURST: usize = 1000;

/// Keeps an agent under its rate ceiling in every one-second window.
///
/// At most `burst` runs may start within any `window`. For a ceiling of at
/// least one run per second, `burst` is the whole number of runs the ceiling
/// allows and `window` is one second, so runs may burst at the start of a
/// window but time lost to a slow run is never made up. Lower ceilings allow
/// one run per `1 / rate` seconds.
struct Pacer {
    burst: usize,
    window: Duration,
    starts: VecDeque<Instant>,
}

impl Pacer {
    fn new(rate: f64) -> Self {
        let per_window = (rate.floor() as usize).max(1);
        let window = Duration::from_secs_f64((per_window as f64 / rate).max(1.0));
        let (burst, window) = if per_window > MAX_BURST {
            (1, window.div_f64(per_window as f64))
        } else {
            (per_window, window)
        };
        Self {
            burst,
            window,
            starts: VecDeque::with_capacity(burst),
        }
    }

    /// Sleep until the next run may start and record its start. Returns
    /// false if the deadline passes first.
    fn wait_for_slot(&mut self, deadline: Option<Instant>) -> bool {
        if self.starts.len() >= self.burst {
            if let Some(&oldest) = self.starts.front() {
                let due = oldest + self.window;
                let now = Instant::now();
                if due > now {
                    let wake = match deadline {
                        Some(d) if d < due => d,
                        _ => due,
                    };
                    thread::sleep(wake.saturating_duration_since(now));
                }
            }
        }
        let now = Instant::now();
        if deadline.is_some_and(|d| now >= d) {
            return false;
        }
        if self.starts.len() >= self.burst {
            self.starts.pop_front();
        }
        self.starts.push_back(now);
        true
    }

    /// Count runs beyond the first of a call that reported several
    fn charge_extra(&mut self, extra: u64, started: Instant) {
        let extra = extra.min(self.burst as u64);
        for _ in 0..extra {
            if self.starts.len() >= self.burst {
                self.starts.pop_front();
            }
            self.starts.push_back(started);
        }
    }
}

/// Sends the agent's id to the orchestrator when dropped.
///
/// Created before the agent's loop starts and moved into its thread, so the
/// signal fires exactly once whether the loop returns or panics.
pub struct CompletionSignal {
    id: usize,
    tx: Sender<usize>,
}

impl CompletionSignal {
    pub fn new(id: usize, tx: Sender<usize>) -> Self {
        Self { id, tx }
    }
}

impl Drop for CompletionSignal {
    fn drop(&mut self) {
        // The receiver only goes away once the orchestrator stopped waiting
        let _ = self.tx.send(self.id);
    }
}
