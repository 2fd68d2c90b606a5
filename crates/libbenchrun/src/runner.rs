//! Benchmark runner - drives a workload through one run
//!
//! The runner walks the workload through its lifecycle hooks, starts one
//! reporter per configured sink, starts one thread per agent and then waits
//! for every agent to signal completion before stopping the reporters.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::agent::{AgentReport, AgentStatus, CompletionSignal};
use crate::config::{keys, Configuration, ConfigurationBuilder};
use crate::error::{BenchError, Result};
use crate::group::{validate_groups, AgentGroup, GroupRuntime};
use crate::metrics::{LatencyPercentiles, MetricSnapshot};
use crate::registry::WorkloadRegistry;
use crate::reporter::{
    ConsoleSink, FileSink, GroupSource, MetricTransport, ReportSink, Reporter, ReporterHandle,
    TcpTransport, TelemetrySink,
};
use crate::workload::{AgentInfo, Workload};

/// Upper bound on how long the runner sleeps between completion checks
pub const COMPLETION_POLL: Duration = Duration::from_secs(1);

/// When the reporters are stopped relative to agent completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReporterStopPolicy {
    /// As soon as any agent finishes
    FirstAgent,
    /// Once every agent has finished
    LastAgent,
}

impl ReporterStopPolicy {
    pub fn from_config(config: &Configuration) -> Result<Self> {
        match config.get_or(keys::STOP_REPORTERS, "first") {
            "first" => Ok(ReporterStopPolicy::FirstAgent),
            "last" => Ok(ReporterStopPolicy::LastAgent),
            other => Err(BenchError::Config(format!(
                "invalid value '{}' for option --{} (expected first or last)",
                other,
                keys::STOP_REPORTERS
            ))),
        }
    }
}

/// Engine options resolved from the configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub interval: Duration,
    pub stop_policy: ReporterStopPolicy,
    pub report_file: Option<PathBuf>,
    pub telemetry: Option<String>,
    pub telemetry_tag: String,
    pub quiet: bool,
}

impl RunSettings {
    pub fn from_config(config: &Configuration) -> Result<Self> {
        Ok(Self {
            interval: config.report_interval()?,
            stop_policy: ReporterStopPolicy::from_config(config)?,
            report_file: config.get_non_empty(keys::REPORT_FILE).map(PathBuf::from),
            telemetry: config.get_non_empty(keys::TELEMETRY).map(str::to_string),
            telemetry_tag: config.get_or(keys::TELEMETRY_TAG, "").to_string(),
            quiet: config.get_bool_or(keys::QUIET, false)?,
        })
    }
}

/// Where a runner is in its run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Configured,
    Initializing,
    WarmingUp,
    SpawningGroups,
    Running,
    /// Reporters are being stopped; agents may still be running
    Draining,
    Stopped,
    ShutDown,
}

/// Result of [`BenchmarkRunner::configure`]
pub enum Configured {
    Ready(BenchmarkRunner),
    /// `--help` was requested; the usage text to print
    Help(String),
}

/// Final counters and latencies of one group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupOutcome {
    pub name: String,
    pub agent_count: usize,
    /// Runs executed by all agents of the group
    pub runs: u64,
    pub agents_failed: usize,
    pub metrics: MetricSnapshot,
    pub latency: LatencyPercentiles,
}

/// Summary of a finished run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub benchmark: String,
    #[serde(with = "serde_duration")]
    pub elapsed: Duration,
    pub agents_total: usize,
    pub agents_failed: usize,
    pub groups: Vec<GroupOutcome>,
}

impl RunOutcome {
    pub fn group(&self, name: &str) -> Option<&GroupOutcome> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// No agent failed
    pub fn is_clean(&self) -> bool {
        self.agents_failed == 0
    }
}

mod serde_duration {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

/// An agent thread that has not been joined yet
struct ActiveAgent {
    group: usize,
    info: AgentInfo,
    handle: JoinHandle<AgentReport>,
}

/// Runs one configured workload
pub struct BenchmarkRunner {
    workload: Box<dyn Workload>,
    config: Configuration,
    settings: RunSettings,
    console: Option<Box<dyn Write + Send>>,
    transport: Option<Box<dyn MetricTransport>>,
    phase: RunPhase,
}

impl BenchmarkRunner {
    /// Configure `workload` and resolve the engine options
    pub fn new(mut workload: Box<dyn Workload>, config: Configuration) -> Result<Self> {
        let settings = RunSettings::from_config(&config)?;
        workload
            .configure(&config)
            .map_err(|e| BenchError::Config(format!("{}: {}", workload.name(), e)))?;
        for (key, value) in config.iter() {
            debug!("--{} {}", key, value);
        }

        Ok(Self {
            workload,
            config,
            settings,
            console: None,
            transport: None,
            phase: RunPhase::Configured,
        })
    }

    /// Build a runner from command-line pairs layered over `base`
    pub fn configure<I, S>(
        base: ConfigurationBuilder,
        args: I,
        registry: &WorkloadRegistry,
    ) -> Result<Configured>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let parsed = Configuration::from_args_with(base, args)?;
        let bench = parsed.config.bench();

        if parsed.help {
            let workload = bench.map(|name| registry.create(name)).transpose()?;
            return Ok(Configured::Help(usage(registry, workload.as_deref())));
        }

        let Some(bench) = bench else {
            return Err(BenchError::Config(format!(
                "--{} is required. Available: {}",
                keys::BENCH,
                registry.names().collect::<Vec<_>>().join(", ")
            )));
        };
        let workload = registry.create(bench)?;
        Ok(Configured::Ready(Self::new(workload, parsed.config)?))
    }

    /// Send console output here instead of stdout
    pub fn with_console_output(mut self, out: Box<dyn Write + Send>) -> Self {
        self.console = Some(out);
        self
    }

    /// Publish telemetry through `transport`, regardless of `--telemetry`
    pub fn with_telemetry_transport(mut self, transport: Box<dyn MetricTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn workload_name(&self) -> &str {
        self.workload.name()
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    fn enter(&mut self, phase: RunPhase) {
        debug!(from = ?self.phase, to = ?phase, "Run phase");
        self.phase = phase;
    }

    /// Execute the run. Returns once every agent has finished.
    pub fn run(&mut self) -> Result<RunOutcome> {
        if self.phase != RunPhase::Configured {
            return Err(BenchError::Config(format!(
                "benchmark {} has already run",
                self.workload.name()
            )));
        }
        let started = Instant::now();
        info!("Running benchmark {}", self.workload.name());

        self.enter(RunPhase::Initializing);
        self.workload
            .initialize()
            .map_err(|e| BenchError::lifecycle("initialize", e))?;

        self.enter(RunPhase::WarmingUp);
        self.workload
            .warmup()
            .map_err(|e| BenchError::lifecycle("warmup", e))?;

        self.enter(RunPhase::SpawningGroups);
        let groups = self.workload.agent_groups()?;
        validate_groups(&groups)?;
        let runtimes: Vec<Arc<GroupRuntime>> = groups
            .iter()
            .map(|g| Arc::new(GroupRuntime::new(g.info())))
            .collect();

        let mut reporters = self.start_reporters(&runtimes);

        let (tx, rx) = unbounded();
        let mut active = HashMap::new();
        let mut reports = Vec::new();
        let mut next_id = 0;
        for (index, (group, runtime)) in groups.iter().zip(&runtimes).enumerate() {
            info!("Starting {}", group.describe());
            spawn_group(index, group, runtime, next_id, &tx, &mut active, &mut reports);
            next_id += group.agent_count();
        }
        // Only the agents' signals keep the channel open from here on
        drop(tx);
        let agents_total = next_id;

        self.enter(RunPhase::Running);
        let mut reporters_stopped = false;
        if self.settings.stop_policy == ReporterStopPolicy::FirstAgent && !reports.is_empty() {
            self.stop_reporters(&mut reporters);
            reporters_stopped = true;
        }

        while !active.is_empty() {
            wait_for_agents(&rx, &mut active, &mut reports);
            if !reporters_stopped
                && self.settings.stop_policy == ReporterStopPolicy::FirstAgent
                && !reports.is_empty()
            {
                self.stop_reporters(&mut reporters);
                reporters_stopped = true;
            }
        }
        if !reporters_stopped {
            self.stop_reporters(&mut reporters);
        }
        self.enter(RunPhase::Stopped);

        let outcome = build_outcome(
            self.workload.name(),
            started.elapsed(),
            agents_total,
            &runtimes,
            &reports,
        );
        info!(
            agents = outcome.agents_total,
            failed = outcome.agents_failed,
            "Benchmark {} finished in {:.2}s",
            outcome.benchmark,
            outcome.elapsed.as_secs_f64()
        );
        Ok(outcome)
    }

    /// Let the workload release its resources
    pub fn shutdown(&mut self) -> Result<()> {
        if self.phase == RunPhase::ShutDown {
            return Ok(());
        }
        self.enter(RunPhase::ShutDown);
        self.workload
            .shutdown()
            .map_err(|e| BenchError::lifecycle("shutdown", e))
    }

    /// [`run`](Self::run) followed by [`shutdown`](Self::shutdown).
    ///
    /// A shutdown failure is logged and never replaces the run's result.
    pub fn run_and_shutdown(mut self) -> Result<RunOutcome> {
        let result = self.run();
        if let Err(e) = self.shutdown() {
            error!("{}", e);
        }
        result
    }

    /// Start reporters in stop order: console, file, telemetry
    fn start_reporters(&mut self, runtimes: &[Arc<GroupRuntime>]) -> Vec<ReporterHandle> {
        let sources: Vec<GroupSource> = runtimes.iter().map(GroupSource::new).collect();
        let benchmark = self.workload.name().to_string();
        let mut sinks: Vec<Box<dyn ReportSink>> = Vec::new();

        if !self.settings.quiet {
            let sink = match self.console.take() {
                Some(out) => ConsoleSink::with_writer(out),
                None => ConsoleSink::stdout(),
            };
            sinks.push(Box::new(sink));
        }
        if let Some(ref path) = self.settings.report_file {
            let sink = FileSink::new(path, &benchmark);
            info!("Reporting to file {}", sink.path().display());
            sinks.push(Box::new(sink));
        }
        let transport = match (self.transport.take(), &self.settings.telemetry) {
            (Some(transport), _) => Some(transport),
            (None, Some(addr)) => {
                info!("Reporting telemetry to {}", addr);
                Some(Box::new(TcpTransport::new(addr.clone())) as Box<dyn MetricTransport>)
            }
            (None, None) => None,
        };
        if let Some(transport) = transport {
            sinks.push(Box::new(TelemetrySink::new(
                &benchmark,
                self.settings.telemetry_tag.clone(),
                transport,
            )));
        }

        let mut handles = Vec::with_capacity(sinks.len());
        for sink in sinks {
            let name = sink.name();
            match Reporter::new(sink, sources.clone(), self.settings.interval).spawn() {
                Ok(handle) => handles.push(handle),
                Err(e) => error!(reporter = name, "Failed to start reporter: {}", e),
            }
        }
        handles
    }

    fn stop_reporters(&mut self, reporters: &mut [ReporterHandle]) {
        self.enter(RunPhase::Draining);
        for reporter in reporters.iter_mut() {
            reporter.stop();
            debug!(reporter = reporter.name(), "Reporter stopped");
        }
    }
}

/// Start one thread per agent of `group`
fn spawn_group(
    index: usize,
    group: &AgentGroup,
    runtime: &Arc<GroupRuntime>,
    first_id: usize,
    tx: &crossbeam_channel::Sender<usize>,
    active: &mut HashMap<usize, ActiveAgent>,
    reports: &mut Vec<AgentReport>,
) {
    for agent in group.create_agents(first_id) {
        let info = agent.info().clone();
        let signal = CompletionSignal::new(info.id, tx.clone());
        let runtime = Arc::clone(runtime);

        let spawned = thread::Builder::new()
            .name(format!("agent-{}-{}", info.group, info.index))
            .spawn(move || {
                let _signal = signal;
                agent.run(runtime.metrics(), runtime.latency())
            });

        match spawned {
            Ok(handle) => {
                active.insert(info.id, ActiveAgent { group: index, info, handle });
            }
            Err(e) => {
                error!(agent = info.id, group = %info.group, "Failed to start agent thread: {}", e);
                reports.push(failed_report(info, format!("thread spawn failed: {}", e)));
            }
        }
    }
}

/// Block until at least one agent completes or the poll interval passes,
/// then join whatever has finished
fn wait_for_agents(
    rx: &Receiver<usize>,
    active: &mut HashMap<usize, ActiveAgent>,
    reports: &mut Vec<AgentReport>,
) {
    match rx.recv_timeout(COMPLETION_POLL) {
        Ok(id) => {
            join_agent(id, active, reports);
            for id in rx.try_iter() {
                join_agent(id, active, reports);
            }
        }
        Err(RecvTimeoutError::Timeout) => {
            let finished: Vec<usize> = active
                .iter()
                .filter(|(_, agent)| agent.handle.is_finished())
                .map(|(id, _)| *id)
                .collect();
            if !finished.is_empty() {
                debug!(count = finished.len(), "Found finished agents without a signal");
            }
            for id in finished {
                join_agent(id, active, reports);
            }
        }
        Err(RecvTimeoutError::Disconnected) => {
            // Every signal has fired, so every thread is done or about to be
            let ids: Vec<usize> = active.keys().copied().collect();
            for id in ids {
                join_agent(id, active, reports);
            }
        }
    }
}

/// Join a finished agent; unknown or already joined ids are ignored
fn join_agent(
    id: usize,
    active: &mut HashMap<usize, ActiveAgent>,
    reports: &mut Vec<AgentReport>,
) {
    let Some(agent) = active.remove(&id) else {
        debug!(agent = id, "Ignoring completion of unknown or joined agent");
        return;
    };
    let report = match agent.handle.join() {
        Ok(report) => report,
        Err(_) => failed_report(agent.info, "agent thread panicked".to_string()),
    };
    if let Some(ref message) = report.error {
        let err = BenchError::Agent {
            group: report.info.group.clone(),
            agent: report.info.id,
            message: message.clone(),
        };
        warn!(group_index = agent.group, "{}", err);
    }
    debug!(agent = id, status = report.status.as_str(), runs = report.runs, "Agent joined");
    reports.push(report);
}

fn failed_report(info: AgentInfo, message: String) -> AgentReport {
    AgentReport {
        info,
        status: AgentStatus::Failed,
        runs: 0,
        error: Some(message),
        elapsed: Duration::ZERO,
    }
}

fn build_outcome(
    benchmark: &str,
    elapsed: Duration,
    agents_total: usize,
    runtimes: &[Arc<GroupRuntime>],
    reports: &[AgentReport],
) -> RunOutcome {
    let groups: Vec<GroupOutcome> = runtimes
        .iter()
        .map(|runtime| {
            let info = runtime.info();
            let own = || reports.iter().filter(|r| r.info.group == info.name);
            GroupOutcome {
                name: info.name.clone(),
                agent_count: info.agent_count,
                runs: own().map(|r| r.runs).sum(),
                agents_failed: own().filter(|r| r.status == AgentStatus::Failed).count(),
                metrics: runtime.metrics().snapshot(),
                latency: runtime.latency().percentiles(),
            }
        })
        .collect();

    RunOutcome {
        benchmark: benchmark.to_string(),
        elapsed,
        agents_total,
        agents_failed: groups.iter().map(|g| g.agents_failed).sum(),
        groups,
    }
}

/// Usage text: engine options, then the workload's own options when known
pub fn usage(registry: &WorkloadRegistry, workload: Option<&dyn Workload>) -> String {
    let mut text =
        String::from("Usage: benchrun [--config <file>] --bench <name> [--<key> <value>]...\n\n");
    text.push_str("Engine options:\n");
    let engine = [
        ("--bench <name>", "workload to run"),
        ("--report <secs>", "reporting interval (default 60)"),
        ("--reportfile <path>", "append average rates to this file"),
        ("--telemetry <host:port>", "send rate records to a collector"),
        ("--telemetrytag <tag>", "extra tag on every telemetry record"),
        ("--stopreporters <first|last>", "stop reporters when the first or last agent ends"),
        ("--jsonreport <path>", "write the run outcome as JSON"),
        ("--quiet <bool>", "disable console reporting"),
    ];
    for (option, description) in engine {
        text.push_str(&format!("  {:<30} {}\n", option, description));
    }

    match workload {
        Some(workload) => {
            let options = workload.usage();
            text.push_str(&format!("\n{} options:\n", workload.name()));
            if options.is_empty() {
                text.push_str("  (none)\n");
            }
            for (option, description) in options {
                text.push_str(&format!("  {:<30} {}\n", option, description));
            }
        }
        None => {
            text.push_str("\nWorkloads:\n");
            for (name, description) in registry.list() {
                text.push_str(&format!("  {:<30} {}\n", name, description));
            }
        }
    }
    text
}
