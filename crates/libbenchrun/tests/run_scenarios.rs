//! End-to-end runs through the benchmark runner

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use libbenchrun::config::keys;
use libbenchrun::runner::{Configured, RunPhase};
use libbenchrun::{
    AgentGroup, AgentInfo, BenchError, BenchmarkRunner, Configuration, ConfigurationBuilder,
    MetricStore, MetricTransport, Result, Step, Task, Workload, WorkloadError, WorkloadRegistry,
};
use parking_lot::Mutex;
use tempfile::tempdir;

type GroupBuilder = Box<dyn Fn() -> Result<Vec<AgentGroup>> + Send>;

/// Workload assembled from a group builder, recording which hooks ran
struct TestWorkload {
    name: &'static str,
    groups: GroupBuilder,
    fail_initialize: bool,
    shutdown_called: Arc<AtomicBool>,
}

impl TestWorkload {
    fn new(
        name: &'static str,
        groups: impl Fn() -> Result<Vec<AgentGroup>> + Send + 'static,
    ) -> Self {
        Self {
            name,
            groups: Box::new(groups),
            fail_initialize: false,
            shutdown_called: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Workload for TestWorkload {
    fn name(&self) -> &str {
        self.name
    }

    fn initialize(&mut self) -> std::result::Result<(), WorkloadError> {
        if self.fail_initialize {
            return Err(WorkloadError::failed("database unreachable"));
        }
        Ok(())
    }

    fn agent_groups(&self) -> Result<Vec<AgentGroup>> {
        (self.groups)()
    }

    fn shutdown(&mut self) -> std::result::Result<(), WorkloadError> {
        self.shutdown_called.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn ops_group(name: &str, agents: usize) -> Result<AgentGroup> {
    AgentGroup::new(name, agents, |_: &AgentInfo| -> Box<dyn Task> {
        Box::new(|_: u64, m: &MetricStore| {
            m.increment("ops", 1);
            Ok::<_, WorkloadError>(Step::Ran(1))
        })
    })
}

/// Console output captured with the time each write happened
#[derive(Clone, Default)]
struct Capture {
    text: Arc<Mutex<String>>,
    summary_at: Arc<Mutex<Option<Instant>>>,
}

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let chunk = String::from_utf8_lossy(buf);
        if chunk.contains("===") {
            self.summary_at.lock().get_or_insert_with(Instant::now);
        }
        self.text.lock().push_str(&chunk);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Ordered reporter events, each noting whether the report file already
/// held its line at that moment
type Events = Arc<Mutex<Vec<(&'static str, bool)>>>;

fn report_written(report: Option<&Path>) -> bool {
    report
        .and_then(|path| std::fs::read_to_string(path).ok())
        .is_some_and(|content| content.contains("put "))
}

/// Collects telemetry records and notes when the transport was closed
#[derive(Clone)]
struct MemoryTransport {
    records: Arc<Mutex<Vec<String>>>,
    events: Events,
    report: Option<PathBuf>,
}

impl MemoryTransport {
    fn new(events: &Events) -> Self {
        Self {
            records: Arc::new(Mutex::new(Vec::new())),
            events: Arc::clone(events),
            report: None,
        }
    }
}

impl MetricTransport for MemoryTransport {
    fn send(&mut self, record: &str) -> io::Result<()> {
        self.records.lock().push(record.to_string());
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        let written = report_written(self.report.as_deref());
        self.events.lock().push(("telemetry closed", written));
        Ok(())
    }
}

/// Console writer that logs an event for every write
struct EventWriter {
    events: Events,
    report: PathBuf,
}

impl Write for EventWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = report_written(Some(self.report.as_path()));
        self.events.lock().push(("console write", written));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn config(pairs: &[(&str, &str)]) -> Configuration {
    pairs
        .iter()
        .fold(Configuration::builder(), |b, (k, v)| b.set(*k, *v))
        .build()
}

/// Two writers sharing 100 runs: every run counted, one file line
#[test]
fn test_writers_end_to_end_with_file_report() {
    let dir = tempdir().unwrap();
    let report = dir.path().join("report.txt");
    let workload = TestWorkload::new("perf.Writers", || {
        Ok(vec![ops_group("writers", 2)?.with_total_runs(100)])
    });

    let runner = BenchmarkRunner::new(
        Box::new(workload),
        config(&[
            (keys::QUIET, "true"),
            (keys::REPORT_FILE, report.to_str().unwrap()),
        ]),
    )
    .unwrap();
    let outcome = runner.run_and_shutdown().unwrap();

    let writers = outcome.group("writers").unwrap();
    assert_eq!(writers.metrics["ops"], 100);
    assert_eq!(writers.runs, 100);
    assert_eq!(outcome.agents_total, 2);
    assert!(outcome.is_clean());

    let content = std::fs::read_to_string(&report).unwrap();
    let lines: Vec<_> = content.lines().collect();
    assert_eq!(lines.len(), 1, "{}", content);
    assert!(lines[0].starts_with("put benchmark.ops.per_sec.avg "), "{}", lines[0]);
    assert!(lines[0].ends_with("benchmark=Writers group=writers agents=2"), "{}", lines[0]);
}

#[test]
fn test_telemetry_records_carry_tag() {
    let transport = MemoryTransport::new(&Arc::new(Mutex::new(Vec::new())));
    let records = Arc::clone(&transport.records);
    let workload = TestWorkload::new("test.Pacer", || {
        Ok(vec![ops_group("pacer", 1)?
            .with_duration_secs(2)
            .with_max_runs_per_second(50)])
    });

    let runner = BenchmarkRunner::new(
        Box::new(workload),
        config(&[
            (keys::QUIET, "true"),
            (keys::REPORT, "1"),
            (keys::TELEMETRY_TAG, "env=ci"),
        ]),
    )
    .unwrap()
    .with_telemetry_transport(Box::new(transport));
    let outcome = runner.run_and_shutdown().unwrap();

    let runs = outcome.group("pacer").unwrap().runs;
    assert!(runs <= 101, "rate ceiling exceeded: {}", runs);

    let records = records.lock();
    let interval = records
        .iter()
        .filter(|r| r.starts_with("put benchmark.ops.per_sec.1m "))
        .count();
    assert!(interval >= 1, "{:?}", *records);
    let last = records.last().unwrap();
    assert!(last.starts_with("put benchmark.ops.per_sec.avg "), "{}", last);
    assert!(records
        .iter()
        .all(|r| r.ends_with("benchmark=Pacer group=pacer agents=1 env=ci")));
}

#[test]
fn test_failing_agents_are_isolated() {
    let workload = TestWorkload::new("flaky", || {
        let flaky = AgentGroup::new("flaky", 4, |info: &AgentInfo| -> Box<dyn Task> {
            let index = info.index;
            Box::new(move |iteration: u64, m: &MetricStore| {
                if index == 1 && iteration == 5 {
                    return Err(WorkloadError::failed("lost connection"));
                }
                if index == 2 && iteration == 3 {
                    panic!("workload bug");
                }
                m.increment("ops", 1);
                Ok(Step::Ran(1))
            })
        })?
        .with_total_runs(40);
        Ok(vec![flaky])
    });

    let runner =
        BenchmarkRunner::new(Box::new(workload), config(&[(keys::QUIET, "true")])).unwrap();
    let outcome = runner.run_and_shutdown().unwrap();

    let flaky = outcome.group("flaky").unwrap();
    assert_eq!(outcome.agents_failed, 2);
    assert_eq!(flaky.agents_failed, 2);
    // Agents 0 and 3 ran all 10 runs, agent 1 four, agent 2 two
    assert_eq!(flaky.metrics["ops"], 10 + 4 + 2 + 10);
    assert_eq!(flaky.runs, 10 + 4 + 10);
}

#[test]
fn test_initialize_failure_starts_no_agents() {
    let started = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&started);
    let mut workload = TestWorkload::new("broken", move || {
        let counter = Arc::clone(&counter);
        Ok(vec![AgentGroup::new("writers", 2, move |_: &AgentInfo| -> Box<dyn Task> {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::new(|_: u64, _: &MetricStore| Ok::<_, WorkloadError>(Step::Exhausted))
        })?])
    });
    workload.fail_initialize = true;
    let shutdown_called = Arc::clone(&workload.shutdown_called);

    let runner =
        BenchmarkRunner::new(Box::new(workload), config(&[(keys::QUIET, "true")])).unwrap();
    let err = runner.run_and_shutdown().unwrap_err();

    assert!(matches!(err, BenchError::Lifecycle { phase: "initialize", .. }));
    assert_eq!(err.exit_code(), 3);
    assert_eq!(started.load(Ordering::SeqCst), 0);
    assert!(shutdown_called.load(Ordering::SeqCst));
}

#[test]
fn test_zero_agent_group_is_config_error() {
    let workload = TestWorkload::new("empty", || Ok(vec![ops_group("writers", 0)?]));
    let mut runner =
        BenchmarkRunner::new(Box::new(workload), config(&[(keys::QUIET, "true")])).unwrap();
    let err = runner.run().unwrap_err();
    assert!(matches!(err, BenchError::Config(ref msg) if msg.contains("at least one")));
    assert_eq!(runner.phase(), RunPhase::SpawningGroups);
}

#[test]
fn test_reporters_stop_in_order() {
    let dir = tempdir().unwrap();
    let report = dir.path().join("report.txt");
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let transport = MemoryTransport {
        report: Some(report.clone()),
        ..MemoryTransport::new(&events)
    };
    let workload = TestWorkload::new("ordered", || {
        Ok(vec![ops_group("writers", 1)?.with_total_runs(10)])
    });

    let runner = BenchmarkRunner::new(
        Box::new(workload),
        config(&[(keys::REPORT_FILE, report.to_str().unwrap())]),
    )
    .unwrap()
    .with_console_output(Box::new(EventWriter {
        events: Arc::clone(&events),
        report: report.clone(),
    }))
    .with_telemetry_transport(Box::new(transport));
    runner.run_and_shutdown().unwrap();

    let events = events.lock();
    // Console finished before the file line was written
    assert!(events.iter().any(|(e, _)| *e == "console write"), "{:?}", *events);
    assert!(
        events.iter().filter(|(e, _)| *e == "console write").all(|(_, written)| !written),
        "{:?}",
        *events
    );
    // and the file line was there before telemetry closed
    let closed = events.iter().position(|(e, _)| *e == "telemetry closed").unwrap();
    assert!(events[closed].1, "{:?}", *events);
    let last_console = events.iter().rposition(|(e, _)| *e == "console write").unwrap();
    assert!(last_console < closed, "{:?}", *events);
    assert!(report_written(Some(report.as_path())));
}

fn fast_and_slow() -> TestWorkload {
    TestWorkload::new("mixed", || {
        Ok(vec![
            ops_group("fast", 1)?.with_total_runs(1),
            ops_group("slow", 1)?
                .with_duration_secs(1)
                .with_max_runs_per_second(100),
        ])
    })
}

#[test]
fn test_reporters_stop_at_first_agent_but_run_waits_for_all() {
    let console = Capture::default();
    let runner = BenchmarkRunner::new(Box::new(fast_and_slow()), Configuration::default())
        .unwrap()
        .with_console_output(Box::new(console.clone()));

    let start = Instant::now();
    let outcome = runner.run_and_shutdown().unwrap();
    let summary_at = console.summary_at.lock().unwrap();

    assert!(start.elapsed() >= Duration::from_secs(1));
    assert!(summary_at.duration_since(start) < Duration::from_millis(900));
    assert!(outcome.group("slow").unwrap().runs > 50);
    assert!(console.text.lock().contains("=== slow"));
}

#[test]
fn test_reporters_stop_at_last_agent_when_asked() {
    let console = Capture::default();
    let runner = BenchmarkRunner::new(
        Box::new(fast_and_slow()),
        config(&[(keys::STOP_REPORTERS, "last")]),
    )
    .unwrap()
    .with_console_output(Box::new(console.clone()));

    let start = Instant::now();
    runner.run_and_shutdown().unwrap();
    let summary_at = console.summary_at.lock().unwrap();

    assert!(summary_at.duration_since(start) >= Duration::from_secs(1));
}

#[test]
fn test_builtin_readwrite_from_args() {
    let registry = WorkloadRegistry::builtin();
    let args = [
        "--bench", "suite.readwrite", "--readers", "2", "--writers", "2", "--seconds", "1",
        "--rows", "200", "--quiet", "true", "--stopreporters", "last",
    ];
    let Configured::Ready(runner) =
        BenchmarkRunner::configure(ConfigurationBuilder::default(), args, &registry).unwrap()
    else {
        panic!("expected a runnable configuration");
    };
    assert_eq!(runner.workload_name(), "readwrite");

    let outcome = runner.run_and_shutdown().unwrap();
    let names: Vec<_> = outcome.groups.iter().map(|g| g.name.as_str()).collect();
    assert_eq!(names, vec!["readers", "writers"]);
    // Warmup seeds a tenth of the rows
    assert_eq!(outcome.group("writers").unwrap().metrics["writes"], 180);
    assert!(outcome.group("readers").unwrap().metrics["reads"] > 0);
    assert!(outcome.is_clean());
}

#[test]
fn test_toml_options_under_command_line() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bench.toml");
    std::fs::write(&path, "bench = \"counter\"\nagents = 3\nruns = 30\nquiet = true\n").unwrap();

    let base = ConfigurationBuilder::default().load_toml(&path).unwrap();
    let Configured::Ready(runner) =
        BenchmarkRunner::configure(base, ["--runs", "60"], &WorkloadRegistry::builtin()).unwrap()
    else {
        panic!("expected a runnable configuration");
    };

    let outcome = runner.run_and_shutdown().unwrap();
    let counter = outcome.group("counter").unwrap();
    assert_eq!(counter.agent_count, 3);
    assert_eq!(counter.metrics["ops"], 60);
}
