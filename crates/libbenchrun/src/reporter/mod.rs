//! Periodic reporters
//!
//! A reporter owns one background thread that, on a fixed interval,
//! snapshots every group's counters, turns the difference to the previous
//! snapshot into per-second rates and hands them to its sink. When stopped
//! it runs one last (partial) interval, lets the sink emit its final
//! aggregate per group, then closes the sink.
//!
//! Sink failures are logged and never leave the reporter thread.

pub mod console;
pub mod file;
pub mod telemetry;

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::group::{GroupInfo, GroupRuntime};
use crate::metrics::{LatencyPercentiles, MetricSnapshot};

pub use console::ConsoleSink;
pub use file::FileSink;
pub use telemetry::{format_record, MetricTransport, TcpTransport, TelemetrySink};

/// Per-second rates for one interval, keyed by counter name
pub type Rates = BTreeMap<String, f64>;

/// One group's measurements over one reporting interval
#[derive(Debug)]
pub struct IntervalSample<'a> {
    /// Wall-clock time of the sample, seconds since the epoch
    pub unix_time: i64,
    pub group: &'a GroupInfo,
    /// Time covered by this interval
    pub elapsed: Duration,
    pub rates: &'a Rates,
    /// Cumulative counters at the end of the interval
    pub totals: &'a MetricSnapshot,
}

/// One group's measurements over the reporter's whole lifetime
#[derive(Debug)]
pub struct FinalSample<'a> {
    pub unix_time: i64,
    pub group: &'a GroupInfo,
    /// Time since the reporter started sampling
    pub elapsed: Duration,
    pub totals: &'a MetricSnapshot,
    pub latency: LatencyPercentiles,
}

/// Output side of a reporter
pub trait ReportSink: Send {
    fn name(&self) -> &'static str;

    /// Acquire resources; called once on the reporter thread before sampling
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn interval(&mut self, sample: &IntervalSample<'_>) -> Result<()>;

    /// Emit the final aggregate for one group
    fn finish(&mut self, sample: &FinalSample<'_>) -> Result<()>;

    /// Release resources; called once after every group was finished
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Rates of change between two snapshots.
///
/// A counter missing from `previous` started at zero. Unchanged counters
/// report a rate of zero. An empty interval yields no rates.
pub fn compute_rates(
    previous: &MetricSnapshot,
    current: &MetricSnapshot,
    elapsed: Duration,
) -> Rates {
    let millis = elapsed.as_secs_f64() * 1000.0;
    if millis <= 0.0 {
        return Rates::new();
    }
    current
        .iter()
        .map(|(name, &value)| {
            let before = previous.get(name).copied().unwrap_or(0);
            let delta = value.saturating_sub(before);
            (name.clone(), delta as f64 * 1000.0 / millis)
        })
        .collect()
}

/// Lifecycle of a reporter thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReporterState {
    Created,
    Running,
    Stopping,
    Stopped,
}

/// A group as seen by a reporter: a weak handle to the live runtime
#[derive(Debug, Clone)]
pub struct GroupSource {
    info: GroupInfo,
    runtime: Weak<GroupRuntime>,
}

impl GroupSource {
    pub fn new(runtime: &Arc<GroupRuntime>) -> Self {
        Self {
            info: runtime.info().clone(),
            runtime: Arc::downgrade(runtime),
        }
    }

    pub fn info(&self) -> &GroupInfo {
        &self.info
    }

    /// Counters, or `None` once the group runtime was dropped
    fn snapshot(&self) -> Option<MetricSnapshot> {
        self.runtime.upgrade().map(|rt| rt.metrics().snapshot())
    }

    fn latency(&self) -> LatencyPercentiles {
        self.runtime
            .upgrade()
            .map(|rt| rt.latency().percentiles())
            .unwrap_or_default()
    }
}

/// Running reporter; stopping it blocks until its thread has exited
pub struct ReporterHandle {
    name: &'static str,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    state: Arc<Mutex<ReporterState>>,
}

impl ReporterHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> ReporterState {
        *self.state.lock()
    }

    pub fn is_stopped(&self) -> bool {
        self.handle.is_none()
    }

    /// Ask the reporter to stop and wait for it to reach `Stopped`.
    ///
    /// Repeated calls are no-ops.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        debug!(reporter = self.name, "Stopping reporter");
        // Dropping the sender wakes the reporter's timed wait
        self.stop_tx.take();
        if handle.join().is_err() {
            error!(reporter = self.name, "Reporter thread panicked");
            *self.state.lock() = ReporterState::Stopped;
        }
    }
}

impl Drop for ReporterHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Periodic sampler bound to one sink
pub struct Reporter {
    sink: Box<dyn ReportSink>,
    groups: Vec<GroupSource>,
    interval: Duration,
}

impl Reporter {
    pub fn new(sink: Box<dyn ReportSink>, groups: Vec<GroupSource>, interval: Duration) -> Self {
        Self {
            sink,
            groups,
            interval,
        }
    }

    /// Start the reporter thread.
    ///
    /// The baseline snapshot is taken here, before the caller can start any
    /// agent, so no increment is folded into it.
    pub fn spawn(self) -> Result<ReporterHandle> {
        let name = self.sink.name();
        let state = Arc::new(Mutex::new(ReporterState::Created));
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let started = Instant::now();
        let baseline: Vec<(Instant, MetricSnapshot)> = self
            .groups
            .iter()
            .map(|g| (started, g.snapshot().unwrap_or_default()))
            .collect();

        let thread_state = Arc::clone(&state);
        let handle = thread::Builder::new()
            .name(format!("reporter-{}", name))
            .spawn(move || {
                let mut reporter = self;
                *thread_state.lock() = ReporterState::Running;
                reporter.run(&stop_rx, &thread_state, started, baseline);
                *thread_state.lock() = ReporterState::Stopped;
            })?;

        Ok(ReporterHandle {
            name,
            stop_tx: Some(stop_tx),
            handle: Some(handle),
            state,
        })
    }

    fn run(
        &mut self,
        stop_rx: &crossbeam_channel::Receiver<()>,
        state: &Mutex<ReporterState>,
        started: Instant,
        mut previous: Vec<(Instant, MetricSnapshot)>,
    ) {
        let name = self.sink.name();
        if let Err(e) = self.sink.open() {
            error!(reporter = name, "Failed to open sink: {}", e);
        }

        let mut next_tick = started + self.interval;
        loop {
            match stop_rx.recv_deadline(next_tick) {
                Err(RecvTimeoutError::Timeout) => {
                    self.sample(&mut previous);
                    next_tick += self.interval;
                    // A slow sink must not cause a burst of catch-up ticks
                    let now = Instant::now();
                    if next_tick <= now {
                        next_tick = now + self.interval;
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        *state.lock() = ReporterState::Stopping;
        self.sample(&mut previous);

        let unix_time = chrono::Utc::now().timestamp();
        for (group, (_, totals)) in self.groups.iter().zip(previous.iter()) {
            let sample = FinalSample {
                unix_time,
                group: group.info(),
                elapsed: started.elapsed(),
                totals,
                latency: group.latency(),
            };
            if let Err(e) = self.sink.finish(&sample) {
                warn!(reporter = name, group = %group.info().name, "Final report failed: {}", e);
            }
        }

        if let Err(e) = self.sink.close() {
            warn!(reporter = name, "Failed to close sink: {}", e);
        }
        debug!(reporter = name, "Reporter stopped");
    }

    /// Take one interval sample of every group
    fn sample(&mut self, previous: &mut [(Instant, MetricSnapshot)]) {
        let name = self.sink.name();
        let unix_time = chrono::Utc::now().timestamp();

        for (group, prev) in self.groups.iter().zip(previous.iter_mut()) {
            let Some(current) = group.snapshot() else {
                continue;
            };
            let now = Instant::now();
            let elapsed = now.duration_since(prev.0);
            let rates = compute_rates(&prev.1, &current, elapsed);
            let sample = IntervalSample {
                unix_time,
                group: group.info(),
                elapsed,
                rates: &rates,
                totals: &current,
            };
            if let Err(e) = self.sink.interval(&sample) {
                warn!(reporter = name, group = %group.info().name, "Interval report failed: {}", e);
            }
            *prev = (now, current);
        }
    }
}
