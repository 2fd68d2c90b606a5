//! Telemetry sink: forwards rate records to a metric collector
//!
//! Records are OpenTSDB-style put lines:
//!
//! ```text
//! put <metric> <unix-seconds> <value> benchmark=<name> group=<group> agents=<n>[ <tag>]
//! ```

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{FinalSample, IntervalSample, ReportSink};
use crate::error::{BenchError, Result};

/// Suffix of per-interval rate metrics
pub const INTERVAL_SUFFIX: &str = "per_sec.1m";
/// Suffix of final average rate metrics
pub const AVERAGE_SUFFIX: &str = "per_sec.avg";

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// Records sent within this long after a failed connect fail immediately
const RECONNECT_BACKOFF: Duration = Duration::from_secs(10);

/// Build one record. `tag` is appended verbatim when non-empty.
pub fn format_record(
    metric: &str,
    unix_time: i64,
    value: f64,
    benchmark: &str,
    group: &str,
    agents: usize,
    tag: &str,
) -> String {
    let mut record = format!(
        "put {} {} {:.2} benchmark={} group={} agents={}",
        metric, unix_time, value, benchmark, group, agents
    );
    if !tag.is_empty() {
        record.push(' ');
        record.push_str(tag);
    }
    record
}

/// Name under which a counter's rate is published
pub fn metric_name(counter: &str, suffix: &str) -> String {
    format!("benchmark.{}.{}", counter, suffix)
}

/// Strip a dotted prefix from a workload name (`perf.bench.Counter` -> `Counter`)
pub fn short_benchmark_name(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

/// Destination for telemetry records
pub trait MetricTransport: Send {
    fn send(&mut self, record: &str) -> io::Result<()>;

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Newline-delimited records over TCP.
///
/// Connects on first use; after a failed write the connection is dropped
/// and the next record reconnects. Connecting is bounded by
/// `CONNECT_TIMEOUT`, and after a failed attempt no new one is made for
/// `RECONNECT_BACKOFF`.
pub struct TcpTransport {
    addr: String,
    stream: Option<TcpStream>,
    retry_at: Option<Instant>,
}

impl TcpTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            stream: None,
            retry_at: None,
        }
    }

    fn connect(&mut self) -> io::Result<&mut TcpStream> {
        if self.stream.is_none() {
            if self.retry_at.is_some_and(|at| Instant::now() < at) {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    format!("telemetry collector {} unreachable, waiting to reconnect", self.addr),
                ));
            }
            debug!(addr = %self.addr, "Connecting to telemetry collector");
            match open_stream(&self.addr) {
                Ok(stream) => {
                    self.retry_at = None;
                    self.stream = Some(stream);
                }
                Err(e) => {
                    self.retry_at = Some(Instant::now() + RECONNECT_BACKOFF);
                    return Err(e);
                }
            }
        }
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no telemetry connection"))
    }
}

/// Try every address `addr` resolves to, each within `CONNECT_TIMEOUT`
fn open_stream(addr: &str) -> io::Result<TcpStream> {
    let mut last_error = None;
    for socket_addr in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&socket_addr, CONNECT_TIMEOUT) {
            Ok(stream) => {
                stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} resolved to no addresses", addr),
        )
    }))
}

impl MetricTransport for TcpTransport {
    fn send(&mut self, record: &str) -> io::Result<()> {
        let stream = self.connect()?;
        let result = stream
            .write_all(record.as_bytes())
            .and_then(|_| stream.write_all(b"\n"))
            .and_then(|_| stream.flush());
        if result.is_err() {
            self.stream = None;
        }
        result
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.flush()?;
            stream.shutdown(std::net::Shutdown::Both)?;
        }
        Ok(())
    }
}

/// Publishes every interval rate and, on stop, the average rate per counter
pub struct TelemetrySink {
    benchmark: String,
    tag: String,
    transport: Box<dyn MetricTransport>,
    /// Interval rates per group and counter
    history: BTreeMap<String, BTreeMap<String, Vec<f64>>>,
}

impl TelemetrySink {
    pub fn new(
        benchmark: &str,
        tag: impl Into<String>,
        transport: Box<dyn MetricTransport>,
    ) -> Self {
        Self {
            benchmark: short_benchmark_name(benchmark).to_string(),
            tag: tag.into(),
            transport,
            history: BTreeMap::new(),
        }
    }

    /// Send records in order; the first failure abandons the rest of the batch
    fn send_all(&mut self, records: Vec<String>) -> Result<()> {
        for (sent, record) in records.iter().enumerate() {
            if let Err(e) = self.transport.send(record) {
                return Err(BenchError::Reporter {
                    reporter: "telemetry",
                    message: format!(
                        "{} of {} records not delivered: {}",
                        records.len() - sent,
                        records.len(),
                        e
                    ),
                });
            }
        }
        Ok(())
    }
}

impl ReportSink for TelemetrySink {
    fn name(&self) -> &'static str {
        "telemetry"
    }

    fn interval(&mut self, sample: &IntervalSample<'_>) -> Result<()> {
        let per_group = self.history.entry(sample.group.name.clone()).or_default();
        let mut records = Vec::with_capacity(sample.rates.len());
        for (counter, &rate) in sample.rates {
            per_group.entry(counter.clone()).or_default().push(rate);
            records.push(format_record(
                &metric_name(counter, INTERVAL_SUFFIX),
                sample.unix_time,
                rate,
                &self.benchmark,
                &sample.group.name,
                sample.group.agent_count,
                &self.tag,
            ));
        }
        self.send_all(records)
    }

    fn finish(&mut self, sample: &FinalSample<'_>) -> Result<()> {
        let Some(per_group) = self.history.get(&sample.group.name) else {
            return Ok(());
        };
        let records: Vec<String> = per_group
            .iter()
            .filter(|(_, rates)| !rates.is_empty())
            .map(|(counter, rates)| {
                let avg = rates.iter().sum::<f64>() / rates.len() as f64;
                format_record(
                    &metric_name(counter, AVERAGE_SUFFIX),
                    sample.unix_time,
                    avg,
                    &self.benchmark,
                    &sample.group.name,
                    sample.group.agent_count,
                    &self.tag,
                )
            })
            .collect();
        self.send_all(records)
    }

    fn close(&mut self) -> Result<()> {
        if let Err(e) = self.transport.close() {
            warn!("Failed to close telemetry transport: {}", e);
        }
        Ok(())
    }
}
