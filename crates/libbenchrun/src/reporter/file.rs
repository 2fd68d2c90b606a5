//! File sink: appends each group's average rate to a report file

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use super::telemetry::{format_record, short_benchmark_name};
use super::{FinalSample, IntervalSample, ReportSink};
use crate::error::{BenchError, Result};

/// Metric name of the line written per group
pub const OPS_PER_SEC_AVG: &str = "benchmark.ops.per_sec.avg";

/// Collects every interval rate of a group and, on stop, appends one
/// record with their mean. The file is opened in append mode and never
/// truncated.
pub struct FileSink {
    path: PathBuf,
    benchmark: String,
    writer: Option<BufWriter<File>>,
    rates: BTreeMap<String, Vec<f64>>,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>, benchmark: &str) -> Self {
        Self {
            path: path.into(),
            benchmark: short_benchmark_name(benchmark).to_string(),
            writer: None,
            rates: BTreeMap::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ReportSink for FileSink {
    fn name(&self) -> &'static str {
        "file"
    }

    fn open(&mut self) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn interval(&mut self, sample: &IntervalSample<'_>) -> Result<()> {
        self.rates
            .entry(sample.group.name.clone())
            .or_default()
            .extend(sample.rates.values().copied());
        Ok(())
    }

    fn finish(&mut self, sample: &FinalSample<'_>) -> Result<()> {
        let Some(rates) = self.rates.get(&sample.group.name).filter(|r| !r.is_empty()) else {
            return Ok(());
        };
        let avg = rates.iter().sum::<f64>() / rates.len() as f64;
        let record = format_record(
            OPS_PER_SEC_AVG,
            sample.unix_time,
            avg,
            &self.benchmark,
            &sample.group.name,
            sample.group.agent_count,
            "",
        );

        let Some(writer) = self.writer.as_mut() else {
            return Err(BenchError::Reporter {
                reporter: "file",
                message: format!("{} is not open", self.path.display()),
            });
        };
        info!("Writing {} to file {}", record, self.path.display());
        writer.write_all(record.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tempfile::tempdir;

    use crate::group::GroupInfo;
    use crate::metrics::{LatencyPercentiles, MetricSnapshot};
    use crate::reporter::Rates;

    fn group(name: &str) -> GroupInfo {
        GroupInfo {
            name: name.to_string(),
            agent_count: 2,
        }
    }

    fn feed(sink: &mut FileSink, group: &GroupInfo, rates: &[f64]) {
        let totals = MetricSnapshot::new();
        for &rate in rates {
            let rates: Rates = [("ops".to_string(), rate)].into_iter().collect();
            sink.interval(&IntervalSample {
                unix_time: 1,
                group,
                elapsed: Duration::from_secs(1),
                rates: &rates,
                totals: &totals,
            })
            .unwrap();
        }
    }

    fn finish(sink: &mut FileSink, group: &GroupInfo) -> Result<()> {
        sink.finish(&FinalSample {
            unix_time: 1700000000,
            group,
            elapsed: Duration::from_secs(3),
            totals: &MetricSnapshot::new(),
            latency: LatencyPercentiles::default(),
        })
    }

    #[test]
    fn test_appends_average_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("report.txt");
        std::fs::write(&path, "existing line\n").unwrap();

        let mut sink = FileSink::new(&path, "perf.Counter");
        sink.open().unwrap();
        let writers = group("writers");
        feed(&mut sink, &writers, &[100.0, 200.0, 300.0]);
        finish(&mut sink, &writers).unwrap();
        sink.close().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "existing line");
        assert_eq!(
            lines[1],
            "put benchmark.ops.per_sec.avg 1700000000 200.00 benchmark=Counter group=writers agents=2"
        );
    }

    #[test]
    fn test_group_without_samples_writes_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("report.txt");
        let mut sink = FileSink::new(&path, "counter");
        sink.open().unwrap();
        finish(&mut sink, &group("idle")).unwrap();
        sink.close().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn test_unopened_file_is_reporter_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing").join("report.txt");
        let mut sink = FileSink::new(&path, "counter");
        assert!(sink.open().is_err());

        let writers = group("writers");
        feed(&mut sink, &writers, &[1.0]);
        let err = finish(&mut sink, &writers).unwrap_err();
        assert!(matches!(err, BenchError::Reporter { reporter: "file", .. }));
    }
}
