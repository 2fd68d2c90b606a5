//! Console sink: human-readable lines on stdout

use std::io::{self, Write};

use super::{FinalSample, IntervalSample, ReportSink};
use crate::error::Result;

/// Writes one line per group per interval, plus a summary per group on stop
pub struct ConsoleSink {
    out: Box<dyn Write + Send>,
}

impl ConsoleSink {
    pub fn stdout() -> Self {
        Self::with_writer(Box::new(io::stdout()))
    }

    pub fn with_writer(out: Box<dyn Write + Send>) -> Self {
        Self { out }
    }
}

impl ReportSink for ConsoleSink {
    fn name(&self) -> &'static str {
        "console"
    }

    fn interval(&mut self, sample: &IntervalSample<'_>) -> Result<()> {
        let mut line = format!(
            "{} [{}] {} agents:",
            chrono::DateTime::from_timestamp(sample.unix_time, 0)
                .map(|t| t.format("%H:%M:%S").to_string())
                .unwrap_or_else(|| sample.unix_time.to_string()),
            sample.group.name,
            sample.group.agent_count
        );
        if sample.rates.is_empty() {
            line.push_str(" no metrics yet");
        }
        for (name, rate) in sample.rates {
            let total = sample.totals.get(name).copied().unwrap_or(0);
            line.push_str(&format!(" {} {:.1}/s (total {})", name, rate, total));
        }
        writeln!(self.out, "{}", line)?;
        self.out.flush()?;
        Ok(())
    }

    fn finish(&mut self, sample: &FinalSample<'_>) -> Result<()> {
        let secs = sample.elapsed.as_secs_f64();
        writeln!(
            self.out,
            "=== {} ({} agents, {:.2}s) ===",
            sample.group.name, sample.group.agent_count, secs
        )?;
        for (name, total) in sample.totals {
            let avg = if secs > 0.0 { *total as f64 / secs } else { 0.0 };
            writeln!(self.out, "  {:<20} {:>12}  avg {:.1}/s", name, total, avg)?;
        }
        if sample.latency.samples > 0 {
            writeln!(
                self.out,
                "  latency              p50={:.2}ms p95={:.2}ms p99={:.2}ms max={:.2}ms",
                sample.latency.p50_ms(),
                sample.latency.p95_ms(),
                sample.latency.p99_ms(),
                sample.latency.max_ms()
            )?;
        }
        self.out.flush()?;
        Ok(())
    }
}
