//! `readwrite`: reader and writer groups sharing one in-memory table
//!
//! Readers sample random rows until their time limit. Writers append rows
//! until the table holds `rows` entries and then report exhaustion, so the
//! writer group ends on its own.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use tracing::{debug, info};

use crate::config::Configuration;
use crate::error::{BenchError, WorkloadError};
use crate::group::AgentGroup;
use crate::metrics::MetricStore;
use crate::workload::{AgentInfo, Step, Task, Workload};

pub const READS: &str = "reads";
pub const WRITES: &str = "writes";
/// Reads that found the table empty
pub const MISSES: &str = "misses";

type Table = Arc<RwLock<Vec<u64>>>;

#[derive(Debug)]
pub struct ReadWriteWorkload {
    pub readers: usize,
    pub writers: usize,
    pub seconds: u64,
    pub rows: usize,
    /// Upper bound of the random pause after each operation
    pub think_ms: u64,
    table: Table,
}

impl Default for ReadWriteWorkload {
    fn default() -> Self {
        Self {
            readers: 4,
            writers: 2,
            seconds: 5,
            rows: 10_000,
            think_ms: 0,
            table: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

pub fn create() -> Box<dyn Workload> {
    Box::new(ReadWriteWorkload::default())
}

impl ReadWriteWorkload {
    pub fn table_len(&self) -> usize {
        self.table.read().len()
    }
}

fn think(max_ms: u64) {
    if max_ms > 0 {
        let delay = rand::thread_rng().gen_range(0..=max_ms);
        thread::sleep(Duration::from_millis(delay));
    }
}

fn option_error(e: BenchError) -> WorkloadError {
    WorkloadError::failed(e.to_string())
}

impl Workload for ReadWriteWorkload {
    fn name(&self) -> &str {
        "readwrite"
    }

    fn usage(&self) -> Vec<(String, String)> {
        vec![
            ("--readers <n>".to_string(), "reader agents (default 4)".to_string()),
            ("--writers <n>".to_string(), "writer agents (default 2)".to_string()),
            ("--seconds <n>".to_string(), "reader time limit (default 5)".to_string()),
            (
                "--rows <n>".to_string(),
                "rows written before writers stop (default 10000)".to_string(),
            ),
            ("--thinkms <n>".to_string(), "max random pause per operation (default 0)".to_string()),
        ]
    }

    fn configure(&mut self, config: &Configuration) -> Result<(), WorkloadError> {
        self.readers = config.get_usize_or("readers", self.readers).map_err(option_error)?;
        self.writers = config.get_usize_or("writers", self.writers).map_err(option_error)?;
        self.seconds = config.get_u64_or("seconds", self.seconds).map_err(option_error)?;
        self.rows = config.get_usize_or("rows", self.rows).map_err(option_error)?;
        self.think_ms = config.get_u64_or("thinkms", self.think_ms).map_err(option_error)?;
        if self.seconds == 0 {
            return Err(WorkloadError::failed("--seconds must be at least 1 for readers"));
        }
        if self.rows == 0 {
            return Err(WorkloadError::failed("--rows must be at least 1"));
        }
        Ok(())
    }

    fn initialize(&mut self) -> Result<(), WorkloadError> {
        self.table.write().clear();
        Ok(())
    }

    /// Seed a tenth of the table so readers have rows from the start
    fn warmup(&mut self) -> Result<(), WorkloadError> {
        let seed = self.rows / 10;
        let mut table = self.table.write();
        table.extend((0..seed as u64).map(|i| i * 31));
        debug!(rows = table.len(), "Seeded table");
        Ok(())
    }

    fn agent_groups(&self) -> Result<Vec<AgentGroup>, BenchError> {
        let think_ms = self.think_ms;

        let table = Arc::clone(&self.table);
        let reader = move |_: &AgentInfo| -> Box<dyn Task> {
            let table = Arc::clone(&table);
            Box::new(move |_: u64, metrics: &MetricStore| {
                {
                    let table = table.read();
                    if table.is_empty() {
                        metrics.increment(MISSES, 1);
                    } else {
                        let row = rand::thread_rng().gen_range(0..table.len());
                        std::hint::black_box(table[row]);
                    }
                }
                metrics.increment(READS, 1);
                think(think_ms);
                Ok::<_, WorkloadError>(Step::Ran(1))
            })
        };
        let readers =
            AgentGroup::new("readers", self.readers, reader)?.with_duration_secs(self.seconds);

        let table = Arc::clone(&self.table);
        let rows = self.rows;
        let writer = move |_: &AgentInfo| -> Box<dyn Task> {
            let table = Arc::clone(&table);
            Box::new(move |iteration: u64, metrics: &MetricStore| {
                {
                    let mut table = table.write();
                    if table.len() >= rows {
                        return Ok::<_, WorkloadError>(Step::Exhausted);
                    }
                    table.push(iteration);
                }
                metrics.increment(WRITES, 1);
                think(think_ms);
                Ok(Step::Ran(1))
            })
        };
        let writers = AgentGroup::new("writers", self.writers, writer)?;

        Ok(vec![readers, writers])
    }

    fn shutdown(&mut self) -> Result<(), WorkloadError> {
        let mut table = self.table.write();
        info!(rows = table.len(), "Dropping table");
        table.clear();
        Ok(())
    }
}
