//! Build-time table of available workloads

use std::collections::BTreeMap;

use crate::error::{BenchError, Result};
use crate::workload::Workload;
use crate::workloads;

/// Constructs a fresh, unconfigured workload
pub type WorkloadConstructor = fn() -> Box<dyn Workload>;

struct Entry {
    description: &'static str,
    constructor: WorkloadConstructor,
}

/// Maps workload names to constructors
#[derive(Default)]
pub struct WorkloadRegistry {
    entries: BTreeMap<&'static str, Entry>,
}

impl WorkloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every workload shipped in this crate
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            "counter",
            "One group of agents incrementing an 'ops' counter",
            workloads::counter::create,
        );
        registry.register(
            "readwrite",
            "Readers and writers sharing an in-memory table",
            workloads::readwrite::create,
        );
        registry
    }

    /// Add or replace a workload
    pub fn register(
        &mut self,
        name: &'static str,
        description: &'static str,
        constructor: WorkloadConstructor,
    ) {
        self.entries.insert(
            name,
            Entry {
                description,
                constructor,
            },
        );
    }

    /// Resolve `name` to a registered workload name.
    ///
    /// Accepts the registered name itself or any dotted name ending in it,
    /// so `perf.suite.counter` resolves to `counter`.
    pub fn resolve(&self, name: &str) -> Option<&'static str> {
        if let Some((key, _)) = self.entries.get_key_value(name) {
            return Some(*key);
        }
        let short = name.rsplit('.').next()?;
        self.entries.get_key_value(short).map(|(key, _)| *key)
    }

    pub fn create(&self, name: &str) -> Result<Box<dyn Workload>> {
        let key = self.resolve(name).ok_or_else(|| {
            BenchError::Config(format!(
                "unknown benchmark '{}'. Available: {}",
                name,
                self.names().collect::<Vec<_>>().join(", ")
            ))
        })?;
        let entry = &self.entries[key];
        Ok((entry.constructor)())
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }

    /// `(name, description)` pairs in name order
    pub fn list(&self) -> Vec<(&'static str, &'static str)> {
        self.entries
            .iter()
            .map(|(name, entry)| (*name, entry.description))
            .collect()
    }
}
