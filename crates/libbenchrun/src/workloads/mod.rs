//! Workloads shipped with the engine, used for smoke runs and tests

pub mod counter;
pub mod readwrite;

pub use counter::CounterWorkload;
pub use readwrite::ReadWriteWorkload;
