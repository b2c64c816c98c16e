pub mod engine;

pub use engine::{CycleReport, MigrationEngine, PartitionTask, TaskOutcome, TaskResult};
