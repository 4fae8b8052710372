//! Experiment execution: the runner, its records, named presets, the stop
//! signal and result persistence.

pub mod presets;
pub mod record;
pub mod runner;
pub mod shutdown;
pub mod store;

pub use presets::{ExperimentSuite, find_configuration, iterations};
pub use record::{AttemptRecord, RunResult, RunSummary, StopReason};
pub use runner::{ExperimentRunner, IdentityCheck, RunnerState, SweepError};
pub use shutdown::{StopHandle, StopListener, spawn_ctrl_c_listener};
pub use store::{JsonFileStore, MemoryStore, ResultStore, StoreError, SweepEntry, SweepReport};
