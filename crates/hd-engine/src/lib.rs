//! # hd-engine
//!
//! Runs Hypered experiments: writes per-trial parameter files, launches the
//! trial binary (or an in-process function) on round-robin devices, reads
//! the objective back and drives the random and surrogate-guided phases.

pub mod engine;
pub mod executor;
pub mod journal;

pub use engine::{LoopPhase, OptimizationLoop, OptimizationOutcome};
pub use executor::{
    extract_objective, CommandRunner, DeviceAssigner, FnRunner, TrialContext, TrialExecutor,
    TrialRunner,
};
pub use journal::{RunSummary, TrialJournal};
