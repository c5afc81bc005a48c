//! # hd-optimizer
//!
//! Search-side building blocks for Hypered: parameter space encoding, a
//! Gaussian-process surrogate, acquisition functions with a multi-start
//! maximizer, and the trial/observation history the engine records into.

pub mod acquisition;
pub mod gp;
pub mod kernel;
pub mod space;
pub mod trial;

pub use acquisition::{confidence_bound, expected_improvement, AcquisitionOptimizer};
pub use gp::{SurrogateModel, SurrogateState};
pub use kernel::Kernel;
pub use space::ParameterSpace;
pub use trial::{BestResult, ObservationHistory, ProposalSource, Trial, TrialFailure, TrialStatus};
