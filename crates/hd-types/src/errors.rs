use thiserror::Error;

/// Main error type for the Hypered system
#[derive(Error, Debug)]
pub enum HdError {
    #[error("Space error: {0}")]
    Space(#[from] SpaceError),

    #[error("Surrogate error: {0}")]
    Surrogate(#[from] SurrogateError),

    #[error("Acquisition error: {0}")]
    Acquisition(#[from] AcquisitionError),

    #[error("Trial error: {0}")]
    Trial(#[from] TrialError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Mismatches between a parameter assignment and the declared space
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpaceError {
    #[error("Missing value for variable: {name}")]
    MissingVariable { name: String },

    #[error("Value {value:?} is not a declared choice of categorical variable {name}")]
    InvalidChoice { name: String, value: String },

    #[error("Variable {name} expects a {expected} value, got {got}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        got: String,
    },

    #[error("Value {value} of variable {name} is outside [{low}, {high}]")]
    OutOfBounds {
        name: String,
        value: f64,
        low: f64,
        high: f64,
    },

    #[error("Encoded vector has {got} slots, space expects {expected}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Gaussian-process fitting and prediction errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SurrogateError {
    #[error("Covariance matrix is singular after {attempts} attempts (last jitter {jitter:e})")]
    SingularCovariance { attempts: usize, jitter: f64 },

    #[error("Query point has {got} dimensions, model was fitted on {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Surrogate model has not been fitted")]
    NotFitted,
}

/// Acquisition maximization errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AcquisitionError {
    #[error("Acquisition surface is flat across {restarts} restarts (best value {best:e})")]
    Degenerate { restarts: usize, best: f64 },

    #[error("Surrogate prediction failed: {0}")]
    Surrogate(#[from] SurrogateError),

    #[error("Proposed point could not be decoded: {0}")]
    Space(#[from] SpaceError),
}

/// Failures while evaluating a single trial
#[derive(Error, Debug)]
pub enum TrialError {
    #[error("Failed to launch trial command `{command}`: {message}")]
    Spawn { command: String, message: String },

    #[error("Trial process exited with status {code:?}")]
    NonZeroExit { code: Option<i32> },

    #[error("Trial timeout: process took longer than {timeout_seconds} seconds")]
    Timeout { timeout_seconds: u64 },

    #[error("Result file not found: {path}")]
    ResultMissing { path: String },

    #[error("Result file {path} is not valid JSON: {message}")]
    ResultUnparsable { path: String, message: String },

    #[error("Objective key {key} is absent from the result")]
    ObjectiveMissing { key: String },

    #[error("Objective key {key} holds a non-numeric value: {value}")]
    ObjectiveNotNumeric { key: String, value: String },

    #[error("Trial encoding failed: {0}")]
    Encoding(#[from] SpaceError),

    #[error("Trial function failed: {message}")]
    Function { message: String },

    #[error("Trial IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Trial task aborted: {message}")]
    Aborted { message: String },
}

impl TrialError {
    /// True when the failure comes from the harness (launching, waiting,
    /// file system) rather than from the evaluated program itself.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            TrialError::Spawn { .. }
                | TrialError::Timeout { .. }
                | TrialError::Encoding(_)
                | TrialError::Io(_)
                | TrialError::Aborted { .. }
        )
    }
}

/// Fatal, pre-run configuration errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Parameter space is empty")]
    EmptySpace,

    #[error("Duplicate variable name: {name}")]
    DuplicateVariable { name: String },

    #[error("Invalid bounds for {name}: low ({low}) must not exceed high ({high})")]
    InvalidBounds { name: String, low: f64, high: f64 },

    #[error("Categorical variable {name} declares no choices")]
    EmptyChoices { name: String },

    #[error("Categorical variable {name} declares choice {choice:?} twice")]
    DuplicateChoice { name: String, choice: String },

    #[error("Log-uniform variable {name} needs a positive lower bound")]
    InvalidLogBounds { name: String },

    #[error("Iteration budget {iterations} is smaller than random_starts {random_starts}")]
    BudgetTooSmall {
        iterations: usize,
        random_starts: usize,
    },

    #[error("Objective key is not specified")]
    MissingObjective,

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

/// Result type alias for Hypered operations
pub type HdResult<T> = Result<T, HdError>;

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::HdError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::ConfigError::Invalid { message: format!($($arg)*) }
    };
}
