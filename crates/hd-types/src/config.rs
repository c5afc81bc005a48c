//! Experiment configuration schema.
//!
//! The configuration is parsed once (usually from JSON) and validated before
//! any parameter space or optimization loop is constructed.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::config_error;
use crate::errors::{ConfigError, HdResult};

/// Whether we are minimizing or maximizing the objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectiveDirection {
    #[default]
    Minimize,
    Maximize,
}

impl ObjectiveDirection {
    /// True when `candidate` is strictly better than `incumbent`.
    pub fn improves(self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Self::Minimize => candidate < incumbent,
            Self::Maximize => candidate > incumbent,
        }
    }
}

/// Objective declaration: which result key to read and which way is better.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveConfig {
    /// Dotted key looked up in the trial result file (e.g. "loss", "metrics.acc").
    pub key: String,
    #[serde(default)]
    pub direction: ObjectiveDirection,
}

/// Sampling prior of a real-valued variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Prior {
    #[default]
    Uniform,
    LogUniform,
}

/// Describes the domain of a variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VariableKind {
    /// Continuous range [low, high].
    Real {
        low: f64,
        high: f64,
        #[serde(default)]
        prior: Prior,
    },
    /// Integer range [low, high] inclusive.
    Integer { low: i64, high: i64 },
    /// Ordered set of distinct labels.
    Categorical { choices: Vec<String> },
}

/// A single named dimension of the parameter space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    /// Variable name; dotted names nest in the parameter file.
    pub name: String,
    #[serde(flatten)]
    pub kind: VariableKind,
}

impl Variable {
    pub fn real(name: impl Into<String>, low: f64, high: f64) -> Self {
        Self {
            name: name.into(),
            kind: VariableKind::Real {
                low,
                high,
                prior: Prior::Uniform,
            },
        }
    }

    pub fn log_uniform(name: impl Into<String>, low: f64, high: f64) -> Self {
        Self {
            name: name.into(),
            kind: VariableKind::Real {
                low,
                high,
                prior: Prior::LogUniform,
            },
        }
    }

    pub fn integer(name: impl Into<String>, low: i64, high: i64) -> Self {
        Self {
            name: name.into(),
            kind: VariableKind::Integer { low, high },
        }
    }

    pub fn categorical<S: Into<String>>(
        name: impl Into<String>,
        choices: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: VariableKind::Categorical {
                choices: choices.into_iter().map(Into::into).collect(),
            },
        }
    }

    /// Check bounds and choices of this declaration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.kind {
            VariableKind::Real { low, high, prior } => {
                // The span must be finite too: samplers and encoders divide by it.
                if !(high - low).is_finite() || low > high {
                    return Err(ConfigError::InvalidBounds {
                        name: self.name.clone(),
                        low: *low,
                        high: *high,
                    });
                }
                if *prior == Prior::LogUniform
                    && (*low <= 0.0 || !(high.ln() - low.ln()).is_finite())
                {
                    return Err(ConfigError::InvalidLogBounds {
                        name: self.name.clone(),
                    });
                }
            }
            VariableKind::Integer { low, high } => {
                if low > high {
                    return Err(ConfigError::InvalidBounds {
                        name: self.name.clone(),
                        low: *low as f64,
                        high: *high as f64,
                    });
                }
            }
            VariableKind::Categorical { choices } => {
                if choices.is_empty() {
                    return Err(ConfigError::EmptyChoices {
                        name: self.name.clone(),
                    });
                }
                let mut seen = HashSet::new();
                for choice in choices {
                    if !seen.insert(choice.as_str()) {
                        return Err(ConfigError::DuplicateChoice {
                            name: self.name.clone(),
                            choice: choice.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// Covariance function used by the surrogate model.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum KernelKind {
    /// Squared exponential.
    #[default]
    Rbf,
    /// Matérn with smoothness `nu` in {0.5, 1.5, 2.5}.
    Matern {
        #[serde(default = "default_matern_nu")]
        nu: f64,
    },
}

/// Acquisition formula used to pick the next point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AcquisitionKind {
    /// Expected improvement with exploration margin `xi`.
    Ei {
        #[serde(default)]
        xi: f64,
    },
    /// Upper (lower, when minimizing) confidence bound.
    Ucb {
        #[serde(default = "default_ucb_kappa")]
        kappa: f64,
    },
}

impl Default for AcquisitionKind {
    fn default() -> Self {
        Self::Ei { xi: 0.0 }
    }
}

/// Trial processes still running after a day are killed.
pub const DEFAULT_TRIAL_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Top-level configuration for an optimization experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub name: String,
    pub objective: ObjectiveConfig,

    /// Command template for the trial binary. Placeholders: `{params_path}`,
    /// `{results_path}`, `{experiment_dir}`, `{device_id}`.
    #[serde(default)]
    pub binary: Option<String>,

    /// Ordered variable declarations; order fixes the encoding layout.
    pub space: Vec<Variable>,

    /// Constant parameters merged into every parameter file.
    #[serde(default = "default_fixed")]
    pub fixed: serde_json::Value,

    #[serde(default = "default_random_starts")]
    pub random_starts: usize,
    #[serde(default = "default_iterations")]
    pub iterations: usize,

    #[serde(default)]
    pub kernel: KernelKind,
    #[serde(default = "default_kernel_scale")]
    pub kernel_scale: f64,
    #[serde(default)]
    pub acquisition_fn: AcquisitionKind,
    #[serde(default = "default_optimizer_restarts")]
    pub optimizer_restarts: usize,

    #[serde(default)]
    pub seed: u64,

    /// How many random-phase trials may run concurrently.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Number of devices handed out round robin.
    #[serde(default = "default_device_count")]
    pub device_count: usize,
    /// Dotted key under which the device id is written to the parameter file.
    #[serde(default)]
    pub device_key: Option<String>,

    /// Bounded wait for each trial process.
    #[serde(default = "default_trial_timeout_secs")]
    pub trial_timeout_secs: u64,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_fixed() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}
fn default_random_starts() -> usize {
    10
}
fn default_iterations() -> usize {
    100
}
fn default_kernel_scale() -> f64 {
    1.0
}
fn default_optimizer_restarts() -> usize {
    5
}
fn default_parallelism() -> usize {
    1
}
fn default_device_count() -> usize {
    1
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("experiments")
}
fn default_trial_timeout_secs() -> u64 {
    DEFAULT_TRIAL_TIMEOUT_SECS
}
fn default_matern_nu() -> f64 {
    1.5
}
fn default_ucb_kappa() -> f64 {
    2.576
}

impl ExperimentConfig {
    pub fn new(
        name: impl Into<String>,
        objective_key: impl Into<String>,
        space: Vec<Variable>,
    ) -> Self {
        Self {
            name: name.into(),
            objective: ObjectiveConfig {
                key: objective_key.into(),
                direction: ObjectiveDirection::Minimize,
            },
            binary: None,
            space,
            fixed: default_fixed(),
            random_starts: default_random_starts(),
            iterations: default_iterations(),
            kernel: KernelKind::default(),
            kernel_scale: default_kernel_scale(),
            acquisition_fn: AcquisitionKind::default(),
            optimizer_restarts: default_optimizer_restarts(),
            seed: 0,
            parallelism: default_parallelism(),
            device_count: default_device_count(),
            device_key: None,
            trial_timeout_secs: DEFAULT_TRIAL_TIMEOUT_SECS,
            cwd: None,
            output_dir: default_output_dir(),
        }
    }

    pub fn with_direction(mut self, direction: ObjectiveDirection) -> Self {
        self.objective.direction = direction;
        self
    }

    pub fn with_binary(mut self, template: impl Into<String>) -> Self {
        self.binary = Some(template.into());
        self
    }

    pub fn with_budget(mut self, random_starts: usize, iterations: usize) -> Self {
        self.random_starts = random_starts;
        self.iterations = iterations;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_devices(mut self, device_count: usize) -> Self {
        self.device_count = device_count;
        self
    }

    pub fn with_device_key(mut self, key: impl Into<String>) -> Self {
        self.device_key = Some(key.into());
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.trial_timeout_secs = seconds;
        self
    }

    pub fn with_fixed(mut self, fixed: serde_json::Value) -> Self {
        self.fixed = fixed;
        self
    }

    /// Directory holding every trial of this experiment.
    pub fn experiment_dir(&self) -> PathBuf {
        self.output_dir.join(&self.name)
    }

    /// Parse and validate a JSON configuration document.
    pub fn from_json_str(text: &str) -> HdResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> HdResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Reject configurations that cannot produce a meaningful run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(config_error!("experiment name is empty"));
        }
        if self.objective.key.trim().is_empty() {
            return Err(ConfigError::MissingObjective);
        }
        if self.space.is_empty() {
            return Err(ConfigError::EmptySpace);
        }

        let mut names = HashSet::new();
        for variable in &self.space {
            if !names.insert(variable.name.as_str()) {
                return Err(ConfigError::DuplicateVariable {
                    name: variable.name.clone(),
                });
            }
            variable.validate()?;
        }

        if self.iterations < self.random_starts {
            return Err(ConfigError::BudgetTooSmall {
                iterations: self.iterations,
                random_starts: self.random_starts,
            });
        }
        if !(self.kernel_scale.is_finite() && self.kernel_scale > 0.0) {
            return Err(config_error!("kernel_scale must be positive, got {}", self.kernel_scale));
        }
        if let KernelKind::Matern { nu } = self.kernel {
            if ![0.5, 1.5, 2.5].contains(&nu) {
                return Err(config_error!("unsupported Matern nu {nu}; use 0.5, 1.5 or 2.5"));
            }
        }
        if self.optimizer_restarts == 0 {
            return Err(config_error!("optimizer_restarts must be at least 1"));
        }
        if self.parallelism == 0 {
            return Err(config_error!("parallelism must be at least 1"));
        }
        if self.device_count == 0 {
            return Err(config_error!("device_count must be at least 1"));
        }
        if self.trial_timeout_secs == 0 {
            return Err(config_error!("trial_timeout_secs must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_config() -> ExperimentConfig {
        ExperimentConfig::new(
            "learning_params",
            "loss",
            vec![
                Variable::real("x", -10.0, 10.0),
                Variable::categorical("option", ["first", "second"]),
            ],
        )
        .with_budget(5, 15)
    }

    #[test]
    fn valid_config_passes() {
        assert_eq!(sample_config().validate(), Ok(()));
    }

    #[test]
    fn empty_space_is_rejected() {
        let config = ExperimentConfig::new("e", "loss", vec![]);
        assert_eq!(config.validate(), Err(ConfigError::EmptySpace));
    }

    #[test]
    fn budget_smaller_than_random_starts_is_rejected() {
        let config = sample_config().with_budget(10, 5);
        assert_eq!(
            config.validate(),
            Err(ConfigError::BudgetTooSmall {
                iterations: 5,
                random_starts: 10
            })
        );
    }

    #[test]
    fn missing_objective_is_rejected() {
        let mut config = sample_config();
        config.objective.key = " ".into();
        assert_eq!(config.validate(), Err(ConfigError::MissingObjective));
    }

    #[test]
    fn duplicate_names_and_choices_are_rejected() {
        let config = ExperimentConfig::new(
            "e",
            "loss",
            vec![Variable::real("x", 0.0, 1.0), Variable::integer("x", 0, 3)],
        );
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateVariable { .. })
        ));

        let config =
            ExperimentConfig::new("e", "loss", vec![Variable::categorical("c", ["a", "a"])]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateChoice { .. })
        ));
    }

    #[test]
    fn invalid_bounds_are_rejected() {
        let config = ExperimentConfig::new("e", "loss", vec![Variable::integer("n", 5, 1)]);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidBounds { .. })));

        let config =
            ExperimentConfig::new("e", "loss", vec![Variable::log_uniform("lr", 0.0, 1.0)]);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidLogBounds { .. })));
    }

    #[test]
    fn overflowing_span_is_rejected() {
        let huge = Variable::real("x", -1e308, 1e308);
        assert!(matches!(huge.validate(), Err(ConfigError::InvalidBounds { .. })));
        assert!(Variable::real("x", f64::NEG_INFINITY, 0.0).validate().is_err());
        assert!(Variable::log_uniform("lr", f64::MIN_POSITIVE, f64::MAX).validate().is_ok());
        assert!(Variable::real("x", -1e307, 1e307).validate().is_ok());
    }

    #[test]
    fn trial_timeout_is_bounded_by_default() {
        let config = sample_config();
        assert_eq!(config.trial_timeout_secs, DEFAULT_TRIAL_TIMEOUT_SECS);

        let text = r#"{
            "name": "t",
            "objective": {"key": "loss"},
            "space": [{"name": "x", "kind": "integer", "low": 0, "high": 3}]
        }"#;
        let parsed = ExperimentConfig::from_json_str(text).unwrap();
        assert_eq!(parsed.trial_timeout_secs, DEFAULT_TRIAL_TIMEOUT_SECS);

        assert!(sample_config().with_timeout(0).validate().is_err());
        assert_eq!(sample_config().with_timeout(30).trial_timeout_secs, 30);
    }

    #[test]
    fn json_config_uses_defaults() {
        let text = r#"{
            "name": "demo",
            "objective": {"key": "metrics.loss"},
            "binary": "python model.py {params_path} {results_path}",
            "space": [
                {"name": "x", "kind": "real", "low": -10, "high": 10},
                {"name": "lr", "kind": "real", "low": 0.0001, "high": 0.1, "prior": "log_uniform"},
                {"name": "layers", "kind": "integer", "low": 1, "high": 4},
                {"name": "opt", "kind": "categorical", "choices": ["adam", "sgd"]}
            ],
            "kernel": {"type": "matern", "nu": 2.5},
            "acquisition_fn": {"type": "ucb"}
        }"#;

        let config = ExperimentConfig::from_json_str(text).unwrap();
        assert_eq!(config.objective.direction, ObjectiveDirection::Minimize);
        assert_eq!(config.random_starts, 10);
        assert_eq!(config.iterations, 100);
        assert_eq!(config.kernel, KernelKind::Matern { nu: 2.5 });
        assert_eq!(config.acquisition_fn, AcquisitionKind::Ucb { kappa: 2.576 });
        assert_eq!(config.space.len(), 4);
        assert_eq!(config.space[1], Variable::log_uniform("lr", 0.0001, 0.1));
        assert_eq!(config.experiment_dir(), PathBuf::from("experiments/demo"));
    }

    #[test]
    fn unsupported_matern_nu_is_rejected() {
        let mut config = sample_config();
        config.kernel = KernelKind::Matern { nu: 1.0 };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn config_file_round_trip() {
        let config = sample_config().with_binary("sh run.sh {params_path} {results_path}");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", serde_json::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = ExperimentConfig::from_json_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn direction_improvement() {
        assert!(ObjectiveDirection::Minimize.improves(1.0, 2.0));
        assert!(!ObjectiveDirection::Minimize.improves(2.0, 2.0));
        assert!(ObjectiveDirection::Maximize.improves(3.0, 2.0));
    }
}
