//! Trial records, the observation history and best-result tracking.

use chrono::{DateTime, Utc};
use hd_types::{ObjectiveDirection, RawParams, TrialError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// How the parameters of a trial were chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalSource {
    /// Random-phase sample.
    Random,
    /// Maximizer of the acquisition function.
    Surrogate,
    /// Random sample substituted after a surrogate or acquisition failure.
    Fallback,
}

/// Why a trial failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialFailure {
    pub message: String,
    /// True for harness failures (spawn, timeout, I/O), false when the
    /// evaluated program misbehaved.
    pub infrastructure: bool,
}

/// A single evaluation of the objective at one parameter assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: Uuid,
    /// 0-indexed position in the run.
    pub number: usize,
    pub params: RawParams,
    pub encoded: Vec<f64>,
    pub source: ProposalSource,
    pub status: TrialStatus,
    pub objective: Option<f64>,
    pub device_id: Option<usize>,
    pub trial_dir: Option<PathBuf>,
    pub failure: Option<TrialFailure>,
    /// Recoverable problems met while proposing or running this trial.
    pub warnings: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Trial {
    pub fn new(
        number: usize,
        params: RawParams,
        encoded: Vec<f64>,
        source: ProposalSource,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            number,
            params,
            encoded,
            source,
            status: TrialStatus::Pending,
            objective: None,
            device_id: None,
            trial_dir: None,
            failure: None,
            warnings: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn mark_running(&mut self, device_id: usize, trial_dir: PathBuf) {
        self.status = TrialStatus::Running;
        self.started_at = Some(Utc::now());
        self.device_id = Some(device_id);
        self.trial_dir = Some(trial_dir);
    }

    pub fn mark_succeeded(&mut self, objective: f64) {
        self.status = TrialStatus::Succeeded;
        self.finished_at = Some(Utc::now());
        self.objective = Some(objective);
    }

    pub fn mark_failed(&mut self, error: &TrialError) {
        self.status = TrialStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.failure = Some(TrialFailure {
            message: error.to_string(),
            infrastructure: error.is_infrastructure(),
        });
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn is_succeeded(&self) -> bool {
        self.status == TrialStatus::Succeeded
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        let started = self.started_at?;
        let finished = self.finished_at?;
        Some((finished - started).num_milliseconds() as f64 / 1000.0)
    }
}

/// Extremum over all succeeded trials so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestResult {
    pub trial_number: usize,
    pub params: RawParams,
    pub objective: f64,
    pub trial_dir: Option<PathBuf>,
}

/// Append-only record of every finished trial.
///
/// Failed trials are kept for reporting but never enter the design matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationHistory {
    direction: ObjectiveDirection,
    trials: Vec<Trial>,
    best: Option<BestResult>,
}

impl ObservationHistory {
    pub fn new(direction: ObjectiveDirection) -> Self {
        Self {
            direction,
            trials: Vec::new(),
            best: None,
        }
    }

    pub fn direction(&self) -> ObjectiveDirection {
        self.direction
    }

    /// Append a finished trial. Returns true when it became the new best.
    pub fn record(&mut self, trial: Trial) -> bool {
        let improved = match (trial.status, trial.objective) {
            (TrialStatus::Succeeded, Some(objective)) => match &self.best {
                None => true,
                Some(best) => self.direction.improves(objective, best.objective),
            },
            _ => false,
        };
        if improved {
            self.best = Some(BestResult {
                trial_number: trial.number,
                params: trial.params.clone(),
                objective: trial.objective.unwrap_or_default(),
                trial_dir: trial.trial_dir.clone(),
            });
        }
        self.trials.push(trial);
        improved
    }

    pub fn trials(&self) -> &[Trial] {
        &self.trials
    }

    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &Trial> {
        self.trials.iter().filter(|t| t.is_succeeded())
    }

    pub fn succeeded_count(&self) -> usize {
        self.succeeded().count()
    }

    pub fn failed_count(&self) -> usize {
        self.trials
            .iter()
            .filter(|t| t.status == TrialStatus::Failed)
            .count()
    }

    pub fn best(&self) -> Option<&BestResult> {
        self.best.as_ref()
    }

    pub fn best_value(&self) -> Option<f64> {
        self.best.as_ref().map(|b| b.objective)
    }

    /// Encoded inputs and objective values of every succeeded trial, in
    /// recording order.
    pub fn design(&self) -> (Vec<Vec<f64>>, Vec<f64>) {
        self.succeeded()
            .filter_map(|t| t.objective.map(|y| (t.encoded.clone(), y)))
            .unzip()
    }
}
