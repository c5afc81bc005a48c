//! The optimization loop: a random exploration phase followed by
//! surrogate-guided proposals until the trial budget is spent.

use hd_optimizer::{
    AcquisitionOptimizer, BestResult, Kernel, ObservationHistory, ParameterSpace, ProposalSource,
    SurrogateModel, Trial,
};
use hd_types::{config_error, internal_error, ExperimentConfig, HdResult, RawParams, TrialError};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::executor::{CommandRunner, TrialExecutor, TrialRunner};
use crate::journal::{RunSummary, TrialJournal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    RandomPhase,
    SurrogateGuidedPhase,
    Terminated,
}

/// Terminal output of a run.
#[derive(Debug, Clone)]
pub struct OptimizationOutcome {
    pub best: Option<BestResult>,
    pub history: ObservationHistory,
}

pub struct OptimizationLoop {
    config: ExperimentConfig,
    space: ParameterSpace,
    surrogate: SurrogateModel,
    acquisition: AcquisitionOptimizer,
    executor: Arc<TrialExecutor>,
    journal: TrialJournal,
    history: ObservationHistory,
    rng: StdRng,
    phase: LoopPhase,
}

impl OptimizationLoop {
    /// Validate `config` and prepare the experiment directory.
    pub fn new(config: ExperimentConfig, runner: Arc<dyn TrialRunner>) -> HdResult<Self> {
        config.validate()?;
        let space = ParameterSpace::new(config.space.clone())?;
        let kernel = Kernel::new(config.kernel, config.kernel_scale)?;
        let executor = Arc::new(TrialExecutor::new(runner, &config));
        let journal = TrialJournal::create(config.experiment_dir())?;

        Ok(Self {
            surrogate: SurrogateModel::new(kernel),
            acquisition: AcquisitionOptimizer::new(
                config.acquisition_fn,
                config.optimizer_restarts,
            ),
            history: ObservationHistory::new(config.objective.direction),
            rng: StdRng::seed_from_u64(config.seed),
            phase: LoopPhase::RandomPhase,
            space,
            executor,
            journal,
            config,
        })
    }

    /// Loop evaluating trials with the configured command template.
    pub fn with_command_runner(config: ExperimentConfig) -> HdResult<Self> {
        let runner = CommandRunner::from_config(&config)
            .ok_or_else(|| config_error!("experiment {} has no binary template", config.name))?;
        Self::new(config, Arc::new(runner))
    }

    /// Replace the surrogate built from the configured kernel.
    pub fn with_surrogate(mut self, surrogate: SurrogateModel) -> Self {
        self.surrogate = surrogate;
        self
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn space(&self) -> &ParameterSpace {
        &self.space
    }

    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    pub fn history(&self) -> &ObservationHistory {
        &self.history
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary::from_history(self.config.name.clone(), &self.history)
    }

    /// Spend the whole trial budget and return the best result with the
    /// full history.
    pub async fn run(&mut self) -> HdResult<OptimizationOutcome> {
        info!(
            experiment = %self.config.name,
            random_starts = self.config.random_starts,
            iterations = self.config.iterations,
            dimension = self.space.dimension(),
            "starting optimization"
        );

        self.phase = LoopPhase::RandomPhase;
        self.run_random_phase().await;

        self.phase = LoopPhase::SurrogateGuidedPhase;
        info!(
            succeeded = self.history.succeeded_count(),
            failed = self.history.failed_count(),
            "entering surrogate-guided phase"
        );
        self.run_guided_phase().await;

        self.phase = LoopPhase::Terminated;
        let summary = self.summary();
        if let Err(e) = self.journal.write_summary(&summary) {
            warn!(error = %e, "failed to write run summary");
        }
        match self.history.best() {
            Some(best) => info!(
                trial = best.trial_number,
                objective = best.objective,
                params = ?best.params,
                "optimization finished"
            ),
            None => warn!(
                trials = self.history.len(),
                "optimization finished without a successful trial"
            ),
        }

        Ok(OptimizationOutcome {
            best: self.history.best().cloned(),
            history: self.history.clone(),
        })
    }

    /// Random trials in batches of `parallelism`. Parameters are sampled and
    /// devices assigned in trial order, and each batch is recorded in trial
    /// order whatever order its trials finish in.
    async fn run_random_phase(&mut self) {
        let total = self.config.random_starts;
        let batch = self.config.parallelism.max(1);

        let mut start = 0;
        while start < total {
            let end = (start + batch).min(total);
            let mut finished = Vec::with_capacity(end - start);
            let mut pending = Vec::with_capacity(end - start);

            for number in start..end {
                let params = self.space.sample_random(&mut self.rng);
                match self.build_trial(number, params, ProposalSource::Random) {
                    Ok(trial) => pending.push(trial),
                    Err(failed) => finished.push(failed),
                }
            }

            finished.extend(self.dispatch(pending).await);
            finished.sort_by_key(|trial| trial.number);
            for trial in finished {
                self.record(trial);
            }
            start = end;
        }
    }

    async fn run_guided_phase(&mut self) {
        for number in self.config.random_starts..self.config.iterations {
            let (params, source, warning) = self.propose();
            let mut trial = match self.build_trial(number, params, source) {
                Ok(trial) => trial,
                Err(failed) => {
                    self.record(failed);
                    continue;
                }
            };
            if let Some(warning) = warning {
                trial.add_warning(warning);
            }
            let finished = self.dispatch(vec![trial]).await;
            for trial in finished {
                self.record(trial);
            }
        }
    }

    /// Prepare `trials` in order, evaluate them on separate tasks and return
    /// them sorted by number. A task that panics or is cancelled yields its
    /// trial marked failed instead of ending the run.
    async fn dispatch(&self, trials: Vec<Trial>) -> Vec<Trial> {
        let mut in_flight = BTreeMap::new();
        let mut running = JoinSet::new();
        for mut trial in trials {
            let ctx = self.executor.prepare(&mut trial);
            in_flight.insert(trial.number, trial.clone());
            let executor = Arc::clone(&self.executor);
            running.spawn(async move { executor.execute(trial, ctx).await });
        }

        let mut finished = Vec::with_capacity(in_flight.len());
        let mut aborted = Vec::new();
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(trial) => {
                    in_flight.remove(&trial.number);
                    finished.push(trial);
                }
                Err(e) => aborted.push(e.to_string()),
            }
        }

        // Whatever is still in flight belongs to a task that never returned.
        let reason = aborted.join("; ");
        for (number, mut trial) in in_flight {
            warn!(trial = number, error = %reason, "trial task aborted");
            trial.mark_failed(&TrialError::Aborted {
                message: reason.clone(),
            });
            finished.push(trial);
        }
        finished.sort_by_key(|trial| trial.number);
        finished
    }

    /// Next parameters from the surrogate, or a random sample with the
    /// reason when the surrogate cannot propose one.
    fn propose(&mut self) -> (RawParams, ProposalSource, Option<String>) {
        match self.propose_from_surrogate() {
            Ok(params) => (params, ProposalSource::Surrogate, None),
            Err(e) => {
                warn!(error = %e, "surrogate proposal unavailable, sampling at random");
                let params = self.space.sample_random(&mut self.rng);
                (params, ProposalSource::Fallback, Some(e.to_string()))
            }
        }
    }

    fn propose_from_surrogate(&mut self) -> HdResult<RawParams> {
        let best = self
            .history
            .best_value()
            .ok_or_else(|| internal_error!("no successful trial to improve on"))?;
        self.surrogate.fit(&self.history)?;
        let x = self.acquisition.propose_next(
            &self.surrogate,
            &self.space,
            best,
            self.history.direction(),
            &mut self.rng,
        )?;
        let params = self.space.decode(&x)?;
        debug!(params = ?params, "surrogate proposal");
        Ok(params)
    }

    /// A pending trial, or the trial already marked failed when `params`
    /// do not encode.
    fn build_trial(
        &self,
        number: usize,
        params: RawParams,
        source: ProposalSource,
    ) -> Result<Trial, Trial> {
        match self.space.encode(&params) {
            Ok(encoded) => Ok(Trial::new(number, params, encoded, source)),
            Err(e) => {
                warn!(trial = number, error = %e, "parameters do not match the space");
                let mut trial = Trial::new(number, params, Vec::new(), source);
                trial.mark_failed(&TrialError::Encoding(e));
                Err(trial)
            }
        }
    }

    fn record(&mut self, trial: Trial) {
        if let Err(e) = self.journal.append(&trial) {
            warn!(trial = trial.number, error = %e, "failed to append to trial journal");
        }
        let number = trial.number;
        let objective = trial.objective;
        if self.history.record(trial) {
            info!(trial = number, objective = ?objective, "new best result");
        }
    }
}
