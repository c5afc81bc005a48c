use hd_engine::{FnRunner, OptimizationLoop, TrialContext, TrialJournal, TrialRunner};
use hd_optimizer::{ProposalSource, TrialStatus};
use hd_types::{ExperimentConfig, ObjectiveDirection, ParameterValue, Variable};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

fn quadratic_config(dir: &TempDir, name: &str) -> ExperimentConfig {
    ExperimentConfig::new(name, "loss", vec![Variable::real("x", -10.0, 10.0)])
        .with_output_dir(dir.path())
        .with_budget(5, 15)
        .with_seed(7)
}

fn quadratic() -> Arc<dyn TrialRunner> {
    Arc::new(FnRunner::new(|params: &Value, _: &TrialContext| {
        let x = params["x"].as_f64().ok_or("x missing")?;
        Ok(json!({"loss": (x - 5.0) * (x - 5.0)}))
    }))
}

fn best_x(params: &hd_types::RawParams) -> f64 {
    params["x"].as_f64().unwrap()
}

#[tokio::test]
async fn converges_on_quadratic() {
    let dir = TempDir::new().unwrap();
    let mut optimization =
        OptimizationLoop::new(quadratic_config(&dir, "quadratic"), quadratic()).unwrap();
    let outcome = optimization.run().await.unwrap();

    assert_eq!(outcome.history.len(), 15);
    let best = outcome.best.unwrap();
    let x = best_x(&best.params);
    assert!((x - 5.0).abs() < 0.5, "best x = {x}");
    assert!(best.objective < 0.25, "best objective = {}", best.objective);
}

#[tokio::test]
async fn runs_are_reproducible_under_a_seed() {
    let dir = TempDir::new().unwrap();
    let mut first = OptimizationLoop::new(quadratic_config(&dir, "first"), quadratic()).unwrap();
    let mut second = OptimizationLoop::new(quadratic_config(&dir, "second"), quadratic()).unwrap();
    let a = first.run().await.unwrap();
    let b = second.run().await.unwrap();

    let trace = |outcome: &hd_engine::OptimizationOutcome| -> Vec<(f64, Option<f64>)> {
        outcome
            .history
            .trials()
            .iter()
            .map(|t| (best_x(&t.params), t.objective))
            .collect()
    };
    assert_eq!(trace(&a), trace(&b));
    assert_eq!(a.best.unwrap().params, b.best.unwrap().params);
}

#[tokio::test]
async fn failing_trials_do_not_stop_the_run() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(FnRunner::new(|params: &Value, _: &TrialContext| {
        let x = params["x"].as_f64().ok_or("x missing")?;
        if x < 0.0 {
            return Err(format!("cannot evaluate x = {x}"));
        }
        Ok(json!({"loss": (x - 5.0) * (x - 5.0)}))
    }));
    let mut optimization =
        OptimizationLoop::new(quadratic_config(&dir, "partial"), runner).unwrap();
    let outcome = optimization.run().await.unwrap();

    assert_eq!(outcome.history.len(), 15);
    let best = outcome.best.unwrap();
    assert!(best_x(&best.params) >= 0.0);
    for trial in outcome.history.trials() {
        match trial.status {
            TrialStatus::Succeeded => assert!(best.objective <= trial.objective.unwrap()),
            TrialStatus::Failed => assert!(best_x(&trial.params) < 0.0),
            other => panic!("unexpected status {other:?}"),
        }
    }
}

#[tokio::test]
async fn devices_follow_trial_order_under_parallelism() {
    let dir = TempDir::new().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    let runner = Arc::new(FnRunner::new(move |params: &Value, ctx: &TrialContext| {
        recorder.lock().unwrap().push((ctx.trial_number, ctx.device_id));
        Ok(json!({"loss": params["x"].as_f64().unwrap_or_default().abs()}))
    }));

    let config = quadratic_config(&dir, "devices")
        .with_budget(6, 10)
        .with_devices(3)
        .with_parallelism(4)
        .with_device_key("device");
    let mut optimization = OptimizationLoop::new(config.clone(), runner).unwrap();
    let outcome = optimization.run().await.unwrap();

    let devices: Vec<usize> = outcome
        .history
        .trials()
        .iter()
        .map(|t| t.device_id.unwrap())
        .collect();
    assert_eq!(devices, vec![0, 1, 2, 0, 1, 2, 0, 1, 2, 0]);

    let numbers: Vec<usize> = outcome.history.trials().iter().map(|t| t.number).collect();
    assert_eq!(numbers, (0..10).collect::<Vec<_>>());

    let mut seen = seen.lock().unwrap().clone();
    seen.sort();
    assert!(seen.iter().all(|(number, device)| number % 3 == *device));

    let params: Value = serde_json::from_str(
        &std::fs::read_to_string(config.experiment_dir().join("trial-0004/params.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(params["device"], json!(1));
}

#[tokio::test]
async fn categorical_space_stays_valid_and_finds_best_choice() {
    let dir = TempDir::new().unwrap();
    let config = ExperimentConfig::new(
        "categorical",
        "score",
        vec![Variable::categorical("opt", ["a", "b", "c"])],
    )
    .with_output_dir(dir.path())
    .with_direction(ObjectiveDirection::Maximize)
    .with_budget(3, 9)
    .with_seed(3);
    let runner = Arc::new(FnRunner::new(|params: &Value, _: &TrialContext| {
        let score = match params["opt"].as_str() {
            Some("a") => 1.0,
            Some("b") => 3.0,
            Some("c") => 2.0,
            other => return Err(format!("unexpected choice {other:?}")),
        };
        Ok(json!({ "score": score }))
    }));

    let mut optimization = OptimizationLoop::new(config, runner).unwrap();
    let outcome = optimization.run().await.unwrap();

    assert_eq!(outcome.history.failed_count(), 0);
    for trial in outcome.history.trials() {
        assert!(matches!(trial.params["opt"], ParameterValue::Categorical(_)));
        assert_eq!(trial.encoded.iter().sum::<f64>(), 1.0);
    }
    let best = outcome.best.unwrap();
    assert_eq!(best.params["opt"], ParameterValue::Categorical("b".into()));
    assert_eq!(best.objective, 3.0);
}

#[tokio::test]
async fn journal_and_summary_are_written() {
    let dir = TempDir::new().unwrap();
    let config = quadratic_config(&dir, "journal").with_budget(2, 4);
    let mut optimization = OptimizationLoop::new(config.clone(), quadratic()).unwrap();
    let outcome = optimization.run().await.unwrap();

    let journal = TrialJournal::read(config.experiment_dir().join("trials.jsonl")).unwrap();
    assert_eq!(journal.len(), 4);
    assert_eq!(journal[0].source, ProposalSource::Random);
    assert_eq!(
        journal.iter().map(|t| t.objective).collect::<Vec<_>>(),
        outcome.history.trials().iter().map(|t| t.objective).collect::<Vec<_>>()
    );

    let summary: Value = serde_json::from_str(
        &std::fs::read_to_string(config.experiment_dir().join("summary.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(summary["total_trials"], json!(4));
    assert_eq!(summary["best"]["objective"], json!(outcome.best.unwrap().objective));

    for number in 0..4 {
        let trial_dir = config.experiment_dir().join(format!("trial-{number:04}"));
        assert!(trial_dir.join("params.json").is_file());
        assert!(trial_dir.join("results.json").is_file());
    }
}
