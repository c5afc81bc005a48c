use anyhow::Context;
use hd_engine::OptimizationLoop;
use hd_types::ExperimentConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let path = std::env::args()
        .nth(1)
        .context("usage: hypered <experiment.json>")?;
    let config = ExperimentConfig::from_json_file(&path)
        .with_context(|| format!("failed to load experiment configuration {path}"))?;

    let mut optimization = OptimizationLoop::with_command_runner(config)?;
    optimization.run().await?;

    println!("{}", serde_json::to_string_pretty(&optimization.summary())?);
    Ok(())
}
