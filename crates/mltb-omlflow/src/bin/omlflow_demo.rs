//! Five trials of `(x - 2)^2`, three logged folds each.
//!
//! Usage: `omlflow-demo [TRACKING_URI]`. Without an argument the URI comes
//! from `MLFLOW_TRACKING_URI`, falling back to `./mlruns`.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use mltb_omlflow::{OptunaMlflow, OptunaMlflowConfig};
use mltb_study::{Study, StudyConfig};
use mltb_tools::mean;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("mltb_omlflow=info".parse()?))
        .init();

    let mut config = OptunaMlflowConfig::default();
    if let Some(uri) = std::env::args().nth(1) {
        config = config.with_tracking_uri(uri);
    }
    let adapter = OptunaMlflow::new(config)?;

    let study = Study::new(StudyConfig::new("omlflow_demo"));
    study.optimize(
        5,
        adapter.objective(|session| {
            let mut results = Vec::with_capacity(3);
            for fold in 0..3 {
                let x = session.suggest_uniform("x", -10.0, 10.0)?;
                let result = (x - 2.0_f64).powi(2);
                session.log_iter([("x", result)], Some(fold));
                results.push(result);
            }
            Ok(mean(&results))
        }),
    )?;

    let best = study.best_trial()?;
    println!(
        "best value {:?} in trial {} with params {:?}",
        best.value, best.number, best.params
    );
    Ok(())
}
