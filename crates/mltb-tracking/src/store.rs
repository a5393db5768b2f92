//! The storage seam behind [`TrackingClient`](crate::TrackingClient).

use std::path::Path;

use tracing::warn;

use mltb_types::TrackingResult;

use crate::run::{Experiment, Metric, Run, RunInfo, RunStatus};

/// Backend that persists experiments and runs.
///
/// Stores validate keys and value lengths, keep params immutable and reject
/// logging into runs that already reached a terminal status.
pub trait TrackingStore: Send + Sync {
    /// Experiment named `name`, created if it does not exist yet.
    fn get_or_create_experiment(&self, name: &str) -> TrackingResult<Experiment>;

    fn list_experiments(&self) -> TrackingResult<Vec<Experiment>>;

    /// Open a new `RUNNING` run.
    fn create_run(
        &self,
        experiment_id: &str,
        run_name: &str,
        parent_run_id: Option<&str>,
    ) -> TrackingResult<RunInfo>;

    /// Move a run to `status`; terminal statuses also set the end time.
    fn update_run_status(&self, run_id: &str, status: RunStatus) -> TrackingResult<RunInfo>;

    fn log_param(&self, run_id: &str, key: &str, value: &str) -> TrackingResult<()>;

    fn log_metric(&self, run_id: &str, metric: Metric) -> TrackingResult<()>;

    fn set_tag(&self, run_id: &str, key: &str, value: &str) -> TrackingResult<()>;

    /// Log params, metrics and tags in one call.
    ///
    /// Every entry is attempted; a rejected entry does not keep the ones
    /// after it from being written. The first error is returned.
    fn log_batch(
        &self,
        run_id: &str,
        params: &[(String, String)],
        metrics: &[Metric],
        tags: &[(String, String)],
    ) -> TrackingResult<()> {
        let mut first_error = None;
        let mut keep = |result: TrackingResult<()>| {
            if let Err(e) = result {
                if first_error.is_some() {
                    warn!(run_id, error = %e, "batch entry rejected");
                } else {
                    first_error = Some(e);
                }
            }
        };
        for (key, value) in params {
            keep(self.log_param(run_id, key, value));
        }
        for metric in metrics {
            keep(self.log_metric(run_id, metric.clone()));
        }
        for (key, value) in tags {
            keep(self.set_tag(run_id, key, value));
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Store the file at `local_path` under the run's artifacts, optionally
    /// below `artifact_dir`. Returns the artifact's relative path.
    fn log_artifact(
        &self,
        run_id: &str,
        local_path: &Path,
        artifact_dir: Option<&str>,
    ) -> TrackingResult<String>;

    fn get_run(&self, run_id: &str) -> TrackingResult<Run>;

    /// Every run of the experiment, oldest first.
    fn search_runs(&self, experiment_id: &str) -> TrackingResult<Vec<Run>>;

    /// All logged points of `key`, in logging order.
    fn metric_history(&self, run_id: &str, key: &str) -> TrackingResult<Vec<Metric>>;
}

/// Relative artifact path for `local_path` stored below `artifact_dir`.
pub(crate) fn artifact_name(local_path: &Path, artifact_dir: Option<&str>) -> TrackingResult<String> {
    let file_name = local_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| mltb_types::TrackingError::InvalidKey {
            key: local_path.display().to_string(),
            reason: "artifact path has no file name".to_string(),
        })?;
    match artifact_dir {
        Some(dir) if !dir.trim_matches('/').is_empty() => {
            let dir = dir.trim_matches('/');
            crate::validation::validate_key(dir)?;
            Ok(format!("{dir}/{file_name}"))
        }
        _ => Ok(file_name.to_string()),
    }
}
