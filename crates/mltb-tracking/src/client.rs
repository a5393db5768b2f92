//! Client facade over a [`TrackingStore`] and the scoped [`ActiveRun`] guard.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error};

use mltb_types::{TrackingError, TrackingResult};

use crate::file::FileStore;
use crate::memory::InMemoryStore;
use crate::run::{Experiment, Metric, Run, RunInfo, RunStatus};
use crate::store::TrackingStore;

/// Environment variable consulted when no tracking URI was set explicitly.
pub const TRACKING_URI_ENV: &str = "MLFLOW_TRACKING_URI";

const DEFAULT_TRACKING_URI: &str = "./mlruns";
const MEMORY_SCHEME: &str = "memory:";
const FILE_SCHEME: &str = "file:";

static TRACKING_URI: RwLock<Option<String>> = parking_lot::const_rwlock(None);

/// Set the process-wide tracking URI.
pub fn set_tracking_uri(uri: impl Into<String>) {
    let uri = uri.into();
    debug!(%uri, "tracking uri set");
    *TRACKING_URI.write() = Some(uri);
}

/// The process-wide tracking URI: the value set with [`set_tracking_uri`],
/// else `MLFLOW_TRACKING_URI`, else `./mlruns`.
pub fn get_tracking_uri() -> String {
    if let Some(uri) = TRACKING_URI.read().clone() {
        return uri;
    }
    match std::env::var(TRACKING_URI_ENV) {
        Ok(uri) if !uri.trim().is_empty() => uri,
        _ => DEFAULT_TRACKING_URI.to_string(),
    }
}

/// Cheaply cloneable handle on a tracking store.
#[derive(Clone)]
pub struct TrackingClient {
    store: Arc<dyn TrackingStore>,
    uri: String,
}

impl fmt::Debug for TrackingClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackingClient").field("uri", &self.uri).finish()
    }
}

impl TrackingClient {
    pub fn new(store: Arc<dyn TrackingStore>) -> Self {
        Self {
            store,
            uri: "<custom>".to_string(),
        }
    }

    /// Client over a fresh [`InMemoryStore`].
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(InMemoryStore::new()),
            uri: MEMORY_SCHEME.to_string(),
        }
    }

    /// Open the store named by `uri`: `memory:`, `file:<path>`,
    /// `file://<path>` or a plain directory path.
    pub fn from_uri(uri: &str) -> TrackingResult<Self> {
        let trimmed = uri.trim();
        if trimmed == MEMORY_SCHEME {
            return Ok(Self::in_memory());
        }

        let path = if let Some(rest) = trimmed.strip_prefix(FILE_SCHEME) {
            rest.strip_prefix("//").unwrap_or(rest)
        } else if trimmed.contains("://") || trimmed.is_empty() {
            return Err(TrackingError::UnsupportedUri {
                uri: uri.to_string(),
            });
        } else {
            trimmed
        };

        let store = FileStore::new(path)?;
        Ok(Self {
            store: Arc::new(store),
            uri: trimmed.to_string(),
        })
    }

    /// Client for [`get_tracking_uri`].
    pub fn from_global_uri() -> TrackingResult<Self> {
        Self::from_uri(&get_tracking_uri())
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn store(&self) -> &Arc<dyn TrackingStore> {
        &self.store
    }

    pub fn get_or_create_experiment(&self, name: &str) -> TrackingResult<Experiment> {
        self.store.get_or_create_experiment(name)
    }

    pub fn list_experiments(&self) -> TrackingResult<Vec<Experiment>> {
        self.store.list_experiments()
    }

    /// Open a run; it is closed when the returned guard is ended or dropped.
    pub fn start_run(
        &self,
        experiment_id: &str,
        run_name: &str,
        parent_run_id: Option<&str>,
    ) -> TrackingResult<ActiveRun> {
        let info = self.store.create_run(experiment_id, run_name, parent_run_id)?;
        debug!(run_id = %info.run_id, run_name, parent = ?parent_run_id, "run started");
        Ok(ActiveRun {
            client: self.clone(),
            info,
            ended: false,
        })
    }

    pub fn set_terminated(&self, run_id: &str, status: RunStatus) -> TrackingResult<RunInfo> {
        self.store.update_run_status(run_id, status)
    }

    pub fn log_param(&self, run_id: &str, key: &str, value: &str) -> TrackingResult<()> {
        self.store.log_param(run_id, key, value)
    }

    pub fn log_metric(&self, run_id: &str, key: &str, value: f64, step: u64) -> TrackingResult<()> {
        self.store.log_metric(run_id, Metric::new(key, value, step))
    }

    pub fn set_tag(&self, run_id: &str, key: &str, value: &str) -> TrackingResult<()> {
        self.store.set_tag(run_id, key, value)
    }

    pub fn log_batch(
        &self,
        run_id: &str,
        params: &[(String, String)],
        metrics: &[Metric],
        tags: &[(String, String)],
    ) -> TrackingResult<()> {
        self.store.log_batch(run_id, params, metrics, tags)
    }

    pub fn log_artifact(
        &self,
        run_id: &str,
        local_path: &Path,
        artifact_dir: Option<&str>,
    ) -> TrackingResult<String> {
        self.store.log_artifact(run_id, local_path, artifact_dir)
    }

    pub fn get_run(&self, run_id: &str) -> TrackingResult<Run> {
        self.store.get_run(run_id)
    }

    pub fn search_runs(&self, experiment_id: &str) -> TrackingResult<Vec<Run>> {
        self.store.search_runs(experiment_id)
    }

    pub fn metric_history(&self, run_id: &str, key: &str) -> TrackingResult<Vec<Metric>> {
        self.store.metric_history(run_id, key)
    }
}

/// A running run that is closed when it goes out of scope.
///
/// Dropping the guard ends the run `FINISHED`, or `FAILED` when the thread is
/// unwinding from a panic. [`ActiveRun::end`] closes it with an explicit
/// status instead.
#[derive(Debug)]
pub struct ActiveRun {
    client: TrackingClient,
    info: RunInfo,
    ended: bool,
}

impl ActiveRun {
    pub fn run_id(&self) -> &str {
        &self.info.run_id
    }

    pub fn info(&self) -> &RunInfo {
        &self.info
    }

    pub fn client(&self) -> &TrackingClient {
        &self.client
    }

    pub fn log_param(&self, key: &str, value: &str) -> TrackingResult<()> {
        self.client.log_param(self.run_id(), key, value)
    }

    pub fn log_metric(&self, key: &str, value: f64, step: u64) -> TrackingResult<()> {
        self.client.log_metric(self.run_id(), key, value, step)
    }

    pub fn set_tag(&self, key: &str, value: &str) -> TrackingResult<()> {
        self.client.set_tag(self.run_id(), key, value)
    }

    pub fn log_batch(
        &self,
        params: &[(String, String)],
        metrics: &[Metric],
        tags: &[(String, String)],
    ) -> TrackingResult<()> {
        self.client.log_batch(self.run_id(), params, metrics, tags)
    }

    pub fn log_artifact(&self, local_path: &Path, artifact_dir: Option<&str>) -> TrackingResult<String> {
        self.client.log_artifact(self.run_id(), local_path, artifact_dir)
    }

    /// Close the run with `status`.
    pub fn end(mut self, status: RunStatus) -> TrackingResult<RunInfo> {
        self.ended = true;
        let info = self.client.set_terminated(self.run_id(), status)?;
        debug!(run_id = %info.run_id, %status, "run ended");
        Ok(info)
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        if self.ended {
            return;
        }
        let status = if std::thread::panicking() {
            RunStatus::Failed
        } else {
            RunStatus::Finished
        };
        if let Err(e) = self.client.set_terminated(&self.info.run_id, status) {
            error!(run_id = %self.info.run_id, error = %e, "failed to close run");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn uri_schemes() {
        let temp_dir = tempdir().unwrap();
        let plain = temp_dir.path().join("plain");
        let client = TrackingClient::from_uri(plain.to_str().unwrap()).unwrap();
        client.get_or_create_experiment("e").unwrap();
        assert!(plain.join("0").join("meta.json").is_file());

        let prefixed = format!("file://{}", temp_dir.path().join("prefixed").display());
        let client = TrackingClient::from_uri(&prefixed).unwrap();
        client.get_or_create_experiment("e").unwrap();
        assert!(temp_dir.path().join("prefixed").join("0").is_dir());

        assert_eq!(TrackingClient::from_uri("memory:").unwrap().uri(), "memory:");
        assert!(matches!(
            TrackingClient::from_uri("http://localhost:5000"),
            Err(TrackingError::UnsupportedUri { .. })
        ));
    }

    #[test]
    fn global_uri_round_trip() {
        set_tracking_uri("memory:");
        assert_eq!(get_tracking_uri(), "memory:");
        assert_eq!(TrackingClient::from_global_uri().unwrap().uri(), "memory:");
    }

    #[test]
    fn dropped_guard_finishes_run() {
        let client = TrackingClient::in_memory();
        let exp = client.get_or_create_experiment("e").unwrap();
        let run_id = {
            let run = client.start_run(&exp.experiment_id, "000", None).unwrap();
            run.set_tag("k", "v").unwrap();
            run.run_id().to_string()
        };
        let run = client.get_run(&run_id).unwrap();
        assert_eq!(run.info.status, RunStatus::Finished);
        assert_eq!(run.tag("k"), Some("v"));
    }

    #[test]
    fn explicit_end_wins() {
        let client = TrackingClient::in_memory();
        let exp = client.get_or_create_experiment("e").unwrap();
        let run = client.start_run(&exp.experiment_id, "000", None).unwrap();
        let run_id = run.run_id().to_string();
        run.end(RunStatus::Killed).unwrap();
        assert_eq!(client.get_run(&run_id).unwrap().info.status, RunStatus::Killed);
    }

    #[test]
    fn panicking_scope_fails_run() {
        let client = TrackingClient::in_memory();
        let exp = client.get_or_create_experiment("e").unwrap();
        let run = client.start_run(&exp.experiment_id, "000", None).unwrap();
        let run_id = run.run_id().to_string();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _run = run;
            panic!("boom");
        }));
        assert!(result.is_err());
        assert_eq!(client.get_run(&run_id).unwrap().info.status, RunStatus::Failed);
    }

    #[test]
    fn nested_guards() {
        let client = TrackingClient::in_memory();
        let exp = client.get_or_create_experiment("e").unwrap();
        let parent = client.start_run(&exp.experiment_id, "000", None).unwrap();
        {
            let child = client
                .start_run(&exp.experiment_id, "000-000", Some(parent.run_id()))
                .unwrap();
            child.log_metric("acc", 0.9, 0).unwrap();
        }
        let parent_id = parent.run_id().to_string();
        parent.end(RunStatus::Finished).unwrap();

        let runs = client.search_runs(&exp.experiment_id).unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.info.status == RunStatus::Finished));
        let child = runs.iter().find(|r| r.is_nested()).unwrap();
        assert_eq!(child.info.parent_run_id.as_deref(), Some(parent_id.as_str()));
    }
}
