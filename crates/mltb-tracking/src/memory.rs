//! Process-local tracking store.

use std::collections::BTreeMap;
use std::path::Path;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use mltb_types::{TrackingError, TrackingResult};

use crate::run::{Experiment, Metric, Run, RunData, RunInfo, RunStatus};
use crate::store::{artifact_name, TrackingStore};
use crate::validation::{validate_key, validate_param, validate_tag};

#[derive(Debug, Clone)]
struct RunRecord {
    info: RunInfo,
    params: BTreeMap<String, String>,
    metrics: BTreeMap<String, Vec<Metric>>,
    tags: BTreeMap<String, String>,
    artifacts: Vec<String>,
}

impl RunRecord {
    fn new(info: RunInfo) -> Self {
        let tags = info.system_tags().into_iter().collect();
        Self {
            info,
            params: BTreeMap::new(),
            metrics: BTreeMap::new(),
            tags,
            artifacts: Vec::new(),
        }
    }

    fn ensure_active(&self) -> TrackingResult<()> {
        if self.info.status.is_terminal() {
            return Err(TrackingError::RunNotActive {
                run_id: self.info.run_id.clone(),
                status: self.info.status.to_string(),
            });
        }
        Ok(())
    }

    fn to_run(&self) -> Run {
        Run {
            info: self.info.clone(),
            data: RunData {
                params: self.params.clone(),
                metrics: RunData::latest_metrics(&self.metrics),
                tags: self.tags.clone(),
                artifacts: self.artifacts.clone(),
            },
        }
    }
}

/// Keeps every experiment and run in memory for the lifetime of the store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    experiments: RwLock<Vec<Experiment>>,
    runs: DashMap<String, RwLock<RunRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    fn with_run<T>(
        &self,
        run_id: &str,
        f: impl FnOnce(&RunRecord) -> TrackingResult<T>,
    ) -> TrackingResult<T> {
        let entry = self.runs.get(run_id).ok_or_else(|| TrackingError::RunNotFound {
            run_id: run_id.to_string(),
        })?;
        let record = entry.read();
        f(&record)
    }

    fn with_active_run<T>(
        &self,
        run_id: &str,
        f: impl FnOnce(&mut RunRecord) -> TrackingResult<T>,
    ) -> TrackingResult<T> {
        let entry = self.runs.get(run_id).ok_or_else(|| TrackingError::RunNotFound {
            run_id: run_id.to_string(),
        })?;
        let mut record = entry.write();
        record.ensure_active()?;
        f(&mut record)
    }
}

impl TrackingStore for InMemoryStore {
    fn get_or_create_experiment(&self, name: &str) -> TrackingResult<Experiment> {
        let mut experiments = self.experiments.write();
        if let Some(existing) = experiments.iter().find(|e| e.name == name) {
            return Ok(existing.clone());
        }
        let experiment = Experiment {
            experiment_id: experiments.len().to_string(),
            name: name.to_string(),
            creation_time: chrono::Utc::now().timestamp_millis(),
        };
        debug!(experiment_id = %experiment.experiment_id, name, "created experiment");
        experiments.push(experiment.clone());
        Ok(experiment)
    }

    fn list_experiments(&self) -> TrackingResult<Vec<Experiment>> {
        Ok(self.experiments.read().clone())
    }

    fn create_run(
        &self,
        experiment_id: &str,
        run_name: &str,
        parent_run_id: Option<&str>,
    ) -> TrackingResult<RunInfo> {
        if !self
            .experiments
            .read()
            .iter()
            .any(|e| e.experiment_id == experiment_id)
        {
            return Err(TrackingError::ExperimentNotFound {
                experiment_id: experiment_id.to_string(),
            });
        }
        if let Some(parent) = parent_run_id {
            if !self.runs.contains_key(parent) {
                return Err(TrackingError::RunNotFound {
                    run_id: parent.to_string(),
                });
            }
        }

        let info = RunInfo::new(experiment_id, run_name, parent_run_id);
        self.runs
            .insert(info.run_id.clone(), RwLock::new(RunRecord::new(info.clone())));
        Ok(info)
    }

    fn update_run_status(&self, run_id: &str, status: RunStatus) -> TrackingResult<RunInfo> {
        self.with_active_run(run_id, |record| {
            record.info.status = status;
            if status.is_terminal() {
                record.info.end_time = Some(chrono::Utc::now().timestamp_millis());
            }
            Ok(record.info.clone())
        })
    }

    fn log_param(&self, run_id: &str, key: &str, value: &str) -> TrackingResult<()> {
        validate_param(key, value)?;
        self.with_active_run(run_id, |record| {
            match record.params.get(key) {
                Some(old) if old != value => Err(TrackingError::ParamChanged {
                    key: key.to_string(),
                    old: old.clone(),
                    new: value.to_string(),
                }),
                Some(_) => Ok(()),
                None => {
                    record.params.insert(key.to_string(), value.to_string());
                    Ok(())
                }
            }
        })
    }

    fn log_metric(&self, run_id: &str, metric: Metric) -> TrackingResult<()> {
        validate_key(&metric.key)?;
        self.with_active_run(run_id, |record| {
            record.metrics.entry(metric.key.clone()).or_default().push(metric);
            Ok(())
        })
    }

    fn set_tag(&self, run_id: &str, key: &str, value: &str) -> TrackingResult<()> {
        validate_tag(key, value)?;
        self.with_active_run(run_id, |record| {
            record.tags.insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    fn log_artifact(
        &self,
        run_id: &str,
        local_path: &Path,
        artifact_dir: Option<&str>,
    ) -> TrackingResult<String> {
        if !local_path.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("artifact {} is not a file", local_path.display()),
            )
            .into());
        }
        let name = artifact_name(local_path, artifact_dir)?;
        self.with_active_run(run_id, |record| {
            if !record.artifacts.contains(&name) {
                record.artifacts.push(name.clone());
            }
            Ok(name)
        })
    }

    fn get_run(&self, run_id: &str) -> TrackingResult<Run> {
        self.with_run(run_id, |record| Ok(record.to_run()))
    }

    fn search_runs(&self, experiment_id: &str) -> TrackingResult<Vec<Run>> {
        let mut runs: Vec<Run> = self
            .runs
            .iter()
            .filter_map(|entry| {
                let record = entry.value().read();
                (record.info.experiment_id == experiment_id).then(|| record.to_run())
            })
            .collect();
        runs.sort_by(|a, b| {
            a.info
                .start_time
                .cmp(&b.info.start_time)
                .then_with(|| a.info.run_name.cmp(&b.info.run_name))
        });
        Ok(runs)
    }

    fn metric_history(&self, run_id: &str, key: &str) -> TrackingResult<Vec<Metric>> {
        self.with_run(run_id, |record| {
            Ok(record.metrics.get(key).cloned().unwrap_or_default())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_run() -> (InMemoryStore, String) {
        let store = InMemoryStore::new();
        let exp = store.get_or_create_experiment("study").unwrap();
        let run = store.create_run(&exp.experiment_id, "000", None).unwrap();
        (store, run.run_id)
    }

    #[test]
    fn experiments_are_reused_by_name() {
        let store = InMemoryStore::new();
        let a = store.get_or_create_experiment("a").unwrap();
        let b = store.get_or_create_experiment("b").unwrap();
        let a2 = store.get_or_create_experiment("a").unwrap();
        assert_eq!(a, a2);
        assert_ne!(a.experiment_id, b.experiment_id);
        assert_eq!(store.list_experiments().unwrap().len(), 2);
    }

    #[test]
    fn params_are_immutable() {
        let (store, run_id) = store_with_run();
        store.log_param(&run_id, "lr", "0.1").unwrap();
        store.log_param(&run_id, "lr", "0.1").unwrap();
        let err = store.log_param(&run_id, "lr", "0.2").unwrap_err();
        assert!(matches!(err, TrackingError::ParamChanged { .. }));
    }

    #[test]
    fn batch_keeps_entries_after_a_rejected_one() {
        let (store, run_id) = store_with_run();
        store.log_param(&run_id, "a", "0").unwrap();

        let params = vec![
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ];
        let metrics = vec![Metric::new("loss", 0.5, 0)];
        let tags = vec![("stage".to_string(), "fit".to_string())];
        let err = store.log_batch(&run_id, &params, &metrics, &tags).unwrap_err();
        assert!(matches!(err, TrackingError::ParamChanged { .. }));

        let run = store.get_run(&run_id).unwrap();
        assert_eq!(run.data.params["a"], "0");
        assert_eq!(run.data.params["b"], "2");
        assert_eq!(run.data.metrics["loss"], 0.5);
        assert_eq!(run.tag("stage"), Some("fit"));
        assert_eq!(store.metric_history(&run_id, "loss").unwrap().len(), 1);
    }

    #[test]
    fn metric_history_and_latest_value() {
        let (store, run_id) = store_with_run();
        for step in 0..3 {
            store
                .log_metric(&run_id, Metric::new("acc", 0.5 + step as f64 / 10.0, step))
                .unwrap();
        }
        let history = store.metric_history(&run_id, "acc").unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].step, 2);
        let run = store.get_run(&run_id).unwrap();
        assert!((run.data.metrics["acc"] - 0.7).abs() < 1e-12);
    }

    #[test]
    fn terminal_runs_reject_logging() {
        let (store, run_id) = store_with_run();
        let info = store.update_run_status(&run_id, RunStatus::Finished).unwrap();
        assert!(info.end_time.is_some());

        let err = store.set_tag(&run_id, "k", "v").unwrap_err();
        assert!(matches!(err, TrackingError::RunNotActive { .. }));
        assert!(store.update_run_status(&run_id, RunStatus::Running).is_err());
    }

    #[test]
    fn nested_runs_and_search() {
        let (store, parent) = store_with_run();
        let exp_id = store.get_run(&parent).unwrap().info.experiment_id;
        let child = store.create_run(&exp_id, "000-000", Some(&parent)).unwrap();

        let runs = store.search_runs(&exp_id).unwrap();
        assert_eq!(runs.len(), 2);
        let nested = runs.iter().find(|r| r.run_id() == child.run_id).unwrap();
        assert!(nested.is_nested());
        assert_eq!(nested.tag(crate::PARENT_RUN_ID_TAG), Some(parent.as_str()));

        assert!(store.create_run(&exp_id, "x", Some("missing")).is_err());
        assert!(store.create_run("42", "x", None).is_err());
    }

    #[test]
    fn invalid_keys_and_values_are_rejected() {
        let (store, run_id) = store_with_run();
        assert!(store.set_tag(&run_id, "a#b", "v").is_err());
        assert!(store.log_param(&run_id, "p", &"x".repeat(251)).is_err());
        assert!(store.get_run("nope").is_err());
    }

    #[test]
    fn batch_logging() {
        let (store, run_id) = store_with_run();
        store
            .log_batch(
                &run_id,
                &[("a".into(), "1".into())],
                &[Metric::new("m", 1.0, 0)],
                &[("t".into(), "x".into())],
            )
            .unwrap();
        let run = store.get_run(&run_id).unwrap();
        assert_eq!(run.data.params["a"], "1");
        assert_eq!(run.data.metrics["m"], 1.0);
        assert_eq!(run.tag("t"), Some("x"));
    }
}
