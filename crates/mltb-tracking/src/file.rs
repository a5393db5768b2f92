//! Directory-tree tracking store.
//!
//! Layout below the root:
//!
//! ```text
//! <experiment_id>/meta.json
//! <experiment_id>/<run_id>/meta.json
//! <experiment_id>/<run_id>/params/<key>
//! <experiment_id>/<run_id>/metrics/<key>      one "timestamp value step" line per point
//! <experiment_id>/<run_id>/tags/<key>
//! <experiment_id>/<run_id>/artifacts/<path>
//! ```

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, warn};

use mltb_types::{TrackingError, TrackingResult};

use crate::run::{Experiment, Metric, Run, RunData, RunInfo, RunStatus};
use crate::store::{artifact_name, TrackingStore};
use crate::validation::{validate_key, validate_param, validate_tag};

const META_FILE: &str = "meta.json";
const PARAMS_DIR: &str = "params";
const METRICS_DIR: &str = "metrics";
const TAGS_DIR: &str = "tags";
const ARTIFACTS_DIR: &str = "artifacts";

/// Tracking store persisted as plain files.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    // Serializes experiment creation and run metadata rewrites.
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new<P: AsRef<Path>>(root: P) -> TrackingResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn experiment_dir(&self, experiment_id: &str) -> PathBuf {
        self.root.join(experiment_id)
    }

    /// Locate the directory of `run_id` in any experiment.
    fn run_dir(&self, run_id: &str) -> TrackingResult<PathBuf> {
        let not_found = || TrackingError::RunNotFound {
            run_id: run_id.to_string(),
        };
        // Run ids are generated uuids, never paths.
        if run_id.is_empty() || !run_id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(not_found());
        }
        for experiment in self.list_experiments()? {
            let dir = self.experiment_dir(&experiment.experiment_id).join(run_id);
            if dir.join(META_FILE).is_file() {
                return Ok(dir);
            }
        }
        Err(not_found())
    }

    fn read_info(&self, run_dir: &Path) -> TrackingResult<RunInfo> {
        let raw = fs::read_to_string(run_dir.join(META_FILE))?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn write_info(&self, run_dir: &Path, info: &RunInfo) -> TrackingResult<()> {
        // Readers never see a half-written file.
        let tmp = run_dir.join(format!("{META_FILE}.tmp"));
        fs::write(&tmp, serde_json::to_string_pretty(info)?)?;
        fs::rename(tmp, run_dir.join(META_FILE))?;
        Ok(())
    }

    fn active_run_dir(&self, run_id: &str) -> TrackingResult<PathBuf> {
        let dir = self.run_dir(run_id)?;
        let info = self.read_info(&dir)?;
        if info.status.is_terminal() {
            return Err(TrackingError::RunNotActive {
                run_id: run_id.to_string(),
                status: info.status.to_string(),
            });
        }
        Ok(dir)
    }

    fn read_run(&self, run_dir: &Path) -> TrackingResult<Run> {
        let info = self.read_info(run_dir)?;
        let params = read_key_files(&run_dir.join(PARAMS_DIR))?;
        let tags = read_key_files(&run_dir.join(TAGS_DIR))?;

        let mut histories = BTreeMap::new();
        for key in list_keys(&run_dir.join(METRICS_DIR))? {
            let history = read_metric_file(&run_dir.join(METRICS_DIR).join(&key), &key)?;
            histories.insert(key, history);
        }
        let artifacts = list_keys(&run_dir.join(ARTIFACTS_DIR))?;

        Ok(Run {
            info,
            data: RunData {
                params,
                metrics: RunData::latest_metrics(&histories),
                tags,
                artifacts,
            },
        })
    }
}

impl TrackingStore for FileStore {
    fn get_or_create_experiment(&self, name: &str) -> TrackingResult<Experiment> {
        let _guard = self.write_lock.lock();
        let experiments = self.list_experiments()?;
        if let Some(existing) = experiments.iter().find(|e| e.name == name) {
            return Ok(existing.clone());
        }

        let next_id = experiments
            .iter()
            .filter_map(|e| e.experiment_id.parse::<u64>().ok())
            .max()
            .map_or(0, |id| id + 1);
        let experiment = Experiment {
            experiment_id: next_id.to_string(),
            name: name.to_string(),
            creation_time: chrono::Utc::now().timestamp_millis(),
        };
        let dir = self.experiment_dir(&experiment.experiment_id);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(META_FILE), serde_json::to_string_pretty(&experiment)?)?;
        debug!(experiment_id = %experiment.experiment_id, name, root = %self.root.display(), "created experiment");
        Ok(experiment)
    }

    fn list_experiments(&self) -> TrackingResult<Vec<Experiment>> {
        let mut experiments = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let meta = entry?.path().join(META_FILE);
            if !meta.is_file() {
                continue;
            }
            let raw = fs::read_to_string(&meta)?;
            match serde_json::from_str::<Experiment>(&raw) {
                Ok(experiment) => experiments.push(experiment),
                Err(e) => warn!(path = %meta.display(), error = %e, "skipping unreadable experiment"),
            }
        }
        experiments.sort_by_key(|e| {
            (
                e.experiment_id.parse::<u64>().unwrap_or(u64::MAX),
                e.experiment_id.clone(),
            )
        });
        Ok(experiments)
    }

    fn create_run(
        &self,
        experiment_id: &str,
        run_name: &str,
        parent_run_id: Option<&str>,
    ) -> TrackingResult<RunInfo> {
        let experiment_dir = self.experiment_dir(experiment_id);
        if validate_key(experiment_id).is_err() || !experiment_dir.join(META_FILE).is_file() {
            return Err(TrackingError::ExperimentNotFound {
                experiment_id: experiment_id.to_string(),
            });
        }
        if let Some(parent) = parent_run_id {
            self.run_dir(parent)?;
        }

        let info = RunInfo::new(experiment_id, run_name, parent_run_id);
        let run_dir = experiment_dir.join(&info.run_id);
        for sub in [PARAMS_DIR, METRICS_DIR, TAGS_DIR, ARTIFACTS_DIR] {
            fs::create_dir_all(run_dir.join(sub))?;
        }
        self.write_info(&run_dir, &info)?;
        for (key, value) in info.system_tags() {
            write_key_file(&run_dir.join(TAGS_DIR), &key, &value)?;
        }
        Ok(info)
    }

    fn update_run_status(&self, run_id: &str, status: RunStatus) -> TrackingResult<RunInfo> {
        let _guard = self.write_lock.lock();
        let dir = self.active_run_dir(run_id)?;
        let mut info = self.read_info(&dir)?;
        info.status = status;
        if status.is_terminal() {
            info.end_time = Some(chrono::Utc::now().timestamp_millis());
        }
        self.write_info(&dir, &info)?;
        Ok(info)
    }

    fn log_param(&self, run_id: &str, key: &str, value: &str) -> TrackingResult<()> {
        validate_param(key, value)?;
        let params = self.active_run_dir(run_id)?.join(PARAMS_DIR);
        let path = params.join(key);
        if path.is_file() {
            let old = fs::read_to_string(&path)?;
            if old != value {
                return Err(TrackingError::ParamChanged {
                    key: key.to_string(),
                    old,
                    new: value.to_string(),
                });
            }
            return Ok(());
        }
        write_key_file(&params, key, value)
    }

    fn log_metric(&self, run_id: &str, metric: Metric) -> TrackingResult<()> {
        validate_key(&metric.key)?;
        let path = self.active_run_dir(run_id)?.join(METRICS_DIR).join(&metric.key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{} {} {}", metric.timestamp, metric.value, metric.step)?;
        Ok(())
    }

    fn set_tag(&self, run_id: &str, key: &str, value: &str) -> TrackingResult<()> {
        validate_tag(key, value)?;
        let tags = self.active_run_dir(run_id)?.join(TAGS_DIR);
        write_key_file(&tags, key, value)
    }

    fn log_artifact(
        &self,
        run_id: &str,
        local_path: &Path,
        artifact_dir: Option<&str>,
    ) -> TrackingResult<String> {
        let name = artifact_name(local_path, artifact_dir)?;
        let target = self.active_run_dir(run_id)?.join(ARTIFACTS_DIR).join(&name);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(local_path, &target)?;
        Ok(name)
    }

    fn get_run(&self, run_id: &str) -> TrackingResult<Run> {
        let dir = self.run_dir(run_id)?;
        self.read_run(&dir)
    }

    fn search_runs(&self, experiment_id: &str) -> TrackingResult<Vec<Run>> {
        let experiment_dir = self.experiment_dir(experiment_id);
        if validate_key(experiment_id).is_err() || !experiment_dir.join(META_FILE).is_file() {
            return Err(TrackingError::ExperimentNotFound {
                experiment_id: experiment_id.to_string(),
            });
        }

        let mut runs = Vec::new();
        for entry in fs::read_dir(&experiment_dir)? {
            let path = entry?.path();
            if path.join(META_FILE).is_file() {
                runs.push(self.read_run(&path)?);
            }
        }
        runs.sort_by(|a, b| {
            a.info
                .start_time
                .cmp(&b.info.start_time)
                .then_with(|| a.info.run_name.cmp(&b.info.run_name))
        });
        Ok(runs)
    }

    fn metric_history(&self, run_id: &str, key: &str) -> TrackingResult<Vec<Metric>> {
        validate_key(key)?;
        let path = self.run_dir(run_id)?.join(METRICS_DIR).join(key);
        if !path.is_file() {
            return Ok(Vec::new());
        }
        read_metric_file(&path, key)
    }
}

fn write_key_file(dir: &Path, key: &str, value: &str) -> TrackingResult<()> {
    let path = dir.join(key);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, value)?;
    Ok(())
}

/// Keys stored below `dir`, with nested directories joined by `/`.
fn list_keys(dir: &Path) -> TrackingResult<Vec<String>> {
    fn walk(dir: &Path, prefix: &str, keys: &mut Vec<String>) -> std::io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let key = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };
            if entry.path().is_dir() {
                walk(&entry.path(), &key, keys)?;
            } else {
                keys.push(key);
            }
        }
        Ok(())
    }

    let mut keys = Vec::new();
    if dir.is_dir() {
        walk(dir, "", &mut keys)?;
    }
    keys.sort();
    Ok(keys)
}

fn read_key_files(dir: &Path) -> TrackingResult<BTreeMap<String, String>> {
    let mut values = BTreeMap::new();
    for key in list_keys(dir)? {
        let value = fs::read_to_string(dir.join(&key))?;
        values.insert(key, value);
    }
    Ok(values)
}

fn read_metric_file(path: &Path, key: &str) -> TrackingResult<Vec<Metric>> {
    let raw = fs::read_to_string(path)?;
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| parse_metric_line(line, key))
        .collect()
}

fn parse_metric_line(line: &str, key: &str) -> TrackingResult<Metric> {
    let corrupt = || TrackingError::Corrupt {
        message: format!("bad metric line for {key:?}: {line:?}"),
    };
    let mut fields = line.split_whitespace();
    let timestamp: i64 = fields.next().and_then(|f| f.parse().ok()).ok_or_else(corrupt)?;
    let value: f64 = fields.next().and_then(|f| f.parse().ok()).ok_or_else(corrupt)?;
    let step: u64 = fields.next().and_then(|f| f.parse().ok()).ok_or_else(corrupt)?;
    Ok(Metric {
        key: key.to_string(),
        value,
        timestamp,
        step,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_store_roundtrip() {
        let temp_dir = tempdir().unwrap();
        let store = FileStore::new(temp_dir.path()).unwrap();

        let exp = store.get_or_create_experiment("study").unwrap();
        assert_eq!(exp.experiment_id, "0");
        assert!(temp_dir.path().join("0").join(META_FILE).is_file());

        let parent = store.create_run(&exp.experiment_id, "000", None).unwrap();
        store.log_param(&parent.run_id, "x", "1.5").unwrap();
        store.set_tag(&parent.run_id, "direction", "MINIMIZE").unwrap();
        store.log_metric(&parent.run_id, Metric::new("fold 1/loss", 0.25, 0)).unwrap();

        let child = store
            .create_run(&exp.experiment_id, "000-000", Some(&parent.run_id))
            .unwrap();
        store.log_metric(&child.run_id, Metric::new("acc", 0.5, 0)).unwrap();
        store.log_metric(&child.run_id, Metric::new("acc", 0.75, 1)).unwrap();
        store.update_run_status(&child.run_id, RunStatus::Finished).unwrap();
        store.update_run_status(&parent.run_id, RunStatus::Finished).unwrap();

        // A fresh store over the same directory sees everything.
        let reopened = FileStore::new(temp_dir.path()).unwrap();
        let run = reopened.get_run(&parent.run_id).unwrap();
        assert_eq!(run.info.status, RunStatus::Finished);
        assert_eq!(run.data.params["x"], "1.5");
        assert_eq!(run.tag("direction"), Some("MINIMIZE"));
        assert_eq!(run.data.metrics["fold 1/loss"], 0.25);

        let history = reopened.metric_history(&child.run_id, "acc").unwrap();
        assert_eq!(history.iter().map(|m| m.value).collect::<Vec<_>>(), vec![0.5, 0.75]);
        assert_eq!(history[1].step, 1);

        let runs = reopened.search_runs(&exp.experiment_id).unwrap();
        assert_eq!(runs.len(), 2);
        let nested = runs.iter().find(|r| r.is_nested()).unwrap();
        assert_eq!(nested.info.parent_run_id.as_deref(), Some(parent.run_id.as_str()));
        assert_eq!(nested.tag(crate::RUN_NAME_TAG), Some("000-000"));
    }

    #[test]
    fn test_experiment_ids_increment() {
        let temp_dir = tempdir().unwrap();
        let store = FileStore::new(temp_dir.path()).unwrap();
        let a = store.get_or_create_experiment("a").unwrap();
        let b = store.get_or_create_experiment("b").unwrap();
        assert_eq!(a.experiment_id, "0");
        assert_eq!(b.experiment_id, "1");
        assert_eq!(store.get_or_create_experiment("a").unwrap(), a);
        let names: Vec<_> = store.list_experiments().unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_terminal_and_immutable() {
        let temp_dir = tempdir().unwrap();
        let store = FileStore::new(temp_dir.path()).unwrap();
        let exp = store.get_or_create_experiment("e").unwrap();
        let run = store.create_run(&exp.experiment_id, "000", None).unwrap();

        store.log_param(&run.run_id, "p", "a").unwrap();
        assert!(matches!(
            store.log_param(&run.run_id, "p", "b"),
            Err(TrackingError::ParamChanged { .. })
        ));

        store.update_run_status(&run.run_id, RunStatus::Killed).unwrap();
        assert!(matches!(
            store.log_metric(&run.run_id, Metric::new("m", 1.0, 0)),
            Err(TrackingError::RunNotActive { .. })
        ));
    }

    #[test]
    fn test_artifacts_are_copied() {
        let temp_dir = tempdir().unwrap();
        let store = FileStore::new(temp_dir.path().join("mlruns")).unwrap();
        let exp = store.get_or_create_experiment("e").unwrap();
        let run = store.create_run(&exp.experiment_id, "000", None).unwrap();

        let source = temp_dir.path().join("model.bin");
        fs::write(&source, b"weights").unwrap();
        let name = store.log_artifact(&run.run_id, &source, Some("checkpoints")).unwrap();
        assert_eq!(name, "checkpoints/model.bin");

        let run = store.get_run(&run.run_id).unwrap();
        assert_eq!(run.data.artifacts, vec!["checkpoints/model.bin".to_string()]);
    }

    #[test]
    fn test_corrupt_metric_line() {
        assert!(parse_metric_line("1 2.5 3", "m").is_ok());
        assert!(parse_metric_line("1 NaN 0", "m").unwrap().value.is_nan());
        assert!(matches!(
            parse_metric_line("garbage", "m"),
            Err(TrackingError::Corrupt { .. })
        ));
    }
}
