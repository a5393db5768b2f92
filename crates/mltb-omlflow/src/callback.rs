//! Training-loop callback that forwards trainer logs through a session.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use tracing::{info, warn};

use mltb_study::TrialHandle;
use mltb_tracking::{MAX_PARAMS_TAGS_PER_BATCH, MAX_PARAM_VAL_LENGTH};
use mltb_types::ParamValue;

use crate::session::TrialSession;

/// Set to `TRUE` or `1` to upload the training output directory as artifacts.
pub const LOG_ARTIFACTS_ENV: &str = "HF_MLFLOW_LOG_ARTIFACTS";

/// The parts of a trainer's state the logger looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrainerState {
    pub global_step: u64,
    /// Only the main process of a distributed run logs.
    pub is_world_process_zero: bool,
}

impl TrainerState {
    pub fn main_process(global_step: u64) -> Self {
        Self {
            global_step,
            is_world_process_zero: true,
        }
    }
}

/// Logs training arguments, model config and training metrics to the trial
/// session.
#[derive(Debug, Clone)]
pub struct TrainingLogger {
    log_training_args: bool,
    log_model_config: bool,
    log_artifacts: Option<bool>,
    initialized: bool,
}

impl TrainingLogger {
    pub fn new(log_training_args: bool, log_model_config: bool) -> Self {
        Self {
            log_training_args,
            log_model_config,
            log_artifacts: None,
            initialized: false,
        }
    }

    /// Decide artifact upload here instead of reading `HF_MLFLOW_LOG_ARTIFACTS`.
    pub fn with_log_artifacts(mut self, enabled: bool) -> Self {
        self.log_artifacts = Some(enabled);
        self
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn logs_artifacts(&self) -> bool {
        self.log_artifacts.unwrap_or(false)
    }

    /// Log the merged model config and training arguments as params.
    ///
    /// Training arguments win over model config entries with the same key.
    /// Values whose text is longer than [`MAX_PARAM_VAL_LENGTH`] are dropped.
    pub fn setup<T: TrialHandle>(
        &mut self,
        session: &TrialSession<'_, T>,
        state: &TrainerState,
        args: &BTreeMap<String, serde_json::Value>,
        model_config: Option<&BTreeMap<String, serde_json::Value>>,
    ) {
        if self.log_artifacts.is_none() {
            let flag = std::env::var(LOG_ARTIFACTS_ENV).unwrap_or_default().to_uppercase();
            self.log_artifacts = Some(matches!(flag.as_str(), "TRUE" | "1"));
        }

        if state.is_world_process_zero {
            let mut combined: BTreeMap<String, serde_json::Value> = BTreeMap::new();
            if self.log_model_config {
                if let Some(config) = model_config {
                    info!("Logging model config.");
                    combined.extend(config.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
            }
            if self.log_training_args {
                info!("Logging training arguments.");
                combined.extend(args.iter().map(|(k, v)| (k.clone(), v.clone())));
            }

            let params: Vec<(String, ParamValue)> = combined
                .into_iter()
                .filter_map(|(name, value)| {
                    let value = ParamValue::from(value);
                    if value.to_string().chars().count() > MAX_PARAM_VAL_LENGTH {
                        warn!(
                            key = %name,
                            "value is longer than {} characters and is not logged as a param",
                            MAX_PARAM_VAL_LENGTH
                        );
                        return None;
                    }
                    Some((name, value))
                })
                .collect();
            for chunk in params.chunks(MAX_PARAMS_TAGS_PER_BATCH) {
                session.log_params(chunk.iter().cloned());
            }
        }
        self.initialized = true;
    }

    pub fn on_train_begin<T: TrialHandle>(
        &mut self,
        session: &TrialSession<'_, T>,
        state: &TrainerState,
        args: &BTreeMap<String, serde_json::Value>,
        model_config: Option<&BTreeMap<String, serde_json::Value>>,
    ) {
        if !self.initialized {
            self.setup(session, state, args, model_config);
        }
    }

    /// Log the numeric entries of `logs` as metrics at the global step.
    ///
    /// Runs [`setup`](Self::setup) first when the trainer never called
    /// [`on_train_begin`](Self::on_train_begin).
    pub fn on_log<T: TrialHandle>(
        &mut self,
        session: &TrialSession<'_, T>,
        state: &TrainerState,
        args: &BTreeMap<String, serde_json::Value>,
        model_config: Option<&BTreeMap<String, serde_json::Value>>,
        logs: &BTreeMap<String, serde_json::Value>,
    ) {
        if !self.initialized {
            self.setup(session, state, args, model_config);
        }
        if !state.is_world_process_zero {
            return;
        }
        let mut metrics = Vec::with_capacity(logs.len());
        for (key, value) in logs {
            match value.as_f64() {
                Some(v) => metrics.push((key.as_str(), v)),
                None => warn!(
                    key = %key,
                    value = %value,
                    "only numeric values can be logged as metrics, dropped"
                ),
            }
        }
        session.log_metrics(metrics, Some(state.global_step));
    }

    /// Upload every file below `output_dir` when artifact logging is enabled.
    pub fn on_train_end<T: TrialHandle>(
        &self,
        session: &TrialSession<'_, T>,
        state: &TrainerState,
        output_dir: &Path,
    ) {
        if !(self.initialized && state.is_world_process_zero && self.logs_artifacts()) {
            return;
        }
        info!(dir = %output_dir.display(), "Logging artifacts. This may take time.");
        if let Err(e) = upload_dir(session, output_dir, None) {
            warn!(dir = %output_dir.display(), error = %e, "could not read training output");
        }
    }
}

fn upload_dir<T: TrialHandle>(
    session: &TrialSession<'_, T>,
    dir: &Path,
    artifact_dir: Option<&str>,
) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            let nested = match artifact_dir {
                Some(parent) => format!("{parent}/{name}"),
                None => name,
            };
            upload_dir(session, &path, Some(&nested))?;
        } else {
            session.log_artifact(&path, artifact_dir);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OptunaMlflow, OptunaMlflowConfig};
    use mltb_study::{Study, StudyConfig};
    use mltb_tracking::{Run, TrackingClient};
    use serde_json::json;
    use tempfile::tempdir;

    fn map(entries: serde_json::Value) -> BTreeMap<String, serde_json::Value> {
        serde_json::from_value(entries).unwrap()
    }

    fn recorded_run(adapter: &OptunaMlflow, study: &str) -> Run {
        let client = adapter.client().unwrap();
        let exp = client.get_or_create_experiment(study).unwrap();
        client.search_runs(&exp.experiment_id).unwrap().remove(0)
    }

    #[test]
    fn setup_merges_config_and_args() {
        let adapter =
            OptunaMlflow::with_client(OptunaMlflowConfig::default(), TrackingClient::in_memory()).unwrap();
        let study = Study::new(StudyConfig::new("callback_setup"));
        let trial = study.ask();
        let mut logger = TrainingLogger::new(true, true).with_log_artifacts(false);

        let args = map(json!({"learning_rate": 0.001, "shared": "from_args", "long": "x".repeat(300)}));
        let model = map(json!({"hidden_size": 768, "shared": "from_model"}));

        adapter
            .run(&trial, |session| {
                logger.on_train_begin(session, &TrainerState::main_process(0), &args, Some(&model));
                Ok(0.0)
            })
            .unwrap();

        assert!(logger.is_initialized());
        let run = recorded_run(&adapter, "callback_setup");
        assert_eq!(run.data.params["learning_rate"], "0.001");
        assert_eq!(run.data.params["hidden_size"], "768");
        assert_eq!(run.data.params["shared"], "from_args");
        assert!(!run.data.params.contains_key("long"));
        assert_eq!(trial.user_attrs()["hidden_size"], json!(768));
    }

    #[test]
    fn secondary_processes_do_not_log() {
        let adapter =
            OptunaMlflow::with_client(OptunaMlflowConfig::default(), TrackingClient::in_memory()).unwrap();
        let study = Study::new(StudyConfig::new("callback_secondary"));
        let trial = study.ask();
        let mut logger = TrainingLogger::new(true, false).with_log_artifacts(false);
        let state = TrainerState {
            global_step: 10,
            is_world_process_zero: false,
        };

        adapter
            .run(&trial, |session| {
                logger.setup(session, &state, &map(json!({"epochs": 3})), None);
                logger.on_log(session, &state, &BTreeMap::new(), None, &map(json!({"loss": 0.3})));
                Ok(0.0)
            })
            .unwrap();

        assert!(logger.is_initialized());
        let run = recorded_run(&adapter, "callback_secondary");
        assert!(run.data.params.is_empty());
        assert!(!run.data.metrics.contains_key("loss"));
    }

    #[test]
    fn on_log_keeps_numeric_entries() {
        let adapter =
            OptunaMlflow::with_client(OptunaMlflowConfig::default(), TrackingClient::in_memory()).unwrap();
        let study = Study::new(StudyConfig::new("callback_log"));
        let trial = study.ask();
        let mut logger = TrainingLogger::new(false, false).with_log_artifacts(false);

        let mut run_id = String::new();
        adapter
            .run(&trial, |session| {
                run_id = session.run_id().unwrap().to_string();
                let logs = map(json!({"loss": 0.25, "epoch": 1, "note": "warmup"}));
                logger.on_log(session, &TrainerState::main_process(40), &BTreeMap::new(), None, &logs);
                Ok(0.0)
            })
            .unwrap();

        let client = adapter.client().unwrap();
        let loss = client.metric_history(&run_id, "loss").unwrap();
        assert_eq!(loss.len(), 1);
        assert_eq!(loss[0].step, 40);
        assert_eq!(loss[0].value, 0.25);
        assert_eq!(client.metric_history(&run_id, "epoch").unwrap()[0].value, 1.0);
        assert!(client.metric_history(&run_id, "note").unwrap().is_empty());
    }

    #[test]
    fn first_on_log_runs_setup() {
        let adapter =
            OptunaMlflow::with_client(OptunaMlflowConfig::default(), TrackingClient::in_memory()).unwrap();
        let study = Study::new(StudyConfig::new("callback_lazy_setup"));
        let trial = study.ask();
        let mut logger = TrainingLogger::new(true, false).with_log_artifacts(false);
        let args = map(json!({"epochs": 3}));
        let state = TrainerState::main_process(5);

        adapter
            .run(&trial, |session| {
                logger.on_log(session, &state, &args, None, &map(json!({"loss": 0.4})));
                let later = TrainerState::main_process(6);
                logger.on_log(session, &later, &args, None, &map(json!({"loss": 0.3})));
                Ok(0.0)
            })
            .unwrap();

        assert!(logger.is_initialized());
        let run = recorded_run(&adapter, "callback_lazy_setup");
        assert_eq!(run.data.params["epochs"], "3");
        assert_eq!(run.data.metrics["loss"], 0.3);
    }

    #[test]
    fn on_train_end_uploads_output_dir() {
        let temp_dir = tempdir().unwrap();
        let output = temp_dir.path().join("output");
        fs::create_dir_all(output.join("checkpoint-1")).unwrap();
        fs::write(output.join("config.json"), "{}").unwrap();
        fs::write(output.join("checkpoint-1").join("weights.bin"), "w").unwrap();

        let adapter =
            OptunaMlflow::with_client(OptunaMlflowConfig::default(), TrackingClient::in_memory()).unwrap();
        let study = Study::new(StudyConfig::new("callback_artifacts"));
        let trial = study.ask();
        let mut logger = TrainingLogger::new(false, false).with_log_artifacts(true);
        let state = TrainerState::main_process(100);

        adapter
            .run(&trial, |session| {
                logger.on_train_begin(session, &state, &BTreeMap::new(), None);
                logger.on_train_end(session, &state, &output);
                Ok(0.0)
            })
            .unwrap();

        let mut artifacts = recorded_run(&adapter, "callback_artifacts").data.artifacts;
        artifacts.sort();
        assert_eq!(artifacts, vec!["checkpoint-1/weights.bin", "config.json"]);
    }
}
