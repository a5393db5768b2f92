//! Tracking records: experiments, runs and metric points.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Tag holding the id of the parent run of a nested run.
pub const PARENT_RUN_ID_TAG: &str = "mlflow.parentRunId";
/// Tag holding the human-readable run name.
pub const RUN_NAME_TAG: &str = "mlflow.runName";
/// Tag holding the user that created the run.
pub const USER_TAG: &str = "mlflow.user";

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Running,
    Scheduled,
    Finished,
    Failed,
    Killed,
}

impl RunStatus {
    /// Terminal runs accept no further logging.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Finished | RunStatus::Failed | RunStatus::Killed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Scheduled => "SCHEDULED",
            RunStatus::Finished => "FINISHED",
            RunStatus::Failed => "FAILED",
            RunStatus::Killed => "KILLED",
        };
        write!(f, "{s}")
    }
}

/// A named group of runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Experiment {
    pub experiment_id: String,
    pub name: String,
    /// Creation time in epoch milliseconds.
    pub creation_time: i64,
}

/// One point of a metric history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub key: String,
    pub value: f64,
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub step: u64,
}

impl Metric {
    pub fn new(key: impl Into<String>, value: f64, step: u64) -> Self {
        Self {
            key: key.into(),
            value,
            timestamp: chrono::Utc::now().timestamp_millis(),
            step,
        }
    }
}

/// Identity and lifecycle of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: String,
    pub experiment_id: String,
    pub run_name: String,
    pub parent_run_id: Option<String>,
    pub status: RunStatus,
    /// Epoch milliseconds.
    pub start_time: i64,
    pub end_time: Option<i64>,
}

impl RunInfo {
    pub fn new(experiment_id: &str, run_name: &str, parent_run_id: Option<&str>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().simple().to_string(),
            experiment_id: experiment_id.to_string(),
            run_name: run_name.to_string(),
            parent_run_id: parent_run_id.map(str::to_string),
            status: RunStatus::Running,
            start_time: chrono::Utc::now().timestamp_millis(),
            end_time: None,
        }
    }

    /// Tags every run carries from creation.
    pub fn system_tags(&self) -> Vec<(String, String)> {
        let mut tags = vec![(RUN_NAME_TAG.to_string(), self.run_name.clone())];
        if let Some(parent) = &self.parent_run_id {
            tags.push((PARENT_RUN_ID_TAG.to_string(), parent.clone()));
        }
        tags
    }
}

/// Logged content of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunData {
    pub params: BTreeMap<String, String>,
    /// Latest value per metric key (highest step, then latest logged).
    pub metrics: BTreeMap<String, f64>,
    pub tags: BTreeMap<String, String>,
    /// Artifact paths relative to the run's artifact root.
    pub artifacts: Vec<String>,
}

impl RunData {
    /// Collapse metric histories to their latest values.
    pub fn latest_metrics(histories: &BTreeMap<String, Vec<Metric>>) -> BTreeMap<String, f64> {
        histories
            .iter()
            .filter_map(|(key, history)| {
                // max_by_key keeps the last maximum, so equal steps favour later points
                history
                    .iter()
                    .max_by_key(|m| (m.step, m.timestamp))
                    .map(|m| (key.clone(), m.value))
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub info: RunInfo,
    pub data: RunData,
}

impl Run {
    pub fn run_id(&self) -> &str {
        &self.info.run_id
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.data.tags.get(key).map(String::as_str)
    }

    pub fn is_nested(&self) -> bool {
        self.info.parent_run_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display_and_terminality() {
        assert_eq!(RunStatus::Killed.to_string(), "KILLED");
        assert_eq!(serde_json::to_string(&RunStatus::Finished).unwrap(), "\"FINISHED\"");
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Scheduled.is_terminal());
    }

    #[test]
    fn nested_runs_carry_parent_tag() {
        let info = RunInfo::new("0", "001-002", Some("abc"));
        assert_eq!(info.run_id.len(), 32);
        let tags = info.system_tags();
        assert!(tags.contains(&(PARENT_RUN_ID_TAG.to_string(), "abc".to_string())));
        assert!(tags.contains(&(RUN_NAME_TAG.to_string(), "001-002".to_string())));
    }

    #[test]
    fn latest_metric_prefers_highest_step() {
        let mut histories = BTreeMap::new();
        histories.insert(
            "loss".to_string(),
            vec![
                Metric { key: "loss".into(), value: 0.3, timestamp: 10, step: 2 },
                Metric { key: "loss".into(), value: 0.9, timestamp: 20, step: 0 },
            ],
        );
        let latest = RunData::latest_metrics(&histories);
        assert_eq!(latest["loss"], 0.3);
    }
}
