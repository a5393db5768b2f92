//! Trials: the record kept by the study and the handle given to objectives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use mltb_types::{ParamValue, StudyDirection, StudyError, StudyResult};

use crate::distributions::Distribution;
use crate::study::StudyInner;

/// Lifecycle state of a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TrialState {
    Running,
    Complete,
    Pruned,
    Fail,
}

impl TrialState {
    pub fn is_finished(self) -> bool {
        !matches!(self, TrialState::Running)
    }
}

/// Snapshot of a trial as stored by its study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrozenTrial {
    pub number: usize,
    pub state: TrialState,
    pub value: Option<f64>,
    pub params: BTreeMap<String, ParamValue>,
    pub distributions: BTreeMap<String, Distribution>,
    pub user_attrs: BTreeMap<String, serde_json::Value>,
    pub intermediate_values: BTreeMap<u64, f64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl FrozenTrial {
    pub fn new(number: usize) -> Self {
        Self {
            number,
            state: TrialState::Running,
            value: None,
            params: BTreeMap::new(),
            distributions: BTreeMap::new(),
            user_attrs: BTreeMap::new(),
            intermediate_values: BTreeMap::new(),
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    pub fn mark_complete(&mut self, value: f64) {
        self.state = TrialState::Complete;
        self.value = Some(value);
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_pruned(&mut self) {
        self.state = TrialState::Pruned;
        // A pruned trial keeps its last reported value.
        self.value = self.intermediate_values.values().next_back().copied();
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: String) {
        self.state = TrialState::Fail;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
    }

    /// Highest step reported so far.
    pub fn last_step(&self) -> Option<u64> {
        self.intermediate_values.keys().next_back().copied()
    }
}

/// What an objective (or the tracking adapter) can do with a running trial.
///
/// The `suggest_*` helpers build a [`Distribution`] and defer to
/// [`TrialHandle::suggest`]; implementors only provide the primitives.
pub trait TrialHandle: Send + Sync {
    /// Zero-based trial number within its study.
    fn number(&self) -> usize;

    fn study_name(&self) -> String;

    fn direction(&self) -> StudyDirection;

    /// Sample (or return the already sampled) value for `name`.
    fn suggest(&self, name: &str, distribution: Distribution) -> StudyResult<ParamValue>;

    fn set_user_attr(&self, key: &str, value: serde_json::Value) -> StudyResult<()>;

    fn user_attrs(&self) -> BTreeMap<String, serde_json::Value>;

    /// Report an intermediate objective value for pruning.
    fn report(&self, value: f64, step: u64) -> StudyResult<()>;

    fn should_prune(&self) -> bool;

    fn distributions(&self) -> BTreeMap<String, Distribution>;

    fn params(&self) -> BTreeMap<String, ParamValue>;

    fn suggest_categorical(&self, name: &str, choices: Vec<ParamValue>) -> StudyResult<ParamValue> {
        self.suggest(name, Distribution::Categorical { choices })
    }

    fn suggest_int(&self, name: &str, low: i64, high: i64, step: i64, log: bool) -> StudyResult<i64> {
        let value = self.suggest(
            name,
            Distribution::Int {
                low,
                high,
                step,
                log,
            },
        )?;
        value.as_i64().ok_or_else(|| mismatch(name, &value))
    }

    fn suggest_float(&self, name: &str, low: f64, high: f64, log: bool) -> StudyResult<f64> {
        let distribution = if log {
            Distribution::LogUniform { low, high }
        } else {
            Distribution::Uniform { low, high }
        };
        let value = self.suggest(name, distribution)?;
        value.as_f64().ok_or_else(|| mismatch(name, &value))
    }

    fn suggest_uniform(&self, name: &str, low: f64, high: f64) -> StudyResult<f64> {
        self.suggest_float(name, low, high, false)
    }

    fn suggest_loguniform(&self, name: &str, low: f64, high: f64) -> StudyResult<f64> {
        self.suggest_float(name, low, high, true)
    }

    fn suggest_discrete_uniform(&self, name: &str, low: f64, high: f64, q: f64) -> StudyResult<f64> {
        let value = self.suggest(name, Distribution::DiscreteUniform { low, high, q })?;
        value.as_f64().ok_or_else(|| mismatch(name, &value))
    }
}

fn mismatch(name: &str, value: &ParamValue) -> StudyError {
    StudyError::InvalidDistribution {
        name: name.to_string(),
        message: format!("sampled value {value} does not match the requested type"),
    }
}

/// Handle to a running trial of a [`crate::Study`].
///
/// Cheap to clone; all state lives in the study's storage.
#[derive(Clone)]
pub struct Trial {
    number: usize,
    study: Arc<StudyInner>,
}

impl std::fmt::Debug for Trial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trial")
            .field("number", &self.number)
            .field("study", &self.study.name)
            .finish()
    }
}

impl Trial {
    pub(crate) fn new(number: usize, study: Arc<StudyInner>) -> Self {
        Self { number, study }
    }

    /// Current snapshot of this trial.
    pub fn frozen(&self) -> StudyResult<FrozenTrial> {
        self.study
            .trials
            .read()
            .get(self.number)
            .cloned()
            .ok_or(StudyError::TrialNotFound {
                number: self.number,
            })
    }

    fn with_running<R>(&self, f: impl FnOnce(&mut FrozenTrial) -> StudyResult<R>) -> StudyResult<R> {
        let mut trials = self.study.trials.write();
        let frozen = trials
            .get_mut(self.number)
            .ok_or(StudyError::TrialNotFound {
                number: self.number,
            })?;
        if frozen.state.is_finished() {
            return Err(StudyError::TrialFinished {
                number: self.number,
            });
        }
        f(frozen)
    }
}

impl TrialHandle for Trial {
    fn number(&self) -> usize {
        self.number
    }

    fn study_name(&self) -> String {
        self.study.name.clone()
    }

    fn direction(&self) -> StudyDirection {
        self.study.direction
    }

    fn suggest(&self, name: &str, distribution: Distribution) -> StudyResult<ParamValue> {
        distribution.validate(name)?;
        self.with_running(|frozen| {
            if let Some(existing) = frozen.distributions.get(name) {
                if existing != &distribution {
                    return Err(StudyError::IncompatibleDistribution {
                        name: name.to_string(),
                        existing: existing.to_string(),
                        requested: distribution.to_string(),
                    });
                }
                if let Some(value) = frozen.params.get(name) {
                    return Ok(value.clone());
                }
            }

            let value = self.study.sampler.lock().sample(&distribution);
            frozen.params.insert(name.to_string(), value.clone());
            frozen.distributions.insert(name.to_string(), distribution);
            Ok(value)
        })
    }

    fn set_user_attr(&self, key: &str, value: serde_json::Value) -> StudyResult<()> {
        self.with_running(|frozen| {
            frozen.user_attrs.insert(key.to_string(), value);
            Ok(())
        })
    }

    fn user_attrs(&self) -> BTreeMap<String, serde_json::Value> {
        self.frozen().map(|t| t.user_attrs).unwrap_or_default()
    }

    fn report(&self, value: f64, step: u64) -> StudyResult<()> {
        self.with_running(|frozen| {
            // First report for a step wins, later ones are ignored.
            frozen.intermediate_values.entry(step).or_insert(value);
            Ok(())
        })
    }

    fn should_prune(&self) -> bool {
        let trials = self.study.trials.read();
        match trials.get(self.number) {
            Some(current) if !current.state.is_finished() => {
                self.study
                    .pruner
                    .prune(&trials, self.study.direction, current)
            }
            _ => false,
        }
    }

    fn distributions(&self) -> BTreeMap<String, Distribution> {
        self.frozen().map(|t| t.distributions).unwrap_or_default()
    }

    fn params(&self) -> BTreeMap<String, ParamValue> {
        self.frozen().map(|t| t.params).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::study::{Study, StudyConfig};

    fn study() -> Study {
        Study::new(StudyConfig::new("trial_tests").with_seed(1))
    }

    #[test]
    fn frozen_trial_lifecycle() {
        let mut trial = FrozenTrial::new(0);
        assert_eq!(trial.state, TrialState::Running);
        assert!(trial.finished_at.is_none());

        trial.mark_complete(1.8);
        assert_eq!(trial.state, TrialState::Complete);
        assert!(trial.finished_at.is_some());
        assert_eq!(trial.value, Some(1.8));
    }

    #[test]
    fn frozen_trial_failure() {
        let mut trial = FrozenTrial::new(3);
        trial.mark_failed("objective panicked".into());
        assert_eq!(trial.state, TrialState::Fail);
        assert_eq!(trial.error.as_deref(), Some("objective panicked"));
    }

    #[test]
    fn pruned_trial_keeps_last_intermediate_value() {
        let mut trial = FrozenTrial::new(1);
        trial.intermediate_values.insert(0, 0.9);
        trial.intermediate_values.insert(4, 0.4);
        trial.mark_pruned();
        assert_eq!(trial.value, Some(0.4));
        assert_eq!(trial.last_step(), Some(4));
    }

    #[test]
    fn resuggesting_returns_first_value() {
        let study = study();
        let trial = study.ask();
        let first = trial.suggest_uniform("x", -10.0, 10.0).unwrap();
        let second = trial.suggest_uniform("x", -10.0, 10.0).unwrap();
        assert_eq!(first, second);
        assert_eq!(trial.params().len(), 1);
    }

    #[test]
    fn incompatible_resuggestion_is_rejected() {
        let study = study();
        let trial = study.ask();
        trial.suggest_int("n", 1, 4, 1, false).unwrap();
        let err = trial.suggest_int("n", 1, 8, 1, false).unwrap_err();
        assert!(matches!(err, StudyError::IncompatibleDistribution { .. }));
    }

    #[test]
    fn typed_suggestions() {
        let study = study();
        let trial = study.ask();
        let n = trial.suggest_int("layers", 1, 3, 1, false).unwrap();
        assert!((1..=3).contains(&n));
        let lr = trial.suggest_loguniform("lr", 1e-4, 1e-1).unwrap();
        assert!((1e-4..=1e-1).contains(&lr));
        let q = trial.suggest_discrete_uniform("dropout", 0.0, 0.5, 0.1).unwrap();
        assert!((0.0..=0.5).contains(&q));
        let act = trial
            .suggest_categorical("act", vec!["relu".into(), "tanh".into()])
            .unwrap();
        assert!(act == ParamValue::from("relu") || act == ParamValue::from("tanh"));
        assert_eq!(trial.distributions().len(), 4);
    }

    #[test]
    fn suggest_int_over_the_whole_range() {
        let study = study();
        let trial = study.ask();
        let n = trial.suggest_int("n", i64::MIN, i64::MAX, 1, false).unwrap();
        assert_eq!(trial.params()["n"], ParamValue::Int(n));
    }

    #[test]
    fn user_attrs_and_reports() {
        let study = study();
        let trial = study.ask();
        trial
            .set_user_attr("fold_acc", serde_json::json!([0.8, 0.9]))
            .unwrap();
        trial.report(0.5, 0).unwrap();
        trial.report(0.7, 0).unwrap();
        let frozen = trial.frozen().unwrap();
        assert_eq!(frozen.user_attrs["fold_acc"], serde_json::json!([0.8, 0.9]));
        assert_eq!(frozen.intermediate_values[&0], 0.5);
        assert!(!trial.should_prune());
    }

    #[test]
    fn finished_trial_rejects_writes() {
        let study = study();
        let trial = study.ask();
        study.tell(&trial, &Ok(1.0)).unwrap();
        let err = trial.set_user_attr("late", serde_json::json!(1)).unwrap_err();
        assert_eq!(err, StudyError::TrialFinished { number: 0 });
    }
}
