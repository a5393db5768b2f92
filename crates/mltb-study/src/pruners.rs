//! Pruners decide whether a running trial should stop early.

use tracing::debug;

use mltb_tools::stats::{mean, ttest_ind};
use mltb_types::{StudyDirection, StudyError, StudyResult};

use crate::study::best_completed;
use crate::trial::{FrozenTrial, TrialState};

/// Common trait for all pruners.
pub trait Pruner: Send + Sync {
    /// Whether `trial` should be pruned given every trial of the study.
    fn prune(&self, trials: &[FrozenTrial], direction: StudyDirection, trial: &FrozenTrial) -> bool;

    /// Human-readable pruner name.
    fn name(&self) -> &str;
}

/// Never prunes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopPruner;

impl Pruner for NopPruner {
    fn prune(&self, _trials: &[FrozenTrial], _direction: StudyDirection, _trial: &FrozenTrial) -> bool {
        false
    }

    fn name(&self) -> &str {
        "nop"
    }
}

/// Prunes when the latest intermediate value is worse than the median of
/// completed trials at the same step.
#[derive(Debug, Clone, Copy)]
pub struct MedianPruner {
    /// Pruning is disabled until this many trials have completed.
    pub n_startup_trials: usize,
    /// Pruning is disabled below this step.
    pub n_warmup_steps: u64,
}

impl Default for MedianPruner {
    fn default() -> Self {
        Self {
            n_startup_trials: 5,
            n_warmup_steps: 0,
        }
    }
}

impl Pruner for MedianPruner {
    fn prune(&self, trials: &[FrozenTrial], direction: StudyDirection, trial: &FrozenTrial) -> bool {
        let Some(step) = trial.last_step() else {
            return false;
        };
        if step < self.n_warmup_steps {
            return false;
        }

        let completed: Vec<&FrozenTrial> = trials
            .iter()
            .filter(|t| t.state == TrialState::Complete)
            .collect();
        if completed.len() < self.n_startup_trials {
            return false;
        }

        let mut values: Vec<f64> = completed
            .iter()
            .filter_map(|t| t.intermediate_values.get(&step).copied())
            .filter(|v| !v.is_nan())
            .collect();
        if values.is_empty() {
            return false;
        }
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mid = values.len() / 2;
        let median = if values.len() % 2 == 0 {
            (values[mid - 1] + values[mid]) / 2.0
        } else {
            values[mid]
        };

        let current = trial.intermediate_values[&step];
        direction.is_better(median, current)
    }

    fn name(&self) -> &str {
        "median"
    }
}

/// Uses statistical significance to prune repeated trainings such as the
/// folds of a cross validation.
///
/// The intermediate values of a trial are compared with those of the best
/// trial so far using Student's t-test. A trial whose mean is worse than the
/// best trial's mean is pruned when the difference is significant at `alpha`.
#[derive(Debug, Clone, Copy)]
pub struct SignificanceRepeatedTrainingPruner {
    alpha: f64,
    n_warmup_steps: usize,
}

impl SignificanceRepeatedTrainingPruner {
    pub fn new(alpha: f64, n_warmup_steps: usize) -> StudyResult<Self> {
        if !(alpha > 0.0 && alpha < 1.0) {
            return Err(StudyError::InvalidConfig {
                message: format!("alpha must be in (0, 1) but got {alpha}"),
            });
        }
        Ok(Self {
            alpha,
            n_warmup_steps,
        })
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn n_warmup_steps(&self) -> usize {
        self.n_warmup_steps
    }
}

impl Default for SignificanceRepeatedTrainingPruner {
    fn default() -> Self {
        Self {
            alpha: 0.1,
            n_warmup_steps: 4,
        }
    }
}

impl Pruner for SignificanceRepeatedTrainingPruner {
    fn prune(&self, trials: &[FrozenTrial], direction: StudyDirection, trial: &FrozenTrial) -> bool {
        // The first trial has nothing to compare against.
        let Some(best) = best_completed(trials, direction) else {
            return false;
        };

        let values: Vec<f64> = trial.intermediate_values.values().copied().collect();
        if values.len() < self.n_warmup_steps {
            debug!(
                trial = trial.number,
                steps = values.len(),
                "trial did not reach n_warmup_steps, no significance check"
            );
            return false;
        }

        let best_values: Vec<f64> = best.intermediate_values.values().copied().collect();
        let trial_mean = mean(&values);
        let best_mean = mean(&best_values);
        if !direction.is_better(best_mean, trial_mean) {
            debug!(
                trial = trial.number,
                trial_mean, best_mean, "trial is not worse than the best trial"
            );
            return false;
        }

        let pvalue = ttest_ind(&values, &best_values).pvalue;
        debug!(trial = trial.number, trial_mean, best_mean, pvalue, "significance check");
        pvalue < self.alpha
    }

    fn name(&self) -> &str {
        "significance_repeated_training"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(number: usize, intermediate: &[f64], value: f64) -> FrozenTrial {
        let mut trial = running(number, intermediate);
        trial.mark_complete(value);
        trial
    }

    fn running(number: usize, intermediate: &[f64]) -> FrozenTrial {
        let mut trial = FrozenTrial::new(number);
        for (step, v) in intermediate.iter().enumerate() {
            trial.intermediate_values.insert(step as u64, *v);
        }
        trial
    }

    #[test]
    fn nop_never_prunes() {
        let current = running(0, &[100.0]);
        assert!(!NopPruner.prune(&[current.clone()], StudyDirection::Minimize, &current));
    }

    #[test]
    fn median_waits_for_startup_trials() {
        let pruner = MedianPruner {
            n_startup_trials: 2,
            n_warmup_steps: 0,
        };
        let history = vec![finished(0, &[1.0], 1.0)];
        let current = running(1, &[5.0]);
        assert!(!pruner.prune(&history, StudyDirection::Minimize, &current));
    }

    #[test]
    fn median_prunes_worse_than_median() {
        let pruner = MedianPruner {
            n_startup_trials: 3,
            n_warmup_steps: 0,
        };
        let history = vec![
            finished(0, &[1.0, 0.5], 0.5),
            finished(1, &[2.0, 0.7], 0.7),
            finished(2, &[3.0, 0.9], 0.9),
        ];
        // Median at step 1 is 0.7.
        assert!(pruner.prune(&history, StudyDirection::Minimize, &running(3, &[0.0, 0.8])));
        assert!(!pruner.prune(&history, StudyDirection::Minimize, &running(3, &[0.0, 0.6])));
        assert!(pruner.prune(&history, StudyDirection::Maximize, &running(3, &[0.0, 0.6])));
    }

    #[test]
    fn median_respects_warmup() {
        let pruner = MedianPruner {
            n_startup_trials: 0,
            n_warmup_steps: 2,
        };
        let history = vec![finished(0, &[0.1, 0.1, 0.1], 0.1)];
        assert!(!pruner.prune(&history, StudyDirection::Minimize, &running(1, &[9.0, 9.0])));
        assert!(pruner.prune(&history, StudyDirection::Minimize, &running(1, &[9.0, 9.0, 9.0])));
    }

    #[test]
    fn significance_requires_a_best_trial() {
        let pruner = SignificanceRepeatedTrainingPruner::default();
        let current = running(0, &[0.1, 0.1, 0.1, 0.1]);
        assert!(!pruner.prune(&[], StudyDirection::Maximize, &current));
    }

    #[test]
    fn significance_prunes_clearly_worse_trial() {
        let pruner = SignificanceRepeatedTrainingPruner::new(0.1, 4).unwrap();
        let history = vec![finished(0, &[0.90, 0.91, 0.92, 0.90, 0.91], 0.91)];

        let worse = running(1, &[0.50, 0.52, 0.49, 0.51]);
        assert!(pruner.prune(&history, StudyDirection::Maximize, &worse));

        // Better trials are never pruned.
        let better = running(1, &[0.95, 0.96, 0.95, 0.97]);
        assert!(!pruner.prune(&history, StudyDirection::Maximize, &better));
    }

    #[test]
    fn significance_waits_for_warmup_and_ignores_noise() {
        let pruner = SignificanceRepeatedTrainingPruner::new(0.05, 4).unwrap();
        let history = vec![finished(0, &[0.8, 0.6, 0.9, 0.7], 0.75)];

        assert!(!pruner.prune(&history, StudyDirection::Maximize, &running(1, &[0.1, 0.1])));

        let noisy = running(1, &[0.9, 0.5, 0.8, 0.6]);
        assert!(!pruner.prune(&history, StudyDirection::Maximize, &noisy));
    }

    #[test]
    fn significance_rejects_bad_alpha() {
        assert!(SignificanceRepeatedTrainingPruner::new(0.0, 4).is_err());
        assert!(SignificanceRepeatedTrainingPruner::new(1.5, 4).is_err());
        let pruner = SignificanceRepeatedTrainingPruner::new(0.2, 3).unwrap();
        assert_eq!(pruner.alpha(), 0.2);
        assert_eq!(pruner.n_warmup_steps(), 3);
    }
}
