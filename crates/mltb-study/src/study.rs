//! Study configuration, trial storage and the optimize loop.

use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use mltb_types::{internal_error, MltbResult, StudyDirection, StudyError, StudyResult, TrialError};

use crate::pruners::{NopPruner, Pruner};
use crate::sampler::RandomSampler;
use crate::trial::{FrozenTrial, Trial, TrialHandle, TrialState};

/// Top-level configuration for a study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyConfig {
    pub name: String,
    pub direction: StudyDirection,
    /// Seed for the random sampler; `None` seeds from the OS.
    pub seed: Option<u64>,
    /// Keep optimizing after a failed trial instead of returning its error.
    pub catch_failures: bool,
}

impl StudyConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: StudyDirection::Minimize,
            seed: None,
            catch_failures: false,
        }
    }

    pub fn with_direction(mut self, direction: StudyDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_catch_failures(mut self, catch: bool) -> Self {
        self.catch_failures = catch;
        self
    }
}

pub(crate) struct StudyInner {
    pub(crate) name: String,
    pub(crate) direction: StudyDirection,
    pub(crate) catch_failures: bool,
    pub(crate) trials: RwLock<Vec<FrozenTrial>>,
    pub(crate) sampler: Mutex<RandomSampler>,
    pub(crate) pruner: Box<dyn Pruner>,
}

/// A named optimization over a sequence of trials.
///
/// Cloning a `Study` yields another handle to the same trials.
#[derive(Clone)]
pub struct Study {
    inner: Arc<StudyInner>,
}

impl std::fmt::Debug for Study {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Study")
            .field("name", &self.inner.name)
            .field("direction", &self.inner.direction)
            .field("pruner", &self.inner.pruner.name())
            .field("trials", &self.inner.trials.read().len())
            .finish()
    }
}

impl Study {
    pub fn new(config: StudyConfig) -> Self {
        Self::with_pruner(config, NopPruner)
    }

    pub fn with_pruner(config: StudyConfig, pruner: impl Pruner + 'static) -> Self {
        Self {
            inner: Arc::new(StudyInner {
                name: config.name,
                direction: config.direction,
                catch_failures: config.catch_failures,
                trials: RwLock::new(Vec::new()),
                sampler: Mutex::new(RandomSampler::new(config.seed)),
                pruner: Box::new(pruner),
            }),
        }
    }

    /// Shorthand for a study with default sampler and no pruning.
    pub fn create(name: impl Into<String>, direction: StudyDirection) -> Self {
        Self::new(StudyConfig::new(name).with_direction(direction))
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn direction(&self) -> StudyDirection {
        self.inner.direction
    }

    /// Start a new trial and return its handle.
    pub fn ask(&self) -> Trial {
        let mut trials = self.inner.trials.write();
        let number = trials.len();
        trials.push(FrozenTrial::new(number));
        Trial::new(number, Arc::clone(&self.inner))
    }

    /// Finish `trial` according to the objective's outcome.
    pub fn tell(&self, trial: &Trial, outcome: &Result<f64, TrialError>) -> StudyResult<TrialState> {
        let number = trial.number();
        let mut trials = self.inner.trials.write();
        let frozen = trials
            .get_mut(number)
            .ok_or(StudyError::TrialNotFound { number })?;
        if frozen.state.is_finished() {
            return Err(StudyError::TrialFinished { number });
        }

        match outcome {
            Ok(value) if value.is_nan() => {
                frozen.mark_failed("objective returned NaN".to_string());
            }
            Ok(value) => frozen.mark_complete(*value),
            Err(e) if e.is_pruned() => frozen.mark_pruned(),
            Err(e) => frozen.mark_failed(e.to_string()),
        }
        Ok(frozen.state)
    }

    /// Run `n_trials` trials one after another.
    pub fn optimize<F>(&self, n_trials: usize, objective: F) -> MltbResult<()>
    where
        F: Fn(&Trial) -> Result<f64, TrialError>,
    {
        for _ in 0..n_trials {
            self.run_trial(&objective)?;
        }
        Ok(())
    }

    /// Run `n_trials` trials on a dedicated pool of `n_jobs` threads.
    ///
    /// The first error that would stop a sequential run stops scheduling new
    /// trials; trials already running are allowed to finish.
    pub fn optimize_parallel<F>(&self, n_trials: usize, n_jobs: usize, objective: F) -> MltbResult<()>
    where
        F: Fn(&Trial) -> Result<f64, TrialError> + Sync + Send,
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(n_jobs.max(1))
            .thread_name(|i| format!("mltb-trial-{i}"))
            .build()
            .map_err(|e| internal_error!("failed to build trial pool: {}", e))?;

        let stop = AtomicBool::new(false);
        let first_error: Mutex<Option<TrialError>> = Mutex::new(None);

        pool.install(|| {
            (0..n_trials).into_par_iter().for_each(|_| {
                if stop.load(Ordering::SeqCst) {
                    return;
                }
                if let Err(e) = self.run_trial(&objective) {
                    stop.store(true, Ordering::SeqCst);
                    first_error.lock().get_or_insert(e);
                }
            })
        });

        match first_error.into_inner() {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    fn run_trial<F>(&self, objective: &F) -> Result<(), TrialError>
    where
        F: Fn(&Trial) -> Result<f64, TrialError>,
    {
        let trial = self.ask();
        let number = trial.number();

        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| objective(&trial))) {
            Ok(outcome) => outcome,
            Err(payload) => {
                if let Err(e) = self.tell(&trial, &Err(TrialError::msg("objective panicked"))) {
                    warn!(trial = number, error = %e, "could not record the panicked trial");
                }
                warn!(trial = number, "Trial {} failed because the objective panicked", number);
                panic::resume_unwind(payload);
            }
        };

        let state = self.tell(&trial, &outcome)?;
        match state {
            TrialState::Complete => {
                let best = self.best_trial().ok();
                info!(
                    trial = number,
                    "Trial {} finished with value: {:?} and parameters: {:?}. Best is trial {:?} with value: {:?}.",
                    number,
                    outcome.as_ref().ok(),
                    trial.frozen().map(|t| t.params).unwrap_or_default(),
                    best.as_ref().map(|t| t.number),
                    best.as_ref().and_then(|t| t.value),
                );
                Ok(())
            }
            TrialState::Pruned => {
                info!(trial = number, "Trial {} pruned.", number);
                Ok(())
            }
            TrialState::Fail | TrialState::Running => match outcome {
                Err(e) if e.is_cancelled() || !self.inner.catch_failures => Err(e),
                Err(e) => {
                    warn!(trial = number, error = %e, "Trial {} failed", number);
                    Ok(())
                }
                Ok(_) => {
                    warn!(trial = number, "Trial {} failed because of a NaN objective", number);
                    Ok(())
                }
            },
        }
    }

    /// All trials in creation order.
    pub fn trials(&self) -> Vec<FrozenTrial> {
        self.inner.trials.read().clone()
    }

    pub fn trial(&self, number: usize) -> Option<FrozenTrial> {
        self.inner.trials.read().get(number).cloned()
    }

    /// Best completed trial according to the study direction.
    pub fn best_trial(&self) -> StudyResult<FrozenTrial> {
        best_completed(&self.inner.trials.read(), self.inner.direction).cloned().ok_or_else(|| {
            StudyError::NoCompletedTrials {
                study_name: self.inner.name.clone(),
            }
        })
    }

    pub fn best_value(&self) -> StudyResult<f64> {
        self.best_trial()?
            .value
            .ok_or_else(|| StudyError::NoCompletedTrials {
                study_name: self.inner.name.clone(),
            })
    }
}

/// Best completed trial in `trials`; ties keep the earliest.
pub(crate) fn best_completed(trials: &[FrozenTrial], direction: StudyDirection) -> Option<&FrozenTrial> {
    let mut best: Option<&FrozenTrial> = None;
    for trial in trials {
        if trial.state != TrialState::Complete {
            continue;
        }
        let Some(value) = trial.value else { continue };
        let improves = match best.and_then(|b| b.value) {
            None => true,
            Some(incumbent) => direction.is_better(value, incumbent),
        };
        if improves {
            best = Some(trial);
        }
    }
    best
}
