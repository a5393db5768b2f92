//! # mltb-study
//!
//! Hyperparameter search for the mltb tool box.
//!
//! Provides parameter distributions, studies that drive trials sequentially
//! or on a rayon pool, the [`TrialHandle`] seam used by the tracking adapter,
//! and pruners that stop unpromising trials early.

mod distributions;
mod pruners;
mod sampler;
mod study;
mod trial;

pub use distributions::Distribution;
pub use pruners::{MedianPruner, NopPruner, Pruner, SignificanceRepeatedTrainingPruner};
pub use sampler::RandomSampler;
pub use study::{Study, StudyConfig};
pub use trial::{FrozenTrial, Trial, TrialHandle, TrialState};
