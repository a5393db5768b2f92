//! # mltb-omlflow
//!
//! Wraps a search-framework objective so every trial is recorded as an
//! experiment tracking run.
//!
//! For each trial invocation the adapter opens a parent run named after the
//! trial number inside an experiment named after the study, mirrors logged
//! values into the trial's user attributes, records per-iteration results as
//! nested runs, and closes the run with a status derived from the objective's
//! outcome. Tracking problems are logged and swallowed; objective errors are
//! returned unchanged.
//!
//! ```no_run
//! use mltb_omlflow::{OptunaMlflow, OptunaMlflowConfig};
//! use mltb_study::{Study, StudyConfig};
//!
//! # fn main() -> anyhow::Result<()> {
//! let adapter = OptunaMlflow::new(OptunaMlflowConfig::default())?;
//! let study = Study::new(StudyConfig::new("quadratic"));
//! study.optimize(10, adapter.objective(|session| {
//!     let x = session.suggest_uniform("x", -10.0, 10.0)?;
//!     Ok((x - 2.0).powi(2))
//! }))?;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod callback;
pub mod config;
pub mod git;
mod host;
pub mod session;

pub use adapter::OptunaMlflow;
pub use callback::{TrainerState, TrainingLogger, LOG_ARTIFACTS_ENV};
pub use config::OptunaMlflowConfig;
pub use session::{TrackingOnly, TrialSession};
