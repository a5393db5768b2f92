//! # mltb-tracking
//!
//! A small experiment tracking service modelled on MLflow's tracking API.
//!
//! Experiments group runs; runs carry params, metric histories, tags and
//! artifacts, and may be nested under a parent run. Two stores are provided:
//! [`InMemoryStore`] for tests and short-lived processes, and [`FileStore`]
//! which keeps an `mlruns`-style directory tree on disk.

pub mod client;
pub mod file;
pub mod memory;
pub mod run;
pub mod store;
pub mod validation;

pub use client::{get_tracking_uri, set_tracking_uri, ActiveRun, TrackingClient, TRACKING_URI_ENV};
pub use file::FileStore;
pub use memory::InMemoryStore;
pub use run::{Experiment, Metric, Run, RunData, RunInfo, RunStatus, PARENT_RUN_ID_TAG, RUN_NAME_TAG, USER_TAG};
pub use store::TrackingStore;
pub use validation::{
    normalize_name, shorten, MAX_ENTITY_KEY_LENGTH, MAX_METRICS_PER_BATCH,
    MAX_PARAMS_TAGS_PER_BATCH, MAX_PARAM_VAL_LENGTH, MAX_TAG_VAL_LENGTH,
};
