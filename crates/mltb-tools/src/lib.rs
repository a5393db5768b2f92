//! # mltb-tools
//!
//! A collection of generic machine learning helpers:
//! - Student's t-test and pairwise t-test combinations
//! - Parallel repeated function calls over a parameter map
//! - F1 metrics derived from ROC points
//! - A gzip-compressed result list persisted between runs

pub mod calls;
pub mod metrics;
pub mod persist;
pub mod stats;

pub use calls::{multi_param_call, multi_param_call_map, Verbosity};
pub use metrics::{best_f1_from_roc, f1_from_roc, pos_neg, RocPoint};
pub use persist::{load_data_list, save_data_list};
pub use stats::{mean, sample_variance, ttest_combinations, ttest_ind, TTestResult};
