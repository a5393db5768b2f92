//! Adapter configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use mltb_tracking::MAX_TAG_VAL_LENGTH;
use mltb_types::{config_error, MltbResult};

/// Configuration for [`OptunaMlflow`](crate::OptunaMlflow).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptunaMlflowConfig {
    /// Tracking store URI. `None` uses the process-wide URI, then
    /// `MLFLOW_TRACKING_URI`, then `./mlruns`.
    pub tracking_uri: Option<String>,
    /// Zero-padding width of run names.
    pub num_name_digits: usize,
    /// Refuse to start a run while the source tree has local changes.
    pub enforce_clean_git: bool,
    /// Metric name the objective's return value is logged under.
    pub result_metric: String,
    /// Tag values longer than this are shortened before tracking.
    pub max_tag_length: usize,
    /// Root of the clean-tree check; `None` is the current directory.
    pub source_dir: Option<PathBuf>,
}

impl Default for OptunaMlflowConfig {
    fn default() -> Self {
        Self {
            tracking_uri: None,
            num_name_digits: 3,
            enforce_clean_git: false,
            result_metric: "study_result_value".to_string(),
            max_tag_length: MAX_TAG_VAL_LENGTH,
            source_dir: None,
        }
    }
}

impl OptunaMlflowConfig {
    pub fn with_tracking_uri(mut self, uri: impl Into<String>) -> Self {
        self.tracking_uri = Some(uri.into());
        self
    }

    pub fn with_num_name_digits(mut self, digits: usize) -> Self {
        self.num_name_digits = digits;
        self
    }

    pub fn with_enforce_clean_git(mut self, enforce: bool) -> Self {
        self.enforce_clean_git = enforce;
        self
    }

    pub fn with_result_metric(mut self, name: impl Into<String>) -> Self {
        self.result_metric = name.into();
        self
    }

    pub fn with_max_tag_length(mut self, length: usize) -> Self {
        self.max_tag_length = length;
        self
    }

    pub fn with_source_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.source_dir = Some(dir.into());
        self
    }

    pub fn from_json(raw: &str) -> MltbResult<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> MltbResult<()> {
        if self.result_metric.trim().is_empty() {
            return Err(config_error!("result_metric must not be empty"));
        }
        if self.num_name_digits > 20 {
            return Err(config_error!(
                "num_name_digits must be at most 20, got {}",
                self.num_name_digits
            ));
        }
        if self.max_tag_length == 0 {
            return Err(config_error!("max_tag_length must be positive"));
        }
        Ok(())
    }

    /// Effective tag value cap, never above what the store accepts.
    pub fn tag_limit(&self) -> usize {
        self.max_tag_length.min(MAX_TAG_VAL_LENGTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = OptunaMlflowConfig::default();
        assert_eq!(config.num_name_digits, 3);
        assert_eq!(config.result_metric, "study_result_value");
        assert_eq!(config.tag_limit(), 5000);
        assert!(!config.enforce_clean_git);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config =
            OptunaMlflowConfig::from_json(r#"{"tracking_uri": "memory:", "num_name_digits": 5}"#)
                .unwrap();
        assert_eq!(config.tracking_uri.as_deref(), Some("memory:"));
        assert_eq!(config.num_name_digits, 5);
        assert_eq!(config.result_metric, "study_result_value");
    }

    #[test]
    fn tag_limit_is_clamped() {
        let config = OptunaMlflowConfig::default().with_max_tag_length(10_000);
        assert_eq!(config.tag_limit(), MAX_TAG_VAL_LENGTH);
        let config = OptunaMlflowConfig::default().with_max_tag_length(64);
        assert_eq!(config.tag_limit(), 64);
    }

    #[test]
    fn invalid_configs() {
        assert!(OptunaMlflowConfig::default().with_result_metric(" ").validate().is_err());
        assert!(OptunaMlflowConfig::default().with_num_name_digits(64).validate().is_err());
        assert!(OptunaMlflowConfig::from_json(r#"{"max_tag_length": 0}"#).is_err());
    }
}
