//! Per-invocation logging state handed to the objective.
//!
//! A [`TrialSession`] lives for exactly one objective call. It owns the
//! parent tracking run and the iteration history, so one adapter can serve
//! any number of concurrent trials.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, error, warn};

use mltb_study::{Distribution, TrialHandle};
use mltb_tracking::{
    normalize_name, shorten, ActiveRun, Metric, RunStatus, TrackingClient, MAX_METRICS_PER_BATCH,
    MAX_PARAMS_TAGS_PER_BATCH, MAX_PARAM_VAL_LENGTH, USER_TAG,
};
use mltb_types::{ParamValue, TrackingResult, TrialError};

/// Tracking calls never fail the trial: errors are logged and dropped.
fn notify<V>(operation: &str, result: TrackingResult<V>) -> Option<V> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            error!(operation, error = %e, "Exception raised during tracking communication");
            None
        }
    }
}

/// The tracking half of a session: the parent run and how values are
/// prepared for the store.
#[derive(Debug)]
pub(crate) struct Tracker {
    client: Option<TrackingClient>,
    experiment_id: Option<String>,
    run: Option<ActiveRun>,
    tag_limit: usize,
    user_at_host: String,
}

impl Tracker {
    /// Open the parent run `run_name` in the experiment named `study_name`.
    ///
    /// Any failure leaves the tracker without a run; logging then becomes a
    /// no-op.
    pub(crate) fn open(
        client: Option<&TrackingClient>,
        study_name: &str,
        run_name: &str,
        tag_limit: usize,
    ) -> Self {
        let user_at_host = crate::host::user_at_host();
        let mut tracker = Self {
            client: client.cloned(),
            experiment_id: None,
            run: None,
            tag_limit,
            user_at_host,
        };
        let Some(client) = client else {
            return tracker;
        };

        let Some(experiment) = notify(
            "get_or_create_experiment",
            client.get_or_create_experiment(study_name),
        ) else {
            return tracker;
        };
        tracker.run = notify(
            "start_run",
            client.start_run(&experiment.experiment_id, run_name, None),
        );
        tracker.experiment_id = Some(experiment.experiment_id);

        if let Some(run) = &tracker.run {
            debug!(run_id = run.run_id(), run_name, study = study_name, "parent run started");
            let tags = vec![
                ("hostname".to_string(), crate::host::hostname()),
                ("process_id".to_string(), std::process::id().to_string()),
                (USER_TAG.to_string(), tracker.user_at_host.clone()),
            ];
            tracker.set_tags(&tags);
        }
        tracker
    }

    fn active(&self, operation: &str) -> Option<&ActiveRun> {
        if self.run.is_none() {
            warn!(operation, "no active tracking run, call skipped");
        }
        self.run.as_ref()
    }

    pub(crate) fn run_id(&self) -> Option<&str> {
        self.run.as_ref().map(ActiveRun::run_id)
    }

    fn param_entry(key: &str, value: &ParamValue) -> (String, String) {
        (
            normalize_name(key),
            shorten(&value.to_string(), MAX_PARAM_VAL_LENGTH),
        )
    }

    fn tag_entry(&self, key: &str, value: &str) -> (String, String) {
        (normalize_name(key), shorten(value, self.tag_limit))
    }

    pub(crate) fn log_param(&self, key: &str, value: &ParamValue) {
        if let Some(run) = self.active("log_param") {
            let (key, value) = Self::param_entry(key, value);
            notify("log_param", run.log_param(&key, &value));
        }
    }

    pub(crate) fn log_params(&self, params: &[(String, ParamValue)]) {
        if let Some(run) = self.active("log_params") {
            let entries: Vec<(String, String)> = params
                .iter()
                .map(|(key, value)| Self::param_entry(key, value))
                .collect();
            for chunk in entries.chunks(MAX_PARAMS_TAGS_PER_BATCH) {
                notify("log_params", run.log_batch(chunk, &[], &[]));
            }
        }
    }

    pub(crate) fn log_metric(&self, key: &str, value: f64, step: u64) {
        if let Some(run) = self.active("log_metric") {
            notify("log_metric", run.log_metric(&normalize_name(key), value, step));
        }
    }

    pub(crate) fn log_metrics(&self, metrics: &[(String, f64)], step: u64) {
        if let Some(run) = self.active("log_metrics") {
            log_metrics_to(run, metrics, step);
        }
    }

    pub(crate) fn set_tag(&self, key: &str, value: &str) {
        if let Some(run) = self.active("set_tag") {
            let (key, value) = self.tag_entry(key, value);
            notify("set_tag", run.set_tag(&key, &value));
        }
    }

    pub(crate) fn set_tags(&self, tags: &[(String, String)]) {
        if let Some(run) = self.active("set_tags") {
            let entries: Vec<(String, String)> = tags
                .iter()
                .map(|(key, value)| self.tag_entry(key, value))
                .collect();
            for chunk in entries.chunks(MAX_PARAMS_TAGS_PER_BATCH) {
                notify("set_tags", run.log_batch(&[], &[], chunk));
            }
        }
    }

    pub(crate) fn log_artifact(&self, local_path: &Path, artifact_dir: Option<&str>) {
        if let Some(run) = self.active("log_artifact") {
            notify("log_artifact", run.log_artifact(local_path, artifact_dir));
        }
    }

    /// Open a nested run under the parent, log `metrics` at `step` and close
    /// it again.
    pub(crate) fn log_nested(&self, run_name: &str, metrics: &[(String, f64)], step: u64) {
        let (Some(client), Some(experiment_id), Some(parent)) =
            (&self.client, &self.experiment_id, self.active("log_iter"))
        else {
            return;
        };
        let Some(child) = notify(
            "start_nested_run",
            client.start_run(experiment_id, run_name, Some(parent.run_id())),
        ) else {
            return;
        };
        notify("set_tag", child.set_tag(USER_TAG, &self.user_at_host));
        log_metrics_to(&child, metrics, step);
        // `child` is closed FINISHED when it goes out of scope here.
    }

    /// Close the parent run; later calls are no-ops.
    pub(crate) fn end(&mut self, status: RunStatus) {
        if let Some(run) = self.run.take() {
            if let Some(info) = notify("end_run", run.end(status)) {
                debug!(run_id = %info.run_id, %status, "parent run ended");
            }
        }
    }
}

fn log_metrics_to(run: &ActiveRun, metrics: &[(String, f64)], step: u64) {
    let points: Vec<Metric> = metrics
        .iter()
        .map(|(key, value)| Metric::new(normalize_name(key), *value, step))
        .collect();
    for chunk in points.chunks(MAX_METRICS_PER_BATCH) {
        notify("log_metrics", run.log_batch(&[], chunk, &[]));
    }
}

fn collect_params<K, V>(items: impl IntoIterator<Item = (K, V)>) -> Vec<(String, ParamValue)>
where
    K: AsRef<str>,
    V: Into<ParamValue>,
{
    items
        .into_iter()
        .map(|(k, v)| (k.as_ref().to_string(), v.into()))
        .collect()
}

fn collect_metrics<K: AsRef<str>>(items: impl IntoIterator<Item = (K, f64)>) -> Vec<(String, f64)> {
    items
        .into_iter()
        .map(|(k, v)| (k.as_ref().to_string(), v))
        .collect()
}

/// What an objective sees while its trial is being recorded.
///
/// Logging methods write the raw key and value to the trial's user
/// attributes and a normalized copy to the tracking run. Use
/// [`TrialSession::tracking_only`] to skip the attribute write.
pub struct TrialSession<'a, T: TrialHandle> {
    trial: &'a T,
    tracker: Tracker,
    num_name_digits: usize,
    iter_step: u64,
    iter_history: BTreeMap<String, Vec<f64>>,
}

impl<'a, T: TrialHandle> TrialSession<'a, T> {
    pub(crate) fn new(trial: &'a T, tracker: Tracker, num_name_digits: usize) -> Self {
        Self {
            trial,
            tracker,
            num_name_digits,
            iter_step: 0,
            iter_history: BTreeMap::new(),
        }
    }

    pub fn trial(&self) -> &T {
        self.trial
    }

    pub fn number(&self) -> usize {
        self.trial.number()
    }

    /// Id of the parent tracking run, if one could be opened.
    pub fn run_id(&self) -> Option<&str> {
        self.tracker.run_id()
    }

    /// View that logs to the tracking run only.
    pub fn tracking_only(&self) -> TrackingOnly<'_> {
        TrackingOnly {
            tracker: &self.tracker,
        }
    }

    /// Step the next implicit [`log_iter`](Self::log_iter) call will use.
    pub fn next_iter_step(&self) -> u64 {
        self.iter_step
    }

    /// Values recorded by [`log_iter`](Self::log_iter) so far, per metric.
    pub fn iter_history(&self) -> &BTreeMap<String, Vec<f64>> {
        &self.iter_history
    }

    fn set_attr(&self, key: &str, value: serde_json::Value) {
        if let Err(e) = self.trial.set_user_attr(key, value) {
            warn!(trial = self.trial.number(), key, error = %e, "could not set trial attribute");
        }
    }

    pub fn log_param(&self, key: &str, value: impl Into<ParamValue>) {
        let value = value.into();
        self.set_attr(key, value.to_json());
        self.tracker.log_param(key, &value);
    }

    pub fn log_params<K, V>(&self, params: impl IntoIterator<Item = (K, V)>)
    where
        K: AsRef<str>,
        V: Into<ParamValue>,
    {
        let params = collect_params(params);
        for (key, value) in &params {
            self.set_attr(key, value.to_json());
        }
        self.tracker.log_params(&params);
    }

    /// Log a metric at `step` (0 when `None`).
    pub fn log_metric(&self, key: &str, value: f64, step: Option<u64>) {
        self.set_attr(key, ParamValue::Float(value).to_json());
        self.tracker.log_metric(key, value, step.unwrap_or(0));
    }

    pub fn log_metrics<K: AsRef<str>>(&self, metrics: impl IntoIterator<Item = (K, f64)>, step: Option<u64>) {
        let metrics = collect_metrics(metrics);
        for (key, value) in &metrics {
            self.set_attr(key, ParamValue::Float(*value).to_json());
        }
        self.tracker.log_metrics(&metrics, step.unwrap_or(0));
    }

    pub fn set_tag(&self, key: &str, value: impl Into<ParamValue>) {
        let value = value.into();
        self.set_attr(key, value.to_json());
        self.tracker.set_tag(key, &value.to_string());
    }

    pub fn set_tags<K, V>(&self, tags: impl IntoIterator<Item = (K, V)>)
    where
        K: AsRef<str>,
        V: Into<ParamValue>,
    {
        let tags = collect_params(tags);
        for (key, value) in &tags {
            self.set_attr(key, value.to_json());
        }
        let tags: Vec<(String, String)> = tags
            .into_iter()
            .map(|(key, value)| (key, value.to_string()))
            .collect();
        self.tracker.set_tags(&tags);
    }

    /// Upload a file to the parent run's artifacts.
    pub fn log_artifact(&self, local_path: &Path, artifact_dir: Option<&str>) {
        self.tracker.log_artifact(local_path, artifact_dir);
    }

    /// Record one iteration (fold, epoch, ...) of the trial.
    ///
    /// Uses `step` or, when `None`, the internal counter; the counter then
    /// continues at `step + 1`. The full history of each metric is written to
    /// the trial attribute `<metric>_iter`, and the metrics go to a nested
    /// run named `<trial>-<step>`.
    pub fn log_iter<K: AsRef<str>>(&mut self, metrics: impl IntoIterator<Item = (K, f64)>, step: Option<u64>) {
        let step = step.unwrap_or(self.iter_step);
        self.iter_step = step.saturating_add(1);

        let metrics = collect_metrics(metrics);
        for (key, value) in &metrics {
            let history = self.iter_history.entry(key.clone()).or_default();
            history.push(*value);
            let snapshot = serde_json::Value::from(history.clone());
            self.set_attr(&format!("{key}_iter"), snapshot);
        }

        let width = self.num_name_digits;
        let run_name = format!("{:0width$}-{:0width$}", self.trial.number(), step);
        self.tracker.log_nested(&run_name, &metrics, step);
    }

    fn suggested<V: Into<ParamValue> + Clone>(&self, name: &str, value: V) -> V {
        self.tracker.log_param(name, &value.clone().into());
        value
    }

    pub fn suggest_categorical(&self, name: &str, choices: Vec<ParamValue>) -> Result<ParamValue, TrialError> {
        let value = self.trial.suggest_categorical(name, choices)?;
        Ok(self.suggested(name, value))
    }

    pub fn suggest_int(&self, name: &str, low: i64, high: i64, step: i64, log: bool) -> Result<i64, TrialError> {
        let value = self.trial.suggest_int(name, low, high, step, log)?;
        Ok(self.suggested(name, value))
    }

    pub fn suggest_uniform(&self, name: &str, low: f64, high: f64) -> Result<f64, TrialError> {
        let value = self.trial.suggest_uniform(name, low, high)?;
        Ok(self.suggested(name, value))
    }

    pub fn suggest_loguniform(&self, name: &str, low: f64, high: f64) -> Result<f64, TrialError> {
        let value = self.trial.suggest_loguniform(name, low, high)?;
        Ok(self.suggested(name, value))
    }

    pub fn suggest_discrete_uniform(&self, name: &str, low: f64, high: f64, q: f64) -> Result<f64, TrialError> {
        let value = self.trial.suggest_discrete_uniform(name, low, high, q)?;
        Ok(self.suggested(name, value))
    }

    pub fn suggest_float(&self, name: &str, low: f64, high: f64, log: bool) -> Result<f64, TrialError> {
        let value = self.trial.suggest_float(name, low, high, log)?;
        Ok(self.suggested(name, value))
    }

    pub fn report(&self, value: f64, step: u64) -> Result<(), TrialError> {
        self.trial.report(value, step)?;
        Ok(())
    }

    pub fn should_prune(&self) -> bool {
        self.trial.should_prune()
    }

    /// Close the run after the objective returned `value`.
    pub(crate) fn finish_ok(&mut self, value: f64, result_metric: &str) {
        self.tracker.log_metric(result_metric, value, 0);

        let mut tags: Vec<(String, ParamValue)> =
            vec![("direction".to_string(), self.trial.direction().to_string().into())];
        let distributions: BTreeMap<String, Distribution> = self.trial.distributions();
        for (name, distribution) in distributions {
            tags.push((format!("{name}_distribution"), distribution.to_string().into()));
        }
        self.set_tags(tags);

        self.tracker.end(RunStatus::Finished);
    }

    /// Close the run after the objective returned `err`.
    pub(crate) fn finish_err(&mut self, err: &TrialError) {
        self.set_tag("exception", error_report(err));
        let status = if err.is_cancelled() {
            RunStatus::Killed
        } else {
            RunStatus::Failed
        };
        self.tracker.end(status);
    }

    /// Close the run after the objective panicked with `message`.
    pub(crate) fn finish_panic(&mut self, message: &str) {
        self.set_tag("exception", format!("panic: {message}"));
        self.tracker.end(RunStatus::Failed);
    }
}

/// Display text of `err` followed by its source chain.
fn error_report(err: &dyn std::error::Error) -> String {
    let mut report = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        report.push_str("\n\nCaused by: ");
        report.push_str(&cause.to_string());
        source = cause.source();
    }
    report
}

/// Logging view that bypasses the trial's user attributes.
pub struct TrackingOnly<'s> {
    tracker: &'s Tracker,
}

impl TrackingOnly<'_> {
    pub fn log_param(&self, key: &str, value: impl Into<ParamValue>) {
        self.tracker.log_param(key, &value.into());
    }

    pub fn log_params<K, V>(&self, params: impl IntoIterator<Item = (K, V)>)
    where
        K: AsRef<str>,
        V: Into<ParamValue>,
    {
        self.tracker.log_params(&collect_params(params));
    }

    pub fn log_metric(&self, key: &str, value: f64, step: Option<u64>) {
        self.tracker.log_metric(key, value, step.unwrap_or(0));
    }

    pub fn log_metrics<K: AsRef<str>>(&self, metrics: impl IntoIterator<Item = (K, f64)>, step: Option<u64>) {
        self.tracker.log_metrics(&collect_metrics(metrics), step.unwrap_or(0));
    }

    pub fn set_tag(&self, key: &str, value: impl Into<ParamValue>) {
        self.tracker.set_tag(key, &value.into().to_string());
    }

    pub fn set_tags<K, V>(&self, tags: impl IntoIterator<Item = (K, V)>)
    where
        K: AsRef<str>,
        V: Into<ParamValue>,
    {
        let tags: Vec<(String, String)> = collect_params(tags)
            .into_iter()
            .map(|(key, value)| (key, value.to_string()))
            .collect();
        self.tracker.set_tags(&tags);
    }
}
