//! The experiment run adapter.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use tracing::{error, info};

use mltb_study::{Trial, TrialHandle};
use mltb_tracking::TrackingClient;
use mltb_types::{MltbResult, TrialError};

use crate::config::OptunaMlflowConfig;
use crate::git;
use crate::session::{Tracker, TrialSession};

/// Records each trial invocation as a tracking run.
///
/// The adapter only holds configuration and a shared client; everything that
/// belongs to one invocation lives in the [`TrialSession`] created for it.
#[derive(Debug, Clone)]
pub struct OptunaMlflow {
    config: OptunaMlflowConfig,
    client: Option<TrackingClient>,
}

impl OptunaMlflow {
    /// Build an adapter whose client is resolved from `config.tracking_uri`.
    ///
    /// A store that cannot be opened is logged and the adapter runs without
    /// tracking.
    pub fn new(config: OptunaMlflowConfig) -> MltbResult<Self> {
        config.validate()?;
        let opened = match &config.tracking_uri {
            Some(uri) => TrackingClient::from_uri(uri),
            None => TrackingClient::from_global_uri(),
        };
        let client = match opened {
            Ok(client) => Some(client),
            Err(e) => {
                error!(uri = ?config.tracking_uri, error = %e, "could not open tracking store, runs will not be recorded");
                None
            }
        };
        Ok(Self { config, client })
    }

    /// Build an adapter around an existing client.
    pub fn with_client(config: OptunaMlflowConfig, client: TrackingClient) -> MltbResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            client: Some(client),
        })
    }

    pub fn config(&self) -> &OptunaMlflowConfig {
        &self.config
    }

    pub fn client(&self) -> Option<&TrackingClient> {
        self.client.as_ref()
    }

    /// Run `objective` for `trial` inside a tracking run.
    ///
    /// The objective's result is returned unchanged. On success the run is
    /// closed `FINISHED`; on error it gets an `exception` tag and is closed
    /// `KILLED` for cancellation or `FAILED` otherwise. A panic closes the run
    /// `FAILED` and is then resumed.
    pub fn run<T, F>(&self, trial: &T, objective: F) -> Result<f64, TrialError>
    where
        T: TrialHandle,
        F: FnOnce(&mut TrialSession<'_, T>) -> Result<f64, TrialError>,
    {
        if self.config.enforce_clean_git {
            let dir = match &self.config.source_dir {
                Some(dir) => dir.clone(),
                None => std::env::current_dir().map_err(|e| TrialError::GitCheck {
                    message: format!("could not determine the current directory: {e}"),
                })?,
            };
            git::ensure_clean_tree(&dir)?;
        }

        let number = trial.number();
        let width = self.config.num_name_digits;
        let run_name = format!("{number:0width$}");
        let tracker = Tracker::open(
            self.client.as_ref(),
            &trial.study_name(),
            &run_name,
            self.config.tag_limit(),
        );
        let mut session = TrialSession::new(trial, tracker, width);

        match panic::catch_unwind(AssertUnwindSafe(|| objective(&mut session))) {
            Ok(Ok(value)) => {
                session.finish_ok(value, &self.config.result_metric);
                info!(trial = number, value, "trial recorded");
                Ok(value)
            }
            Ok(Err(e)) => {
                session.finish_err(&e);
                info!(trial = number, error = %e, "trial recorded with error");
                Err(e)
            }
            Err(payload) => {
                session.finish_panic(&panic_message(payload.as_ref()));
                panic::resume_unwind(payload)
            }
        }
    }

    /// Wrap `f` into an objective for [`Study::optimize`](mltb_study::Study::optimize)
    /// or [`Study::optimize_parallel`](mltb_study::Study::optimize_parallel).
    pub fn objective<'s, F>(&'s self, f: F) -> impl Fn(&Trial) -> Result<f64, TrialError> + Send + Sync + 's
    where
        F: Fn(&mut TrialSession<'_, Trial>) -> Result<f64, TrialError> + Send + Sync + 's,
    {
        move |trial: &Trial| self.run(trial, &f)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "objective panicked".to_string()
    }
}
