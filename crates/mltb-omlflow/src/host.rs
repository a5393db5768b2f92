//! Host identity recorded on every run.

use tracing::warn;

pub(crate) fn hostname() -> String {
    match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            warn!(error = %e, "could not determine hostname");
            "unknown".to_string()
        }
    }
}

pub(crate) fn user() -> String {
    ["USER", "USERNAME", "LOGNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// `user@hostname`, written to the `mlflow.user` tag.
pub(crate) fn user_at_host() -> String {
    format!("{}@{}", user(), hostname())
}
