//! Clean working tree check run before a trial is recorded.

use std::path::Path;
use std::process::Command;

use tracing::debug;

use mltb_types::TrialError;

/// Fail unless `git status --porcelain` reports no changes under `dir`.
pub fn ensure_clean_tree(dir: &Path) -> Result<(), TrialError> {
    let output = Command::new("git")
        .arg("status")
        .arg("--porcelain")
        .current_dir(dir)
        .output()
        .map_err(|e| TrialError::GitCheck {
            message: format!("could not run git in {}: {e}", dir.display()),
        })?;

    if !output.status.success() {
        return Err(TrialError::GitCheck {
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let changes = count_changes(&String::from_utf8_lossy(&output.stdout));
    debug!(dir = %dir.display(), changes, "checked working tree");
    if changes > 0 {
        return Err(TrialError::DirtyWorkingTree {
            path: dir.display().to_string(),
            changes,
        });
    }
    Ok(())
}

/// Number of changed paths in `git status --porcelain` output.
pub fn count_changes(porcelain: &str) -> usize {
    porcelain.lines().filter(|line| !line.trim().is_empty()).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn counts_porcelain_lines() {
        assert_eq!(count_changes(""), 0);
        assert_eq!(count_changes(" M src/lib.rs\n?? notes.txt\n"), 2);
    }

    #[test]
    fn outside_a_repository_is_a_check_error() {
        let temp_dir = tempdir().unwrap();
        let err = ensure_clean_tree(temp_dir.path()).unwrap_err();
        assert!(matches!(err, TrialError::GitCheck { .. }));
    }

    #[test]
    fn untracked_file_makes_tree_dirty() {
        let temp_dir = tempdir().unwrap();
        let init = Command::new("git").arg("init").arg("-q").current_dir(temp_dir.path()).status();
        if !matches!(init, Ok(status) if status.success()) {
            // git is not installed here
            return;
        }
        assert!(ensure_clean_tree(temp_dir.path()).is_ok());

        fs::write(temp_dir.path().join("scratch.txt"), "x").unwrap();
        match ensure_clean_tree(temp_dir.path()) {
            Err(TrialError::DirtyWorkingTree { changes, .. }) => assert_eq!(changes, 1),
            other => panic!("expected a dirty tree, got {other:?}"),
        }
    }
}
