//! Resolves the workspace directory (§6 "Persisted state layout"): the
//! host-side directory holding `containers/<name>/`, `mounts/<image>/`, and
//! `run/<name>.{pid,sock}`. Droidspaces always runs with `CAP_SYS_ADMIN`
//! (no rootless mode, unlike the teacher's XDG-based rootless fallback
//! chain), so resolution is a single env var with a fixed default rather
//! than a multi-step rootless/non-rootless search.

use std::path::PathBuf;

use anyhow::{Context, Result};
use droidspaces_engine::utils::mkdir_p;

const WORKSPACE_ENV: &str = "DROIDSPACES_WORKSPACE";

#[cfg(not(test))]
fn default_workspace() -> PathBuf {
    PathBuf::from("/data/local/droidspaces")
}

#[cfg(test)]
fn default_workspace() -> PathBuf {
    std::env::temp_dir().join("droidspaces-test-workspace")
}

/// Resolves the workspace: `--workspace` flag, then `$DROIDSPACES_WORKSPACE`,
/// then the fixed default. Creates the directory (mode `0700`) if it does
/// not already exist.
pub fn determine(workspace_flag: Option<PathBuf>) -> Result<PathBuf> {
    let path = workspace_flag
        .or_else(|| std::env::var_os(WORKSPACE_ENV).map(PathBuf::from))
        .unwrap_or_else(default_workspace);

    if !path.exists() {
        mkdir_p(&path, 0o700).with_context(|| format!("failed to create workspace directory {path:?}"))?;
    }

    path.canonicalize()
        .with_context(|| format!("failed to canonicalize workspace path {path:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_explicit_flag_wins_over_env() {
        std::env::remove_var(WORKSPACE_ENV);
        let tmp = tempfile::tempdir().unwrap();
        let explicit = tmp.path().join("explicit");
        let resolved = determine(Some(explicit.clone())).unwrap();
        assert_eq!(resolved, explicit.canonicalize().unwrap());
    }

    #[test]
    #[serial]
    fn test_env_var_used_when_no_flag() {
        let tmp = tempfile::tempdir().unwrap();
        let via_env = tmp.path().join("via-env");
        std::env::set_var(WORKSPACE_ENV, &via_env);
        let resolved = determine(None).unwrap();
        assert_eq!(resolved, via_env.canonicalize().unwrap());
        std::env::remove_var(WORKSPACE_ENV);
    }

    #[test]
    #[serial]
    fn test_existing_directory_is_reused() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("existing");
        std::fs::create_dir(&path).unwrap();
        let resolved = determine(Some(path.clone())).unwrap();
        assert_eq!(resolved, path.canonicalize().unwrap());
    }
}
