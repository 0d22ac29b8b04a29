//! `enter` (§6): opens a new session attached to a running container's init
//! by joining its namespaces. Runs as a fresh process, so it only has the
//! pid persisted at `run/<name>.pid` to go on — the in-memory `Instance`
//! from `start` lives in a different process entirely.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use nix::unistd::Pid;

use droidspaces_engine::container;

/// Open a new session inside a running container's namespaces.
#[derive(Parser, Debug)]
pub struct Enter {
    /// Container name, as given to `create`.
    #[clap(long = "name", short = 'n')]
    pub name: String,

    /// Command to run inside the container; defaults to a login shell.
    #[clap(last = true)]
    pub argv: Vec<String>,
}

impl Enter {
    pub fn exec(&self, workspace: PathBuf) -> Result<()> {
        let pid = read_pid(&workspace, &self.name)?;
        if !container::pid_is_alive(pid) {
            bail!("container {} is not running", self.name);
        }

        let argv = if self.argv.is_empty() {
            vec!["/bin/sh".to_string(), "-l".to_string()]
        } else {
            self.argv.clone()
        };

        let child = container::exec_enter_pid(pid, &argv)
            .with_context(|| format!("failed to enter container {}", self.name))?;
        let status = nix::sys::wait::waitpid(child, None);
        tracing::debug!(?status, "enter session exited");
        Ok(())
    }
}

fn read_pid(workspace: &std::path::Path, name: &str) -> Result<Pid> {
    let path = container::pid_file_path(workspace, name);
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("container {name} has no recorded pid at {path:?}; is it running?"))?;
    let raw = contents
        .trim()
        .parse::<i32>()
        .with_context(|| format!("pid file {path:?} does not contain a valid pid"))?;
    Ok(Pid::from_raw(raw))
}
