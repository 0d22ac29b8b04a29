//! `stop` (§6, §4.H running → stopping): signals a running container's init
//! (`SIGTERM`, then `SIGKILL` after grace) using the pid persisted at
//! `run/<name>.pid` — this subcommand is invoked as a fresh process, not
//! the one that called `start`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use droidspaces_engine::container;

/// Stop a running container.
#[derive(Parser, Debug)]
pub struct Stop {
    /// Container name, as given to `create`.
    #[clap(long = "name", short = 'n')]
    pub name: String,
}

impl Stop {
    pub fn exec(&self, workspace: PathBuf) -> Result<()> {
        let pid_path = container::pid_file_path(&workspace, &self.name);
        let contents = std::fs::read_to_string(&pid_path)
            .with_context(|| format!("container {} is not running (no pid file)", self.name))?;
        let pid = contents
            .trim()
            .parse::<i32>()
            .map(nix::unistd::Pid::from_raw)
            .with_context(|| format!("pid file {pid_path:?} does not contain a valid pid"))?;

        if container::pid_is_alive(pid) {
            container::signal_stop(pid).context("failed to stop container")?;
        }

        let _ = std::fs::remove_file(&pid_path);
        println!("stopped container {}", self.name);
        Ok(())
    }
}
