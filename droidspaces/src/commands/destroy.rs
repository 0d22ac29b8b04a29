//! `destroy` (§6, §4.H stopping → destroyed): best-effort teardown of a
//! container from a fresh process — signals init if still alive, unmounts
//! an image rootfs or Termux bridge if one was left mounted, and removes
//! the container's persisted state.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use droidspaces_engine::container;
use droidspaces_engine::host_command::SystemHostCommand;
use droidspaces_engine::syscall;

/// Destroy a container, stopping it first if still running.
#[derive(Parser, Debug)]
pub struct Destroy {
    /// Container name, as given to `create`.
    #[clap(long = "name", short = 'n')]
    pub name: String,
}

impl Destroy {
    pub fn exec(&self, workspace: PathBuf) -> Result<()> {
        let syscall = syscall::create_syscall();
        let host_command = SystemHostCommand;
        container::destroy_by_name(syscall.as_ref(), &host_command, &workspace, &self.name)
            .with_context(|| format!("failed to destroy container {}", self.name))?;
        println!("destroyed container {}", self.name);
        Ok(())
    }
}
