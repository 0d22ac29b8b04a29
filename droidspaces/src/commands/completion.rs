//! `completion` (§6): generates a shell-completion script via
//! `clap_complete`. Pure CLI ergonomics, not runtime functionality.

use std::io;

use anyhow::Result;
use clap::Parser;
use clap_complete::{generate, Shell};

#[derive(Debug, Parser)]
/// Generate a shell completion script
pub struct Completion {
    #[clap(value_enum)]
    pub shell: Shell,
}

pub fn completion(args: Completion, app: &mut clap::Command) -> Result<()> {
    let name = app.get_name().to_string();
    generate(args.shell, app, name, &mut io::stdout());
    Ok(())
}
