//! # Droidspaces
//! Single-binary Linux container runtime that boots a full userland —
//! including systemd where available — on constrained and Android hosts.
//! This binary is the CLI/supervisor collaborator (§1 "out of scope"
//! boundary): it parses the command surface in §6, assembles a `Config`,
//! and drives the `droidspaces-engine` lifecycle orchestrator.
mod commands;
mod observability;
mod rootpath;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{crate_version, CommandFactory, Parser, Subcommand};

use crate::commands::{completion, create, destroy, enter, start, stop};
use crate::observability::ObservabilityConfig;

#[derive(Parser, Debug)]
#[clap(name = "droidspaces", version = crate_version!(), author = env!("CARGO_PKG_AUTHORS"))]
struct Opts {
    /// Workspace directory holding per-container state (§6). Defaults to
    /// `$DROIDSPACES_WORKSPACE`, falling back to a fixed path.
    #[clap(long, global = true)]
    workspace: Option<PathBuf>,

    /// Maximum logging.
    #[clap(long, global = true)]
    debug: bool,

    /// Explicit log level, overriding `$DROIDSPACES_LOG_LEVEL` and `--debug`.
    #[clap(long = "log-level", global = true)]
    log_level: Option<String>,

    /// Write logs to this file instead of stderr.
    #[clap(long = "log-file", global = true)]
    log_file: Option<PathBuf>,

    /// `text` (default) or `json`.
    #[clap(long = "log-format", global = true)]
    log_format: Option<String>,

    /// Also emit logs to the systemd journal, when available.
    #[clap(long = "systemd-log", global = true)]
    systemd_log: bool,

    #[clap(subcommand)]
    subcmd: SubCommand,
}

#[derive(Subcommand, Debug)]
enum SubCommand {
    /// Validate a configuration and persist it for later `start`.
    Create(create::Create),
    /// Boot a container and attach to its console.
    Start(start::Start),
    /// Open a new session inside a running container.
    Enter(enter::Enter),
    /// Signal a running container's init to exit.
    Stop(stop::Stop),
    /// Tear down a container's mounts and persisted state.
    Destroy(destroy::Destroy),
    /// Generate a shell completion script.
    Completion(completion::Completion),
}

fn main() -> Result<()> {
    // A malicious container can gain access to the host machine by
    // modifying droidspaces's own host binary and infecting it with code
    // that runs the next time the runtime is invoked — the same class of
    // vulnerability tracked as CVE-2019-5736 in runc and youki. The fix is
    // to seal `/proc/self/exe` into an anonymous, immutable copy and
    // re-execute from that, done here before anything else runs.
    pentacle::ensure_sealed().context("failed to seal /proc/self/exe")?;

    let opts = Opts::parse();

    let log_level = opts
        .log_level
        .clone()
        .or_else(|| std::env::var("DROIDSPACES_LOG_LEVEL").ok());
    if let Err(err) = observability::init(ObservabilityConfig {
        debug: opts.debug,
        log_level,
        log_file: opts.log_file.clone(),
        log_format: opts.log_format.clone(),
        journald: opts.systemd_log,
    }) {
        eprintln!("log init failed: {err:?}");
    }

    tracing::debug!(args = ?std::env::args_os(), "started");

    let exit_code = match run(opts) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("droidspaces: {err:#}");
            exit_code_for(&err)
        }
    };

    std::process::exit(exit_code);
}

fn run(opts: Opts) -> Result<()> {
    let workspace = rootpath::determine(opts.workspace.clone())?;

    match opts.subcmd {
        SubCommand::Create(create) => create.exec(workspace),
        SubCommand::Start(start) => start.exec(workspace),
        SubCommand::Enter(enter) => enter.exec(workspace),
        SubCommand::Stop(stop) => stop.exec(workspace),
        SubCommand::Destroy(destroy) => destroy.exec(workspace),
        SubCommand::Completion(args) => completion::completion(args, &mut Opts::command()),
    }
}

/// Maps a failure to the exit code families in §6. Errors that already
/// carry an `EngineError` report its exit code; everything else (a CLI
/// argument error, a missing rootfs canonicalized before reaching the
/// engine) is a configuration error.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<droidspaces_engine::EngineError>())
        .map(|e| e.exit_code())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opts_parses_create_subcommand() {
        let opts = Opts::try_parse_from([
            "droidspaces",
            "create",
            "--name",
            "alpine",
            "--rootfs",
            "/tmp",
        ])
        .unwrap();
        assert!(matches!(opts.subcmd, SubCommand::Create(_)));
    }

    #[test]
    fn test_opts_rejects_unknown_subcommand() {
        assert!(Opts::try_parse_from(["droidspaces", "frobnicate"]).is_err());
    }
}
