//! `create` (§6): validates the container configuration assembled from CLI
//! flags and persists it under `<workspace>/containers/<name>/config`. Does
//! not touch the kernel — namespace/mount construction only happens once
//! `start` calls into the engine's `boot`.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

use droidspaces_engine::config::{Config, InitMode, MountSpec};
use droidspaces_engine::container;

/// Create a container from a rootfs directory or image.
#[derive(Parser, Debug)]
pub struct Create {
    /// Container name; used to derive workspace subpaths.
    #[clap(long = "name", short = 'n')]
    pub name: String,

    /// Absolute path to a rootfs directory or a loop-mountable image file.
    #[clap(long)]
    pub rootfs: PathBuf,

    /// UTS hostname set inside the container; empty leaves it unset.
    #[clap(long, default_value = "")]
    pub hostname: String,

    /// How init is launched once the container has pivoted into its rootfs.
    #[clap(long = "init-mode", value_enum, default_value = "shell")]
    pub init_mode: InitModeArg,

    /// Enable IPv6 forwarding on the host and in the container's resolver.
    #[clap(long)]
    pub ipv6: bool,

    /// Grant host `/dev` bind and GPU group propagation.
    #[clap(long = "hw-access")]
    pub hw_access: bool,

    /// Bridge the Termux `/tmp` X11/VirGL sockets even without `--hw-access`.
    #[clap(long = "termux-x11")]
    pub termux_x11: bool,

    /// Extra bind mount, repeatable: `src:tgt` or `src:tgt:ro`.
    #[clap(long = "mount")]
    pub mounts: Vec<String>,

    /// Environment variable passed to init, repeatable: `KEY=VALUE`.
    #[clap(long = "env", short = 'e')]
    pub env: Vec<String>,

    /// Argv used when `--init-mode custom-argv` is selected.
    #[clap(last = true)]
    pub custom_argv: Vec<String>,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum InitModeArg {
    Systemd,
    Shell,
    CustomArgv,
}

impl Create {
    pub fn exec(&self, workspace: PathBuf) -> Result<()> {
        let config = self.to_config()?;
        container::create(&config, &workspace).context("failed to create container")?;
        println!("created container {}", self.name);
        Ok(())
    }

    fn to_config(&self) -> Result<Config> {
        let rootfs = self
            .rootfs
            .canonicalize()
            .with_context(|| format!("rootfs {:?} does not exist", self.rootfs))?;

        let init_mode = match self.init_mode {
            InitModeArg::Systemd => InitMode::Systemd,
            InitModeArg::Shell => InitMode::Shell,
            InitModeArg::CustomArgv => {
                if self.custom_argv.is_empty() {
                    bail!("--init-mode custom-argv requires an argv after `--`");
                }
                InitMode::CustomArgv(self.custom_argv.clone())
            }
        };

        let mounts = self
            .mounts
            .iter()
            .map(|spec| parse_mount_spec(spec))
            .collect::<Result<Vec<_>>>()?;

        let mut env = HashMap::with_capacity(self.env.len());
        for entry in &self.env {
            let (key, value) = entry
                .split_once('=')
                .with_context(|| format!("--env entry {entry:?} is not KEY=VALUE"))?;
            env.insert(key.to_string(), value.to_string());
        }

        Ok(Config {
            container_name: self.name.clone(),
            rootfs,
            hostname: self.hostname.clone(),
            init_mode,
            enable_ipv6: self.ipv6,
            hw_access: self.hw_access,
            termux_x11: self.termux_x11,
            env,
            mounts,
        })
    }
}

fn parse_mount_spec(spec: &str) -> Result<MountSpec> {
    let mut parts = spec.splitn(3, ':');
    let source = parts
        .next()
        .filter(|s| !s.is_empty())
        .with_context(|| format!("--mount entry {spec:?} is missing a source"))?;
    let target = parts
        .next()
        .filter(|s| !s.is_empty())
        .with_context(|| format!("--mount entry {spec:?} is missing a target"))?;
    let read_only = match parts.next() {
        None => false,
        Some("ro") => true,
        Some("rw") => false,
        Some(other) => bail!("--mount entry {spec:?} has unknown mode {other:?}"),
    };

    Ok(MountSpec {
        source: PathBuf::from(source),
        target: PathBuf::from(target),
        read_only,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mount_spec_defaults_to_read_write() {
        let spec = parse_mount_spec("/sdcard:/mnt/sdcard").unwrap();
        assert!(!spec.read_only);
        assert_eq!(spec.target, PathBuf::from("/mnt/sdcard"));
    }

    #[test]
    fn test_parse_mount_spec_parses_ro_suffix() {
        let spec = parse_mount_spec("/sdcard:/mnt/sdcard:ro").unwrap();
        assert!(spec.read_only);
    }

    #[test]
    fn test_parse_mount_spec_rejects_missing_target() {
        assert!(parse_mount_spec("/sdcard").is_err());
    }

    #[test]
    fn test_parse_mount_spec_rejects_unknown_mode() {
        assert!(parse_mount_spec("/sdcard:/mnt/sdcard:bogus").is_err());
    }
}
