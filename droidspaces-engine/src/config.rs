//! Container configuration (`Config`): an immutable, serde-serializable
//! record passed by value into the orchestrator and persisted verbatim as
//! `containers/<name>/config` under the workspace.

use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

const CONFIG_FILE_NAME: &str = "config";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to save config to {path:?}: {msg}")]
    SaveFailed { msg: String, path: PathBuf },
    #[error("failed to load config from {path:?}: {msg}")]
    LoadFailed { msg: String, path: PathBuf },
    #[error("container name must be non-empty, printable, and contain no slash: {0:?}")]
    InvalidName(String),
    #[error("rootfs path must be absolute: {0:?}")]
    RootfsNotAbsolute(PathBuf),
    #[error("rootfs does not exist: {0:?}")]
    RootfsMissing(PathBuf),
}

type Result<T> = std::result::Result<T, ConfigError>;

/// How init is launched once the container has pivoted into its rootfs.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InitMode {
    Systemd,
    Shell,
    CustomArgv(Vec<String>),
}

impl InitMode {
    /// The argv the orchestrator execs once the container has booted.
    pub fn argv(&self) -> Vec<String> {
        match self {
            InitMode::Systemd => vec!["/sbin/init".to_string()],
            InitMode::Shell => vec!["/bin/sh".to_string()],
            InitMode::CustomArgv(argv) => argv.clone(),
        }
    }

    pub fn is_systemd(&self) -> bool {
        matches!(self, InitMode::Systemd)
    }
}

/// One entry of `Config::mounts`: `(source, target, read_only)`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct MountSpec {
    pub source: PathBuf,
    pub target: PathBuf,
    pub read_only: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Config {
    pub container_name: String,
    pub rootfs: PathBuf,
    pub hostname: String,
    pub init_mode: InitMode,
    pub enable_ipv6: bool,
    pub hw_access: bool,
    pub termux_x11: bool,
    pub env: HashMap<String, String>,
    pub mounts: Vec<MountSpec>,
}

impl Config {
    /// Validates the invariants from the data model: non-empty printable
    /// name with no slash, and an absolute, existing rootfs. Everything
    /// else is free-form and validated by the component that consumes it.
    pub fn validate(&self) -> Result<()> {
        let name = &self.container_name;
        if name.is_empty()
            || name.contains('/')
            || !name.chars().all(|c| !c.is_control())
        {
            return Err(ConfigError::InvalidName(name.clone()));
        }

        if !self.rootfs.is_absolute() {
            return Err(ConfigError::RootfsNotAbsolute(self.rootfs.clone()));
        }

        if !self.rootfs.exists() {
            return Err(ConfigError::RootfsMissing(self.rootfs.clone()));
        }

        Ok(())
    }

    /// True when `rootfs` points at a regular file (a loop-mountable image)
    /// rather than a directory that is already a usable rootfs.
    pub fn rootfs_is_image(&self) -> bool {
        self.rootfs.is_file()
    }

    pub fn save<P: AsRef<Path>>(&self, container_dir: P) -> Result<()> {
        let path = container_dir.as_ref().join(CONFIG_FILE_NAME);
        let file = fs::File::create(&path).map_err(|err| ConfigError::SaveFailed {
            msg: err.to_string(),
            path: path.clone(),
        })?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self).map_err(|err| ConfigError::SaveFailed {
            msg: err.to_string(),
            path: path.clone(),
        })?;
        writer.flush().map_err(|err| ConfigError::SaveFailed {
            msg: err.to_string(),
            path,
        })?;

        Ok(())
    }

    pub fn load<P: AsRef<Path>>(container_dir: P) -> Result<Self> {
        let path = container_dir.as_ref().join(CONFIG_FILE_NAME);
        let file = fs::File::open(&path).map_err(|err| ConfigError::LoadFailed {
            msg: err.to_string(),
            path: path.clone(),
        })?;
        let reader = BufReader::new(file);
        serde_json::from_reader(reader).map_err(|err| ConfigError::LoadFailed {
            msg: err.to_string(),
            path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_config(rootfs: PathBuf) -> Config {
        Config {
            container_name: "alpine".to_string(),
            rootfs,
            hostname: "alpine".to_string(),
            init_mode: InitMode::Shell,
            enable_ipv6: false,
            hw_access: false,
            termux_x11: false,
            env: HashMap::new(),
            mounts: vec![],
        }
    }

    #[test]
    fn test_validate_rejects_slash_in_name() {
        let tmp = tempdir().unwrap();
        let mut config = sample_config(tmp.path().to_path_buf());
        config.container_name = "a/b".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidName(_))
        ));
    }

    #[test]
    fn test_validate_rejects_relative_rootfs() {
        let mut config = sample_config(PathBuf::from("relative/path"));
        config.rootfs = PathBuf::from("relative/path");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RootfsNotAbsolute(_))
        ));
    }

    #[test]
    fn test_validate_rejects_missing_rootfs() {
        let config = sample_config(PathBuf::from("/nonexistent/rootfs/path"));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RootfsMissing(_))
        ));
    }

    #[test]
    fn test_validate_accepts_well_formed_config() {
        let tmp = tempdir().unwrap();
        let config = sample_config(tmp.path().to_path_buf());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_save_and_load_round_trip() {
        let tmp = tempdir().unwrap();
        let config = sample_config(tmp.path().to_path_buf());
        config.save(tmp.path()).expect("save should succeed");
        let loaded = Config::load(tmp.path()).expect("load should succeed");
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_rootfs_is_image_detects_regular_file() {
        let tmp = tempdir().unwrap();
        let img = tmp.path().join("alpine.img");
        fs::write(&img, b"not a real image").unwrap();
        let config = sample_config(img);
        assert!(config.rootfs_is_image());
    }
}
