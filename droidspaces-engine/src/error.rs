//! Top-level error type composing every subsystem's error into the category
//! set from the runtime's error handling design (§7).

use crate::config::ConfigError;
use crate::hwaccess::HwAccessError;
use crate::network::NetworkError;
use crate::platform::PlatformError;
use crate::rootfs::RootfsError;
use crate::seccomp::SeccompError;
use crate::syscall::SyscallError;
use crate::tty::TtyError;

/// SyscallWrapperError aims to simplify error handling of syscalls in
/// the engine. In many occasions, we mix nix::Error and std::io::Error, which
/// makes error handling complicated.
#[derive(Debug, thiserror::Error)]
pub enum SyscallWrapperError {
    #[error(transparent)]
    Io(std::io::Error),
    #[error(transparent)]
    Nix(nix::Error),
}

impl From<std::io::Error> for SyscallWrapperError {
    fn from(err: std::io::Error) -> Self {
        SyscallWrapperError::Io(err)
    }
}

impl From<nix::Error> for SyscallWrapperError {
    fn from(err: nix::Error) -> Self {
        SyscallWrapperError::Nix(err)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("platform unsupported: {0}")]
    PlatformUnsupported(String),
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error("mount failed for {path}: {source}")]
    MountFailed {
        path: std::path::PathBuf,
        #[source]
        source: RootfsError,
    },
    #[error(transparent)]
    Rootfs(#[from] RootfsError),
    #[error("pivot_root failed: {0}")]
    PivotFailed(#[source] SyscallError),
    #[error("init exec failed: {0}")]
    InitFailed(#[source] SyscallError),
    #[error(transparent)]
    Syscall(#[from] SyscallError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    HwAccess(#[from] HwAccessError),
    #[error(transparent)]
    Seccomp(#[from] SeccompError),
    #[error(transparent)]
    Tty(#[from] TtyError),
    #[error("child exited with status {0}")]
    ChildExited(i32),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Non-fatal failures get logged and discarded by the orchestrator; this
/// type exists so call sites can express "this may fail, and that's fine"
/// without building a full `EngineError` for something nobody will propagate.
#[derive(Debug, thiserror::Error)]
#[error("{reason}")]
pub struct BestEffortWarning {
    pub reason: String,
}

impl BestEffortWarning {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl EngineError {
    /// Maps an error to the exit code the CLI reports (§6 Exit codes).
    /// Signal termination (`>128`) is handled by the binary itself, not here.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::ConfigInvalid(_) | EngineError::Config(_) => 1,
            EngineError::PlatformUnsupported(_) | EngineError::Platform(_) => 2,
            EngineError::MountFailed { .. } | EngineError::Rootfs(_) => 3,
            EngineError::PivotFailed(_) => 4,
            EngineError::InitFailed(_) => 5,
            EngineError::Syscall(_)
            | EngineError::Network(_)
            | EngineError::HwAccess(_)
            | EngineError::Seccomp(_)
            | EngineError::Tty(_)
            | EngineError::ChildExited(_)
            | EngineError::Io(_) => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;