//! A thin wrapper around the handful of raw syscalls the lifecycle
//! orchestrator needs, behind a trait so unit tests can substitute a
//! recording fake instead of touching the real kernel.

pub mod linux;
#[allow(clippy::module_inception)]
pub mod syscall;
pub mod test;

pub use syscall::{create_syscall, Syscall, SyscallType};

#[derive(Debug, thiserror::Error)]
pub enum SyscallError {
    #[error("failed to unshare {flags:?}: {errno}")]
    UnshareFailed {
        flags: nix::sched::CloneFlags,
        errno: nix::errno::Errno,
    },
    #[error("failed to set hostname to {hostname:?}: {errno}")]
    SetHostnameFailed {
        hostname: String,
        errno: nix::errno::Errno,
    },
    #[error("failed to pivot root to {path:?}: {errno}")]
    PivotRootFailed {
        path: std::path::PathBuf,
        errno: nix::errno::Errno,
    },
    #[error("mount failed: source={mount_source:?} target={mount_target:?} fstype={fstype:?} flags={flags:?}: {errno}")]
    MountFailed {
        mount_source: Option<std::path::PathBuf>,
        mount_target: std::path::PathBuf,
        fstype: Option<String>,
        flags: nix::mount::MsFlags,
        data: Option<String>,
        errno: nix::errno::Errno,
    },
    #[error("umount2 of {target:?} failed: {errno}")]
    Umount2Failed {
        target: std::path::PathBuf,
        flags: nix::mount::MntFlags,
        errno: nix::errno::Errno,
    },
    #[error("symlink {old_path:?} -> {new_path:?} failed: {err}")]
    SymlinkFailed {
        old_path: std::path::PathBuf,
        new_path: std::path::PathBuf,
        err: std::io::Error,
    },
    #[error("mknod {path:?} failed: {errno}")]
    MknodFailed {
        path: std::path::PathBuf,
        kind: nix::sys::stat::SFlag,
        perm: nix::sys::stat::Mode,
        dev: u64,
        errno: nix::errno::Errno,
    },
    #[error("chown {path:?} failed: {errno}")]
    ChownFailed {
        path: std::path::PathBuf,
        owner: Option<nix::unistd::Uid>,
        group: Option<nix::unistd::Gid>,
        errno: nix::errno::Errno,
    },
    #[error("failed to set PR_SET_NO_NEW_PRIVS: {0}")]
    SetNoNewPrivsFailed(nix::errno::Errno),
    #[error("failed to install seccomp filter: {0}")]
    SeccompInstallFailed(nix::errno::Errno),
    #[error("failed to close fds above {preserve_fds}: {source}")]
    CloseRangeFailed {
        preserve_fds: i32,
        source: std::io::Error,
    },
    #[error("execvpe of {program:?} failed: {errno}")]
    ExecFailed {
        program: String,
        errno: nix::errno::Errno,
    },
}

pub type Result<T> = std::result::Result<T, SyscallError>;
