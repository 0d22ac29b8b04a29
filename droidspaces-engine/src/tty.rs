//! PTY/console bridge (§4.G): master/slave allocation, bind-mounting the
//! slave over `/dev/console` and the `/dev/ttyN` placeholders, the child-side
//! controlling-terminal handoff, and the parent-side raw termios guard.

use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::pty::{openpty, OpenptyResult};
use nix::sys::termios::{self, SetArg, Termios};
use nix::unistd::{dup2, setsid};

use crate::rootfs::mount::bind_mount;
use crate::syscall::Syscall;

#[derive(Debug, thiserror::Error)]
pub enum TtyError {
    #[error("failed to open pty pair: {0}")]
    OpenPty(#[source] nix::Error),
    #[error("failed to set FD_CLOEXEC on pty fd: {0}")]
    SetCloexec(#[source] nix::Error),
    #[error("setsid failed: {0}")]
    Setsid(#[source] nix::Error),
    #[error("TIOCSCTTY failed")]
    Tiocsctty,
    #[error("dup2 onto {target} failed: {source}")]
    Dup2 {
        target: &'static str,
        #[source]
        source: nix::Error,
    },
    #[error(transparent)]
    Rootfs(#[from] crate::rootfs::RootfsError),
    #[error("tcgetattr/tcsetattr failed: {0}")]
    Termios(#[source] nix::Error),
}

type Result<T> = std::result::Result<T, TtyError>;

/// The four placeholder device names bind-mounted with the console slave
/// inside isolated-mode `/dev` (built in `rootfs::device`).
pub const TTY_TARGETS: &[&str] = &["console", "tty1", "tty2", "tty3", "tty4"];

/// An allocated PTY pair. Both fds carry `FD_CLOEXEC` (I2) so neither
/// survives an `exec` by accident; the child clears it on its own copy of
/// the slave fd just before `exec`'ing init.
pub struct TerminalPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
    pub slave_path: PathBuf,
}

fn set_cloexec(fd: RawFd) -> Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(TtyError::SetCloexec)?;
    Ok(())
}

/// Opens a fresh master/slave PTY pair via `openpty`, setting `FD_CLOEXEC`
/// on both ends.
pub fn terminal_create() -> Result<TerminalPair> {
    let OpenptyResult { master, slave } = openpty(None, None).map_err(TtyError::OpenPty)?;
    set_cloexec(master.as_raw_fd())?;
    set_cloexec(slave.as_raw_fd())?;

    let slave_path = slave_pty_path(slave.as_raw_fd())?;

    Ok(TerminalPair { master, slave, slave_path })
}

fn slave_pty_path(slave_fd: RawFd) -> Result<PathBuf> {
    let mut buf = vec![0u8; 64];
    let ret = unsafe { libc::ptsname_r(slave_fd, buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if ret != 0 {
        return Err(TtyError::Tiocsctty);
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    buf.truncate(len);
    Ok(PathBuf::from(String::from_utf8_lossy(&buf).into_owned()))
}

/// Bind-mounts the slave device onto `/dev/console` and the four `ttyN`
/// placeholders inside `rootfs`, so init (and anything it execs) finds a
/// controlling terminal at the conventional paths regardless of which
/// `/dev` mode (shared or isolated) is in effect.
pub fn bind_slave_into_rootfs(
    syscall: &dyn Syscall,
    rootfs: &Path,
    slave_path: &Path,
) -> Result<Vec<PathBuf>> {
    let mut mounted = Vec::with_capacity(TTY_TARGETS.len());
    for name in TTY_TARGETS {
        let target = rootfs.join("dev").join(name);
        bind_mount(syscall, slave_path, &target)?;
        mounted.push(target);
    }
    Ok(mounted)
}

/// Child-side controlling-terminal handoff, called post-fork and
/// pre-`exec`: detaches from any inherited controlling terminal (`setsid`),
/// acquires the slave as the new one (`TIOCSCTTY`), then `dup2`s it over
/// stdin/stdout/stderr.
pub fn attach_controlling_terminal(slave_fd: RawFd) -> Result<()> {
    setsid().map_err(TtyError::Setsid)?;

    if unsafe { libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) } < 0 {
        return Err(TtyError::Tiocsctty);
    }

    dup2(slave_fd, libc::STDIN_FILENO).map_err(|source| TtyError::Dup2 { target: "stdin", source })?;
    dup2(slave_fd, libc::STDOUT_FILENO).map_err(|source| TtyError::Dup2 { target: "stdout", source })?;
    dup2(slave_fd, libc::STDERR_FILENO).map_err(|source| TtyError::Dup2 { target: "stderr", source })?;

    Ok(())
}

/// Parent-side raw termios guard over the supervisor's own controlling
/// terminal (if it has one): applies the exact flag set named in §4.G and
/// restores the original termios on drop.
pub struct RawTerminalGuard {
    fd: RawFd,
    original: Termios,
}

impl RawTerminalGuard {
    pub fn apply(fd: RawFd) -> Result<Self> {
        let original = termios::tcgetattr(fd).map_err(TtyError::Termios)?;
        let mut raw = original.clone();

        raw.input_flags.remove(
            termios::InputFlags::ISTRIP
                | termios::InputFlags::INLCR
                | termios::InputFlags::IGNCR
                | termios::InputFlags::ICRNL
                | termios::InputFlags::IXON
                | termios::InputFlags::IXANY
                | termios::InputFlags::IXOFF,
        );
        raw.input_flags.insert(termios::InputFlags::IGNPAR);

        raw.output_flags.remove(termios::OutputFlags::ONLCR);
        raw.output_flags.insert(termios::OutputFlags::OPOST);

        raw.local_flags.remove(
            termios::LocalFlags::ISIG
                | termios::LocalFlags::ICANON
                | termios::LocalFlags::ECHO
                | termios::LocalFlags::ECHOE
                | termios::LocalFlags::ECHOK
                | termios::LocalFlags::ECHONL
                | termios::LocalFlags::TOSTOP
                | termios::LocalFlags::IEXTEN,
        );

        raw.control_chars[termios::SpecialCharacterIndices::VMIN as usize] = 1;
        raw.control_chars[termios::SpecialCharacterIndices::VTIME as usize] = 0;

        termios::tcsetattr(fd, SetArg::TCSANOW, &raw).map_err(TtyError::Termios)?;

        Ok(RawTerminalGuard { fd, original })
    }
}

impl Drop for RawTerminalGuard {
    fn drop(&mut self) {
        if let Err(err) = termios::tcsetattr(self.fd, SetArg::TCSANOW, &self.original) {
            tracing::warn!(?err, "failed to restore original termios on detach");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_create_sets_cloexec_on_both_fds() {
        let pair = terminal_create().unwrap();
        let master_flags = fcntl(pair.master.as_raw_fd(), FcntlArg::F_GETFD).unwrap();
        let slave_flags = fcntl(pair.slave.as_raw_fd(), FcntlArg::F_GETFD).unwrap();
        assert_ne!(master_flags & libc::FD_CLOEXEC, 0);
        assert_ne!(slave_flags & libc::FD_CLOEXEC, 0);
    }

    #[test]
    fn test_terminal_create_resolves_a_slave_path_under_dev_pts() {
        let pair = terminal_create().unwrap();
        assert!(pair.slave_path.to_string_lossy().contains("pts") || pair.slave_path.exists());
    }

    #[test]
    fn test_bind_slave_into_rootfs_mounts_five_targets() {
        let syscall = crate::syscall::test::TestHelperSyscall::default();
        let pair = terminal_create().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let mounted = bind_slave_into_rootfs(&syscall, tmp.path(), &pair.slave_path).unwrap();
        assert_eq!(mounted.len(), TTY_TARGETS.len());
        assert!(mounted.iter().any(|p| p.ends_with("console")));
    }
}
