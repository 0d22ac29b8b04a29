//! An interface trait so that the rest of the engine can call necessary
//! kernel functionality without having to worry about implementation
//! details or, in tests, without touching the kernel at all.
use std::any::Any;
use std::path::Path;

use nix::mount::{MntFlags, MsFlags};
use nix::sched::CloneFlags;
use nix::sys::stat::{Mode, SFlag};
use nix::unistd::{Gid, Uid};

use crate::syscall::linux::LinuxSyscall;
use crate::syscall::test::TestHelperSyscall;
use crate::syscall::Result;

pub trait Syscall {
    fn as_any(&self) -> &dyn Any;

    /// Disassociates the calling process's execution context parts named
    /// in `flags`, creating new namespaces for subsequently forked children.
    fn unshare(&self, flags: CloneFlags) -> Result<()>;

    fn set_hostname(&self, hostname: &str) -> Result<()>;

    /// Makes `path` the process's root directory, unmounting the old root.
    fn pivot_rootfs(&self, path: &Path) -> Result<()>;

    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<()>;

    fn umount2(&self, target: &Path, flags: MntFlags) -> Result<()>;

    fn symlink(&self, original: &Path, link: &Path) -> Result<()>;

    fn mknod(&self, path: &Path, kind: SFlag, perm: Mode, dev: u64) -> Result<()>;

    fn chown(&self, path: &Path, owner: Option<Uid>, group: Option<Gid>) -> Result<()>;

    /// `prctl(PR_SET_NO_NEW_PRIVS, 1, ...)`; must precede seccomp install (O5).
    fn set_no_new_privs(&self) -> Result<()>;

    /// Installs `prog` as the process's seccomp filter via
    /// `prctl(PR_SET_SECCOMP, SECCOMP_MODE_FILTER, ...)`.
    fn install_seccomp_filter(&self, prog: &[u8]) -> Result<()>;

    /// Closes every open file descriptor above `preserve_fds`, used by the
    /// init child to avoid leaking engine-internal fds into the booted
    /// container.
    fn close_range(&self, preserve_fds: i32) -> Result<()>;
}

#[derive(Clone, Copy)]
pub enum SyscallType {
    Linux,
    Test,
}

impl Default for SyscallType {
    fn default() -> Self {
        if cfg!(test) {
            SyscallType::Test
        } else {
            SyscallType::Linux
        }
    }
}

impl SyscallType {
    pub fn create_syscall(&self) -> Box<dyn Syscall> {
        match self {
            SyscallType::Linux => Box::new(LinuxSyscall),
            SyscallType::Test => Box::<TestHelperSyscall>::default(),
        }
    }
}

pub fn create_syscall() -> Box<dyn Syscall> {
    SyscallType::default().create_syscall()
}
