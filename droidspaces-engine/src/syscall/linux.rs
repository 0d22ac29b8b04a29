//! Implements the `Syscall` trait against the real Linux kernel.
use std::any::Any;
use std::os::unix::fs::symlink;
use std::path::Path;

use nix::{
    mount::{mount, umount2, MntFlags, MsFlags},
    sched::{unshare, CloneFlags},
    sys::stat::{mknod, Mode, SFlag},
    unistd::{chown, fchdir, pivot_root, sethostname, Gid, Uid},
};

use super::{Result, Syscall, SyscallError};

#[derive(Clone)]
pub struct LinuxSyscall;

impl Syscall for LinuxSyscall {
    fn as_any(&self) -> &dyn Any {
        self
    }

    // See https://man7.org/linux/man-pages/man2/unshare.2.html
    fn unshare(&self, flags: CloneFlags) -> Result<()> {
        unshare(flags).map_err(|errno| SyscallError::UnshareFailed { flags, errno })
    }

    fn set_hostname(&self, hostname: &str) -> Result<()> {
        sethostname(hostname).map_err(|errno| SyscallError::SetHostnameFailed {
            hostname: hostname.to_owned(),
            errno,
        })
    }

    /// See https://man7.org/linux/man-pages/man2/pivot_root.2.html, especially
    /// the notes. `pivot_root(path, path)` stacks the old root directly on
    /// top of the new one at the same path, which avoids having to create a
    /// temporary `old_root` directory under the new root just to hold the
    /// mapping we are about to unmount anyway.
    fn pivot_rootfs(&self, path: &Path) -> Result<()> {
        let newroot = nix::fcntl::open(path, nix::fcntl::OFlag::O_DIRECTORY | nix::fcntl::OFlag::O_RDONLY, Mode::empty())
            .map_err(|errno| SyscallError::PivotRootFailed {
                path: path.to_owned(),
                errno,
            })?;

        pivot_root(path, path).map_err(|errno| SyscallError::PivotRootFailed {
            path: path.to_owned(),
            errno,
        })?;

        // Make the old root rslave, not rprivate, so an unmount here does not
        // propagate into the host mount namespace. See runc#1500.
        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_SLAVE | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|errno| SyscallError::PivotRootFailed {
            path: path.to_owned(),
            errno,
        })?;

        // MNT_DETACH: the old root becomes invisible to new lookups immediately
        // but the kernel waits for it to go idle before actually releasing it.
        umount2("/", MntFlags::MNT_DETACH).map_err(|errno| SyscallError::PivotRootFailed {
            path: path.to_owned(),
            errno,
        })?;

        let result = fchdir(&newroot).map_err(|errno| SyscallError::PivotRootFailed {
            path: path.to_owned(),
            errno,
        });
        let _ = nix::unistd::close(newroot);
        result
    }

    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<()> {
        mount(source, target, fstype, flags, data).map_err(|errno| SyscallError::MountFailed {
            mount_source: source.map(|p| p.to_owned()),
            mount_target: target.to_owned(),
            fstype: fstype.map(|s| s.to_owned()),
            flags,
            data: data.map(|s| s.to_owned()),
            errno,
        })
    }

    fn umount2(&self, target: &Path, flags: MntFlags) -> Result<()> {
        umount2(target, flags).map_err(|errno| SyscallError::Umount2Failed {
            target: target.to_owned(),
            flags,
            errno,
        })
    }

    fn symlink(&self, original: &Path, link: &Path) -> Result<()> {
        symlink(original, link).map_err(|err| SyscallError::SymlinkFailed {
            old_path: original.to_owned(),
            new_path: link.to_owned(),
            err,
        })
    }

    fn mknod(&self, path: &Path, kind: SFlag, perm: Mode, dev: u64) -> Result<()> {
        mknod(path, kind, perm, dev).map_err(|errno| SyscallError::MknodFailed {
            path: path.to_owned(),
            kind,
            perm,
            dev,
            errno,
        })
    }

    fn chown(&self, path: &Path, owner: Option<Uid>, group: Option<Gid>) -> Result<()> {
        chown(path, owner, group).map_err(|errno| SyscallError::ChownFailed {
            path: path.to_owned(),
            owner,
            group,
            errno,
        })
    }

    fn set_no_new_privs(&self) -> Result<()> {
        let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
        if ret != 0 {
            return Err(SyscallError::SetNoNewPrivsFailed(nix::errno::Errno::last()));
        }
        Ok(())
    }

    /// The seccomp BPF ABI expects a `struct sock_fprog { len, filter }`
    /// where `filter` is an array of 8-byte `struct sock_filter` records;
    /// `prog` is exactly that array, serialized by the BPF builder.
    fn install_seccomp_filter(&self, prog: &[u8]) -> Result<()> {
        const FILTER_LEN: usize = std::mem::size_of::<libc::sock_filter>();
        debug_assert_eq!(prog.len() % FILTER_LEN, 0);

        let filters: &[libc::sock_filter] = unsafe {
            std::slice::from_raw_parts(prog.as_ptr() as *const libc::sock_filter, prog.len() / FILTER_LEN)
        };

        let fprog = libc::sock_fprog {
            len: filters.len() as u16,
            filter: filters.as_ptr() as *mut libc::sock_filter,
        };

        let ret = unsafe {
            libc::prctl(
                libc::PR_SET_SECCOMP,
                libc::SECCOMP_MODE_FILTER,
                &fprog as *const libc::sock_fprog,
            )
        };
        if ret != 0 {
            return Err(SyscallError::SeccompInstallFailed(nix::errno::Errno::last()));
        }
        Ok(())
    }

    /// Scans `/proc/self/fd` rather than calling the `close_range(2)` syscall
    /// directly, since the kernel version on older Android devices may not
    /// have it.
    fn close_range(&self, preserve_fds: i32) -> Result<()> {
        let open_fds: Vec<i32> = std::fs::read_dir("/proc/self/fd")
            .map_err(|source| SyscallError::CloseRangeFailed { preserve_fds, source })?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()))
            .collect();

        let min_fd = libc::STDERR_FILENO + 1 + preserve_fds;
        for fd in open_fds.into_iter().filter(|&fd| fd >= min_fd) {
            let _ = nix::unistd::close(fd);
        }
        Ok(())
    }
}
