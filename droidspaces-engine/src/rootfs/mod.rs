//! The mount engine (§4.C): idempotent `mount`/`bind_mount`, `/dev`
//! construction for both shared (`hw_access`) and isolated modes, devpts,
//! cgroup v1/v2 selection, and loop-mounting of rootfs images. This module
//! owns the mount log used to roll back a partially-booted container.

pub mod cgroup;
pub mod device;
pub mod loopmount;
pub mod mount;

pub use cgroup::setup_cgroups;
pub use device::setup_dev;
pub use loopmount::{mount_rootfs_img, unmount_rootfs_img};
pub use mount::{bind_mount, domount, setup_devpts};

use std::path::PathBuf;

use nix::mount::MntFlags;

#[derive(Debug, thiserror::Error)]
pub enum RootfsError {
    #[error(transparent)]
    Syscall(#[from] crate::syscall::SyscallError),
    #[error(transparent)]
    Fs(#[from] crate::utils::FsError),
    #[error("mount target {0:?} is not usable: expected a {1}")]
    TargetTypeMismatch(PathBuf, &'static str),
    #[error("no free loop device available")]
    NoFreeLoopDevice,
    #[error("image mount point {0:?} is not empty, refusing to remove")]
    MountPointNotEmpty(PathBuf),
    #[error("io error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, RootfsError>;

/// One successful mount the orchestrator can undo, in the reverse order it
/// was recorded — the rollback mechanism named in §9 and tested by §8.3.
#[derive(Debug, Clone)]
pub struct MountLogEntry {
    pub target: PathBuf,
    pub unmount_flags: MntFlags,
}

/// Ordered record of every mount a boot attempt has performed so far.
/// `rollback` replays it in reverse; failures during rollback are logged
/// and swallowed since we're already unwinding from an earlier error.
#[derive(Debug, Default)]
pub struct MountLog {
    entries: Vec<MountLogEntry>,
}

impl MountLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, target: impl Into<PathBuf>, unmount_flags: MntFlags) {
        self.entries.push(MountLogEntry {
            target: target.into(),
            unmount_flags,
        });
    }

    pub fn entries(&self) -> &[MountLogEntry] {
        &self.entries
    }

    /// No target may be a prefix of an earlier target (§8.3: no shadowing).
    /// Mounting a shallower path after a deeper one hides everything already
    /// mounted underneath it, so that ordering is invalid.
    pub fn has_shadowing(&self) -> bool {
        for (i, earlier) in self.entries.iter().enumerate() {
            for later in &self.entries[i + 1..] {
                if earlier.target.starts_with(&later.target) && earlier.target != later.target {
                    return true;
                }
            }
        }
        false
    }

    pub fn rollback(&self, syscall: &dyn crate::syscall::Syscall) {
        for entry in self.entries.iter().rev() {
            if let Err(err) = syscall.umount2(&entry.target, entry.unmount_flags) {
                tracing::warn!(target = ?entry.target, ?err, "rollback unmount failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_log_rolls_back_in_reverse_order() {
        let syscall = crate::syscall::test::TestHelperSyscall::default();
        let mut log = MountLog::new();
        log.record("/a", MntFlags::MNT_DETACH);
        log.record("/a/b", MntFlags::empty());
        log.rollback(&syscall);
        let umounts = syscall.get_umount2_args();
        assert_eq!(umounts[0].0, PathBuf::from("/a/b"));
        assert_eq!(umounts[1].0, PathBuf::from("/a"));
    }

    #[test]
    fn test_mount_log_detects_shadowing() {
        let mut log = MountLog::new();
        log.record("/a", MntFlags::empty());
        log.record("/a/b", MntFlags::empty());
        assert!(!log.has_shadowing());

        let mut log2 = MountLog::new();
        log2.record("/proc", MntFlags::empty());
        log2.record("/dev/pts", MntFlags::empty());
        assert!(!log2.has_shadowing());

        // A mount recorded a second time at a path that is itself a prefix
        // of nothing else is fine; but an earlier, longer path followed by
        // a shorter prefix of it is the shadowing case the property guards.
        let mut log3 = MountLog::new();
        log3.record("/dev/pts", MntFlags::empty());
        log3.record("/dev", MntFlags::empty());
        assert!(log3.has_shadowing());
    }
}
