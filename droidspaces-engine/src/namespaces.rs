//! Namespace construction for a container boot.
//!
//! Ordering guarantee (O1): all namespace creation precedes all mounts.
//! Droidspaces always creates a fresh namespace set for the container — it
//! never joins an existing namespace by path and never creates a user
//! namespace (the engine assumes it already runs with `CAP_SYS_ADMIN`, per
//! the non-goal on unprivileged operation).

use crate::syscall::Syscall;
use nix::sched::CloneFlags;

/// The namespaces the orchestrator creates for every container, in the
/// order the kernel documentation recommends unsharing them.
pub const CONTAINER_NAMESPACES: &[CloneFlags] = &[
    CloneFlags::CLONE_NEWUTS,
    CloneFlags::CLONE_NEWIPC,
    CloneFlags::CLONE_NEWPID,
    CloneFlags::CLONE_NEWNET,
    CloneFlags::CLONE_NEWNS,
];

/// `CLONE_NEWCGROUP` is only added when the host has a cgroup hierarchy for
/// the mount engine to place the container into.
pub fn namespace_flags(with_cgroup_ns: bool) -> CloneFlags {
    let mut flags = CloneFlags::empty();
    for f in CONTAINER_NAMESPACES {
        flags |= *f;
    }
    if with_cgroup_ns {
        flags |= CloneFlags::CLONE_NEWCGROUP;
    }
    flags
}

/// Unshares every requested namespace in a single call. `CLONE_NEWPID` only
/// affects processes forked after this call returns — the caller itself
/// stays in its original pid namespace, which is why the init child is
/// always forked strictly after this runs.
pub fn unshare_namespaces(syscall: &dyn Syscall, with_cgroup_ns: bool) -> Result<(), crate::syscall::SyscallError> {
    syscall.unshare(namespace_flags(with_cgroup_ns))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::test::TestHelperSyscall;
    use crate::syscall::Syscall;

    #[test]
    fn test_namespace_flags_without_cgroup_ns() {
        let flags = namespace_flags(false);
        assert!(flags.contains(CloneFlags::CLONE_NEWUTS));
        assert!(flags.contains(CloneFlags::CLONE_NEWIPC));
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(flags.contains(CloneFlags::CLONE_NEWNET));
        assert!(flags.contains(CloneFlags::CLONE_NEWNS));
        assert!(!flags.contains(CloneFlags::CLONE_NEWCGROUP));
        assert!(!flags.contains(CloneFlags::CLONE_NEWUSER));
    }

    #[test]
    fn test_namespace_flags_with_cgroup_ns() {
        assert!(namespace_flags(true).contains(CloneFlags::CLONE_NEWCGROUP));
    }

    #[test]
    fn test_unshare_namespaces_records_combined_flags() {
        let syscall = TestHelperSyscall::default();
        unshare_namespaces(&syscall, true).unwrap();
        let recorded = syscall.get_unshare_args();
        assert_eq!(recorded, vec![namespace_flags(true)]);
    }
}
