//! cgroup v1/v2 selection (§4.C). This is a version *detector and single
//! mount call*, not a resource-limit controller — droidspaces boots a
//! userland, it does not enforce cgroup quotas.

use std::path::Path;

use nix::mount::MsFlags;

use super::mount::domount;
use super::Result;
use crate::syscall::Syscall;

const LEGACY_HIERARCHIES: &[&str] = &[
    "cpu", "cpuacct", "devices", "memory", "freezer", "blkio", "pids", "systemd",
];

pub(crate) fn host_has_unified_cgroup() -> bool {
    Path::new("/sys/fs/cgroup/cgroup.controllers").exists()
        || crate::utils::grep_line("/proc/mounts", "cgroup2")
}

/// Mounts unified cgroup v2 when the host has it, otherwise lays down a
/// tmpfs and mounts the legacy per-controller hierarchies.
pub fn setup_cgroups(syscall: &dyn Syscall, rootfs: &Path) -> Result<()> {
    let cgroup_root = rootfs.join("sys/fs/cgroup");
    crate::utils::mkdir_p(&cgroup_root, 0o755)?;

    if host_has_unified_cgroup() {
        return domount(
            syscall,
            None,
            &cgroup_root,
            Some("cgroup2"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
            None,
        );
    }

    domount(
        syscall,
        None,
        &cgroup_root,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
        Some("mode=755"),
    )?;

    for name in LEGACY_HIERARCHIES {
        let hierarchy = cgroup_root.join(name);
        crate::utils::mkdir_p(&hierarchy, 0o755)?;
        domount(
            syscall,
            None,
            &hierarchy,
            Some("cgroup"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
            Some(name),
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::test::TestHelperSyscall;
    use tempfile::tempdir;

    #[test]
    fn test_setup_cgroups_mounts_a_hierarchy() {
        let syscall = TestHelperSyscall::default();
        let tmp = tempdir().unwrap();
        setup_cgroups(&syscall, tmp.path()).unwrap();
        let mounts = syscall.get_mount_args();
        assert!(!mounts.is_empty());
        // Either the single cgroup2 mount, or tmpfs + 8 legacy hierarchies.
        assert!(mounts.len() == 1 || mounts.len() == 1 + LEGACY_HIERARCHIES.len());
    }

    #[test]
    fn test_legacy_hierarchies_cover_expected_controllers() {
        for name in ["cpu", "memory", "pids", "systemd"] {
            assert!(LEGACY_HIERARCHIES.contains(&name));
        }
    }
}
