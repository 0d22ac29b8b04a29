//! The parameterized `mount` helper, bind-mount materialization, and devpts
//! setup (§4.C).

use std::fs;
use std::path::Path;

use nix::mount::MsFlags;

use super::{Result, RootfsError};
use crate::syscall::{Syscall, SyscallError};

/// Mounts `src` onto `tgt`, treating `EBUSY` (already mounted) as success —
/// the engine's idempotent-retry contract. Any other error propagates as
/// `MountFailed`.
pub fn domount(
    syscall: &dyn Syscall,
    src: Option<&Path>,
    tgt: &Path,
    fs: Option<&str>,
    flags: MsFlags,
    data: Option<&str>,
) -> Result<()> {
    match syscall.mount(src, tgt, fs, flags, data) {
        Ok(()) => Ok(()),
        Err(SyscallError::MountFailed { errno, .. }) if errno == nix::errno::Errno::EBUSY => {
            tracing::debug!(target = ?tgt, "mount already present, treating EBUSY as success");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// Bind-mounts `src` onto `tgt`, materializing `tgt` first: a directory if
/// `src` is a directory, otherwise a zero-byte regular file (I4).
pub fn bind_mount(syscall: &dyn Syscall, src: &Path, tgt: &Path) -> Result<()> {
    materialize_bind_target(src, tgt)?;
    domount(
        syscall,
        Some(src),
        tgt,
        None,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None,
    )
}

pub fn materialize_bind_target(src: &Path, tgt: &Path) -> Result<()> {
    if src.is_dir() {
        crate::utils::mkdir_p(tgt, 0o755)?;
    } else {
        if let Some(parent) = tgt.parent() {
            crate::utils::mkdir_p(parent, 0o755)?;
        }
        if !tgt.exists() {
            fs::File::create(tgt).map_err(|source| RootfsError::Io {
                path: tgt.to_owned(),
                source,
            })?;
        }
    }
    Ok(())
}

/// Mounts a `newinstance` devpts at `rootfs/dev/pts` with the fixed options
/// the spec requires — `ptmxmode=0666,mode=0620,gid=5` — the tty group.
pub fn setup_devpts(syscall: &dyn Syscall, rootfs: &Path) -> Result<std::path::PathBuf> {
    let devpts = rootfs.join("dev/pts");
    crate::utils::mkdir_p(&devpts, 0o755)?;
    domount(
        syscall,
        None,
        &devpts,
        Some("devpts"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        Some("newinstance,ptmxmode=0666,mode=0620,gid=5"),
    )?;
    Ok(devpts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::test::TestHelperSyscall;
    use tempfile::tempdir;

    #[test]
    fn test_domount_swallows_ebusy() {
        // TestHelperSyscall never errors, so this exercises the Ok path;
        // the EBUSY branch is covered logically by domount's match arms
        // and exercised end-to-end via the orchestrator's retry tests.
        let syscall = TestHelperSyscall::default();
        let tmp = tempdir().unwrap();
        domount(&syscall, None, tmp.path(), Some("tmpfs"), MsFlags::empty(), None).unwrap();
        assert_eq!(syscall.get_mount_args().len(), 1);
    }

    #[test]
    fn test_bind_mount_materializes_directory_target() {
        let syscall = TestHelperSyscall::default();
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir(&src).unwrap();
        let tgt = tmp.path().join("dst");
        bind_mount(&syscall, &src, &tgt).unwrap();
        assert!(tgt.is_dir());
    }

    #[test]
    fn test_bind_mount_materializes_file_target() {
        let syscall = TestHelperSyscall::default();
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("src");
        fs::write(&src, b"x").unwrap();
        let tgt = tmp.path().join("nested/dst");
        bind_mount(&syscall, &src, &tgt).unwrap();
        assert!(tgt.is_file());
        assert_eq!(fs::metadata(&tgt).unwrap().len(), 0);
    }

    #[test]
    fn test_setup_devpts_uses_fixed_options() {
        let syscall = TestHelperSyscall::default();
        let tmp = tempdir().unwrap();
        setup_devpts(&syscall, tmp.path()).unwrap();
        let args = syscall.get_mount_args();
        let devpts = args.iter().find(|a| a.fstype.as_deref() == Some("devpts")).unwrap();
        assert_eq!(devpts.data.as_deref(), Some("newinstance,ptmxmode=0666,mode=0620,gid=5"));
    }
}
