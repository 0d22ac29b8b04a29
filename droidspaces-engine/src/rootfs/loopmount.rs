//! Loop-mounting of rootfs images (§4.C): `mount_rootfs_img` constructs a
//! per-image mount point under `<workspace>/mounts/<basename>/`, best-effort
//! `e2fsck`s the image, attaches it to a free loop device via the
//! loop-control ioctls (not `losetup`), and mounts it. `unmount_rootfs_img`
//! detaches with `MNT_DETACH`, falling back to a lazy shell unmount.

use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::mount::{MntFlags, MsFlags};

use super::mount::domount;
use super::{Result, RootfsError};
use crate::host_command::HostCommand;
use crate::syscall::Syscall;

const LOOP_CONTROL: &str = "/dev/loop-control";
const LOOP_CTL_GET_FREE: libc::c_ulong = 0x4C82;
const LOOP_SET_FD: libc::c_ulong = 0x4C00;
const LOOP_CLR_FD: libc::c_ulong = 0x4C01;

fn loop_device_path(index: i32) -> PathBuf {
    PathBuf::from(format!("/dev/loop{index}"))
}

/// Finds a free loop device via `LOOP_CTL_GET_FREE` and attaches `img` to
/// it via `LOOP_SET_FD`, returning the loop device path.
fn attach_loop(img: &Path) -> Result<PathBuf> {
    let ctl = OpenOptions::new()
        .read(true)
        .write(true)
        .open(LOOP_CONTROL)
        .map_err(|source| RootfsError::Io { path: PathBuf::from(LOOP_CONTROL), source })?;

    let index = unsafe { libc::ioctl(ctl.as_raw_fd(), LOOP_CTL_GET_FREE) };
    if index < 0 {
        return Err(RootfsError::NoFreeLoopDevice);
    }

    let loopdev_path = loop_device_path(index);
    let loopdev = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&loopdev_path)
        .map_err(|source| RootfsError::Io { path: loopdev_path.clone(), source })?;
    let imgfile = OpenOptions::new()
        .read(true)
        .write(true)
        .open(img)
        .map_err(|source| RootfsError::Io { path: img.to_owned(), source })?;

    let ret = unsafe { libc::ioctl(loopdev.as_raw_fd(), LOOP_SET_FD, imgfile.as_raw_fd()) };
    if ret < 0 {
        return Err(RootfsError::Io {
            path: loopdev_path,
            source: std::io::Error::last_os_error(),
        });
    }

    Ok(loopdev_path)
}

fn detach_loop(loopdev_path: &Path) {
    if let Ok(loopdev) = OpenOptions::new().read(true).write(true).open(loopdev_path) {
        let ret = unsafe { libc::ioctl(loopdev.as_raw_fd(), LOOP_CLR_FD, 0) };
        if ret < 0 {
            tracing::warn!(path = ?loopdev_path, "failed to clear loop device binding");
        }
    }
}

fn mount_point_for(workspace: &Path, img: &Path) -> PathBuf {
    let basename = img
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    workspace.join("mounts").join(basename)
}

/// Mounts `img` via loop at `<workspace>/mounts/<basename>/`, returning the
/// mount point. `e2fsck -f -y` runs best-effort first (a failure does not
/// abort the mount — a dirty filesystem is still usable).
pub fn mount_rootfs_img(
    syscall: &dyn Syscall,
    host_command: &dyn HostCommand,
    workspace: &Path,
    img: &Path,
) -> Result<PathBuf> {
    let mount_point = mount_point_for(workspace, img);
    crate::utils::mkdir_p(&mount_point, 0o755)?;

    if let Err(err) = host_command.run("e2fsck", &["-f", "-y", &img.to_string_lossy()]) {
        tracing::warn!(?err, image = ?img, "e2fsck failed or unavailable, continuing anyway");
    }

    let loopdev = attach_loop(img)?;
    domount(
        syscall,
        Some(&loopdev),
        &mount_point,
        Some("ext4"),
        MsFlags::empty(),
        None,
    )?;

    Ok(mount_point)
}

/// Unmounts the image mount point with `MNT_DETACH`, falling back to a lazy
/// shell unmount on failure, then removes the directory only if empty.
pub fn unmount_rootfs_img(
    syscall: &dyn Syscall,
    host_command: &dyn HostCommand,
    mount_point: &Path,
) -> Result<()> {
    if let Err(err) = syscall.umount2(mount_point, MntFlags::MNT_DETACH) {
        tracing::warn!(?err, path = ?mount_point, "direct unmount failed, falling back to `umount -l`");
        let _ = host_command.run("umount", &["-l", &mount_point.to_string_lossy()]);
    }

    match std::fs::read_dir(mount_point) {
        Ok(mut entries) => {
            if entries.next().is_none() {
                let _ = std::fs::remove_dir(mount_point);
            }
        }
        Err(_) => { /* already gone or inaccessible; nothing more to do */ }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host_command::test::RecordingHostCommand;
    use tempfile::tempdir;

    #[test]
    fn test_mount_point_for_strips_extension() {
        let workspace = Path::new("/data/droidspaces");
        let img = Path::new("/sdcard/alpine.img");
        assert_eq!(
            mount_point_for(workspace, img),
            PathBuf::from("/data/droidspaces/mounts/alpine")
        );
    }

    #[test]
    fn test_unmount_removes_empty_directory() {
        let syscall = crate::syscall::test::TestHelperSyscall::default();
        let host_command = RecordingHostCommand::default();
        let tmp = tempdir().unwrap();
        let mount_point = tmp.path().join("mounts/alpine");
        crate::utils::mkdir_p(&mount_point, 0o755).unwrap();
        unmount_rootfs_img(&syscall, &host_command, &mount_point).unwrap();
        assert!(!mount_point.exists());
    }

    #[test]
    fn test_unmount_leaves_nonempty_directory() {
        let syscall = crate::syscall::test::TestHelperSyscall::default();
        let host_command = RecordingHostCommand::default();
        let tmp = tempdir().unwrap();
        let mount_point = tmp.path().join("mounts/alpine");
        crate::utils::mkdir_p(&mount_point, 0o755).unwrap();
        std::fs::write(mount_point.join("leftover"), b"x").unwrap();
        unmount_rootfs_img(&syscall, &host_command, &mount_point).unwrap();
        assert!(mount_point.exists());
    }
}
