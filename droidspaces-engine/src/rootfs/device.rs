//! `/dev` construction (§4.C): shared mode bind-mounts the host devtmpfs;
//! isolated mode builds a minimal device set from scratch, falling back to
//! bind-mounting the host node when `mknod` is unavailable (no `CAP_MKNOD`
//! on confined Android — open question (d) in §9, kept and logged at warn).

use std::path::Path;

use nix::mount::MsFlags;
use nix::sys::stat::{Mode, SFlag};

use super::mount::{bind_mount, domount};
use super::Result;
use crate::syscall::Syscall;

/// One entry of the minimal isolated-mode device set: name under `dev/`,
/// device kind, major/minor, and mode (defaulting to 0666 unless given).
struct DeviceSpec {
    name: &'static str,
    kind: SFlag,
    major: u64,
    minor: u64,
    mode: u32,
}

const ISOLATED_DEVICES: &[DeviceSpec] = &[
    DeviceSpec { name: "null", kind: SFlag::S_IFCHR, major: 1, minor: 3, mode: 0o666 },
    DeviceSpec { name: "zero", kind: SFlag::S_IFCHR, major: 1, minor: 5, mode: 0o666 },
    DeviceSpec { name: "full", kind: SFlag::S_IFCHR, major: 1, minor: 7, mode: 0o666 },
    DeviceSpec { name: "random", kind: SFlag::S_IFCHR, major: 1, minor: 8, mode: 0o666 },
    DeviceSpec { name: "urandom", kind: SFlag::S_IFCHR, major: 1, minor: 9, mode: 0o666 },
    DeviceSpec { name: "tty", kind: SFlag::S_IFCHR, major: 5, minor: 0, mode: 0o666 },
    DeviceSpec { name: "console", kind: SFlag::S_IFCHR, major: 5, minor: 1, mode: 0o600 },
    DeviceSpec { name: "ptmx", kind: SFlag::S_IFCHR, major: 5, minor: 2, mode: 0o666 },
];

/// Placeholder regular files created as later bind targets for PTY slave
/// handoff (§4.G); they hold no device node themselves.
const TTY_PLACEHOLDERS: &[&str] = &["tty1", "tty2", "tty3", "tty4"];

fn makedev(major: u64, minor: u64) -> u64 {
    nix::sys::stat::makedev(major, minor)
}

/// Shared mode (`hw_access=true`): bind-mount the host `devtmpfs` wholesale.
fn setup_dev_shared(syscall: &dyn Syscall, rootfs: &Path) -> Result<()> {
    let dev = rootfs.join("dev");
    crate::utils::mkdir_p(&dev, 0o755)?;
    domount(
        syscall,
        Some(Path::new("/dev")),
        &dev,
        None,
        MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        None,
    )
}

/// Isolated mode: a fresh 4 MiB tmpfs plus a minimal hand-built device set.
fn setup_dev_isolated(syscall: &dyn Syscall, rootfs: &Path) -> Result<()> {
    let dev = rootfs.join("dev");
    crate::utils::mkdir_p(&dev, 0o755)?;
    domount(
        syscall,
        None,
        &dev,
        Some("tmpfs"),
        MsFlags::MS_NOSUID,
        Some("size=4m,mode=755"),
    )?;

    for spec in ISOLATED_DEVICES {
        let path = dev.join(spec.name);
        let dev_num = makedev(spec.major, spec.minor);
        match syscall.mknod(&path, spec.kind, Mode::from_bits_truncate(spec.mode), dev_num) {
            Ok(()) => {}
            Err(_) => {
                // No CAP_MKNOD: fall back to bind-mounting the host node.
                // This grants the container a host character device it
                // would otherwise not have (§9 open question (d)).
                let host_path = Path::new("/dev").join(spec.name);
                if host_path.exists() {
                    tracing::warn!(
                        device = spec.name,
                        "mknod failed, bind-mounting host device node instead"
                    );
                    bind_mount(syscall, &host_path, &path)?;
                } else {
                    tracing::warn!(device = spec.name, "mknod failed and no host device to fall back to");
                }
            }
        }
    }

    for name in TTY_PLACEHOLDERS {
        let path = dev.join(name);
        if !path.exists() {
            std::fs::File::create(&path).map_err(|source| super::RootfsError::Io {
                path: path.clone(),
                source,
            })?;
        }
    }

    setup_dev_symlinks(syscall, &dev)?;

    Ok(())
}

fn setup_dev_symlinks(syscall: &dyn Syscall, dev: &Path) -> Result<()> {
    let links: &[(&str, &str)] = &[
        ("/proc/self/fd", "fd"),
        ("/proc/self/fd/0", "stdin"),
        ("/proc/self/fd/1", "stdout"),
        ("/proc/self/fd/2", "stderr"),
    ];
    for (target, link_name) in links {
        let link = dev.join(link_name);
        if link.exists() || link.is_symlink() {
            continue;
        }
        syscall.symlink(Path::new(target), &link)?;
    }
    Ok(())
}

/// `setup_dev` (§4.C): shared mode when `hw_access` is set, isolated
/// otherwise.
pub fn setup_dev(syscall: &dyn Syscall, rootfs: &Path, hw_access: bool) -> Result<()> {
    if hw_access {
        setup_dev_shared(syscall, rootfs)
    } else {
        setup_dev_isolated(syscall, rootfs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::test::TestHelperSyscall;
    use tempfile::tempdir;

    #[test]
    fn test_setup_dev_shared_binds_host_devtmpfs() {
        let syscall = TestHelperSyscall::default();
        let tmp = tempdir().unwrap();
        setup_dev(&syscall, tmp.path(), true).unwrap();
        let mounts = syscall.get_mount_args();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].source, Some(Path::new("/dev").to_path_buf()));
        assert!(mounts[0].flags.contains(MsFlags::MS_NOSUID));
        assert!(mounts[0].flags.contains(MsFlags::MS_NOEXEC));
    }

    #[test]
    fn test_setup_dev_isolated_creates_minimal_device_set() {
        let syscall = TestHelperSyscall::default();
        let tmp = tempdir().unwrap();
        setup_dev(&syscall, tmp.path(), false).unwrap();
        let mknods = syscall.get_mknod_args();
        assert_eq!(mknods.len(), ISOLATED_DEVICES.len());
        let console = mknods.iter().find(|m| m.path.ends_with("console")).unwrap();
        assert_eq!(console.perm, Mode::from_bits_truncate(0o600));
    }

    #[test]
    fn test_setup_dev_isolated_creates_tty_placeholders() {
        let syscall = TestHelperSyscall::default();
        let tmp = tempdir().unwrap();
        setup_dev(&syscall, tmp.path(), false).unwrap();
        for n in TTY_PLACEHOLDERS {
            assert!(tmp.path().join("dev").join(n).is_file());
        }
    }

    #[test]
    fn test_setup_dev_isolated_creates_symlinks() {
        let syscall = TestHelperSyscall::default();
        let tmp = tempdir().unwrap();
        setup_dev(&syscall, tmp.path(), false).unwrap();
        let links = syscall.get_symlink_args();
        assert!(links.iter().any(|(_, link)| link.ends_with("fd")));
        assert!(links.iter().any(|(_, link)| link.ends_with("stdin")));
    }
}
