//! A no-op `Syscall` impl that records every call it receives, so tests can
//! assert on what the engine *tried* to do without needing root or a real
//! mount namespace.
use std::any::Any;
use std::cell::RefCell;
use std::path::{Path, PathBuf};

use nix::mount::{MntFlags, MsFlags};
use nix::sched::CloneFlags;
use nix::sys::stat::{Mode, SFlag};
use nix::unistd::{Gid, Uid};

use super::{Result, Syscall};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountArgs {
    pub source: Option<PathBuf>,
    pub target: PathBuf,
    pub fstype: Option<String>,
    pub flags: MsFlags,
    pub data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MknodArgs {
    pub path: PathBuf,
    pub kind: SFlag,
    pub perm: Mode,
    pub dev: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChownArgs {
    pub path: PathBuf,
    pub owner: Option<Uid>,
    pub group: Option<Gid>,
}

#[derive(Debug, Default)]
pub struct TestHelperSyscall {
    unshare_args: RefCell<Vec<CloneFlags>>,
    set_hostname_args: RefCell<Vec<String>>,
    pivot_rootfs_args: RefCell<Vec<PathBuf>>,
    mount_args: RefCell<Vec<MountArgs>>,
    umount2_args: RefCell<Vec<(PathBuf, MntFlags)>>,
    symlink_args: RefCell<Vec<(PathBuf, PathBuf)>>,
    mknod_args: RefCell<Vec<MknodArgs>>,
    chown_args: RefCell<Vec<ChownArgs>>,
    set_no_new_privs_called: RefCell<u32>,
    install_seccomp_filter_args: RefCell<Vec<Vec<u8>>>,
    close_range_args: RefCell<Vec<i32>>,
}

impl Syscall for TestHelperSyscall {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn unshare(&self, flags: CloneFlags) -> Result<()> {
        self.unshare_args.borrow_mut().push(flags);
        Ok(())
    }

    fn set_hostname(&self, hostname: &str) -> Result<()> {
        self.set_hostname_args.borrow_mut().push(hostname.to_owned());
        Ok(())
    }

    fn pivot_rootfs(&self, path: &Path) -> Result<()> {
        self.pivot_rootfs_args.borrow_mut().push(path.to_owned());
        Ok(())
    }

    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<()> {
        self.mount_args.borrow_mut().push(MountArgs {
            source: source.map(|p| p.to_owned()),
            target: target.to_owned(),
            fstype: fstype.map(|s| s.to_owned()),
            flags,
            data: data.map(|s| s.to_owned()),
        });
        Ok(())
    }

    fn umount2(&self, target: &Path, flags: MntFlags) -> Result<()> {
        self.umount2_args.borrow_mut().push((target.to_owned(), flags));
        Ok(())
    }

    fn symlink(&self, original: &Path, link: &Path) -> Result<()> {
        self.symlink_args
            .borrow_mut()
            .push((original.to_owned(), link.to_owned()));
        Ok(())
    }

    fn mknod(&self, path: &Path, kind: SFlag, perm: Mode, dev: u64) -> Result<()> {
        self.mknod_args.borrow_mut().push(MknodArgs {
            path: path.to_owned(),
            kind,
            perm,
            dev,
        });
        Ok(())
    }

    fn chown(&self, path: &Path, owner: Option<Uid>, group: Option<Gid>) -> Result<()> {
        self.chown_args.borrow_mut().push(ChownArgs {
            path: path.to_owned(),
            owner,
            group,
        });
        Ok(())
    }

    fn set_no_new_privs(&self) -> Result<()> {
        *self.set_no_new_privs_called.borrow_mut() += 1;
        Ok(())
    }

    fn install_seccomp_filter(&self, prog: &[u8]) -> Result<()> {
        self.install_seccomp_filter_args.borrow_mut().push(prog.to_vec());
        Ok(())
    }

    fn close_range(&self, preserve_fds: i32) -> Result<()> {
        self.close_range_args.borrow_mut().push(preserve_fds);
        Ok(())
    }
}

impl TestHelperSyscall {
    pub fn get_unshare_args(&self) -> Vec<CloneFlags> {
        self.unshare_args.borrow().clone()
    }

    pub fn get_set_hostname_args(&self) -> Vec<String> {
        self.set_hostname_args.borrow().clone()
    }

    pub fn get_pivot_rootfs_args(&self) -> Vec<PathBuf> {
        self.pivot_rootfs_args.borrow().clone()
    }

    pub fn get_mount_args(&self) -> Vec<MountArgs> {
        self.mount_args.borrow().clone()
    }

    pub fn get_umount2_args(&self) -> Vec<(PathBuf, MntFlags)> {
        self.umount2_args.borrow().clone()
    }

    pub fn get_symlink_args(&self) -> Vec<(PathBuf, PathBuf)> {
        self.symlink_args.borrow().clone()
    }

    pub fn get_mknod_args(&self) -> Vec<MknodArgs> {
        self.mknod_args.borrow().clone()
    }

    pub fn get_chown_args(&self) -> Vec<ChownArgs> {
        self.chown_args.borrow().clone()
    }

    pub fn set_no_new_privs_called(&self) -> u32 {
        *self.set_no_new_privs_called.borrow()
    }

    pub fn get_install_seccomp_filter_args(&self) -> Vec<Vec<u8>> {
        self.install_seccomp_filter_args.borrow().clone()
    }

    pub fn get_close_range_args(&self) -> Vec<i32> {
        self.close_range_args.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_mount_call() {
        let syscall = TestHelperSyscall::default();
        syscall
            .mount(
                Some(Path::new("/src")),
                Path::new("/dst"),
                Some("ext4"),
                MsFlags::MS_BIND,
                None,
            )
            .unwrap();
        let recorded = syscall.get_mount_args();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].target, PathBuf::from("/dst"));
        assert_eq!(recorded[0].flags, MsFlags::MS_BIND);
    }

    #[test]
    fn test_records_pivot_rootfs_call() {
        let syscall = TestHelperSyscall::default();
        syscall.pivot_rootfs(Path::new("/mnt/rootfs")).unwrap();
        assert_eq!(syscall.get_pivot_rootfs_args(), vec![PathBuf::from("/mnt/rootfs")]);
    }

    #[test]
    fn test_records_seccomp_install() {
        let syscall = TestHelperSyscall::default();
        syscall.set_no_new_privs().unwrap();
        syscall.install_seccomp_filter(&[0u8; 8]).unwrap();
        assert_eq!(syscall.set_no_new_privs_called(), 1);
        assert_eq!(syscall.get_install_seccomp_filter_args(), vec![vec![0u8; 8]]);
    }
}
