//! Filesystem utilities (§4.B): atomic-ish small file I/O, recursive mkdir,
//! SELinux context access, procfs path building, and line-grep. These are
//! the low-level primitives the mount engine, network bootstrap, and
//! hardware access modules build on; none of them know about namespaces or
//! mounts themselves.

use std::ffi::{CString, OsStr};
use std::fs;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to create directory {path:?}: {source}")]
    Mkdir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("selinux getxattr on {path:?} failed: {errno}")]
    GetContext { path: PathBuf, errno: nix::errno::Errno },
    #[error("selinux setxattr on {path:?} failed: {errno}")]
    SetContext { path: PathBuf, errno: nix::errno::Errno },
}

type Result<T> = std::result::Result<T, FsError>;

/// Reads a small file whole. There is no size cap enforced here — callers
/// only ever point this at `/etc/*`-sized configuration files.
pub fn read_small(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let path = path.as_ref();
    fs::read(path).map_err(|source| FsError::Read {
        path: path.to_owned(),
        source,
    })
}

/// Truncating, non-atomic write. Callers that need atomicity (the `/etc/group`
/// rewrite in `hwaccess`) go via a sibling temp file and `rename` themselves.
pub fn write_small(path: impl AsRef<Path>, bytes: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let mut file = fs::File::create(path).map_err(|source| FsError::Write {
        path: path.to_owned(),
        source,
    })?;
    file.write_all(bytes).map_err(|source| FsError::Write {
        path: path.to_owned(),
        source,
    })
}

/// Recursive `mkdir -p` with an explicit mode, since `fs::create_dir_all`
/// applies the process umask instead of a caller-chosen mode.
pub fn mkdir_p(path: impl AsRef<Path>, mode: u32) -> Result<()> {
    let path = path.as_ref();
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(path)
        .map_err(|source| FsError::Mkdir {
            path: path.to_owned(),
            source,
        })
}

/// True if any line of `path` contains `needle` as a substring. Used for
/// cheap presence checks (`cgroup2` in `/proc/mounts`, a GID line in
/// `/etc/group`) without pulling in a structured parser.
pub fn grep_line(path: impl AsRef<Path>, needle: &str) -> bool {
    match fs::read_to_string(path.as_ref()) {
        Ok(contents) => contents.lines().any(|line| line.contains(needle)),
        Err(_) => false,
    }
}

const SELINUX_XATTR: &[u8] = b"security.selinux\0";

/// Reads the `security.selinux` extended attribute. Degrades to an empty
/// string (never panics) on `ENOTSUP`/`ENODATA`, which is the common case on
/// a host with SELinux disabled or a filesystem that doesn't carry xattrs —
/// callers treat that as a `BestEffortWarning`, not a hard failure.
pub fn get_selinux_context(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let c_path = path_to_cstring(path);
    let mut buf = vec![0u8; 256];

    loop {
        let ret = unsafe {
            libc::getxattr(
                c_path.as_ptr(),
                SELINUX_XATTR.as_ptr() as *const libc::c_char,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };

        if ret >= 0 {
            buf.truncate(ret as usize);
            return Ok(String::from_utf8_lossy(&buf).trim_end_matches('\0').to_string());
        }

        let errno = nix::errno::Errno::last();
        if errno == nix::errno::Errno::ERANGE && buf.len() < 65536 {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if errno == nix::errno::Errno::ENOTSUP || errno == nix::errno::Errno::ENODATA {
            return Ok(String::new());
        }
        return Err(FsError::GetContext {
            path: path.to_owned(),
            errno,
        });
    }
}

/// Writes `ctx` to the `security.selinux` extended attribute. Same
/// degrade-gracefully contract as `get_selinux_context`.
pub fn set_selinux_context(path: impl AsRef<Path>, ctx: &str) -> Result<()> {
    let path = path.as_ref();
    let c_path = path_to_cstring(path);
    let value = ctx.as_bytes();

    let ret = unsafe {
        libc::setxattr(
            c_path.as_ptr(),
            SELINUX_XATTR.as_ptr() as *const libc::c_char,
            value.as_ptr() as *const libc::c_void,
            value.len(),
            0,
        )
    };

    if ret == 0 {
        return Ok(());
    }

    let errno = nix::errno::Errno::last();
    if errno == nix::errno::Errno::ENOTSUP {
        return Ok(());
    }
    Err(FsError::SetContext {
        path: path.to_owned(),
        errno,
    })
}

fn path_to_cstring(path: &Path) -> CString {
    CString::new(path.as_os_str().as_bytes()).expect("path must not contain NUL bytes")
}

/// Builds `/proc/<pid>/<rest>`, centralizing the one place the engine needs
/// to know procfs's path shape.
pub fn procfs_path(pid: i32, rest: impl AsRef<OsStr>) -> PathBuf {
    PathBuf::from(format!("/proc/{pid}")).join(rest.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_then_read_small_round_trips() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("f");
        write_small(&path, b"hello").unwrap();
        assert_eq!(read_small(&path).unwrap(), b"hello");
    }

    #[test]
    fn test_write_small_truncates_existing_content() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("f");
        write_small(&path, b"a much longer line of content").unwrap();
        write_small(&path, b"short").unwrap();
        assert_eq!(read_small(&path).unwrap(), b"short");
    }

    #[test]
    fn test_mkdir_p_creates_nested_dirs() {
        let tmp = tempdir().unwrap();
        let nested = tmp.path().join("a/b/c");
        mkdir_p(&nested, 0o755).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn test_grep_line_finds_substring() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("mounts");
        write_small(&path, b"cgroup2 /sys/fs/cgroup cgroup2 rw 0 0\n").unwrap();
        assert!(grep_line(&path, "cgroup2"));
        assert!(!grep_line(&path, "cgroup1"));
    }

    #[test]
    fn test_grep_line_missing_file_is_false() {
        assert!(!grep_line("/nonexistent/path/does/not/exist", "anything"));
    }

    #[test]
    fn test_procfs_path_shape() {
        assert_eq!(procfs_path(42, "fd"), PathBuf::from("/proc/42/fd"));
    }

    #[test]
    fn test_selinux_context_degrades_gracefully_on_unsupported_fs() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("f");
        write_small(&path, b"x").unwrap();
        // tmpfs-backed tempdir typically has no xattr support for
        // security.selinux; this must not panic or hard-fail.
        let _ = get_selinux_context(&path);
    }
}
