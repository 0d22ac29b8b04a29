//! Hardware access bridging (§4.E): scans a catalog of GPU device nodes for
//! their owning GIDs and reconciles `/etc/group` so `root` (the container's
//! only user) can reach them, and bridges a Termux X11/VirGL socket
//! directory into the container when requested.

use std::collections::BTreeSet;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::mount::MsFlags;
use nix::unistd::{Gid, Uid};

use crate::host_command::HostCommand;
use crate::rootfs::mount::{bind_mount, domount};
use crate::syscall::Syscall;
use crate::utils;

#[derive(Debug, thiserror::Error)]
pub enum HwAccessError {
    #[error(transparent)]
    Fs(#[from] crate::utils::FsError),
    #[error(transparent)]
    Syscall(#[from] crate::syscall::SyscallError),
    #[error(transparent)]
    Rootfs(#[from] crate::rootfs::RootfsError),
}

type Result<T> = std::result::Result<T, HwAccessError>;

/// Device nodes commonly associated with GPU/graphics access across the
/// hardware families this engine expects to boot on top of. Presence is
/// optional per-device; only nodes that exist on this host contribute a GID.
const GPU_DEVICE_CATALOG: &[&str] = &[
    // DRI (Mesa, any vendor exposing a DRM node)
    "/dev/dri/card0",
    "/dev/dri/card1",
    "/dev/dri/renderD128",
    "/dev/dri/renderD129",
    // NVIDIA proprietary driver, UVM, and MPS/MIG capability nodes
    "/dev/nvidia0",
    "/dev/nvidia1",
    "/dev/nvidiactl",
    "/dev/nvidia-modeset",
    "/dev/nvidia-uvm",
    "/dev/nvidia-uvm-tools",
    "/dev/nvidia-caps/nvidia-cap1",
    "/dev/nvidia-caps/nvidia-cap2",
    // ARM Mali
    "/dev/mali0",
    // Qualcomm Adreno / KGSL
    "/dev/kgsl-3d0",
    // AMD KFD (ROCm compute)
    "/dev/kfd",
    // Imagination PowerVR
    "/dev/pvr_sync",
    "/dev/pvrsrvkm",
    // Tegra nvhost / nvmap
    "/dev/nvhost-ctrl",
    "/dev/nvhost-gpu",
    "/dev/nvhost-as-gpu",
    "/dev/nvmap",
    // DMA-BUF heaps
    "/dev/ion",
    "/dev/dma_heap/system",
    // VirGL/goldfish software sync
    "/dev/sw_sync",
];

/// Scans `GPU_DEVICE_CATALOG` and returns the set of unique non-zero owning
/// GIDs found among the nodes that exist on this host. Must run before
/// `pivot_root` while the host `/dev` is still visible (I1).
pub fn scan_gpu_group_ids() -> BTreeSet<u32> {
    let mut gids = BTreeSet::new();
    for device in GPU_DEVICE_CATALOG {
        if let Ok(meta) = std::fs::metadata(device) {
            let gid = meta.gid();
            if gid != 0 {
                gids.insert(gid);
            }
        }
    }
    gids
}

/// A single `/etc/group` line, parsed and held structurally so individual
/// members can be appended without reformatting unrelated lines.
#[derive(Debug, Clone, PartialEq, Eq)]
struct GroupEntry {
    name: String,
    passwd: String,
    gid: u32,
    members: Vec<String>,
}

impl GroupEntry {
    fn parse(line: &str) -> Option<GroupEntry> {
        let mut fields = line.splitn(4, ':');
        let name = fields.next()?.to_string();
        let passwd = fields.next()?.to_string();
        let gid: u32 = fields.next()?.parse().ok()?;
        let members = fields
            .next()
            .unwrap_or("")
            .split(',')
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .collect();
        Some(GroupEntry { name, passwd, gid, members })
    }

    fn render(&self) -> String {
        format!("{}:{}:{}:{}", self.name, self.passwd, self.gid, self.members.join(","))
    }

    fn synthesize_gpu_group(gid: u32) -> GroupEntry {
        GroupEntry {
            name: format!("gpu_{gid}"),
            passwd: "x".to_string(),
            gid,
            members: vec!["root".to_string()],
        }
    }
}

fn parse_group_file(contents: &str) -> Vec<GroupEntry> {
    contents.lines().filter_map(GroupEntry::parse).collect()
}

/// Post-pivot group reconciliation (§4.E): for each GID already captured by
/// the pre-pivot scan, either ensures `root` is a whole-word member of the
/// existing group with that GID, or appends a synthetic `gpu_<gid>:x:<gid>:root`
/// line. Rewrites `<group_path>.tmp` and renames atomically; no-ops (and
/// unlinks the temp file) if nothing actually changed.
pub fn reconcile_gpu_groups(group_path: &Path, gids: &BTreeSet<u32>) -> Result<()> {
    if gids.is_empty() {
        return Ok(());
    }

    let contents = match utils::read_small(group_path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => {
            tracing::warn!(path = ?group_path, "missing, skipping GPU group reconciliation");
            return Ok(());
        }
    };

    let mut entries = parse_group_file(&contents);
    let mut changed = false;

    for gid in gids {
        if let Some(entry) = entries.iter_mut().find(|e| e.gid == *gid) {
            if !entry.members.iter().any(|m| m == "root") {
                entry.members.push("root".to_string());
                changed = true;
            }
        } else {
            entries.push(GroupEntry::synthesize_gpu_group(*gid));
            changed = true;
        }
    }

    if !changed {
        return Ok(());
    }

    let rendered: String = entries.iter().map(|e| e.render() + "\n").collect();
    write_atomic(group_path, rendered.as_bytes())
}

/// Writes `bytes` to a sibling `<path>.tmp` and renames it over `path`. The
/// temp file name is the literal one named in §6's on-disk format list
/// (`/etc/group.tmp`), not a generated suffix.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    utils::write_small(&tmp_path, bytes)?;
    std::fs::rename(&tmp_path, path).map_err(|source| {
        HwAccessError::Fs(crate::utils::FsError::Write { path: path.to_owned(), source })
    })?;
    Ok(())
}

const TERMUX_TMP_PATH: &str = "/data/data/com.termux/files/usr/tmp";
const TERMUX_PACKAGE_DATA_DIR: &str = "/data/data/com.termux";
const FALLBACK_SELINUX_CONTEXT: &str = "u:object_r:app_data_file:s0";
const TERMUX_STOP_GRACE: Duration = Duration::from_millis(500);

pub fn termux_tmp_path() -> PathBuf {
    PathBuf::from(TERMUX_TMP_PATH)
}

/// True if `path` is already mounted as `tmpfs`, read from `/proc/mounts`.
fn mount_is_tmpfs(path: &Path) -> bool {
    let path_str = path.to_string_lossy();
    match std::fs::read_to_string("/proc/mounts") {
        Ok(contents) => contents.lines().any(|line| {
            let mut fields = line.split_whitespace();
            let _source = fields.next();
            let target = fields.next().unwrap_or("");
            let fstype = fields.next().unwrap_or("");
            target == path_str && fstype == "tmpfs"
        }),
        Err(_) => false,
    }
}

/// Host-phase Termux bridge setup (§4.E), run before namespace creation:
/// ensures a single tmpfs exists at the well-known Termux tmp path, owned by
/// Termux's UID/GID (captured from the pre-existing directory, if any),
/// mode `01777`, with the SELinux context copied from Termux's package data
/// directory (or the fallback context). Returns whether this call created
/// the tmpfs (as opposed to finding one already in place), which the
/// orchestrator must remember so `destroy` only tears down what it made.
pub fn ensure_termux_bridge(syscall: &dyn Syscall, host_command: &dyn HostCommand) -> Result<bool> {
    let path = termux_tmp_path();

    if mount_is_tmpfs(&path) {
        tracing::debug!(path = ?path, "termux tmpfs bridge already present");
        return Ok(false);
    }

    let (owner, group) = match std::fs::metadata(&path) {
        Ok(meta) => (Uid::from_raw(meta.uid()), Gid::from_raw(meta.gid())),
        Err(_) => {
            tracing::warn!(path = ?path, "termux tmp directory missing, defaulting bridge ownership to root");
            (Uid::from_raw(0), Gid::from_raw(0))
        }
    };

    if path.is_dir() {
        stop_termux_best_effort(host_command);
    }

    utils::mkdir_p(&path, 0o1777)?;
    domount(syscall, None, &path, Some("tmpfs"), MsFlags::empty(), Some("mode=1777"))?;
    syscall.chown(&path, Some(owner), Some(group))?;

    let ctx = utils::get_selinux_context(TERMUX_PACKAGE_DATA_DIR).unwrap_or_default();
    let ctx = if ctx.is_empty() { FALLBACK_SELINUX_CONTEXT.to_string() } else { ctx };
    if let Err(err) = utils::set_selinux_context(&path, &ctx) {
        tracing::warn!(?err, "failed to apply selinux context to termux tmpfs bridge");
    }

    Ok(true)
}

/// Container-side bridge (§4.E), run pre-pivot alongside the rest of the
/// mount construction: on Android, bind-mounts the whole Termux tmpfs onto
/// `rootfs/tmp` so both `.X11-unix` and `.virgl_test` are visible inside the
/// container; on desktop Linux, binds `/tmp/.X11-unix` directly when present.
pub fn bind_termux_tmp_into_rootfs(syscall: &dyn Syscall, rootfs: &Path, is_android: bool) -> Result<Option<PathBuf>> {
    let (src, tgt) = if is_android {
        (termux_tmp_path(), rootfs.join("tmp"))
    } else {
        let src = PathBuf::from("/tmp/.X11-unix");
        if !src.exists() {
            tracing::warn!("no /tmp/.X11-unix on host, skipping x11 bridge");
            return Ok(None);
        }
        (src, rootfs.join("tmp/.X11-unix"))
    };

    if !src.exists() {
        tracing::warn!(path = ?src, "termux bridge source missing, skipping");
        return Ok(None);
    }

    bind_mount(syscall, &src, &tgt)?;
    Ok(Some(tgt))
}

/// Best-effort `am force-stop com.termux` followed by `pkill -9` and a fixed
/// grace period, used before laying down the tmpfs bridge so Termux releases
/// its hold on the directory. Named per §9 open question (a): the grace
/// stays a fixed constant rather than a configurable timeout.
pub fn stop_termux_best_effort(host_command: &dyn HostCommand) {
    let _ = host_command.run("am", &["force-stop", "com.termux"]);
    let _ = host_command.run("pkill", &["-9", "-f", "com.termux"]);
    std::thread::sleep(TERMUX_STOP_GRACE);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_entry_parse_and_render_round_trips() {
        let line = "video:x:44:shell,phablet";
        let entry = GroupEntry::parse(line).unwrap();
        assert_eq!(entry.name, "video");
        assert_eq!(entry.gid, 44);
        assert_eq!(entry.members, vec!["shell", "phablet"]);
        assert_eq!(entry.render(), line);
    }

    #[test]
    fn test_group_entry_parse_handles_empty_member_list() {
        let entry = GroupEntry::parse("root:x:0:").unwrap();
        assert!(entry.members.is_empty());
        assert_eq!(entry.render(), "root:x:0:");
    }

    #[test]
    fn test_reconcile_adds_root_to_existing_matching_group() {
        let tmp = tempfile::tempdir().unwrap();
        let group_path = tmp.path().join("group");
        utils::write_small(&group_path, b"root:x:0:\nvideo:x:44:\naudio:x:29:\n").unwrap();

        let mut gids = BTreeSet::new();
        gids.insert(44u32);
        reconcile_gpu_groups(&group_path, &gids).unwrap();

        let rewritten = String::from_utf8(utils::read_small(&group_path).unwrap()).unwrap();
        assert!(rewritten.contains("video:x:44:root"));
        assert!(rewritten.contains("audio:x:29:\n"));
        assert!(rewritten.contains("root:x:0:\n"));
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let group_path = tmp.path().join("group");
        utils::write_small(&group_path, b"video:x:44:\n").unwrap();

        let mut gids = BTreeSet::new();
        gids.insert(44u32);
        reconcile_gpu_groups(&group_path, &gids).unwrap();
        reconcile_gpu_groups(&group_path, &gids).unwrap();

        let rewritten = String::from_utf8(utils::read_small(&group_path).unwrap()).unwrap();
        assert_eq!(rewritten.matches("root").count(), 1);
    }

    #[test]
    fn test_reconcile_appends_synthetic_group_for_unmatched_gid() {
        let tmp = tempfile::tempdir().unwrap();
        let group_path = tmp.path().join("group");
        utils::write_small(&group_path, b"root:x:0:\n").unwrap();

        let mut gids = BTreeSet::new();
        gids.insert(1008u32);
        reconcile_gpu_groups(&group_path, &gids).unwrap();

        let rewritten = String::from_utf8(utils::read_small(&group_path).unwrap()).unwrap();
        assert!(rewritten.lines().any(|l| l == "gpu_1008:x:1008:root"));
    }

    #[test]
    fn test_reconcile_noop_when_no_gids_captured() {
        let tmp = tempfile::tempdir().unwrap();
        let group_path = tmp.path().join("group");
        utils::write_small(&group_path, b"root:x:0:\n").unwrap();
        reconcile_gpu_groups(&group_path, &BTreeSet::new()).unwrap();
        let contents = String::from_utf8(utils::read_small(&group_path).unwrap()).unwrap();
        assert_eq!(contents, "root:x:0:\n");
    }

    #[test]
    fn test_reconcile_uses_dot_tmp_sibling_file() {
        let tmp = tempfile::tempdir().unwrap();
        let group_path = tmp.path().join("group");
        utils::write_small(&group_path, b"root:x:0:\n").unwrap();
        let mut gids = BTreeSet::new();
        gids.insert(9000u32);
        reconcile_gpu_groups(&group_path, &gids).unwrap();
        assert!(!tmp.path().join("group.tmp").exists());
    }

    #[test]
    fn test_bind_termux_bridge_skips_when_source_missing_on_desktop() {
        let syscall = crate::syscall::test::TestHelperSyscall::default();
        let tmp = tempfile::tempdir().unwrap();
        let bridged = bind_termux_tmp_into_rootfs(&syscall, tmp.path(), false).unwrap();
        assert!(bridged.is_none());
    }

    #[test]
    fn test_mount_is_tmpfs_false_for_unknown_path() {
        assert!(!mount_is_tmpfs(Path::new("/definitely/not/a/mount/point")));
    }
}
