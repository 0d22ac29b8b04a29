//! Child-side boot sequence (§4.H): everything that runs after `fork()`,
//! inside the new namespaces, up to `exec`'ing init. Failures are reported
//! back to the parent over the phase channel rather than exiting silently,
//! so the orchestrator can log a precise cause before tearing down.

use std::collections::BTreeSet;
use std::ffi::CString;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::host_command::HostCommand;
use crate::platform::PlatformProbe;
use crate::process::channel::{Channel, PhaseMessage};
use crate::rootfs::{self, MountLog};
use crate::syscall::Syscall;
use crate::{hwaccess, network, seccomp, tty};

/// Runs the full child-side sequence. Returns `Ok(())` only if `execvp`
/// itself fails to even start (which, on success, never returns at all —
/// the process image is replaced). `gpu_gids` is the set captured by the
/// orchestrator's host-phase scan, strictly before this process's
/// `pivot_root` (I1) — this function only reconciles `/etc/group` against
/// it, it never rescans.
pub fn run(
    syscall: &dyn Syscall,
    host_command: &dyn HostCommand,
    probe: &PlatformProbe,
    config: &Config,
    gpu_gids: &BTreeSet<u32>,
    channel: &Channel,
) -> Result<()> {
    let rootfs = effective_rootfs(config);
    let mut mount_log = MountLog::new();

    if let Err(err) = boot(syscall, host_command, probe, config, gpu_gids, &rootfs, channel, &mut mount_log) {
        tracing::error!(?err, "child boot sequence failed, rolling back mounts");
        mount_log.rollback(syscall);
        let _ = channel.send(&PhaseMessage::InitExecFailed(err.to_string()));
        return Err(err);
    }

    Ok(())
}

fn effective_rootfs(config: &Config) -> PathBuf {
    // Image rootfs is mounted onto a workspace-relative path by the
    // orchestrator before fork; by the time init.rs runs, `config.rootfs`
    // already names a directory either way (§4.C).
    config.rootfs.clone()
}

fn boot(
    syscall: &dyn Syscall,
    host_command: &dyn HostCommand,
    probe: &PlatformProbe,
    config: &Config,
    gpu_gids: &BTreeSet<u32>,
    rootfs: &Path,
    channel: &Channel,
    mount_log: &mut MountLog,
) -> Result<()> {
    channel.send(&PhaseMessage::NamespacesReady)?;

    rootfs::setup_dev(syscall, rootfs, config.hw_access)?;
    mount_log.record(rootfs.join("dev"), nix::mount::MntFlags::MNT_DETACH);

    let procfs = rootfs.join("proc");
    crate::utils::mkdir_p(&procfs, 0o755).map_err(rootfs::RootfsError::from)?;
    syscall.mount(None, &procfs, Some("proc"), nix::mount::MsFlags::empty(), None)?;
    mount_log.record(procfs, nix::mount::MntFlags::MNT_DETACH);

    let sysfs = rootfs.join("sys");
    crate::utils::mkdir_p(&sysfs, 0o755).map_err(rootfs::RootfsError::from)?;
    syscall.mount(None, &sysfs, Some("sysfs"), nix::mount::MsFlags::empty(), None)?;
    mount_log.record(sysfs, nix::mount::MntFlags::MNT_DETACH);

    rootfs::setup_cgroups(syscall, rootfs)?;
    mount_log.record(rootfs.join("sys/fs/cgroup"), nix::mount::MntFlags::MNT_DETACH);

    let devpts = rootfs::setup_devpts(syscall, rootfs)?;
    mount_log.record(devpts, nix::mount::MntFlags::MNT_DETACH);

    for spec in &config.mounts {
        let relative_target = spec.target.strip_prefix("/").unwrap_or(&spec.target);
        let target = rootfs.join(relative_target);
        rootfs::bind_mount(syscall, &spec.source, &target)?;
        if spec.read_only {
            syscall.mount(
                None,
                &target,
                None,
                nix::mount::MsFlags::MS_BIND | nix::mount::MsFlags::MS_REMOUNT | nix::mount::MsFlags::MS_RDONLY,
                None,
            )?;
        }
        mount_log.record(target, nix::mount::MntFlags::MNT_DETACH);
    }

    if config.termux_x11 {
        match hwaccess::bind_termux_tmp_into_rootfs(syscall, rootfs, probe.is_android) {
            Ok(Some(target)) => mount_log.record(target, nix::mount::MntFlags::MNT_DETACH),
            Ok(None) => {}
            Err(err) => tracing::warn!(?err, "termux/x11 bridge mount failed, continuing without it"),
        }
    }

    debug_assert!(
        !mount_log.has_shadowing(),
        "mount log must never record a shallower target after a deeper one"
    );

    channel.send(&PhaseMessage::MountsReady)?;

    syscall.pivot_rootfs(rootfs).map_err(EngineError::PivotFailed)?;
    channel.send(&PhaseMessage::PivotDone)?;

    network::rootfs_phase(syscall, host_command, probe, &config.hostname)?;

    if config.hw_access {
        if let Err(err) = hwaccess::reconcile_gpu_groups(Path::new("/etc/group"), gpu_gids) {
            tracing::warn!(?err, "gpu group reconciliation failed, continuing without it");
        }
    }

    let filter = seccomp::build_filter(probe, config.init_mode.is_systemd())?;
    syscall.set_no_new_privs()?;
    syscall.install_seccomp_filter(&seccomp::to_raw_bytes(&filter))?;
    channel.send(&PhaseMessage::SeccompInstalled)?;

    let pair = tty::terminal_create()?;
    for target in tty::bind_slave_into_rootfs(syscall, Path::new("/"), &pair.slave_path)? {
        mount_log.record(target, nix::mount::MntFlags::MNT_DETACH);
    }
    channel.send_with_fd(&PhaseMessage::ConsoleReady, pair.master.as_raw_fd())?;

    tty::attach_controlling_terminal(pair.slave.as_raw_fd())?;

    syscall.close_range(0)?;

    exec_init(config)
}

fn to_cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| {
        EngineError::InitFailed(crate::syscall::SyscallError::ExecFailed {
            program: s.to_string(),
            errno: nix::errno::Errno::EINVAL,
        })
    })
}

fn exec_init(config: &Config) -> Result<()> {
    let argv = config.init_mode.argv();
    let program = to_cstring(&argv[0])?;
    let c_args = argv.iter().map(|a| to_cstring(a)).collect::<Result<Vec<_>>>()?;
    let c_env = config
        .env
        .iter()
        .map(|(k, v)| to_cstring(&format!("{k}={v}")))
        .collect::<Result<Vec<_>>>()?;

    let errno = nix::unistd::execvpe(&program, &c_args, &c_env).unwrap_err();
    Err(EngineError::InitFailed(crate::syscall::SyscallError::ExecFailed {
        program: argv[0].clone(),
        errno,
    }))
}
