//! Lifecycle orchestrator (§4.H): the state machine that drives a container
//! from `created` through `running` to `destroyed`, tying together the
//! mount engine, namespace construction, the child boot sequence, and the
//! phase-sync channel. Structured the way the teacher structures its
//! `container_main_process`/`Container` split — a supervisor that forks a
//! single child and exchanges phase messages with it — simplified down to a
//! single fork since droidspaces assumes `CAP_SYS_ADMIN` and has no
//! rootless/user-namespace concern to juggle.

use std::collections::BTreeSet;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::host_command::HostCommand;
use crate::namespaces;
use crate::platform::PlatformProbe;
use crate::process::channel::{Channel, PhaseMessage};
use crate::process::{container_fork, init};
use crate::rootfs::{self, MountLog};
use crate::syscall::Syscall;
use crate::{hwaccess, network};

/// Grace period between `SIGTERM` and `SIGKILL` when stopping a container
/// whose init does not exit on its own (§4.H "running" → "stopping").
const STOP_GRACE: Duration = Duration::from_secs(5);

/// `Instance::phase` (§3 Data model). Advances monotonically (I3); no
/// transition skips `Pivoting` before `Booting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Created,
    Mounting,
    Pivoting,
    Booting,
    Running,
    Stopping,
    Destroyed,
}

/// Runtime state for a booted (or booting) container (§3 Data model). The
/// PTY fds are process-local and not meaningfully serializable; only
/// `tty_slaves` (device names) would cross a persistence boundary, were
/// `Instance` reloaded from disk rather than held live by the process that
/// booted it.
pub struct Instance {
    pub pid: Option<Pid>,
    pub rootfs_mount: PathBuf,
    pub console_master: Option<OwnedFd>,
    pub tty_slaves: Vec<PathBuf>,
    pub gpu_gids: BTreeSet<u32>,
    pub kernel_major: u32,
    pub kernel_minor: u32,
    pub phase: Phase,

    /// Whether this run created the Termux tmpfs bridge (as opposed to
    /// finding one already mounted) — only an owner tears it down (§5
    /// Resources).
    termux_bridge_owned: bool,
    /// Set when `config.rootfs` was an image file and the host phase loop-
    /// mounted it; `destroy` unmounts exactly this path.
    image_mount_point: Option<PathBuf>,
}

impl Instance {
    fn new(probe: &PlatformProbe) -> Self {
        Instance {
            pid: None,
            rootfs_mount: PathBuf::new(),
            console_master: None,
            tty_slaves: Vec::new(),
            gpu_gids: BTreeSet::new(),
            kernel_major: probe.kernel.major,
            kernel_minor: probe.kernel.minor,
            phase: Phase::Created,
            termux_bridge_owned: false,
            image_mount_point: None,
        }
    }
}

/// `create` (§6): validates `config` and persists it under
/// `<workspace>/containers/<name>/config`. Does not touch the kernel at all
/// — namespace/mount construction only happens in `boot`.
pub fn create(config: &Config, workspace: &Path) -> Result<()> {
    config.validate()?;
    let container_dir = container_dir(workspace, &config.container_name);
    crate::utils::mkdir_p(&container_dir, 0o700)?;
    config.save(&container_dir)?;
    Ok(())
}

pub fn container_dir(workspace: &Path, name: &str) -> PathBuf {
    workspace.join("containers").join(name)
}

/// `run/<name>.pid` (§6 persisted state layout): where the supervisor
/// writes the booted init's pid so a later `stop`/`enter`/`destroy`
/// invocation (a fresh process) can find it.
pub fn pid_file_path(workspace: &Path, name: &str) -> PathBuf {
    workspace.join("run").join(format!("{name}.pid"))
}

/// `run/<name>.sock` (§6): the supervisor's PTY-attach socket path. The
/// engine only names the path here; the socket itself is owned and served
/// by the CLI's `start` supervisor loop (§5: "independent processes attached
/// through a named UNIX socket").
pub fn sock_file_path(workspace: &Path, name: &str) -> PathBuf {
    workspace.join("run").join(format!("{name}.sock"))
}

/// Reads the persisted pid file for `name` (§6's `run/<name>.pid`) and
/// returns the pid only if it still names a live process. Used by a fresh
/// CLI invocation (`start`/`stop`/`destroy`) that has nothing but this file
/// to go on — in particular, `start` uses this to tell an already-running
/// container apart from one that needs booting, so it can reattach to the
/// existing console socket instead of calling `boot` a second time.
pub fn running_pid(workspace: &Path, name: &str) -> Option<Pid> {
    let contents = std::fs::read_to_string(pid_file_path(workspace, name)).ok()?;
    let raw: i32 = contents.trim().parse().ok()?;
    let pid = Pid::from_raw(raw);
    pid_is_alive(pid).then_some(pid)
}

/// Best-effort `destroy` for the CLI's `destroy` subcommand, invoked as a
/// fresh process with no live `Instance`: signals the persisted pid (if
/// still alive), unmounts the image rootfs mount point and the Termux
/// bridge if present (both mount calls are idempotent — `EBUSY`/ENOENT are
/// swallowed, matching `domount`'s contract), then removes the container's
/// persisted directory and pid/sock files.
pub fn destroy_by_name(
    syscall: &dyn Syscall,
    host_command: &dyn HostCommand,
    workspace: &Path,
    name: &str,
) -> Result<()> {
    let pid_path = pid_file_path(workspace, name);
    if let Some(pid) = running_pid(workspace, name) {
        signal_stop(pid)?;
    }

    let cdir = container_dir(workspace, name);
    if let Ok(config) = Config::load(&cdir) {
        if config.rootfs_is_image() {
            if let Some(stem) = config.rootfs.file_stem().and_then(|s| s.to_str()) {
                let mount_point = workspace.join("mounts").join(stem);
                if mount_point.exists() {
                    rootfs::unmount_rootfs_img(syscall, host_command, &mount_point)?;
                }
            }
        }
        if config.termux_x11 {
            let termux_path = hwaccess::termux_tmp_path();
            if let Err(err) = syscall.umount2(&termux_path, nix::mount::MntFlags::MNT_DETACH) {
                tracing::debug!(?err, "termux bridge was not mounted (or already torn down), ignoring");
            }
        }
    }

    let _ = std::fs::remove_file(&pid_path);
    let _ = std::fs::remove_file(sock_file_path(workspace, name));
    if cdir.exists() {
        std::fs::remove_dir_all(&cdir).map_err(EngineError::Io)?;
    }

    Ok(())
}

/// `boot` (§4.H: created → mounting → pivoting → booting → running).
///
/// Runs entirely in the calling (supervisor) process up through `fork()`;
/// everything from "new namespaces" onward happens in the forked child,
/// synchronized back to this function via `channel`. Returns once the child
/// has signaled `ConsoleReady`, handing back a `running`-phase `Instance`
/// whose `pid` is the booted init.
pub fn boot(
    syscall: &dyn Syscall,
    host_command: &dyn HostCommand,
    probe: &PlatformProbe,
    config: &Config,
    workspace: &Path,
) -> Result<Instance> {
    let mut instance = Instance::new(probe);

    // --- created -> mounting: host phase (O1: namespaces precede mounts). ---
    network::host_phase(host_command, probe, config.enable_ipv6)?;

    // I1/O4: the GPU GID scan runs here, before any namespace is created and
    // while the host's real /dev is still what every path resolves to.
    instance.gpu_gids = if config.hw_access { hwaccess::scan_gpu_group_ids() } else { BTreeSet::new() };

    if config.termux_x11 {
        match hwaccess::ensure_termux_bridge(syscall, host_command) {
            Ok(owned) => instance.termux_bridge_owned = owned,
            Err(err) => tracing::warn!(?err, "termux tmpfs bridge setup failed, continuing without it"),
        }
    }

    let rootfs = if config.rootfs_is_image() {
        let mount_point = rootfs::mount_rootfs_img(syscall, host_command, workspace, &config.rootfs)?;
        instance.image_mount_point = Some(mount_point.clone());
        mount_point
    } else {
        config.rootfs.clone()
    };
    instance.rootfs_mount = rootfs.clone();
    instance.phase = Phase::Mounting;

    namespaces::unshare_namespaces(syscall, rootfs::cgroup::host_has_unified_cgroup())?;

    // --- mounting -> pivoting -> booting -> running: the forked child. ---
    let (parent_channel, child_channel) = Channel::pair().map_err(|err| {
        EngineError::Io(std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))
    })?;

    let mut boot_config = config.clone();
    boot_config.rootfs = rootfs;
    let gpu_gids = instance.gpu_gids.clone();
    let probe = *probe;

    let child_syscall_type = crate::syscall::SyscallType::default();
    // `child_channel` moves into the closure; the child's own fork()-inherited
    // duplicate of `parent_channel`'s fd is closed before exec by
    // `Syscall::close_range` in `process::init::run`, not here.
    let pid = container_fork(move || {
        let child_syscall = child_syscall_type.create_syscall();
        let host_command = crate::host_command::SystemHostCommand;
        match init::run(child_syscall.as_ref(), &host_command, &probe, &boot_config, &gpu_gids, &child_channel) {
            Ok(()) => Ok(0),
            Err(err) => {
                tracing::error!(?err, "init child exited with error");
                Err(err)
            }
        }
    })?;
    instance.pid = Some(pid);

    loop {
        match parent_channel.recv() {
            Ok(PhaseMessage::NamespacesReady) => instance.phase = Phase::Mounting,
            Ok(PhaseMessage::MountsReady) => instance.phase = Phase::Pivoting,
            Ok(PhaseMessage::PivotDone) => instance.phase = Phase::Booting,
            Ok(PhaseMessage::SeccompInstalled) => {}
            Ok(PhaseMessage::ConsoleReady) => {
                // Unreachable: ConsoleReady always arrives via recv_with_fd
                // below. Kept so the match stays exhaustive as a safety net.
                instance.phase = Phase::Running;
                break;
            }
            Ok(PhaseMessage::InitExecFailed(reason)) => {
                let _ = waitpid(pid, Some(WaitPidFlag::empty()));
                tracing::error!(reason, "init reported exec failure");
                return Err(EngineError::InitFailed(crate::syscall::SyscallError::ExecFailed {
                    program: boot_program_name(config),
                    errno: nix::errno::Errno::ECHILD,
                }));
            }
            Err(_) => {
                let _ = waitpid(pid, Some(WaitPidFlag::empty()));
                return Err(EngineError::ChildExited(-1));
            }
        }

        if instance.phase == Phase::Booting {
            let (msg, fd) = parent_channel.recv_with_fd().map_err(|err| {
                EngineError::Io(std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))
            })?;
            match msg {
                PhaseMessage::ConsoleReady => {
                    instance.console_master = fd;
                    instance.phase = Phase::Running;
                    break;
                }
                PhaseMessage::InitExecFailed(reason) => {
                    let _ = waitpid(pid, Some(WaitPidFlag::empty()));
                    tracing::error!(reason, "init reported exec failure");
                    return Err(EngineError::InitFailed(crate::syscall::SyscallError::ExecFailed {
                        program: boot_program_name(config),
                        errno: nix::errno::Errno::ECHILD,
                    }));
                }
                other => {
                    tracing::warn!(?other, "unexpected message while awaiting console handoff");
                }
            }
        }
    }

    instance.tty_slaves = crate::tty::TTY_TARGETS
        .iter()
        .map(|name| Path::new("dev").join(name))
        .collect();

    Ok(instance)
}

fn boot_program_name(config: &Config) -> String {
    config.init_mode.argv().into_iter().next().unwrap_or_default()
}

/// `stop` (§4.H: running → stopping): `SIGTERM`, wait up to `STOP_GRACE`,
/// then `SIGKILL` if init has not exited.
pub fn stop(instance: &mut Instance) -> Result<()> {
    let Some(pid) = instance.pid else {
        return Ok(());
    };
    instance.phase = Phase::Stopping;
    signal_stop(pid)?;
    instance.pid = None;
    Ok(())
}

/// `SIGTERM`-then-`SIGKILL`-after-grace against a bare pid, with no
/// `Instance` available. Used both by `stop` above (same process that
/// booted the container) and directly by the CLI's `stop`/`destroy`
/// subcommands, which run as a fresh process that only has the pid
/// persisted under `run/<name>.pid` (§6) to go on.
pub fn signal_stop(pid: Pid) -> Result<()> {
    signal::kill(pid, Signal::SIGTERM).map_err(|errno| EngineError::Io(std::io::Error::from(errno)))?;

    let deadline = std::time::Instant::now() + STOP_GRACE;
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                if std::time::Instant::now() >= deadline {
                    let _ = signal::kill(pid, Signal::SIGKILL);
                    let _ = waitpid(pid, None);
                    break;
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            Ok(_) => break,
            Err(nix::errno::Errno::ECHILD) => break,
            Err(errno) => return Err(EngineError::Io(std::io::Error::from(errno))),
        }
    }

    Ok(())
}

/// True if `pid` still names a live process, used by the CLI to decide
/// whether a persisted pid file refers to a container that is still
/// running before attempting to signal it.
pub fn pid_is_alive(pid: Pid) -> bool {
    signal::kill(pid, None).is_ok()
}

/// `destroy` (§4.H: stopping → destroyed; §5 Resources): unmounts the
/// Termux bridge only if this run created it, unmounts an image rootfs if
/// one was loop-mounted, and closes the PTY master.
pub fn destroy(
    syscall: &dyn Syscall,
    host_command: &dyn HostCommand,
    workspace: &Path,
    instance: &mut Instance,
) -> Result<()> {
    if instance.phase == Phase::Running || instance.phase == Phase::Booting {
        stop(instance)?;
    }

    if instance.termux_bridge_owned {
        let path = hwaccess::termux_tmp_path();
        if let Err(err) = syscall.umount2(&path, nix::mount::MntFlags::MNT_DETACH) {
            tracing::warn!(?err, "failed to unmount termux tmpfs bridge during destroy");
        }
        instance.termux_bridge_owned = false;
    }

    if let Some(mount_point) = instance.image_mount_point.take() {
        rootfs::unmount_rootfs_img(syscall, host_command, &mount_point)?;
    }

    instance.console_master = None;
    let _ = workspace;
    instance.phase = Phase::Destroyed;
    Ok(())
}

/// `enter` (§6): opens a new session attached to the running container's
/// init by joining its namespaces via `/proc/<pid>/ns/*` and `setns`, then
/// `fork`+`exec`ing the requested command (defaulting to a login shell).
pub fn exec_enter(instance: &Instance, argv: &[String]) -> Result<Pid> {
    let Some(pid) = instance.pid else {
        return Err(EngineError::ChildExited(-1));
    };
    exec_enter_pid(pid, argv)
}

/// Pid-based variant of `exec_enter`, for the CLI's `enter` subcommand,
/// which runs as a fresh process with only the persisted init pid (§6's
/// `run/<name>.pid`) and no in-memory `Instance` to draw on.
pub fn exec_enter_pid(pid: Pid, argv: &[String]) -> Result<Pid> {
    let ns_dir = crate::utils::procfs_path(pid.as_raw(), "ns");
    let ns_order = ["ipc", "uts", "net", "pid", "mnt"];

    container_fork(move || {
        for ns in ns_order {
            let ns_path = ns_dir.join(ns);
            let fd = nix::fcntl::open(&ns_path, nix::fcntl::OFlag::O_RDONLY, nix::sys::stat::Mode::empty())
                .map_err(|errno| EngineError::Io(std::io::Error::from(errno)))?;
            let res = nix::sched::setns(&fd, nix::sched::CloneFlags::empty());
            let _ = nix::unistd::close(fd);
            res.map_err(|errno| EngineError::Io(std::io::Error::from(errno)))?;
        }

        let program = std::ffi::CString::new(argv[0].clone()).map_err(|_| EngineError::ChildExited(-1))?;
        let c_args = argv
            .iter()
            .map(|a| std::ffi::CString::new(a.clone()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| EngineError::ChildExited(-1))?;
        let errno = nix::unistd::execvp(&program, &c_args).unwrap_err();
        Err(EngineError::Io(std::io::Error::from(errno)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_serializes_snake_case() {
        let json = serde_json::to_string(&Phase::Mounting).unwrap();
        assert_eq!(json, "\"mounting\"");
    }

    #[test]
    fn test_container_dir_layout() {
        let dir = container_dir(Path::new("/data/droidspaces"), "alpine");
        assert_eq!(dir, PathBuf::from("/data/droidspaces/containers/alpine"));
    }

    #[test]
    fn test_instance_starts_in_created_phase() {
        let probe = PlatformProbe {
            is_android: false,
            kernel: crate::platform::KernelVersion { major: 5, minor: 10 },
        };
        let instance = Instance::new(&probe);
        assert_eq!(instance.phase, Phase::Created);
        assert!(instance.pid.is_none());
        assert!(instance.gpu_gids.is_empty());
    }

    #[test]
    fn test_pid_file_path_layout() {
        let path = pid_file_path(Path::new("/data/droidspaces"), "alpine");
        assert_eq!(path, PathBuf::from("/data/droidspaces/run/alpine.pid"));
    }

    #[test]
    fn test_sock_file_path_layout() {
        let path = sock_file_path(Path::new("/data/droidspaces"), "alpine");
        assert_eq!(path, PathBuf::from("/data/droidspaces/run/alpine.sock"));
    }

    #[test]
    fn test_pid_is_alive_for_current_process() {
        assert!(pid_is_alive(nix::unistd::getpid()));
    }

    #[test]
    fn test_destroy_by_name_is_a_noop_for_unknown_container() {
        let tmp = tempfile::tempdir().unwrap();
        let syscall = crate::syscall::test::TestHelperSyscall::default();
        let host_command = crate::host_command::test::RecordingHostCommand::default();
        let result = destroy_by_name(&syscall, &host_command, tmp.path(), "never-created");
        assert!(result.is_ok());
    }

    #[test]
    fn test_running_pid_is_none_for_missing_pid_file() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(running_pid(tmp.path(), "never-created").is_none());
    }

    #[test]
    fn test_running_pid_returns_some_for_own_live_pid() {
        let tmp = tempfile::tempdir().unwrap();
        let pid_path = pid_file_path(tmp.path(), "alpine");
        std::fs::create_dir_all(pid_path.parent().unwrap()).unwrap();
        std::fs::write(&pid_path, nix::unistd::getpid().to_string()).unwrap();
        assert_eq!(running_pid(tmp.path(), "alpine"), Some(nix::unistd::getpid()));
    }

    #[test]
    fn test_running_pid_is_none_for_stale_pid() {
        let tmp = tempfile::tempdir().unwrap();
        let pid_path = pid_file_path(tmp.path(), "alpine");
        std::fs::create_dir_all(pid_path.parent().unwrap()).unwrap();
        // pid 999999 is never a real process in any sandboxed test environment.
        std::fs::write(&pid_path, "999999").unwrap();
        assert!(running_pid(tmp.path(), "alpine").is_none());
    }
}
