//! `start` (§6): boots a previously `create`d container and bridges the
//! invoking terminal to the console PTY until init exits or the supervisor
//! is asked to stop. This is the command that actually drives the engine's
//! `boot` state machine (created → … → running) and, at the end, `stop`
//! plus `destroy` (§4.H running → stopping → destroyed).
//!
//! If the container is already running (its persisted pid is still alive),
//! `start` does not boot a second time — it attaches to the existing
//! supervisor's console socket instead (§6: "attaches to existing PTY";
//! §5: "independent processes attached through a named UNIX socket").

use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use nix::fcntl::{fcntl, FcntlArg};

use droidspaces_engine::config::Config;
use droidspaces_engine::container::{self, Phase};
use droidspaces_engine::host_command::SystemHostCommand;
use droidspaces_engine::platform;
use droidspaces_engine::syscall;
use droidspaces_engine::tty::RawTerminalGuard;

/// Boot a previously created container and attach to its console.
#[derive(Parser, Debug)]
pub struct Start {
    /// Container name, as given to `create`.
    #[clap(long = "name", short = 'n')]
    pub name: String,
}

impl Start {
    pub fn exec(&self, workspace: PathBuf) -> Result<()> {
        if container::running_pid(&workspace, &self.name).is_some() {
            tracing::info!(name = %self.name, "container already running, attaching to its console");
            return attach_to_running(&workspace, &self.name);
        }

        let container_dir = container::container_dir(&workspace, &self.name);
        let config = Config::load(&container_dir)
            .with_context(|| format!("container {:?} was not found; run create first", self.name))?;

        let syscall = syscall::create_syscall();
        let host_command = SystemHostCommand;
        let probe = platform::probe();

        let mut instance = container::boot(syscall.as_ref(), &host_command, &probe, &config, &workspace)
            .with_context(|| format!("failed to boot container {}", self.name))?;

        if let Some(pid) = instance.pid {
            let pid_path = container::pid_file_path(&workspace, &self.name);
            if let Some(parent) = pid_path.parent() {
                let _ = droidspaces_engine::utils::mkdir_p(parent, 0o700);
            }
            let _ = std::fs::write(&pid_path, pid.to_string());
        }

        tracing::info!(name = %self.name, pid = ?instance.pid, "container running");

        let sock_path = container::sock_file_path(&workspace, &self.name);
        match instance.console_master.as_ref() {
            Some(master) => {
                if let Err(err) = spawn_console_server(&sock_path, master) {
                    tracing::warn!(?err, "failed to start console attach socket, reattaching will not be possible");
                }
            }
            None => tracing::warn!("container booted without a console master fd, no attach socket started"),
        }

        bridge_console(&mut instance)?;

        let _ = std::fs::remove_file(&sock_path);
        let _ = container::destroy(syscall.as_ref(), &host_command, &workspace, &mut instance);
        let _ = std::fs::remove_file(container::pid_file_path(&workspace, &self.name));

        Ok(())
    }
}

/// Duplicates `fd` with `CLOEXEC` set, the same `F_DUPFD_CLOEXEC` idiom used
/// throughout the corpus for handing a kernel fd to a second consumer
/// without the original being affected by the duplicate's lifetime.
fn dup_cloexec(fd: RawFd) -> std::io::Result<OwnedFd> {
    let dup = fcntl(fd, FcntlArg::F_DUPFD_CLOEXEC(3)).map_err(std::io::Error::from)?;
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

/// Binds `sock_path` (§6's `run/<name>.sock`) and serves it in a background
/// thread for the lifetime of this process: each connecting client is
/// bridged to its own duplicate of the console master until it disconnects,
/// so a later `start --name N` invocation against the same (still running)
/// container can reattach without rebooting it. Runs alongside this
/// invocation's own foreground `bridge_console` loop, which owns the
/// original master fd.
fn spawn_console_server(sock_path: &Path, master: &OwnedFd) -> Result<()> {
    let _ = std::fs::remove_file(sock_path);
    if let Some(parent) = sock_path.parent() {
        let _ = droidspaces_engine::utils::mkdir_p(parent, 0o700);
    }
    let listener =
        UnixListener::bind(sock_path).with_context(|| format!("failed to bind console socket {sock_path:?}"))?;
    let master = dup_cloexec(master.as_raw_fd()).context("failed to duplicate console master fd")?;

    std::thread::spawn(move || {
        for conn in listener.incoming() {
            let Ok(stream) = conn else { continue };
            let Ok(master_dup) = dup_cloexec(master.as_raw_fd()) else { continue };
            if let Err(err) = bridge_stream(stream, master_dup) {
                tracing::debug!(?err, "console attach session ended");
            }
        }
    });

    Ok(())
}

/// Copies bytes between a reattached client's socket and a duplicate of the
/// console master until either side hits EOF — the same shape as
/// `bridge_console`'s stdio loop, applied to a `UnixStream` instead of this
/// process's own stdin/stdout.
fn bridge_stream(stream: UnixStream, master: OwnedFd) -> std::io::Result<()> {
    let mut master_read = std::fs::File::from(master);
    let mut master_write = master_read.try_clone()?;
    let mut stream_read = stream.try_clone()?;
    let mut stream_write = stream;

    let reader = std::thread::spawn(move || -> std::io::Result<()> {
        let mut buf = [0u8; 4096];
        loop {
            let n = master_read.read(&mut buf)?;
            if n == 0 {
                break;
            }
            stream_write.write_all(&buf[..n])?;
        }
        Ok(())
    });

    let mut buf = [0u8; 4096];
    loop {
        let n = match stream_read.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if master_write.write_all(&buf[..n]).is_err() {
            break;
        }
    }

    let _ = reader.join();
    Ok(())
}

/// Attaches to an already-running container's console over its persisted
/// `run/<name>.sock`, bridging this process's own stdio the same way
/// `bridge_console` bridges it to a freshly booted one.
fn attach_to_running(workspace: &Path, name: &str) -> Result<()> {
    let sock_path = container::sock_file_path(workspace, name);
    let stream = UnixStream::connect(&sock_path).with_context(|| {
        format!("container {name:?} is running but its console socket {sock_path:?} is unreachable")
    })?;

    let stdin_fd = std::io::stdin().as_raw_fd();
    let _raw_guard = RawTerminalGuard::apply(stdin_fd).ok();

    let mut stream_read = stream.try_clone().context("failed to dup console socket")?;
    let mut stream_write = stream;

    let reader = std::thread::spawn(move || -> std::io::Result<()> {
        let mut buf = [0u8; 4096];
        let mut stdout = std::io::stdout();
        loop {
            let n = stream_read.read(&mut buf)?;
            if n == 0 {
                break;
            }
            stdout.write_all(&buf[..n])?;
            stdout.flush()?;
        }
        Ok(())
    });

    let mut stdin = std::io::stdin();
    let mut buf = [0u8; 4096];
    loop {
        let n = match stdin.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if stream_write.write_all(&buf[..n]).is_err() {
            break;
        }
    }

    let _ = reader.join();
    Ok(())
}

/// Copies bytes between the invoking process's own stdio and the
/// container's console PTY master until either side hits EOF, putting the
/// supervisor's own terminal (if it has one) into raw mode for the
/// duration (§4.G). Not a full multiplexer — good enough for a single
/// foreground attach, matching the one-console-per-container model.
fn bridge_console(instance: &mut container::Instance) -> Result<()> {
    let Some(master) = instance.console_master.take() else {
        anyhow::bail!("container booted without a console master fd");
    };

    let stdin_fd = std::io::stdin().as_raw_fd();
    let _raw_guard = RawTerminalGuard::apply(stdin_fd).ok();

    let mut master_read = std::fs::File::from(master);
    let mut master_write = master_read.try_clone().context("failed to dup console master fd")?;

    let reader = std::thread::spawn(move || -> std::io::Result<()> {
        let mut buf = [0u8; 4096];
        let mut stdout = std::io::stdout();
        loop {
            let n = master_read.read(&mut buf)?;
            if n == 0 {
                break;
            }
            stdout.write_all(&buf[..n])?;
            stdout.flush()?;
        }
        Ok(())
    });

    let mut stdin = std::io::stdin();
    let mut buf = [0u8; 4096];
    loop {
        let n = match stdin.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if master_write.write_all(&buf[..n]).is_err() {
            break;
        }
    }

    let _ = reader.join();

    if let Some(pid) = instance.pid {
        let status = nix::sys::wait::waitpid(pid, None);
        tracing::debug!(?status, "init process exited");
    }
    instance.phase = Phase::Stopping;

    Ok(())
}
