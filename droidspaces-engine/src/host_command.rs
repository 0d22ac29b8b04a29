//! `HostCommand` (§9 design note): the collaborator that models shelling
//! out to host binaries (`iptables`, `e2fsck`, `am`, `pkill`, `getprop`,
//! a lazy `umount`). Everything that has a kernel-syscall equivalent
//! (mount, loop-control, namespace, pivot_root) goes through `Syscall`
//! instead; `HostCommand` exists only for the handful of operations this
//! corpus has no raw-syscall path for.

use std::process::{ExitStatus, Output};

#[derive(Debug, thiserror::Error)]
pub enum HostCommandError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

type Result<T> = std::result::Result<T, HostCommandError>;

/// Abstracts "run this host binary with these arguments" so unit tests can
/// assert on the sequence and arguments without a real shell, a real
/// `iptables`, or a real Android `getprop`.
pub trait HostCommand {
    fn run(&self, program: &str, args: &[&str]) -> Result<ExitStatus>;

    /// Like `run`, but captures stdout — used for `getprop` reads.
    fn output(&self, program: &str, args: &[&str]) -> Result<Output>;
}

/// Production implementation: spawns the named binary and waits for it.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHostCommand;

impl HostCommand for SystemHostCommand {
    fn run(&self, program: &str, args: &[&str]) -> Result<ExitStatus> {
        std::process::Command::new(program)
            .args(args)
            .status()
            .map_err(|source| HostCommandError::Spawn {
                program: program.to_string(),
                source,
            })
    }

    fn output(&self, program: &str, args: &[&str]) -> Result<Output> {
        std::process::Command::new(program)
            .args(args)
            .output()
            .map_err(|source| HostCommandError::Spawn {
                program: program.to_string(),
                source,
            })
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod test {
    use super::*;
    use std::cell::RefCell;
    use std::os::unix::process::ExitStatusExt;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct RecordedCall {
        pub program: String,
        pub args: Vec<String>,
    }

    /// A recording fake: every `run`/`output` call is logged, and callers
    /// can pre-program canned stdout for `output` calls keyed by program
    /// name so `getprop`-style probes can be tested deterministically.
    #[derive(Debug, Default)]
    pub struct RecordingHostCommand {
        calls: RefCell<Vec<RecordedCall>>,
        canned_stdout: RefCell<std::collections::HashMap<String, Vec<String>>>,
    }

    impl RecordingHostCommand {
        pub fn calls(&self) -> Vec<RecordedCall> {
            self.calls.borrow().clone()
        }

        /// Queues successive stdout responses for `program`; each call to
        /// `output` for that program pops the next queued response (or an
        /// empty string once the queue is drained).
        pub fn queue_stdout(&self, program: &str, stdout: impl Into<String>) {
            self.canned_stdout
                .borrow_mut()
                .entry(program.to_string())
                .or_default()
                .push(stdout.into());
        }
    }

    impl HostCommand for RecordingHostCommand {
        fn run(&self, program: &str, args: &[&str]) -> Result<ExitStatus> {
            self.calls.borrow_mut().push(RecordedCall {
                program: program.to_string(),
                args: args.iter().map(|s| s.to_string()).collect(),
            });
            Ok(ExitStatus::from_raw(0))
        }

        fn output(&self, program: &str, args: &[&str]) -> Result<Output> {
            self.calls.borrow_mut().push(RecordedCall {
                program: program.to_string(),
                args: args.iter().map(|s| s.to_string()).collect(),
            });
            let stdout = self
                .canned_stdout
                .borrow_mut()
                .get_mut(program)
                .filter(|q| !q.is_empty())
                .map(|q| q.remove(0))
                .unwrap_or_default();
            Ok(Output {
                status: ExitStatus::from_raw(0),
                stdout: stdout.into_bytes(),
                stderr: Vec::new(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test::RecordingHostCommand;
    use super::*;

    #[test]
    fn test_recording_host_command_logs_calls_in_order() {
        let cmd = RecordingHostCommand::default();
        cmd.run("iptables", &["-t", "nat", "-A", "POSTROUTING"]).unwrap();
        cmd.run("e2fsck", &["-f", "-y", "/dev/loop0"]).unwrap();
        let calls = cmd.calls();
        assert_eq!(calls[0].program, "iptables");
        assert_eq!(calls[1].program, "e2fsck");
    }

    #[test]
    fn test_recording_host_command_returns_queued_stdout() {
        let cmd = RecordingHostCommand::default();
        cmd.queue_stdout("getprop", "8.8.4.4\n");
        let out = cmd.output("getprop", &["net.dns1"]).unwrap();
        assert_eq!(String::from_utf8(out.stdout).unwrap(), "8.8.4.4\n");
    }

    #[test]
    fn test_recording_host_command_empty_queue_yields_empty_stdout() {
        let cmd = RecordingHostCommand::default();
        let out = cmd.output("getprop", &["net.dns1"]).unwrap();
        assert!(out.stdout.is_empty());
    }
}
