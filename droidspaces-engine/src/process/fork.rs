//! A thin wrapper around `fork()` that makes the child side look like a
//! thread spawn: the callback's `Result` becomes the child's exit code
//! rather than requiring the caller to juggle `ForkResult` directly.

use nix::unistd::{self, Pid};

use crate::error::{EngineError, Result};

pub fn container_fork<F: FnOnce() -> Result<i32>>(cb: F) -> Result<Pid> {
    match unsafe { unistd::fork() }.map_err(|errno| EngineError::Io(std::io::Error::from(errno)))? {
        unistd::ForkResult::Parent { child } => Ok(child),
        unistd::ForkResult::Child => {
            let ret = match cb() {
                Err(err) => {
                    tracing::debug!(?err, "child callback failed");
                    -1
                }
                Ok(ec) => ec,
            };
            std::process::exit(ret);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::{waitpid, WaitStatus};

    #[test]
    fn test_container_fork_propagates_exit_code() {
        let pid = container_fork(|| Ok(0)).unwrap();
        match waitpid(pid, None).expect("waitpid failed") {
            WaitStatus::Exited(p, status) => {
                assert_eq!(pid, p);
                assert_eq!(status, 0);
            }
            other => panic!("unexpected wait status: {other:?}"),
        }
    }

    #[test]
    fn test_container_fork_maps_callback_error_to_nonzero_exit() {
        let pid = container_fork(|| Err(EngineError::ChildExited(-1))).unwrap();
        match waitpid(pid, None).expect("waitpid failed") {
            WaitStatus::Exited(p, status) => {
                assert_eq!(pid, p);
                assert_eq!(status, 255);
            }
            other => panic!("unexpected wait status: {other:?}"),
        }
    }
}
