//! Fork-based test helper: runs a closure in a child process and reports
//! its result (or panic) back to the test thread, since several of the
//! engine's behaviors (namespace handling, pivot_root, PTY handoff) can
//! only be meaningfully exercised from a forked, single-threaded process.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

use nix::sys::wait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct ErrorEnclosure {
    source: Option<Box<ErrorEnclosure>>,
    description: String,
}

impl ErrorEnclosure {
    fn new<T>(e: &T) -> ErrorEnclosure
    where
        T: ?Sized + std::error::Error,
    {
        ErrorEnclosure {
            description: e.to_string(),
            source: e.source().map(|s| Box::new(ErrorEnclosure::new(s))),
        }
    }
}

impl std::fmt::Display for ErrorEnclosure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description)
    }
}

impl std::error::Error for ErrorEnclosure {
    fn source(&self) -> Option<&(dyn 'static + std::error::Error)> {
        self.source.as_ref().map(|source| &**source as &(dyn 'static + std::error::Error))
    }
}

type ClosureResult = Result<(), ErrorEnclosure>;

#[derive(Debug, thiserror::Error)]
pub enum TestError {
    #[error("failed to create socketpair: {0}")]
    Socketpair(#[source] std::io::Error),
    #[error("failed to fork: {0}")]
    Fork(#[source] nix::Error),
    #[error("failed to wait for child process: {0}")]
    Wait(#[source] nix::Error),
    #[error("failed to exchange result with child process: {0}")]
    Transport(#[source] std::io::Error),
    #[error("failed to run function in child process")]
    Execution(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("the closure caused the child process to panic")]
    Panic,
}

#[derive(Debug, thiserror::Error)]
pub enum TestCallbackError {
    #[error("{0}")]
    Custom(String),
    #[error("{0:?}")]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl From<&str> for TestCallbackError {
    fn from(s: &str) -> Self {
        TestCallbackError::Custom(s.to_string())
    }
}

impl From<String> for TestCallbackError {
    fn from(s: String) -> Self {
        TestCallbackError::Custom(s)
    }
}

fn send<T: Serialize>(stream: &mut UnixStream, value: &T) -> std::io::Result<()> {
    let body = serde_json::to_vec(value).expect("test payload must serialize");
    stream.write_all(&(body.len() as u32).to_le_bytes())?;
    stream.write_all(&body)
}

fn recv<T: DeserializeOwned>(stream: &mut UnixStream) -> std::io::Result<T> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let mut body = vec![0u8; u32::from_le_bytes(len_buf) as usize];
    stream.read_exact(&mut body)?;
    Ok(serde_json::from_slice(&body).expect("test payload must deserialize"))
}

/// Runs `cb` in a forked child process, returning its result (or a
/// `TestError::Panic` if it panicked) in the calling process.
pub fn test_in_child_process<F>(cb: F) -> Result<(), TestError>
where
    F: FnOnce() -> Result<(), TestCallbackError> + std::panic::UnwindSafe,
{
    let (mut parent_sock, mut child_sock) =
        UnixStream::pair().map_err(TestError::Socketpair)?;

    match unsafe { nix::unistd::fork() }.map_err(TestError::Fork)? {
        nix::unistd::ForkResult::Parent { child } => {
            drop(child_sock);
            let result: ClosureResult = recv(&mut parent_sock).map_err(TestError::Transport)?;
            wait::waitpid(child, None).map_err(TestError::Wait)?;
            result.map_err(|err| TestError::Execution(Box::new(err)))?;
        }
        nix::unistd::ForkResult::Child => {
            drop(parent_sock);
            let test_result: ClosureResult = match std::panic::catch_unwind(cb) {
                Ok(ret) => ret.map_err(|err| ErrorEnclosure::new(&err)),
                Err(_) => Err(ErrorEnclosure::new(&TestError::Panic)),
            };
            let _ = send(&mut child_sock, &test_result);
            std::process::exit(0);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_process_reports_callback_error() {
        let ret = test_in_child_process(|| Err(TestCallbackError::Custom("test error".to_string())));
        assert!(ret.is_err());
    }

    #[test]
    fn test_child_process_reports_success() {
        let ret = test_in_child_process(|| Ok(()));
        assert!(ret.is_ok());
    }

    #[test]
    fn test_panic_child_process_is_reported_as_error() {
        let ret = test_in_child_process(|| {
            panic!("test panic");
        });
        assert!(ret.is_err());
    }
}
