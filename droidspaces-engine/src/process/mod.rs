//! Process primitives: a `fork()` wrapper that makes the child side easy to
//! reason about, the parent/child phase-sync channel, and the child-side
//! boot sequence that runs between `fork()` and `exec()`.

pub mod channel;
pub mod fork;
pub mod init;

pub use fork::container_fork;
