//! Parent/child phase-sync IPC (§4.H): a `socketpair(AF_UNIX, SOCK_SEQPACKET)`
//! carrying length-prefixed `serde_json` frames, with `SCM_RIGHTS` support for
//! handing the PTY master fd from the child (which creates it inside the
//! new mount namespace's devpts) back to the parent supervisor.

use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{self, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("failed to create socketpair: {0}")]
    CreateSocketpair(#[source] nix::Error),
    #[error("failed to send frame: {0}")]
    Send(#[source] nix::Error),
    #[error("failed to receive frame: {0}")]
    Recv(#[source] nix::Error),
    #[error("peer closed the channel")]
    Closed,
    #[error("failed to (de)serialize frame: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("frame exceeds maximum size ({0} bytes)")]
    FrameTooLarge(usize),
}

type Result<T> = std::result::Result<T, ChannelError>;

/// The phase-boundary messages exchanged between parent (supervisor) and
/// child (future init) during boot. The orchestrator's state machine
/// (§4.H) blocks on these at each transition rather than relying on timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PhaseMessage {
    NamespacesReady,
    MountsReady,
    PivotDone,
    SeccompInstalled,
    /// Sent by the child alongside the PTY master fd via `SCM_RIGHTS`.
    ConsoleReady,
    InitExecFailed(String),
}

const MAX_FRAME_LEN: usize = 4096;

/// One end of the `socketpair`. Parent and child each hold one; the type is
/// symmetric since either side can send or receive at any phase boundary.
pub struct Channel {
    fd: OwnedFd,
}

impl Channel {
    /// Creates a connected pair. The caller splits them across `fork()`;
    /// one half survives in the parent, the other in the child.
    pub fn pair() -> Result<(Channel, Channel)> {
        let (a, b) = socket::socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::empty(),
        )
        .map_err(ChannelError::CreateSocketpair)?;
        Ok((Channel { fd: a }, Channel { fd: b }))
    }

    pub fn send(&self, msg: &PhaseMessage) -> Result<()> {
        let body = serde_json::to_vec(msg)?;
        if body.len() > MAX_FRAME_LEN {
            return Err(ChannelError::FrameTooLarge(body.len()));
        }
        socket::send(self.fd.as_raw_fd(), &body, MsgFlags::empty()).map_err(ChannelError::Send)?;
        Ok(())
    }

    /// Sends `msg` plus `fd` in the same datagram's ancillary data, per
    /// `SCM_RIGHTS`. `fd` is not closed by this call; the caller still owns
    /// it (and, per the PTY contract, keeps its own copy open).
    pub fn send_with_fd(&self, msg: &PhaseMessage, fd: RawFd) -> Result<()> {
        let body = serde_json::to_vec(msg)?;
        if body.len() > MAX_FRAME_LEN {
            return Err(ChannelError::FrameTooLarge(body.len()));
        }
        let iov = [IoSlice::new(&body)];
        let fds = [fd];
        let cmsg = ControlMessage::ScmRights(&fds);
        socket::sendmsg::<()>(self.fd.as_raw_fd(), &iov, &[cmsg], MsgFlags::empty(), None)
            .map_err(ChannelError::Send)?;
        Ok(())
    }

    pub fn recv(&self) -> Result<PhaseMessage> {
        let mut buf = vec![0u8; MAX_FRAME_LEN];
        let n = socket::recv(self.fd.as_raw_fd(), &mut buf, MsgFlags::empty()).map_err(ChannelError::Recv)?;
        if n == 0 {
            return Err(ChannelError::Closed);
        }
        buf.truncate(n);
        Ok(serde_json::from_slice(&buf)?)
    }

    /// Receives a frame, returning any file descriptor handed over via
    /// `SCM_RIGHTS` alongside it.
    pub fn recv_with_fd(&self) -> Result<(PhaseMessage, Option<OwnedFd>)> {
        let mut buf = vec![0u8; MAX_FRAME_LEN];
        let mut iov = [IoSliceMut::new(&mut buf)];
        let mut cmsg_space = nix::cmsg_space!([RawFd; 1]);
        let msg = socket::recvmsg::<()>(
            self.fd.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_space),
            MsgFlags::empty(),
        )
        .map_err(ChannelError::Recv)?;

        if msg.bytes == 0 {
            return Err(ChannelError::Closed);
        }

        let received_fd = msg.cmsgs()?.find_map(|cmsg| match cmsg {
            ControlMessageOwned::ScmRights(fds) => fds.into_iter().next(),
            _ => None,
        });

        let body = &buf[..msg.bytes];
        let parsed = serde_json::from_slice(body)?;
        let owned_fd = received_fd.map(|fd| unsafe { OwnedFd::from_raw_fd(fd) });
        Ok((parsed, owned_fd))
    }
}
