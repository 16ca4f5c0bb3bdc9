//! The unix stream transport: nonblocking I/O driven through smol's
//! reactor, with SCM_RIGHTS ancillary data for file descriptor passing.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::sys::socket::{
    connect, recvmsg, sendmsg, socket, AddressFamily, ControlMessage, ControlMessageOwned,
    MsgFlags, SockAddr, SockFlag, SockType, UnixAddr,
};
use nix::sys::uio::IoVec;
use smol::Async;

use crate::address::Transport;

#[derive(Debug)]
pub struct Socket {
    stream: Async<UnixStream>,
}

impl Socket {
    pub async fn connect(transport: &Transport) -> crate::Result<Self> {
        let stream = match transport {
            Transport::UnixPath(path) => Async::<UnixStream>::connect(path).await?,
            Transport::UnixAbstract(name) => {
                // Abstract sockets have no filesystem path, so the standard
                // library cannot connect to them. Unix domain connects
                // complete immediately, so the blocking connect here is
                // harmless.
                let fd = socket(
                    AddressFamily::Unix,
                    SockType::Stream,
                    SockFlag::SOCK_CLOEXEC,
                    None,
                )
                .map_err(nix_to_io)?;
                let addr = SockAddr::Unix(UnixAddr::new_abstract(name).map_err(nix_to_io)?);
                if let Err(err) = connect(fd, &addr) {
                    let _ = nix::unistd::close(fd);
                    return Err(nix_to_io(err).into());
                }
                Async::new(unsafe { UnixStream::from_raw_fd(fd) })?
            }
        };

        Ok(Self { stream })
    }

    /// A connected socket pair, one end per role. The test harness speaks
    /// the bus side of the protocol over one of these.
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((
            Self {
                stream: Async::new(a)?,
            },
            Self {
                stream: Async::new(b)?,
            },
        ))
    }

    /// Receive bytes into `buf`, together with any SCM_RIGHTS descriptors
    /// that arrived with them. Returns `(0, …)` on EOF.
    pub async fn recvmsg(&self, buf: &mut [u8]) -> crate::Result<(usize, Vec<RawFd>)> {
        let received = self
            .stream
            .read_with(|stream| {
                let iov = [IoVec::from_mut_slice(buf)];
                let mut cmsg_space = nix::cmsg_space!([RawFd; 16]);
                let msg = recvmsg(
                    stream.as_raw_fd(),
                    &iov,
                    Some(&mut cmsg_space),
                    MsgFlags::MSG_CMSG_CLOEXEC,
                )
                .map_err(nix_to_io)?;

                let mut fds = Vec::new();
                for cmsg in msg.cmsgs() {
                    if let ControlMessageOwned::ScmRights(received) = cmsg {
                        fds.extend(received);
                    }
                }
                Ok((msg.bytes, fds))
            })
            .await?;

        Ok(received)
    }

    /// Send the whole buffer, attaching `fds` to the first bytes written.
    pub async fn send_all(&self, buf: &[u8], fds: &[RawFd]) -> crate::Result<()> {
        let mut pos = 0;
        while pos < buf.len() {
            let with_fds: &[RawFd] = if pos == 0 { fds } else { &[] };
            let written = self
                .stream
                .write_with(|stream| {
                    let iov = [IoVec::from_slice(&buf[pos..])];
                    let cmsgs = if with_fds.is_empty() {
                        Vec::new()
                    } else {
                        vec![ControlMessage::ScmRights(with_fds)]
                    };
                    sendmsg(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
                        .map_err(nix_to_io)
                })
                .await?;

            if written == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "socket write stalled").into());
            }
            pos += written;
        }

        Ok(())
    }
}

fn nix_to_io(err: nix::Error) -> io::Error {
    match err.as_errno() {
        Some(errno) => io::Error::from_raw_os_error(errno as i32),
        None => io::Error::new(io::ErrorKind::Other, err),
    }
}
