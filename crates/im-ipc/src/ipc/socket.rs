//! Unix-domain-socket primitives.
//!
//! A transport moves raw bytes with one `recvmsg`/`sendmsg` per call; a
//! [`Pipe`] layers read-until-delimiter and write-fully semantics on top.
//! The server transport additionally carries an ancillary buffer so that the
//! kernel-attached `SCM_CREDENTIALS` of the peer can be read off the first
//! message.

use super::protocol::IpcUser;
use crate::config::IpcConfig;
use crate::error::{IpcError, Result};
use async_trait::async_trait;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use tokio::io::Interest;
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

use nix::sys::socket::{recvmsg, sendmsg, setsockopt, sockopt, ControlMessageOwned, MsgFlags};

/// Ancillary buffer size; at least `CMSG_SPACE(sizeof(struct ucred))`.
const CREDENTIALS_CONTROL_SPACE: usize = 64;

/// Validate `path` for use as a Unix socket address.
///
/// Paths that would not fit `sockaddr_un` are rejected instead of truncated.
pub fn socket_address(path: &Path) -> Result<&Path> {
    let length = path.as_os_str().len();
    if length >= IpcConfig::MAX_SOCKET_PATH_LENGTH {
        return Err(IpcError::SocketPathTooLong {
            path: path.to_path_buf(),
            length,
            max: IpcConfig::MAX_SOCKET_PATH_LENGTH,
        });
    }
    if length == 0 {
        return Err(IpcError::Config {
            message: "socket path is empty".to_string(),
        });
    }
    Ok(path)
}

/// Byte-level socket operations used by [`Pipe`].
#[async_trait]
pub trait IpcTransport: Send {
    /// Receive once into `buf`. Returns the number of bytes received; `0`
    /// means the peer closed the stream.
    async fn receive(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Send once from `buf`. Returns the number of bytes accepted.
    async fn send(&mut self, buf: &[u8]) -> Result<usize>;

    /// Credentials of the peer, if the transport captured any.
    fn peer_credentials(&self) -> Option<IpcUser>;
}

/// Outcome of [`Pipe::read_until`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadUntil {
    /// Absolute index of the delimiter in the destination.
    pub before: usize,
    /// Bytes received after the delimiter.
    pub after: usize,
}

/// Fixed-size transfer buffer between a transport and a message buffer.
#[derive(Debug)]
pub struct Pipe {
    buffer: Box<[u8]>,
}

impl Default for Pipe {
    fn default() -> Self {
        Self::new(IpcConfig::PIPE_BUFFER_SIZE)
    }
}

impl Pipe {
    pub fn new(size: usize) -> Self {
        Self {
            buffer: vec![0u8; size.max(1)].into_boxed_slice(),
        }
    }

    /// Receive into `destination` starting at `already_written` until
    /// `delimiter` shows up in freshly received bytes.
    ///
    /// Each receive asks for no more than the room left in `destination`, so
    /// bytes of a following message never count against the current one.
    pub async fn read_until<T>(
        &mut self,
        transport: &mut T,
        destination: &mut [u8],
        delimiter: u8,
        already_written: usize,
    ) -> Result<ReadUntil>
    where
        T: IpcTransport + ?Sized,
    {
        let mut offset = already_written;
        loop {
            let room = destination.len().saturating_sub(offset);
            if room == 0 {
                return Err(IpcError::MessageTooLarge {
                    capacity: destination.len(),
                });
            }
            let wanted = room.min(self.buffer.len());
            let received = transport.receive(&mut self.buffer[..wanted]).await?;
            if received == 0 {
                return Err(IpcError::ConnectionClosed);
            }
            let end = offset + received;

            let fresh = &self.buffer[..received];
            destination[offset..end].copy_from_slice(fresh);

            if let Some(position) = fresh.iter().position(|b| *b == delimiter) {
                return Ok(ReadUntil {
                    before: offset + position,
                    after: received - position - 1,
                });
            }
            offset = end;
        }
    }

    /// Send every byte of `bytes`, one pipe-sized chunk at a time.
    pub async fn send_fully<T>(&mut self, transport: &mut T, bytes: &[u8]) -> Result<()>
    where
        T: IpcTransport + ?Sized,
    {
        for chunk in bytes.chunks(self.buffer.len()) {
            let staged = &mut self.buffer[..chunk.len()];
            staged.copy_from_slice(chunk);

            let mut sent = 0;
            while sent < staged.len() {
                let written = transport.send(&staged[sent..]).await?;
                if written == 0 {
                    return Err(IpcError::ConnectionClosed);
                }
                sent += written;
            }
        }
        Ok(())
    }
}

/// Transport over a tokio `UnixStream`.
pub struct UnixTransport {
    stream: UnixStream,
    /// Ancillary buffer; only present on the server side.
    control: Option<Vec<u8>>,
    credentials: Option<IpcUser>,
}

impl UnixTransport {
    /// Wrap an accepted stream and prepare it to receive peer credentials.
    pub fn server(stream: UnixStream) -> Result<Self> {
        setsockopt(&stream, sockopt::PassCred, &true).map_err(std::io::Error::from)?;
        Ok(Self {
            stream,
            control: Some(Vec::with_capacity(CREDENTIALS_CONTROL_SPACE)),
            credentials: None,
        })
    }

    /// Wrap a connected client stream.
    ///
    /// The client never sets `SO_PASSCRED`: the server's option alone makes
    /// the kernel attach our credentials, and a client receiving without an
    /// ancillary buffer would see every message truncated.
    pub fn client(stream: UnixStream) -> Self {
        Self {
            stream,
            control: None,
            credentials: None,
        }
    }

    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_address(path)?).await?;
        Ok(Self::client(stream))
    }

    /// Kernel-reported `SO_PEERCRED` identity, used when no ancillary
    /// credentials arrived.
    fn stream_credentials(&self) -> Option<IpcUser> {
        let cred = self.stream.peer_cred().ok()?;
        Some(IpcUser {
            uid: cred.uid(),
            gid: cred.gid(),
            pid: cred.pid()?,
        })
    }
}

/// Enable credential passing on a listening socket; accepted sockets inherit it.
pub fn enable_credentials(listener: &UnixListener) -> Result<()> {
    setsockopt(listener, sockopt::PassCred, &true).map_err(std::io::Error::from)?;
    Ok(())
}

fn receive_message(
    fd: RawFd,
    buf: &mut [u8],
    control: Option<&mut Vec<u8>>,
) -> std::io::Result<(usize, Option<IpcUser>)> {
    let mut iov = [IoSliceMut::new(buf)];
    let message = recvmsg::<()>(fd, &mut iov, control, MsgFlags::MSG_CMSG_CLOEXEC)?;

    let mut credentials = None;
    for cmsg in message.cmsgs()? {
        if let ControlMessageOwned::ScmCredentials(creds) = cmsg {
            credentials = Some(IpcUser {
                uid: creds.uid(),
                gid: creds.gid(),
                pid: creds.pid(),
            });
        }
    }
    Ok((message.bytes, credentials))
}

fn send_message(fd: RawFd, buf: &[u8]) -> std::io::Result<usize> {
    let iov = [IoSlice::new(buf)];
    Ok(sendmsg::<()>(fd, &iov, &[], MsgFlags::MSG_NOSIGNAL, None)?)
}

#[async_trait]
impl IpcTransport for UnixTransport {
    async fn receive(&mut self, buf: &mut [u8]) -> Result<usize> {
        let fd = self.stream.as_raw_fd();
        let control = &mut self.control;

        let (received, credentials) = self
            .stream
            .async_io(Interest::READABLE, || {
                receive_message(fd, &mut *buf, control.as_mut())
            })
            .await?;

        if self.credentials.is_none() {
            if let Some(creds) = credentials {
                debug!(
                    "Captured peer credentials uid={} gid={} pid={}",
                    creds.uid, creds.gid, creds.pid
                );
                self.credentials = Some(creds);
            }
        }
        Ok(received)
    }

    async fn send(&mut self, buf: &[u8]) -> Result<usize> {
        let fd = self.stream.as_raw_fd();
        let sent = self
            .stream
            .async_io(Interest::WRITABLE, || send_message(fd, buf))
            .await?;
        Ok(sent)
    }

    fn peer_credentials(&self) -> Option<IpcUser> {
        if self.control.is_none() {
            return None;
        }
        self.credentials.or_else(|| self.stream_credentials())
    }
}
