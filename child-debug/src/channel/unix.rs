// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Unix channel: a datagram socket, plus a pipe as the signal.
//!
//! Every datagram is delivered whole or not at all, which is what makes a datagram socket a
//! faithful stand-in for a mailslot.  On Linux the socket is bound in the abstract namespace so
//! nothing is left behind on the filesystem; elsewhere it is a socket file that we unlink on drop.

use super::{ChannelIdentity, ChannelNamespace};
use crate::shared::handshake::RawId;
use libc::{c_void, pollfd, POLLIN};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::time::Duration;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const PEEK_SCRATCH_SIZE: usize = 64 * 1024;

fn cvt(result: libc::c_int) -> io::Result<libc::c_int> {
    if result == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(result)
    }
}

/// Makes `fd` survive `exec` and keeps it away from the standard streams, which a harness is
/// likely to redirect in the worker.
fn inheritable_above_stdio(fd: OwnedFd) -> io::Result<OwnedFd> {
    let fd = if fd.as_raw_fd() <= libc::STDERR_FILENO {
        // SAFETY: fcntl on an fd we own; the duplicate is owned by the returned OwnedFd.
        let dup = cvt(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 3) })?;
        unsafe { OwnedFd::from_raw_fd(dup) }
    } else {
        fd
    };
    // SAFETY: fcntl on an fd we own.
    let flags = cvt(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFD) })?;
    cvt(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, flags & !libc::FD_CLOEXEC) })?;
    Ok(fd)
}

fn set_fd_flags(fd: RawFd, get: libc::c_int, set: libc::c_int, add: libc::c_int) -> io::Result<()> {
    // SAFETY: fcntl on an fd owned by the caller.
    let flags = cvt(unsafe { libc::fcntl(fd, get) })?;
    cvt(unsafe { libc::fcntl(fd, set, flags | add) })?;
    Ok(())
}

pub(crate) struct Receiver {
    socket: UnixDatagram,
    path: Option<PathBuf>,
    /// Only the creating process unlinks the socket file; a forked worker drops a copy.
    owner: u32,
}

impl Receiver {
    pub(crate) fn create(
        identity: &ChannelIdentity,
        namespace: &ChannelNamespace,
    ) -> io::Result<Self> {
        let (socket, path) = match namespace {
            ChannelNamespace::Default => Self::bind_default(identity)?,
            ChannelNamespace::Directory(dir) => {
                let path = dir.join(identity.name());
                (UnixDatagram::bind(&path)?, Some(path))
            }
        };
        let receiver = Self {
            socket,
            path,
            owner: std::process::id(),
        };
        receiver.socket.set_nonblocking(true)?;
        Ok(receiver)
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn bind_default(identity: &ChannelIdentity) -> io::Result<(UnixDatagram, Option<PathBuf>)> {
        #[cfg(target_os = "android")]
        use std::os::android::net::SocketAddrExt;
        #[cfg(target_os = "linux")]
        use std::os::linux::net::SocketAddrExt;
        use std::os::unix::net::SocketAddr;

        let addr = SocketAddr::from_abstract_name(identity.name().as_bytes())?;
        Ok((UnixDatagram::bind_addr(&addr)?, None))
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn bind_default(identity: &ChannelIdentity) -> io::Result<(UnixDatagram, Option<PathBuf>)> {
        let path = std::env::temp_dir().join(identity.name());
        Ok((UnixDatagram::bind(&path)?, Some(path)))
    }

    /// An unbound socket connected to this receiver, for the worker to inherit.
    pub(crate) fn open_sender(&self) -> io::Result<Sender> {
        let socket = UnixDatagram::unbound()?;
        socket.connect_addr(&self.socket.local_addr()?)?;
        #[cfg(target_vendor = "apple")]
        {
            let on: libc::c_int = 1;
            // SAFETY: setsockopt on a socket we own with a correctly sized option value.
            cvt(unsafe {
                libc::setsockopt(
                    socket.as_raw_fd(),
                    libc::SOL_SOCKET,
                    libc::SO_NOSIGPIPE,
                    &on as *const libc::c_int as *const c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            })?;
        }
        Ok(Sender {
            fd: inheritable_above_stdio(OwnedFd::from(socket))?,
        })
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub(crate) fn next_message_size(&self) -> io::Result<Option<usize>> {
        // MSG_TRUNC makes recv report the real datagram length even with a zero-sized buffer.
        self.recv_retrying(std::ptr::null_mut(), 0, libc::MSG_PEEK | libc::MSG_TRUNC)
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    pub(crate) fn next_message_size(&self) -> io::Result<Option<usize>> {
        let mut scratch = vec![0u8; PEEK_SCRATCH_SIZE];
        self.recv_retrying(
            scratch.as_mut_ptr() as *mut c_void,
            scratch.len(),
            libc::MSG_PEEK,
        )
    }

    pub(crate) fn read_message(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv_retrying(buf.as_mut_ptr() as *mut c_void, buf.len(), 0)?
            .ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))
    }

    fn recv_retrying(
        &self,
        buf: *mut c_void,
        len: usize,
        flags: libc::c_int,
    ) -> io::Result<Option<usize>> {
        loop {
            // SAFETY: buf is either null with len 0, or valid for len bytes.
            let n = unsafe {
                libc::recv(self.socket.as_raw_fd(), buf, len, flags | libc::MSG_DONTWAIT)
            };
            if n >= 0 {
                return Ok(Some(n as usize));
            }
            match nix::Error::last_raw() {
                libc::EINTR => continue,
                libc::EAGAIN => return Ok(None),
                errno => return Err(io::Error::from_raw_os_error(errno)),
            }
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };
        if self.owner != std::process::id() {
            return;
        }
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Failed to unlink channel socket"
            );
        }
    }
}

pub(crate) struct Sender {
    fd: OwnedFd,
}

impl Sender {
    pub(crate) fn raw_id(&self) -> RawId {
        self.fd.as_raw_fd() as RawId
    }
}

/// A pipe standing in for a manual-reset event: "set" means at least one byte is buffered.
pub(crate) struct Signal {
    read: OwnedFd,
    write: OwnedFd,
}

impl Signal {
    pub(crate) fn create() -> io::Result<Self> {
        let mut fds = [-1 as RawFd; 2];
        // SAFETY: fds has room for the two descriptors.
        cvt(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
        // SAFETY: pipe succeeded, so both descriptors are open and ours.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        for fd in [&read, &write] {
            set_fd_flags(fd.as_raw_fd(), libc::F_GETFL, libc::F_SETFL, libc::O_NONBLOCK)?;
        }
        set_fd_flags(read.as_raw_fd(), libc::F_GETFD, libc::F_SETFD, libc::FD_CLOEXEC)?;
        let write = inheritable_above_stdio(write)?;
        Ok(Self { read, write })
    }

    pub(crate) fn worker_id(&self) -> RawId {
        self.write.as_raw_fd() as RawId
    }

    pub(crate) fn reset(&self) -> io::Result<()> {
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: buf is valid for its length.
            let n = unsafe {
                libc::read(self.read.as_raw_fd(), buf.as_mut_ptr() as *mut c_void, buf.len())
            };
            if n > 0 {
                continue;
            }
            if n == 0 {
                return Ok(());
            }
            match nix::Error::last_raw() {
                libc::EINTR => continue,
                libc::EAGAIN => return Ok(()),
                errno => return Err(io::Error::from_raw_os_error(errno)),
            }
        }
    }

    pub(crate) fn wait(&self, timeout: Duration) -> io::Result<bool> {
        let mut poll_fds = [pollfd {
            fd: self.read.as_raw_fd(),
            events: POLLIN,
            revents: 0,
        }];
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        loop {
            let poll_result = unsafe {
                libc::poll(poll_fds.as_mut_ptr(), poll_fds.len() as libc::nfds_t, timeout_ms)
            };
            match poll_result {
                -1 => match nix::Error::last_raw() {
                    libc::EAGAIN | libc::EINTR => continue,
                    errno => return Err(io::Error::from_raw_os_error(errno)),
                },
                0 => return Ok(false),
                _ => return Ok(poll_fds[0].revents & POLLIN != 0),
            }
        }
    }
}

// Worker side.  Everything below runs inside a signal handler: no allocation, no locks.

/// Sends `bytes` as a single datagram on the inherited send handle.
pub(crate) fn send_message(sender: RawId, bytes: &[u8]) -> io::Result<()> {
    loop {
        // SAFETY: bytes is valid for its length; a stale fd fails with EBADF.
        let n = unsafe {
            libc::send(
                sender as RawFd,
                bytes.as_ptr() as *const c_void,
                bytes.len(),
                SEND_FLAGS,
            )
        };
        if n >= 0 {
            return Ok(());
        }
        match nix::Error::last_raw() {
            libc::EINTR => continue,
            errno => return Err(io::Error::from_raw_os_error(errno)),
        }
    }
}

/// Sets the signal.  Setting an already-set signal is a no-op.
pub(crate) fn set_signal(signal: RawId) -> io::Result<()> {
    let byte = 1u8;
    loop {
        // SAFETY: writing one byte from a stack variable.
        let n = unsafe { libc::write(signal as RawFd, &byte as *const u8 as *const c_void, 1) };
        if n >= 0 {
            return Ok(());
        }
        match nix::Error::last_raw() {
            libc::EINTR => continue,
            // The pipe is full, so it is signaled already.
            libc::EAGAIN => return Ok(()),
            errno => return Err(io::Error::from_raw_os_error(errno)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::tests::test_prefix;

    fn receiver(test: &str) -> Receiver {
        let identity = ChannelIdentity::new(&test_prefix(test), 1);
        Receiver::create(&identity, &ChannelNamespace::Default).unwrap()
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_empty_receiver_has_no_message() {
        let receiver = receiver("empty");
        assert_eq!(receiver.next_message_size().unwrap(), None);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_messages_keep_their_boundaries() {
        let receiver = receiver("boundaries");
        let sender = receiver.open_sender().unwrap();
        assert!(sender.raw_id() > libc::STDERR_FILENO as RawId);

        send_message(sender.raw_id(), b"first").unwrap();
        send_message(sender.raw_id(), &[7u8; 1000]).unwrap();

        assert_eq!(receiver.next_message_size().unwrap(), Some(5));
        let mut buf = vec![0u8; 5];
        assert_eq!(receiver.read_message(&mut buf).unwrap(), 5);
        assert_eq!(buf, b"first");

        assert_eq!(receiver.next_message_size().unwrap(), Some(1000));
        let mut buf = vec![0u8; 1000];
        assert_eq!(receiver.read_message(&mut buf).unwrap(), 1000);
        assert!(buf.iter().all(|&b| b == 7));

        assert_eq!(receiver.next_message_size().unwrap(), None);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_only_the_creator_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        let namespace = ChannelNamespace::Directory(dir.path().to_path_buf());
        let identity = ChannelIdentity::new("worker", 1);
        let path = dir.path().join(identity.name());

        let mut inherited = Receiver::create(&identity, &namespace).unwrap();
        // As seen from a forked child.
        inherited.owner = inherited.owner.wrapping_add(1);
        drop(inherited);
        assert!(path.exists());
        std::fs::remove_file(&path).unwrap();

        drop(Receiver::create(&identity, &namespace).unwrap());
        assert!(!path.exists());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_worker_fds_are_inheritable() {
        let receiver = receiver("inherit");
        let sender = receiver.open_sender().unwrap();
        let signal = Signal::create().unwrap();
        for fd in [sender.raw_id() as RawFd, signal.worker_id() as RawFd] {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
            assert_eq!(flags & libc::FD_CLOEXEC, 0);
        }
        let flags = unsafe { libc::fcntl(signal.read.as_raw_fd(), libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);
    }
}
