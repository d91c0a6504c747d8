//! Local-domain socket link (component B).
//!
//! Wraps `mio::net::UnixListener`/`UnixStream` for the reactor's
//! readiness polling, and drops down to `nix`'s raw-fd socket calls for
//! the two things `std`/`mio` don't expose: passing a file descriptor as
//! ancillary data and reading the peer's credentials.

use std::fs;
use std::io::{self, IoSlice, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use mio::net::{UnixListener, UnixStream};
use nix::sys::socket::{getsockopt, sendmsg, MsgFlags, UnixCredentials};
#[cfg(test)]
use nix::sys::socket::{recvmsg, ControlMessageOwned};
#[cfg(test)]
use std::io::IoSliceMut;

/// Directory and socket-file mode so any permitted UID/GID can connect
/// regardless of the Manager's own umask (§4.B, §4.I).
const LISTEN_DIR_MODE: u32 = 0o777;

/// The Manager's listening endpoint.
pub struct Listener {
    inner: UnixListener,
    path: PathBuf,
}

impl Listener {
    /// Bind at `path`, creating its parent directory with mode 0777 and
    /// re-asserting that mode after bind (bind/mkdir both go through the
    /// process umask, which the directory mode must not inherit).
    pub fn bind(path: &Path) -> Result<Listener> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating socket directory {}", parent.display()))?;
            fs::set_permissions(parent, fs::Permissions::from_mode(LISTEN_DIR_MODE))
                .with_context(|| format!("chmod {} 0777", parent.display()))?;
        }

        // A stale socket file from a prior, uncleanly-terminated run
        // would otherwise make bind() fail with AddrInUse.
        if path.exists() {
            fs::remove_file(path)
                .with_context(|| format!("removing stale socket {}", path.display()))?;
        }

        let inner = UnixListener::bind(path)
            .with_context(|| format!("binding listening socket at {}", path.display()))?;

        if let Some(parent) = path.parent() {
            fs::set_permissions(parent, fs::Permissions::from_mode(LISTEN_DIR_MODE))
                .with_context(|| format!("re-chmod {} 0777", parent.display()))?;
        }

        Ok(Listener {
            inner,
            path: path.to_path_buf(),
        })
    }

    pub fn inner_mut(&mut self) -> &mut UnixListener {
        &mut self.inner
    }

    /// Accept one pending connection, returning the raw stream and the
    /// peer's credentials before any application data is exchanged.
    pub fn accept(&mut self) -> io::Result<(UnixStream, UnixCredentials)> {
        let (stream, _addr) = self.inner.accept()?;
        let creds = peer_credentials(stream.as_raw_fd())
            .map_err(|e| io::Error::other(format!("peer credentials: {e}")))?;
        Ok((stream, creds))
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Fetch `SO_PEERCRED` for an already-accepted connection.
pub fn peer_credentials(fd: RawFd) -> nix::Result<UnixCredentials> {
    // SAFETY: `fd` is a live socket fd owned by the caller for the
    // duration of this call; we don't retain the borrow past it.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    getsockopt(&borrowed, nix::sys::socket::sockopt::PeerCredentials)
}

/// A single accepted, admitted connection.
pub struct Link {
    stream: UnixStream,
}

impl Link {
    pub fn new(stream: UnixStream) -> Link {
        Link { stream }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn stream_mut(&mut self) -> &mut UnixStream {
        &mut self.stream
    }

    /// Read at most one message. The reactor only calls this on read
    /// readiness, so the underlying read is expected to return promptly.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    /// Write atomically: the whole buffer or an error, never a partial
    /// frame.
    pub fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.stream.write_all(buf)
    }

    /// Pass `fd` as `SCM_RIGHTS` ancillary data, alongside a single
    /// marker byte (a control message with no accompanying data is
    /// rejected or dropped on some platforms).
    pub fn send_fd(&mut self, fd: RawFd) -> nix::Result<()> {
        let iov = [IoSlice::new(&[0u8])];
        let fds = [fd];
        let cmsg = [nix::sys::socket::ControlMessage::ScmRights(&fds)];
        sendmsg::<()>(self.raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)?;
        Ok(())
    }

    /// Receive one `SCM_RIGHTS`-carried fd, if the client library ever
    /// needs to hand one back to the Manager. Unused by the Manager's
    /// own protocol today but kept symmetric with `send_fd` for tests.
    #[cfg(test)]
    pub fn recv_fd(&mut self) -> nix::Result<Option<RawFd>> {
        let mut data = [0u8; 1];
        let mut iov = [IoSliceMut::new(&mut data)];
        let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
        let msg = recvmsg::<()>(
            self.raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::empty(),
        )?;
        for cmsg in msg.cmsgs()? {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                return Ok(fds.first().copied());
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::FromRawFd;

    #[test]
    fn fd_round_trips_over_socketpair() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut link_a = Link::new(a);
        let mut link_b = Link::new(b);

        let (memfd, _size) = crate::buffer::create(4096).unwrap();
        // sendmsg dups the fd for the peer; `memfd` still owns and will
        // close the original when it drops at the end of this scope.
        link_a.send_fd(memfd.as_raw_fd()).unwrap();

        let received = link_b.recv_fd().unwrap();
        assert!(received.is_some());
        unsafe { std::os::fd::OwnedFd::from_raw_fd(received.unwrap()) };
    }
}
