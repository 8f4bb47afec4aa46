// src/io.rs
//
// Non-blocking I/O adapter: read/write/sendfile calls that look blocking
// to the caller but park the task on the reactor whenever the descriptor
// would block. Interrupted syscalls are retried transparently.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Instant;

use crate::error::{WeftError, WeftResult};
use crate::poller::Interest;
use crate::reactor::{self, block_on_fd};
use crate::syscalls;

fn closed_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

/// A raw descriptor owned by one task. Dropping it deregisters the fd
/// from the reactor before closing, so nothing stays blocked on it.
pub struct NbSocket {
    fd: RawFd,
}

impl NbSocket {
    pub fn from_raw(fd: RawFd) -> Self {
        NbSocket { fd }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub async fn read(&self, buf: &mut [u8], deadline: Option<Instant>) -> WeftResult<usize> {
        loop {
            match syscalls::read_fd(self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(e) => match e.kind() {
                    io::ErrorKind::WouldBlock => {
                        block_on_fd(self.fd, Interest::Read, deadline).await?;
                    }
                    io::ErrorKind::Interrupted => {}
                    k if closed_kind(k) => return Err(WeftError::ConnectionClosed),
                    _ => return Err(e.into()),
                },
            }
        }
    }

    pub async fn write(&self, buf: &[u8], deadline: Option<Instant>) -> WeftResult<usize> {
        loop {
            match syscalls::write_fd(self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(e) => match e.kind() {
                    io::ErrorKind::WouldBlock => {
                        block_on_fd(self.fd, Interest::Write, deadline).await?;
                    }
                    io::ErrorKind::Interrupted => {}
                    k if closed_kind(k) => return Err(WeftError::ConnectionClosed),
                    _ => return Err(e.into()),
                },
            }
        }
    }

    pub async fn write_all(&self, mut buf: &[u8], deadline: Option<Instant>) -> WeftResult<()> {
        while !buf.is_empty() {
            let n = self.write(buf, deadline).await?;
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Copy `len` bytes from `file_fd` starting at `*offset` to the
    /// socket via sendfile, looping on short writes and parking on
    /// would-block. The file's kernel offset is never used, so the
    /// descriptor may be shared across concurrent responses.
    pub async fn sendfile(
        &self,
        file_fd: RawFd,
        offset: &mut u64,
        len: u64,
        deadline: Option<Instant>,
    ) -> WeftResult<()> {
        let mut remaining = len;
        while remaining > 0 {
            let chunk = remaining.min(1 << 20) as usize;
            match syscalls::sendfile_fd(self.fd, file_fd, offset, chunk) {
                Ok(0) => return Err(WeftError::ConnectionClosed),
                Ok(n) => remaining -= n as u64,
                Err(e) => match e.kind() {
                    io::ErrorKind::WouldBlock => {
                        block_on_fd(self.fd, Interest::Write, deadline).await?;
                    }
                    io::ErrorKind::Interrupted => {}
                    k if closed_kind(k) => return Err(WeftError::ConnectionClosed),
                    _ => return Err(e.into()),
                },
            }
        }
        Ok(())
    }

    pub fn cork(&self, on: bool) {
        syscalls::set_cork(self.fd, on);
    }
}

impl Drop for NbSocket {
    fn drop(&mut self) {
        // Deregistration must precede close. Outside a worker (tests,
        // teardown after the reactor is gone) there is nothing to forget.
        reactor::try_with(|r| r.forget(self.fd));
        syscalls::close_fd(self.fd);
    }
}

// ---- TLS seam ----
//
// The TLS implementation itself is an external collaborator. It is
// modelled as an opaque session over the raw descriptor whose operations
// either complete or report which direction of the underlying socket
// they are waiting on; the adapter parks accordingly and retries.

pub enum TlsProgress<T> {
    Done(T),
    WantRead,
    WantWrite,
}

pub trait TlsSession: Send {
    fn handshake(&mut self, fd: RawFd) -> io::Result<TlsProgress<()>>;
    fn read(&mut self, fd: RawFd, buf: &mut [u8]) -> io::Result<TlsProgress<usize>>;
    fn write(&mut self, fd: RawFd, buf: &[u8]) -> io::Result<TlsProgress<usize>>;
}

pub trait TlsAcceptor: Send + Sync {
    fn accept(&self) -> Box<dyn TlsSession>;
}

/// A client stream: plain TCP or TLS over it. Uniform suspend-on-would-
/// block semantics either way.
pub enum Stream {
    Plain(NbSocket),
    Tls {
        sock: NbSocket,
        session: Box<dyn TlsSession>,
    },
}

impl Stream {
    pub fn plain(fd: RawFd) -> Self {
        Stream::Plain(NbSocket::from_raw(fd))
    }

    pub fn tls(fd: RawFd, session: Box<dyn TlsSession>) -> Self {
        Stream::Tls {
            sock: NbSocket::from_raw(fd),
            session,
        }
    }

    pub fn fd(&self) -> RawFd {
        match self {
            Stream::Plain(s) => s.fd(),
            Stream::Tls { sock, .. } => sock.fd(),
        }
    }

    pub fn cork(&self, on: bool) {
        match self {
            Stream::Plain(s) => s.cork(on),
            Stream::Tls { sock, .. } => sock.cork(on),
        }
    }

    /// Complete the TLS handshake, if any, before the first request.
    pub async fn handshake(&mut self, deadline: Option<Instant>) -> WeftResult<()> {
        let Stream::Tls { sock, session } = self else {
            return Ok(());
        };
        let fd = sock.fd();
        loop {
            match session.handshake(fd) {
                Ok(TlsProgress::Done(())) => return Ok(()),
                Ok(TlsProgress::WantRead) => {
                    block_on_fd(fd, Interest::Read, deadline).await?;
                }
                Ok(TlsProgress::WantWrite) => {
                    block_on_fd(fd, Interest::Write, deadline).await?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if closed_kind(e.kind()) => return Err(WeftError::ConnectionClosed),
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub async fn read(&mut self, buf: &mut [u8], deadline: Option<Instant>) -> WeftResult<usize> {
        match self {
            Stream::Plain(s) => s.read(buf, deadline).await,
            Stream::Tls { sock, session } => {
                let fd = sock.fd();
                loop {
                    match session.read(fd, buf) {
                        Ok(TlsProgress::Done(n)) => return Ok(n),
                        Ok(TlsProgress::WantRead) => {
                            block_on_fd(fd, Interest::Read, deadline).await?;
                        }
                        Ok(TlsProgress::WantWrite) => {
                            block_on_fd(fd, Interest::Write, deadline).await?;
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) if closed_kind(e.kind()) => {
                            return Err(WeftError::ConnectionClosed)
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
    }

    pub async fn write(&mut self, buf: &[u8], deadline: Option<Instant>) -> WeftResult<usize> {
        match self {
            Stream::Plain(s) => s.write(buf, deadline).await,
            Stream::Tls { sock, session } => {
                let fd = sock.fd();
                loop {
                    match session.write(fd, buf) {
                        Ok(TlsProgress::Done(n)) => return Ok(n),
                        Ok(TlsProgress::WantRead) => {
                            block_on_fd(fd, Interest::Read, deadline).await?;
                        }
                        Ok(TlsProgress::WantWrite) => {
                            block_on_fd(fd, Interest::Write, deadline).await?;
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) if closed_kind(e.kind()) => {
                            return Err(WeftError::ConnectionClosed)
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
    }

    pub async fn write_all(&mut self, mut buf: &[u8], deadline: Option<Instant>) -> WeftResult<()> {
        while !buf.is_empty() {
            let n = self.write(buf, deadline).await?;
            buf = &buf[n..];
        }
        Ok(())
    }

    /// File-to-socket copy. Plain sockets use sendfile; TLS streams fall
    /// back to positional reads through the session.
    pub async fn send_file(
        &mut self,
        file_fd: RawFd,
        offset: &mut u64,
        len: u64,
        deadline: Option<Instant>,
    ) -> WeftResult<()> {
        match self {
            Stream::Plain(s) => s.sendfile(file_fd, offset, len, deadline).await,
            Stream::Tls { .. } => {
                let mut remaining = len;
                let mut buf = vec![0u8; 64 * 1024];
                while remaining > 0 {
                    let want = remaining.min(buf.len() as u64) as usize;
                    let n = match syscalls::pread_fd(file_fd, &mut buf[..want], *offset) {
                        Ok(0) => return Err(WeftError::ConnectionClosed),
                        Ok(n) => n,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e.into()),
                    };
                    *offset += n as u64;
                    remaining -= n as u64;
                    self.write_all(&buf[..n], deadline).await?;
                }
                Ok(())
            }
        }
    }
}
