// src/syscalls.rs
//
// Thin wrappers over the kernel primitives the engine is built on:
// non-blocking sockets, epoll, sendfile, pipes for fd hand-off, and
// eventfd for cross-worker wakeups. Linux only.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;

use libc::{c_int, c_void, socklen_t};

use crate::error::WeftResult;

// ---- Socket operations ----

/// Create a non-blocking TCP listener. TCP_NODELAY is set on the listener
/// and inherited by every accepted socket.
pub fn create_listen_socket(host: &str, port: u16, reuse_addr: bool) -> WeftResult<RawFd> {
    let addr_str = format!("{}:{}", host, port);
    let addr: std::net::SocketAddr = addr_str
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let domain = if addr.is_ipv6() {
        libc::AF_INET6
    } else {
        libc::AF_INET
    };

    unsafe {
        let fd = libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let one: c_int = 1;
        if reuse_addr {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const _ as *const c_void,
                mem::size_of_val(&one) as socklen_t,
            );
        }

        // Inherited by accepted sockets, saves a per-accept setsockopt.
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );

        if let Err(e) = bind_addr(fd, &addr) {
            libc::close(fd);
            return Err(e);
        }

        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

fn bind_addr(fd: c_int, addr: &std::net::SocketAddr) -> WeftResult<()> {
    unsafe {
        match addr {
            std::net::SocketAddr::V4(a) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                if libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                ) < 0
                {
                    return Err(io::Error::last_os_error().into());
                }
            }
            std::net::SocketAddr::V6(a) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                if libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                ) < 0
                {
                    return Err(io::Error::last_os_error().into());
                }
            }
        }
        Ok(())
    }
}

/// Accept one connection. Returns `None` on would-block.
pub fn accept_connection(listen_fd: RawFd) -> io::Result<Option<RawFd>> {
    unsafe {
        let fd = libc::accept4(
            listen_fd,
            ptr::null_mut(),
            ptr::null_mut(),
            libc::SOCK_NONBLOCK,
        );
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err)
            }
        } else {
            Ok(Some(fd))
        }
    }
}

// ---- Non-blocking reads and writes ----
//
// Would-block and EINTR are surfaced as errors of the matching ErrorKind;
// the I/O adapter decides whether to park or retry. EOF is `Ok(0)`.

pub fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let res = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

pub fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let res = unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) };
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

pub fn pread_fd(fd: RawFd, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let res = unsafe {
        libc::pread(
            fd,
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
            offset as libc::off_t,
        )
    };
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

/// Offset-accepting sendfile. The kernel offset of `in_fd` is not touched,
/// so one descriptor can be shared by concurrent responses.
pub fn sendfile_fd(out_fd: RawFd, in_fd: RawFd, offset: &mut u64, count: usize) -> io::Result<usize> {
    let mut off = *offset as libc::off_t;
    let res = unsafe { libc::sendfile(out_fd, in_fd, &mut off, count) };
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        *offset = off as u64;
        Ok(res as usize)
    }
}

/// Toggle TCP_CORK around a response so header and body coalesce into
/// full segments.
pub fn set_cork(fd: RawFd, on: bool) {
    let v: c_int = if on { 1 } else { 0 };
    unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_CORK,
            &v as *const _ as *const c_void,
            mem::size_of_val(&v) as socklen_t,
        );
    }
}

pub fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

// ---- Accept-distribute pipes ----

/// Non-blocking Unix pipe, read end non-blocking. Returns (read, write).
pub fn create_pipe() -> WeftResult<(RawFd, RawFd)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::pipe(fds.as_mut_ptr()) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let flags = libc::fcntl(fds[0], libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fds[0]);
            libc::close(fds[1]);
            return Err(err.into());
        }
    }
    Ok((fds[0], fds[1]))
}

/// Wire format for a handed-off connection: client fd then the accepting
/// address index, native endianness, 8 bytes total. Writes of 8 bytes to a
/// pipe are atomic per POSIX.
pub const CONN_RECORD_LEN: usize = 8;

pub fn encode_conn_record(client_fd: RawFd, addr_index: u32) -> [u8; CONN_RECORD_LEN] {
    let mut rec = [0u8; CONN_RECORD_LEN];
    rec[..4].copy_from_slice(&client_fd.to_ne_bytes());
    rec[4..].copy_from_slice(&addr_index.to_ne_bytes());
    rec
}

pub fn decode_conn_record(rec: &[u8; CONN_RECORD_LEN]) -> (RawFd, u32) {
    let fd = i32::from_ne_bytes(rec[..4].try_into().unwrap());
    let idx = u32::from_ne_bytes(rec[4..].try_into().unwrap());
    (fd, idx)
}

pub fn send_conn_over_pipe(pipe_write_fd: RawFd, client_fd: RawFd, addr_index: u32) -> io::Result<()> {
    let rec = encode_conn_record(client_fd, addr_index);
    loop {
        let n = unsafe {
            libc::write(
                pipe_write_fd,
                rec.as_ptr() as *const c_void,
                CONN_RECORD_LEN,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(());
    }
}

// ---- eventfd (remote wakeups) ----

pub fn create_eventfd() -> WeftResult<RawFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        Err(io::Error::last_os_error().into())
    } else {
        Ok(fd)
    }
}

pub fn eventfd_signal(fd: RawFd) {
    let one: u64 = 1;
    unsafe {
        libc::write(fd, &one as *const u64 as *const c_void, 8);
    }
}

pub fn eventfd_drain(fd: RawFd) {
    let mut buf: u64 = 0;
    unsafe {
        libc::read(fd, &mut buf as *mut u64 as *mut c_void, 8);
    }
}

// ---- Signals ----

/// Mask SIGPIPE so a write to a closed peer surfaces as EPIPE instead of
/// killing the process.
pub fn mask_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

// ---- Epoll ----

pub struct Epoll {
    pub fd: RawFd,
}

impl Epoll {
    pub fn new() -> WeftResult<Self> {
        unsafe {
            let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Epoll { fd })
        }
    }

    pub fn add(&self, fd: RawFd, token: u64, interests: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests,
            u64: token,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    pub fn modify(&self, fd: RawFd, token: u64, interests: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests,
            u64: token,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_MOD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> io::Result<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );
            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err);
            }
            Ok(res as usize)
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
