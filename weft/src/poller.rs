// src/poller.rs
//
// Readiness poller: registers descriptors for one-shot, edge-triggered
// interest and reports woken tokens. Client sockets use the fd itself as
// the token; control descriptors (intake pipe, injector eventfd) use
// reserved tokens and stay armed level-triggered.

use std::collections::HashSet;
use std::os::unix::io::RawFd;

use crate::error::WeftResult;
use crate::syscalls::Epoll;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

impl Interest {
    fn bits(self) -> u32 {
        match self {
            Interest::Read => libc::EPOLLIN as u32,
            Interest::Write => libc::EPOLLOUT as u32,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub token: u64,
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
}

pub struct Poller {
    epoll: Epoll,
    // fds currently known to epoll, so arm() can pick ADD vs MOD.
    known: HashSet<RawFd>,
    events: Vec<libc::epoll_event>,
}

impl Poller {
    pub fn new() -> WeftResult<Self> {
        Ok(Poller {
            epoll: Epoll::new()?,
            known: HashSet::new(),
            events: vec![libc::epoll_event { events: 0, u64: 0 }; 1024],
        })
    }

    /// Arm `fd` for a single wakeup in the given direction. One-shot and
    /// edge-triggered; the descriptor must be re-armed after every event.
    pub fn arm(&mut self, fd: RawFd, token: u64, interest: Interest) -> std::io::Result<()> {
        let bits = interest.bits()
            | libc::EPOLLET as u32
            | libc::EPOLLONESHOT as u32
            | libc::EPOLLRDHUP as u32;
        if self.known.contains(&fd) {
            self.epoll.modify(fd, token, bits)
        } else {
            self.epoll.add(fd, token, bits)?;
            self.known.insert(fd);
            Ok(())
        }
    }

    /// Permanently watch a control descriptor for readability,
    /// level-triggered so nothing is lost if an iteration leaves data.
    pub fn watch(&mut self, fd: RawFd, token: u64) -> std::io::Result<()> {
        self.epoll.add(fd, token, libc::EPOLLIN as u32)?;
        self.known.insert(fd);
        Ok(())
    }

    /// Drop all interest in `fd`. Must be called before the fd is closed.
    pub fn forget(&mut self, fd: RawFd) {
        if self.known.remove(&fd) {
            let _ = self.epoll.delete(fd);
        }
    }

    pub fn wait(&mut self, timeout_ms: i32) -> std::io::Result<Vec<Event>> {
        let n = self.epoll.wait(&mut self.events, timeout_ms)?;
        let mut out = Vec::with_capacity(n);
        for ev in &self.events[..n] {
            let bits = ev.events;
            out.push(Event {
                token: ev.u64,
                readable: bits & libc::EPOLLIN as u32 != 0,
                writable: bits & libc::EPOLLOUT as u32 != 0,
                hangup: bits
                    & (libc::EPOLLERR as u32
                        | libc::EPOLLHUP as u32
                        | libc::EPOLLRDHUP as u32)
                    != 0,
            });
        }
        Ok(out)
    }
}
