// src/reactor.rs
//
// Per-worker scheduler state and the suspension primitives built on it.
// A task suspends by recording what it is waiting for (a descriptor
// direction, a deadline, or nothing for a plain yield) and returning
// Pending; the worker loop wakes it by putting its id back on the ready
// queue. A task is in at most one of {ready queue, sleep heap, fd
// registry} at any instant.
//
// Leaf futures reach the reactor through a thread-local pointer that is
// set only while a task is being polled. This is single-threaded by
// construction: each worker owns its reactor, and event dispatch never
// interleaves with future polling.

use std::cell::Cell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::io;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::ptr;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use crate::error::{WeftError, WeftResult};
use crate::poller::{Interest, Poller};
use crate::syscalls;
use crate::task::{TaskFuture, TaskId};

/// Token reserved for the worker's injector eventfd.
pub(crate) const TOKEN_INJECTOR: u64 = u64::MAX;
/// Token reserved for the connection-intake pipe.
pub(crate) const TOKEN_INTAKE: u64 = u64::MAX - 1;

pub(crate) struct IoWaiter {
    pub task: TaskId,
    pub interest: Interest,
    pub deadline: Option<Instant>,
}

/// Cross-thread wake handle. Pushing a task id and signalling the eventfd
/// gets the owning worker out of epoll_wait; it drains the queue at the
/// top of its next iteration.
pub(crate) struct Injector {
    queue: StdMutex<Vec<TaskId>>,
    eventfd: RawFd,
}

impl Injector {
    pub fn new() -> WeftResult<Arc<Self>> {
        Ok(Arc::new(Injector {
            queue: StdMutex::new(Vec::new()),
            eventfd: syscalls::create_eventfd()?,
        }))
    }

    pub fn fd(&self) -> RawFd {
        self.eventfd
    }

    pub fn wake(&self, task: TaskId) {
        self.queue.lock().unwrap().push(task);
        syscalls::eventfd_signal(self.eventfd);
    }

    pub fn drain(&self) -> Vec<TaskId> {
        syscalls::eventfd_drain(self.eventfd);
        std::mem::take(&mut *self.queue.lock().unwrap())
    }
}

impl Drop for Injector {
    fn drop(&mut self) {
        syscalls::close_fd(self.eventfd);
    }
}

pub(crate) struct Reactor {
    pub poller: Poller,
    ready: VecDeque<TaskId>,
    queued: Vec<bool>,
    sleepers: BinaryHeap<Reverse<(Instant, TaskId)>>,
    registry: HashMap<RawFd, IoWaiter>,
    // Lazy deadline index over the registry; stale entries are skipped.
    io_deadlines: BinaryHeap<Reverse<(Instant, RawFd)>>,
    // Descriptors whose wakeup carried a hang-up/error, or was forced by
    // the timeout sweep. Consumed by the blocked task's next poll.
    hup: HashSet<RawFd>,
    expired: HashSet<RawFd>,
    current: TaskId,
    injector: Arc<Injector>,
    // Futures spawned from inside tasks; the worker files them into the
    // slab between polls.
    pub spawned: Vec<TaskFuture>,
}

impl Reactor {
    pub fn new(capacity: usize, injector: Arc<Injector>) -> WeftResult<Self> {
        Ok(Reactor {
            poller: Poller::new()?,
            ready: VecDeque::with_capacity(64),
            queued: vec![false; capacity],
            sleepers: BinaryHeap::new(),
            registry: HashMap::new(),
            io_deadlines: BinaryHeap::new(),
            hup: HashSet::new(),
            expired: HashSet::new(),
            current: 0,
            injector,
            spawned: Vec::new(),
        })
    }

    pub fn injector(&self) -> Arc<Injector> {
        self.injector.clone()
    }

    pub fn set_current(&mut self, id: TaskId) {
        self.current = id;
    }

    pub fn current(&self) -> TaskId {
        self.current
    }

    /// FIFO enqueue with per-task dedup.
    pub fn enqueue(&mut self, id: TaskId) {
        let idx = id as usize;
        if idx < self.queued.len() && !self.queued[idx] {
            self.queued[idx] = true;
            self.ready.push_back(id);
        }
    }

    pub fn pop_ready(&mut self) -> Option<TaskId> {
        let id = self.ready.pop_front()?;
        self.queued[id as usize] = false;
        Some(id)
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty() || !self.spawned.is_empty()
    }

    fn register_io(
        &mut self,
        fd: RawFd,
        interest: Interest,
        deadline: Option<Instant>,
    ) -> io::Result<()> {
        self.poller.arm(fd, fd as u64, interest)?;
        let prev = self.registry.insert(
            fd,
            IoWaiter {
                task: self.current,
                interest,
                deadline,
            },
        );
        debug_assert!(prev.is_none(), "two tasks blocked on one descriptor");
        if let Some(d) = deadline {
            self.io_deadlines.push(Reverse((d, fd)));
        }
        Ok(())
    }

    /// Drop every trace of `fd`. Always called before the descriptor is
    /// closed, so nothing is ever blocked on a closed fd.
    pub fn forget(&mut self, fd: RawFd) {
        self.registry.remove(&fd);
        self.hup.remove(&fd);
        self.expired.remove(&fd);
        self.poller.forget(fd);
    }

    /// Readiness arrived for `fd`: move the blocked task to the ready
    /// queue. Hang-up events make the task's next I/O attempt fail with a
    /// closed-stream condition.
    pub fn on_io_event(&mut self, fd: RawFd, hangup: bool) {
        if let Some(waiter) = self.registry.remove(&fd) {
            if hangup {
                self.hup.insert(fd);
            }
            self.enqueue(waiter.task);
        }
    }

    /// Wake every sleeper whose deadline has passed.
    pub fn expire_sleepers(&mut self, now: Instant) {
        while let Some(Reverse((deadline, task))) = self.sleepers.peek().copied() {
            if deadline > now {
                break;
            }
            self.sleepers.pop();
            self.enqueue(task);
        }
    }

    /// Close out clients that have had no I/O before their deadline. The
    /// blocked task is woken and fails with a timed-out condition.
    pub fn sweep_io_deadlines(&mut self, now: Instant) {
        while let Some(Reverse((deadline, fd))) = self.io_deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            self.io_deadlines.pop();
            let hit = match self.registry.get(&fd) {
                Some(w) => matches!(w.deadline, Some(d) if d <= now),
                None => false,
            };
            if hit {
                let waiter = self.registry.remove(&fd).unwrap();
                self.expired.insert(fd);
                self.enqueue(waiter.task);
            }
        }
    }

    /// Fail every read-blocked task with a closed-stream condition. Used
    /// at shutdown: idle keep-alive readers unwind through their normal
    /// error paths while in-flight response writes finish.
    pub fn abort_blocked(&mut self) {
        let fds: Vec<RawFd> = self
            .registry
            .iter()
            .filter(|(_, w)| w.interest == Interest::Read)
            .map(|(fd, _)| *fd)
            .collect();
        for fd in fds {
            let waiter = self.registry.remove(&fd).unwrap();
            self.hup.insert(fd);
            self.enqueue(waiter.task);
        }
    }

    /// Poll timeout for the next iteration: zero when work is pending,
    /// otherwise until the earliest sleeper or I/O deadline, capped so
    /// shutdown is noticed promptly.
    pub fn next_timeout_ms(&self, now: Instant, cap_ms: i32) -> i32 {
        if self.has_ready() {
            return 0;
        }
        let mut earliest: Option<Instant> = None;
        if let Some(Reverse((d, _))) = self.sleepers.peek() {
            earliest = Some(*d);
        }
        if let Some(Reverse((d, _))) = self.io_deadlines.peek() {
            earliest = Some(match earliest {
                Some(e) if e <= *d => e,
                _ => *d,
            });
        }
        match earliest {
            Some(d) => {
                let ms = d.saturating_duration_since(now).as_millis() as i64;
                ms.min(cap_ms as i64).max(0) as i32
            }
            None => cap_ms,
        }
    }

}

// ---- Thread-local access ----

thread_local! {
    static CURRENT_REACTOR: Cell<*mut Reactor> = const { Cell::new(ptr::null_mut()) };
}

/// RAII scope marking "a task of this reactor is being polled".
pub(crate) struct ReactorGuard;

pub(crate) fn enter(reactor: *mut Reactor) -> ReactorGuard {
    CURRENT_REACTOR.with(|c| c.set(reactor));
    ReactorGuard
}

impl Drop for ReactorGuard {
    fn drop(&mut self) {
        CURRENT_REACTOR.with(|c| c.set(ptr::null_mut()));
    }
}

pub(crate) fn with<R>(f: impl FnOnce(&mut Reactor) -> R) -> R {
    let ptr = CURRENT_REACTOR.with(|c| c.get());
    assert!(!ptr.is_null(), "suspension point used outside a weft worker");
    f(unsafe { &mut *ptr })
}

pub(crate) fn try_with<R>(f: impl FnOnce(&mut Reactor) -> R) -> Option<R> {
    let ptr = CURRENT_REACTOR.with(|c| c.get());
    if ptr.is_null() {
        None
    } else {
        Some(f(unsafe { &mut *ptr }))
    }
}

// ---- Suspension primitives ----

/// Suspend the current task until `fd` is ready in the given direction.
/// Fails with `ConnectionClosed` when the poller reported hang-up and
/// `TimedOut` when the idle sweep cancelled the wait.
pub fn block_on_fd(fd: RawFd, interest: Interest, deadline: Option<Instant>) -> Readiness {
    Readiness {
        fd,
        interest,
        deadline,
        armed: false,
    }
}

pub struct Readiness {
    fd: RawFd,
    interest: Interest,
    deadline: Option<Instant>,
    armed: bool,
}

impl Future for Readiness {
    type Output = WeftResult<()>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let me = &mut *self;
        with(|r| {
            if !me.armed {
                if let Err(e) = r.register_io(me.fd, me.interest, me.deadline) {
                    return Poll::Ready(Err(e.into()));
                }
                me.armed = true;
                Poll::Pending
            } else if r.expired.remove(&me.fd) {
                Poll::Ready(Err(WeftError::TimedOut))
            } else if r.hup.remove(&me.fd) {
                Poll::Ready(Err(WeftError::ConnectionClosed))
            } else if matches!(r.registry.get(&me.fd), Some(w) if w.task == r.current()) {
                // Spurious wake: the registration is still armed.
                Poll::Pending
            } else {
                Poll::Ready(Ok(()))
            }
        })
    }
}

impl Drop for Readiness {
    fn drop(&mut self) {
        // Cancelled mid-wait (timeout race, task teardown): pull the
        // registry entry so the fd can be re-armed later.
        if self.armed {
            try_with(|r| {
                if let Some(w) = r.registry.get(&self.fd) {
                    if w.task == r.current() {
                        r.registry.remove(&self.fd);
                    }
                }
            });
        }
    }
}

/// Suspend the current task until `deadline`.
pub fn sleep_until(deadline: Instant) -> Sleep {
    Sleep {
        deadline,
        queued: false,
    }
}

pub fn sleep(duration: Duration) -> Sleep {
    sleep_until(Instant::now() + duration)
}

pub struct Sleep {
    deadline: Instant,
    queued: bool,
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let me = &mut *self;
        if me.queued {
            // The heap entry stays put until it expires, so a premature
            // (spurious) wake just parks again.
            return if Instant::now() >= me.deadline {
                Poll::Ready(())
            } else {
                Poll::Pending
            };
        }
        if Instant::now() >= me.deadline {
            return Poll::Ready(());
        }
        with(|r| {
            let task = r.current();
            r.sleepers.push(Reverse((me.deadline, task)));
        });
        me.queued = true;
        Poll::Pending
    }
}

/// Move the current task to the tail of the ready queue so other runnable
/// tasks get a turn.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        with(|r| {
            let task = r.current();
            r.enqueue(task);
        });
        Poll::Pending
    }
}

/// Spawn a task onto the current worker. The future starts at the tail of
/// the ready queue.
pub fn spawn(fut: impl Future<Output = ()> + 'static) {
    with(|r| r.spawned.push(Box::pin(fut)));
}

/// Drive an external non-blocking primitive through the scheduler: `op`
/// is attempted, and every would-block indication parks the task until
/// `fd` is ready again. Interrupts are retried transparently. An `Ok(0)`
/// from `op` terminates progress and is returned as-is.
pub async fn schedule_io<F>(fd: RawFd, interest: Interest, mut op: F) -> WeftResult<usize>
where
    F: FnMut() -> io::Result<usize>,
{
    loop {
        match op() {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                block_on_fd(fd, interest, None).await?;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Race `fut` against a deadline: `None` when the duration elapses
/// first. The loser's suspension is withdrawn when it drops, so the task
/// never stays parked on a stale wait.
pub fn timeout<F: Future>(duration: Duration, fut: F) -> Timeout<F> {
    Timeout {
        fut,
        sleep: sleep(duration),
    }
}

pub struct Timeout<F> {
    fut: F,
    sleep: Sleep,
}

impl<F: Future> Future for Timeout<F> {
    type Output = Option<F::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Structural pinning of `fut`; `sleep` is Unpin.
        let this = unsafe { self.get_unchecked_mut() };
        let fut = unsafe { Pin::new_unchecked(&mut this.fut) };
        if let Poll::Ready(v) = fut.poll(cx) {
            return Poll::Ready(Some(v));
        }
        if Pin::new(&mut this.sleep).poll(cx).is_ready() {
            return Poll::Ready(None);
        }
        Poll::Pending
    }
}

/// Used by the cooperative mutex to address the suspended task from
/// another thread.
pub(crate) fn current_wake_handle() -> (Arc<Injector>, TaskId) {
    with(|r| (r.injector(), r.current()))
}
