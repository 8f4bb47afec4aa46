// src/worker.rs
//
// One scheduler per OS thread. The worker owns its poller, ready queue,
// sleep heap, and registry; a client lives on the worker that received
// it for its whole lifetime. There is no work stealing. The only
// cross-thread state on the hot path is the connection counter the
// acceptor reads and the injector other workers wake mutexes through.

use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::{ListenAddr, ServerConfig};
use crate::conn::{client_task, WorkerCtx};
use crate::error::WeftResult;
use crate::metrics::WorkerMetrics;
use crate::reactor::{self, Injector, Reactor, TOKEN_INJECTOR, TOKEN_INTAKE};
use crate::router::Router;
use crate::syscalls;
use crate::task::{TaskId, TaskSlab};

/// Per-iteration cap on ready-task runs, so a storm of runnable tasks
/// cannot starve the poller.
const RUN_BUDGET: usize = 256;
/// Poll timeout ceiling; bounds shutdown latency.
const POLL_CAP_MS: i32 = 500;
/// How long a draining worker waits for stragglers after shutdown.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// The cross-thread face of a worker.
pub(crate) struct WorkerShared {
    /// Live clients on this worker. Written only by the owning worker;
    /// the acceptor scans it with relaxed loads when balancing.
    pub connection_count: AtomicUsize,
    pub metrics: Arc<WorkerMetrics>,
    pub injector: Arc<Injector>,
}

pub(crate) struct Worker {
    id: usize,
    slab: TaskSlab,
    reactor: Box<Reactor>,
    shared: Arc<WorkerShared>,
    intake_fd: RawFd,
    router: Arc<Router>,
    config: Arc<ServerConfig>,
    listens: Arc<Vec<ListenAddr>>,
}

impl Worker {
    pub fn new(
        id: usize,
        shared: Arc<WorkerShared>,
        intake_fd: RawFd,
        router: Arc<Router>,
        config: Arc<ServerConfig>,
        listens: Arc<Vec<ListenAddr>>,
    ) -> WeftResult<Self> {
        let capacity = config.max_connections + 16;
        let reactor = Box::new(Reactor::new(capacity, shared.injector.clone())?);
        Ok(Worker {
            id,
            slab: TaskSlab::new(capacity),
            reactor,
            shared,
            intake_fd,
            router,
            config,
            listens,
        })
    }

    pub fn run(mut self, shutdown: Arc<AtomicBool>) {
        if let Err(e) = self
            .reactor
            .poller
            .watch(self.shared.injector.fd(), TOKEN_INJECTOR)
        {
            warn!(worker = self.id, error = %e, "injector watch failed");
        }
        if let Err(e) = self.reactor.poller.watch(self.intake_fd, TOKEN_INTAKE) {
            warn!(worker = self.id, error = %e, "intake watch failed");
        }

        let ctx = Rc::new(WorkerCtx {
            shared: self.shared.clone(),
            router: self.router.clone(),
            config: self.config.clone(),
            listens: self.listens.clone(),
            shutdown: shutdown.clone(),
        });

        debug!(worker = self.id, "entering event loop");
        let mut draining_since: Option<Instant> = None;
        let mut intake_open = true;

        loop {
            self.file_spawned();

            // 1. Drain the ready queue, bounded per iteration.
            let mut budget = RUN_BUDGET;
            while budget > 0 {
                let id = match self.reactor.pop_ready() {
                    Some(id) => id,
                    None => break,
                };
                budget -= 1;
                self.poll_task(id);
                self.file_spawned();
            }

            // Shutdown: unblock idle readers once, then drain.
            if shutdown.load(Ordering::Acquire) && draining_since.is_none() {
                draining_since = Some(Instant::now());
                self.reactor.abort_blocked();
            }
            if let Some(since) = draining_since {
                let idle = self.slab.live() == 0 && !self.reactor.has_ready();
                if idle || since.elapsed() > DRAIN_GRACE {
                    break;
                }
            }

            // 2..3. Compute the timeout and poll.
            let now = Instant::now();
            let timeout = self.reactor.next_timeout_ms(now, POLL_CAP_MS);
            let events = match self.reactor.poller.wait(timeout) {
                Ok(ev) => ev,
                Err(e) => {
                    warn!(worker = self.id, error = %e, "poll failed");
                    continue;
                }
            };

            // 4. Dispatch readiness.
            for ev in events {
                match ev.token {
                    TOKEN_INJECTOR => {
                        for id in self.shared.injector.drain() {
                            self.reactor.enqueue(id);
                        }
                    }
                    TOKEN_INTAKE => {
                        if intake_open && !self.drain_intake(&ctx) {
                            intake_open = false;
                            self.reactor.poller.forget(self.intake_fd);
                        }
                    }
                    token => self.reactor.on_io_event(token as RawFd, ev.hangup),
                }
            }

            // 5..6. Wake expired sleepers, sweep idle clients.
            let now = Instant::now();
            self.reactor.expire_sleepers(now);
            self.reactor.sweep_io_deadlines(now);
        }

        syscalls::close_fd(self.intake_fd);
        info!(worker = self.id, "worker exiting");
    }

    /// Move futures spawned from inside tasks into the slab, in spawn
    /// order.
    fn file_spawned(&mut self) {
        if self.reactor.spawned.is_empty() {
            return;
        }
        for fut in std::mem::take(&mut self.reactor.spawned) {
            match self.slab.spawn(fut) {
                Some(id) => self.reactor.enqueue(id),
                None => warn!(worker = self.id, "task slab full, dropping spawned task"),
            }
        }
    }

    fn poll_task(&mut self, id: TaskId) {
        let mut fut = match self.slab.take(id) {
            Some(f) => f,
            // Stale queue entry for a finished task.
            None => return,
        };
        self.reactor.set_current(id);
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let reactor_ptr: *mut Reactor = &mut *self.reactor;
        let result = {
            let _guard = reactor::enter(reactor_ptr);
            fut.as_mut().poll(&mut cx)
        };
        match result {
            Poll::Pending => self.slab.park(id, fut),
            Poll::Ready(()) => {
                drop(fut);
                self.slab.finish(id);
            }
        }
    }

    /// Accept handed-off connections from the acceptor pipe. Returns
    /// false once the pipe reports EOF (acceptor has shut down).
    fn drain_intake(&mut self, ctx: &Rc<WorkerCtx>) -> bool {
        loop {
            let mut rec = [0u8; syscalls::CONN_RECORD_LEN];
            let mut got = 0;
            while got < rec.len() {
                match syscalls::read_fd(self.intake_fd, &mut rec[got..]) {
                    Ok(0) => {
                        // Mid-record EOF cannot happen: records are
                        // written atomically.
                        return false;
                    }
                    Ok(n) => got += n,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        if got == 0 {
                            return true;
                        }
                        continue;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        warn!(worker = self.id, error = %e, "intake pipe read failed");
                        return false;
                    }
                }
            }
            let (fd, addr_index) = syscalls::decode_conn_record(&rec);
            let task = client_task(ctx.clone(), fd, addr_index as usize);
            match self.slab.spawn(Box::pin(task)) {
                Some(id) => self.reactor.enqueue(id),
                None => {
                    // Out of capacity: shed the connection.
                    warn!(worker = self.id, "slab full, refusing connection");
                    syscalls::close_fd(fd);
                }
            }
        }
    }
}

fn noop_raw_waker() -> RawWaker {
    RawWaker::new(std::ptr::null(), &NOOP_VTABLE)
}

static NOOP_VTABLE: RawWakerVTable =
    RawWakerVTable::new(|_| noop_raw_waker(), |_| {}, |_| {}, |_| {});

/// Wakeups flow through the reactor's own queues, never through the
/// waker; polls get an inert one.
fn noop_waker() -> Waker {
    unsafe { Waker::from_raw(noop_raw_waker()) }
}
