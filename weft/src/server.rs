// src/server.rs
//
// Server assembly: bind the listeners, spawn one pinned worker per
// thread, then run the acceptor, which hands each accepted connection to
// the least-loaded worker over a pipe. Balancing reads the per-worker
// connection counters with relaxed loads; staleness is accepted to keep
// the accept path lock-free.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::error::{WeftError, WeftResult};
use crate::metrics::WorkerMetrics;
use crate::reactor::Injector;
use crate::router::Router;
use crate::syscalls;
use crate::worker::{Worker, WorkerShared};

pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Server { config }
    }

    /// Convenience: a plain-TCP server on `host:port` with defaults.
    pub fn bind(host_port: &str) -> Self {
        let (host, port) = match host_port.rsplit_once(':') {
            Some((h, p)) => (h.to_string(), p.parse().unwrap_or(8080)),
            None => (host_port.to_string(), 8080),
        };
        let config = ServerConfig::new().listen(crate::config::ListenAddr::new(host, port));
        Server { config }
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.config.num_threads = n.max(1);
        self
    }

    /// Run until ctrl-c. Startup failures (bind, worker creation)
    /// propagate; the caller exits.
    pub fn serve(self, router: Router) -> WeftResult<()> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            shutdown_clone.store(true, Ordering::SeqCst);
        }) {
            warn!(error = %e, "ctrl-c handler not installed");
        }
        self.serve_with_shutdown(router, shutdown)
    }

    /// Run until `shutdown` becomes true.
    pub fn serve_with_shutdown(
        mut self,
        router: Router,
        shutdown: Arc<AtomicBool>,
    ) -> WeftResult<()> {
        if self.config.listens.is_empty() {
            return Err(WeftError::Fatal("no listen addresses configured".into()));
        }
        for (i, addr) in self.config.listens.iter_mut().enumerate() {
            addr.index = i;
        }
        if self.config.mask_sigpipe {
            syscalls::mask_sigpipe();
        }

        let config = Arc::new(self.config);
        let listens = Arc::new(config.listens.clone());
        let router = Arc::new(router);

        // Bind everything up front; a bind failure is fatal before any
        // thread starts.
        let mut listen_fds: Vec<RawFd> = Vec::with_capacity(listens.len());
        for addr in listens.iter() {
            let fd = syscalls::create_listen_socket(&addr.host, addr.port, addr.reuse_addr)
                .map_err(|e| {
                    WeftError::Fatal(format!("bind {}:{}: {}", addr.host, addr.port, e))
                })?;
            info!(host = %addr.host, port = addr.port, index = addr.index, "listening");
            listen_fds.push(fd);
        }

        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        let mut shareds: Vec<Arc<WorkerShared>> = Vec::with_capacity(config.num_threads);
        let mut pipe_writers: Vec<RawFd> = Vec::with_capacity(config.num_threads);
        let mut handles = Vec::with_capacity(config.num_threads);

        info!(workers = config.num_threads, "starting workers");
        for i in 0..config.num_threads {
            let injector = Injector::new()?;
            let shared = Arc::new(WorkerShared {
                connection_count: std::sync::atomic::AtomicUsize::new(0),
                metrics: Arc::new(WorkerMetrics::new()),
                injector,
            });
            let (pipe_r, pipe_w) = syscalls::create_pipe()?;
            shareds.push(shared.clone());
            pipe_writers.push(pipe_w);

            let core_id = core_ids.get(i % core_ids.len().max(1)).copied();
            let router = router.clone();
            let config = config.clone();
            let listens = listens.clone();
            let shutdown = shutdown.clone();

            let handle = thread::Builder::new()
                .name(format!("weft-worker-{}", i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        if core_affinity::set_for_current(id) {
                            info!(worker = i, cpu = id.id, "pinned");
                        }
                    }
                    match Worker::new(i, shared, pipe_r, router, config, listens) {
                        Ok(worker) => worker.run(shutdown),
                        Err(e) => {
                            // A worker that cannot start leaves the pool
                            // undersized in a way the acceptor cannot
                            // see; treat it as fatal.
                            error!(worker = i, error = %e, "worker creation failed");
                            std::process::exit(1);
                        }
                    }
                })
                .map_err(|e| WeftError::Fatal(format!("spawn worker {}: {}", i, e)))?;
            handles.push(handle);
        }

        // Periodic metrics reporter.
        {
            let shareds = shareds.clone();
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name("weft-metrics".to_string())
                .spawn(move || {
                    while !shutdown.load(Ordering::Acquire) {
                        thread::sleep(Duration::from_secs(5));
                        if shutdown.load(Ordering::Acquire) {
                            break;
                        }
                        let mut conns = 0u64;
                        let mut reqs = 0u64;
                        let mut bytes = 0u64;
                        for s in &shareds {
                            conns += s.metrics.active_conns.load(Ordering::Relaxed);
                            reqs += s.metrics.req_count.load(Ordering::Relaxed);
                            bytes += s.metrics.bytes_sent.load(Ordering::Relaxed);
                        }
                        info!(active = conns, requests = reqs, bytes_sent = bytes, "stats");
                    }
                })
                .ok();
        }

        run_acceptor(
            &listen_fds,
            &shareds,
            &pipe_writers,
            config.max_connections,
            &shutdown,
        );

        // Closing the write ends EOFs every worker's intake pipe.
        for fd in listen_fds {
            syscalls::close_fd(fd);
        }
        for fd in pipe_writers {
            syscalls::close_fd(fd);
        }
        for handle in handles {
            let _ = handle.join();
        }
        info!("server shut down");
        Ok(())
    }
}

/// Accept loop: level-triggered epoll over every listener; each accepted
/// socket goes to the worker with the fewest live connections, ties to
/// the lowest worker id. While the global cap is reached nothing is
/// accepted and connections queue in the kernel backlog.
fn run_acceptor(
    listen_fds: &[RawFd],
    shareds: &[Arc<WorkerShared>],
    pipe_writers: &[RawFd],
    max_connections: usize,
    shutdown: &AtomicBool,
) {
    let epoll = match syscalls::Epoll::new() {
        Ok(e) => e,
        Err(e) => {
            error!(error = %e, "acceptor epoll failed");
            return;
        }
    };
    for (idx, &fd) in listen_fds.iter().enumerate() {
        if let Err(e) = epoll.add(fd, idx as u64, libc::EPOLLIN as u32) {
            error!(index = idx, error = %e, "acceptor register failed");
            return;
        }
    }

    let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; 64];

    while !shutdown.load(Ordering::Acquire) {
        let n = match epoll.wait(&mut events, 500) {
            Ok(n) => n,
            Err(_) => continue,
        };

        for ev in &events[..n] {
            let addr_index = ev.u64 as usize;
            let listen_fd = listen_fds[addr_index];
            loop {
                let total: usize = shareds
                    .iter()
                    .map(|s| s.connection_count.load(Ordering::Relaxed))
                    .sum();
                if total >= max_connections {
                    // At the cap: stop accepting, let the backlog hold
                    // them, and back off so the level-triggered listener
                    // does not spin.
                    thread::sleep(Duration::from_millis(10));
                    break;
                }
                match syscalls::accept_connection(listen_fd) {
                    Ok(Some(client_fd)) => {
                        let target = least_loaded(shareds);
                        if syscalls::send_conn_over_pipe(
                            pipe_writers[target],
                            client_fd,
                            addr_index as u32,
                        )
                        .is_err()
                        {
                            syscalls::close_fd(client_fd);
                        }
                    }
                    Ok(None) => break,
                    Err(_) => break,
                }
            }
        }
    }
    info!("acceptor exiting");
}

fn least_loaded(shareds: &[Arc<WorkerShared>]) -> usize {
    let mut best = 0;
    let mut best_count = usize::MAX;
    for (i, s) in shareds.iter().enumerate() {
        let c = s.connection_count.load(Ordering::Relaxed);
        if c < best_count {
            best = i;
            best_count = c;
        }
    }
    best
}
