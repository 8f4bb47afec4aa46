// src/lib.rs
//
// weft: an HTTP/1.1 server library built on a sharded cooperative
// scheduler. N worker threads each run a single-threaded scheduler over
// their own epoll set; every client connection is one task that lives on
// one worker for its lifetime. Socket I/O looks blocking and suspends
// the task on would-block.

pub mod body;
pub mod cache;
pub mod config;
pub mod conn;
pub mod cookie;
pub mod error;
pub mod files;
pub mod filter;
pub mod http;
pub mod io;
pub mod logging;
pub mod metrics;
pub mod mime;
pub mod mutex;
pub mod parser;
pub mod poller;
pub mod reactor;
pub mod router;
pub mod server;
pub mod sse;
pub mod stream;
pub mod syscalls;
pub mod task;
pub mod uri;
pub mod worker;
pub mod writer;

// Re-exports for users
pub use body::BodyReader;
pub use config::{ListenAddr, ServerConfig};
pub use cookie::{Cookie, SameSite};
pub use error::{WeftError, WeftResult};
pub use files::{DirBehavior, DirOptions, StaticDir};
pub use filter::{Filter, FilterOutcome};
pub use http::{Body, ClosePolicy, Headers, Method, Request, Response};
pub use io::{TlsAcceptor, TlsProgress, TlsSession};
pub use logging::{init_logging, init_logging_with_level};
pub use mutex::CoMutex;
pub use reactor::{block_on_fd, schedule_io, sleep, sleep_until, spawn, timeout, yield_now};
pub use router::{Pattern, Router, Scope, Val};
pub use server::Server;
pub use sse::{sse_response, SseEvent};
