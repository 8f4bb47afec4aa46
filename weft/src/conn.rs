// src/conn.rs
//
// The per-client task: parse a request, route it, run the handler, write
// the response, drain leftovers, repeat until the connection closes.
// Error classes follow one rule each: transport errors close without a
// response, protocol errors answer 4xx and close, policy and handler
// errors answer and keep the connection when framing allows.

use std::cell::RefCell;
use std::future::Future;
use std::os::unix::io::RawFd;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use tracing::{debug, error};

use crate::body::BodyReader;
use crate::config::{ListenAddr, ServerConfig};
use crate::cookie;
use crate::error::{WeftError, WeftResult};
use crate::filter::FilterOutcome;
use crate::http::{Method, Request, Response};
use crate::io::Stream;
use crate::parser;
use crate::reactor::yield_now;
use crate::router::{HandlerFuture, Router};
use crate::stream::Channel;
use crate::worker::WorkerShared;
use crate::writer::write_response;

/// Per-worker context shared by every client task on that worker.
pub(crate) struct WorkerCtx {
    pub shared: Arc<WorkerShared>,
    pub router: Arc<Router>,
    pub config: Arc<ServerConfig>,
    pub listens: Arc<Vec<ListenAddr>>,
    pub shutdown: Arc<AtomicBool>,
}

struct ConnGuard {
    shared: Arc<WorkerShared>,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.shared.connection_count.fetch_sub(1, Ordering::Relaxed);
        self.shared.metrics.dec_conn();
    }
}

pub(crate) async fn client_task(ctx: Rc<WorkerCtx>, fd: RawFd, addr_index: usize) {
    ctx.shared.connection_count.fetch_add(1, Ordering::Relaxed);
    ctx.shared.metrics.inc_conn();
    let _guard = ConnGuard {
        shared: ctx.shared.clone(),
    };

    let stream = match ctx.listens.get(addr_index).and_then(|a| a.tls.clone()) {
        Some(acceptor) => Stream::tls(fd, acceptor.accept()),
        None => Stream::plain(fd),
    };
    let mut channel = Channel::new(stream, ctx.config.buf_size, ctx.config.idle());
    if let Err(e) = channel.handshake().await {
        debug!(fd, error = %e, "tls handshake failed");
        return;
    }
    let chan = Rc::new(RefCell::new(channel));

    let mut served: u32 = 0;
    loop {
        let head = {
            let mut c = chan.borrow_mut();
            parser::read_head(&mut c).await
        };
        let head = match head {
            Ok(Some(h)) => h,
            // Clean close between requests.
            Ok(None) => break,
            Err(e) if e.is_transport() => break,
            Err(WeftError::Parse(pe)) => {
                let resp = Response::with_text(pe.status(), pe.to_string());
                let _ = {
                    let mut c = chan.borrow_mut();
                    write_response(&mut c, resp, false, false).await
                };
                break;
            }
            Err(e) => {
                error!(error = %e, "request read failed");
                break;
            }
        };

        let mut head = head;
        let framing = match parser::body_framing(&mut head.headers) {
            Ok(f) => f,
            Err(_) => {
                let resp = Response::bad_request();
                let _ = {
                    let mut c = chan.borrow_mut();
                    write_response(&mut c, resp, false, false).await
                };
                break;
            }
        };
        let body = BodyReader::new(chan.clone(), framing);

        // Methods outside the supported set answer 405; the body is
        // still drained so the connection can be reused.
        let method = match head.method {
            Some(m) => m,
            None => {
                if body.drain().await.is_err() {
                    break;
                }
                let resp = Response::method_not_allowed();
                let keep = served + 1 < ctx.config.keep_alive_limit;
                let written = {
                    let mut c = chan.borrow_mut();
                    write_response(&mut c, resp, false, keep).await
                };
                if written.is_err() || !keep {
                    break;
                }
                served += 1;
                yield_now().await;
                continue;
            }
        };

        let close_requested = head.headers.has_token("Connection", "close")
            || (!head.http_11 && !head.headers.has_token("Connection", "keep-alive"));
        let host = head.headers.get("Host").map(|h| h.to_string());
        let cookies = head
            .headers
            .get("Cookie")
            .map(cookie::parse_cookie_header)
            .unwrap_or_default();

        let request = Request {
            method,
            raw_path: head.raw_path,
            path: head.path,
            query: head.query,
            headers: head.headers,
            host: host.clone(),
            cookies,
            body: body.clone(),
            start: Instant::now(),
            close_after: close_requested,
            addr_index,
        };

        let head_only = method == Method::Head;
        let response = handle_request(&ctx, request, addr_index, host.as_deref()).await;

        ctx.shared.metrics.inc_req();
        served += 1;

        let response = match response {
            Ok(resp) => resp,
            Err(e) if e.is_transport() => break,
            Err(WeftError::Handler { code, message }) => Response::with_text(code, message),
            Err(e) => {
                error!(error = %e, "handler failed");
                Response::internal_error()
            }
        };

        let keep_alive = !close_requested
            && !response.wants_close()
            && served < ctx.config.keep_alive_limit
            && !ctx.shutdown.load(Ordering::Acquire);

        let written = {
            let mut c = chan.borrow_mut();
            write_response(&mut c, response, head_only, keep_alive).await
        };
        match written {
            Ok(n) => ctx.shared.metrics.add_bytes(n),
            Err(_) => break,
        }

        if !keep_alive {
            break;
        }
        // Leftover body bytes are consumed to the message boundary
        // before the next request is read.
        if body.drain().await.is_err() {
            break;
        }
        // Give other clients on this worker a turn between requests.
        yield_now().await;
    }
}

async fn handle_request(
    ctx: &Rc<WorkerCtx>,
    request: Request,
    addr_index: usize,
    host: Option<&str>,
) -> WeftResult<Response> {
    let (handler, vals, filter) =
        match ctx
            .router
            .dispatch(request.method(), addr_index, host, request.path())
        {
            Some(found) => found,
            None => return Ok(Response::not_found()),
        };

    let (request, post) = match filter {
        Some(f) => match f.apply(request) {
            FilterOutcome::Pass(req, post) => (req, post),
            FilterOutcome::Reject(resp) => return Ok(resp),
        },
        None => (request, None),
    };

    let result = CatchUnwind {
        inner: handler(request, vals),
    }
    .await;

    let response = match result {
        Ok(r) => r?,
        Err(()) => {
            error!("handler panicked");
            Response::internal_error()
        }
    };

    Ok(match post {
        Some(p) => p(response),
        None => response,
    })
}

/// Isolates handler panics so one request cannot take the worker down.
struct CatchUnwind {
    inner: HandlerFuture,
}

impl Future for CatchUnwind {
    type Output = Result<WeftResult<Response>, ()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let me = self.get_mut();
        match std::panic::catch_unwind(AssertUnwindSafe(|| me.inner.as_mut().poll(cx))) {
            Ok(Poll::Ready(v)) => Poll::Ready(Ok(v)),
            Ok(Poll::Pending) => Poll::Pending,
            Err(_) => Poll::Ready(Err(())),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_request(path: &str) -> Request {
    use crate::http::Headers;
    use crate::parser::Framing;
    use crate::syscalls;

    let (r, w) = syscalls::create_pipe().unwrap();
    syscalls::close_fd(w);
    let chan = Rc::new(RefCell::new(Channel::new(Stream::plain(r), 1024, None)));
    Request {
        method: Method::Get,
        raw_path: path.to_string(),
        path: path.to_string(),
        query: Vec::new(),
        headers: Headers::new(),
        host: None,
        cookies: Vec::new(),
        body: BodyReader::new(chan, Framing::Empty),
        start: Instant::now(),
        close_after: false,
        addr_index: 0,
    }
}
