// Scheduler-visible behavior over the wire: fairness between clients on
// one worker, cooperative sleeping, the cooperative mutex under
// cross-worker contention, idle timeouts, filters, and virtual hosts.

mod common;

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;
use weft::{CoMutex, Cookie, Filter, Pattern, Response, Router, Scope, ServerConfig};

#[test]
fn test_sleeping_handler_does_not_block_worker() {
    let mut router = Router::new();
    router.get::<(), _, _>(Pattern::literal("/slow"), |_req, ()| async {
        weft::sleep(Duration::from_millis(500)).await;
        Ok(Response::ok("slow"))
    });
    router.get::<(), _, _>(Pattern::literal("/fast"), |_req, ()| async {
        Ok(Response::ok("fast"))
    });
    let mut config = ServerConfig::new();
    config.num_threads = 1;
    let server = start_server(router, config);

    // Kick off the slow request, then ask for the fast one on a second
    // connection handled by the same worker.
    let mut slow = connect(&server);
    slow.write_all(b"GET /slow HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .unwrap();

    std::thread::sleep(Duration::from_millis(50));
    let started = Instant::now();
    let fast = get(&server, "/fast");
    assert_eq!(fast.body_str(), "fast");
    assert!(
        started.elapsed() < Duration::from_millis(300),
        "fast request waited on the sleeping one"
    );

    let resp = read_response(&mut slow, false);
    assert_eq!(resp.body_str(), "slow");
}

#[test]
fn test_stalled_client_does_not_block_others() {
    let mut router = Router::new();
    router.get::<(), _, _>(Pattern::literal("/ping"), |_req, ()| async {
        Ok(Response::ok("pong"))
    });
    let mut config = ServerConfig::new();
    config.num_threads = 1;
    let server = start_server(router, config);

    // A client that sends half a request line and stalls.
    let mut stalled = connect(&server);
    stalled.write_all(b"GET /pi").unwrap();

    for _ in 0..5 {
        let resp = get(&server, "/ping");
        assert_eq!(resp.body_str(), "pong");
    }
}

#[test]
fn test_cooperative_mutex_no_lost_updates() {
    let counter = Arc::new(CoMutex::new(0u64));
    let mut router = Router::new();
    let c = counter.clone();
    router.get::<(), _, _>(Pattern::literal("/incr"), move |_req, ()| {
        let c = c.clone();
        async move {
            let mut guard = c.lock().await;
            let before = *guard;
            // Hold the lock across a suspension so contention is real.
            weft::sleep(Duration::from_millis(5)).await;
            *guard = before + 1;
            let now = *guard;
            drop(guard);
            Ok(Response::ok(now.to_string()))
        }
    });
    let mut config = ServerConfig::new();
    config.num_threads = 4;
    let server = start_server(router, config);
    let port = server.port;

    let mut handles = Vec::new();
    for _ in 0..4 {
        handles.push(std::thread::spawn(move || {
            for _ in 0..5 {
                let mut stream = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
                stream
                    .write_all(b"GET /incr HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
                    .unwrap();
                let resp = common::read_response(&mut stream, false);
                assert_eq!(resp.code, 200);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    // 4 threads x 5 increments, none lost despite the held-across-sleep
    // critical section.
    assert_eq!(*counter.try_lock().unwrap(), 20);
}

#[test]
fn test_idle_timeout_closes_connection() {
    let mut router = Router::new();
    router.get::<(), _, _>(Pattern::literal("/x"), |_req, ()| async {
        Ok(Response::ok("x"))
    });
    let mut config = ServerConfig::new();
    config.num_threads = 1;
    config.timeout = 1;
    let server = start_server(router, config);

    let mut stream = connect(&server);
    let started = Instant::now();
    // Send nothing; the sweep should close us.
    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf).unwrap();
    assert_eq!(n, 0, "expected EOF from idle sweep");
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(900), "closed too early: {:?}", waited);
    assert!(waited < Duration::from_secs(5), "sweep too late: {:?}", waited);
}

#[test]
fn test_timeout_race_returns_none_on_expiry() {
    let mut router = Router::new();
    router.get::<(), _, _>(Pattern::literal("/race"), |_req, ()| async {
        let slept = weft::timeout(Duration::from_millis(50), weft::sleep(Duration::from_secs(30))).await;
        assert!(slept.is_none());
        let quick = weft::timeout(Duration::from_secs(30), weft::sleep(Duration::from_millis(1))).await;
        assert!(quick.is_some());
        Ok(Response::ok("raced"))
    });
    let mut config = ServerConfig::new();
    config.num_threads = 1;
    let server = start_server(router, config);
    let started = Instant::now();
    assert_eq!(get(&server, "/race").body_str(), "raced");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_filters_compose_over_http() {
    let compress_marker = Filter::after(|mut resp| {
        resp.headers.set("X-Compressed", "yes");
        resp
    });
    let stats = Filter::after(|mut resp| {
        let seen = resp.headers.get("X-Compressed").unwrap_or("no").to_string();
        resp.headers.set("X-Stats-Saw-Compressed", seen);
        resp
    });
    // Cross: compression must transform the response before statistics
    // records it.
    let chain = compress_marker.cross(stats);

    let auth = Filter::before(|req| {
        if req.header("Authorization").is_some() {
            Ok(req)
        } else {
            Err(Response::forbidden())
        }
    });

    let mut router = Router::new();
    router.register::<(), _, _>(
        weft::Method::Get,
        Pattern::literal("/filtered"),
        Scope::any(),
        Some(chain),
        |_req, ()| async { Ok(Response::ok("body")) },
    );
    router.register::<(), _, _>(
        weft::Method::Get,
        Pattern::literal("/guarded"),
        Scope::any(),
        Some(auth),
        |_req, ()| async { Ok(Response::ok("secret")) },
    );

    let mut config = ServerConfig::new();
    config.num_threads = 1;
    let server = start_server(router, config);

    let resp = get(&server, "/filtered");
    assert_eq!(resp.header("X-Compressed"), Some("yes"));
    // Statistics saw the already-transformed response.
    assert_eq!(resp.header("X-Stats-Saw-Compressed"), Some("yes"));

    assert_eq!(get(&server, "/guarded").code, 403);
    let authed = request(
        &server,
        "GET",
        "/guarded",
        &[("Authorization", "Bearer t"), ("Connection", "close")],
        b"",
    );
    assert_eq!(authed.body_str(), "secret");
}

#[test]
fn test_virtual_host_scoping() {
    let mut router = Router::new();
    router.register::<(), _, _>(
        weft::Method::Get,
        Pattern::literal("/page"),
        Scope::on_host("alpha.test"),
        None,
        |_req, ()| async { Ok(Response::ok("alpha")) },
    );
    router.register::<(), _, _>(
        weft::Method::Get,
        Pattern::literal("/page"),
        Scope::on_host("beta.test"),
        None,
        |_req, ()| async { Ok(Response::ok("beta")) },
    );
    let mut config = ServerConfig::new();
    config.num_threads = 1;
    let server = start_server(router, config);

    let alpha = request(
        &server,
        "GET",
        "/page",
        &[("Host", "alpha.test:8080"), ("Connection", "close")],
        b"",
    );
    assert_eq!(alpha.body_str(), "alpha");
    let beta = request(
        &server,
        "GET",
        "/page",
        &[("Host", "beta.test"), ("Connection", "close")],
        b"",
    );
    assert_eq!(beta.body_str(), "beta");
    let other = request(
        &server,
        "GET",
        "/page",
        &[("Host", "gamma.test"), ("Connection", "close")],
        b"",
    );
    assert_eq!(other.code, 404);
}

#[test]
fn test_cookies_round_trip() {
    let mut router = Router::new();
    router.get::<(), _, _>(Pattern::literal("/whoami"), |req: weft::Request, ()| {
        let user = req.cookie("user").unwrap_or("nobody").to_string();
        async move {
            Ok(Response::ok(user)
                .set_cookie(&Cookie::new("seen", "1").path("/").http_only())
                .set_cookie(&Cookie::delete("stale")))
        }
    });
    let mut config = ServerConfig::new();
    config.num_threads = 1;
    let server = start_server(router, config);

    let resp = request(
        &server,
        "GET",
        "/whoami",
        &[("Cookie", "user=alice; other=x"), ("Connection", "close")],
        b"",
    );
    assert_eq!(resp.body_str(), "alice");
    let set: Vec<&str> = resp
        .headers
        .iter()
        .filter(|(k, _)| k.eq_ignore_ascii_case("Set-Cookie"))
        .map(|(_, v)| v.as_str())
        .collect();
    assert!(set.contains(&"seen=1; Path=/; HttpOnly"));
    assert!(set.contains(&"stale=; Max-Age=-1"));
}

#[test]
fn test_request_request_isolation() {
    // A reject in one request's filter must not leak into the next
    // request on the same connection.
    let flaky = Filter::before(|req| {
        if req.query_value("deny").is_some() {
            Err(Response::forbidden())
        } else {
            Ok(req)
        }
    });
    let mut router = Router::new();
    router.register::<(), _, _>(
        weft::Method::Get,
        Pattern::literal("/maybe"),
        Scope::any(),
        Some(flaky),
        |_req, ()| async { Ok(Response::ok("allowed")) },
    );
    let mut config = ServerConfig::new();
    config.num_threads = 1;
    let server = start_server(router, config);

    let mut stream = connect(&server);
    stream
        .write_all(b"GET /maybe?deny=1 HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    assert_eq!(read_response(&mut stream, false).code, 403);
    stream
        .write_all(b"GET /maybe HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .unwrap();
    let ok = read_response(&mut stream, false);
    assert_eq!(ok.code, 200);
    assert_eq!(ok.body_str(), "allowed");
}
