// Shared harness for the wire-protocol suites: spawn a server on a free
// port, speak raw HTTP/1.1 over std TcpStream, parse responses.
#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use weft::{Router, Server, ServerConfig};

pub struct TestServer {
    pub port: u16,
    shutdown: Arc<AtomicBool>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server with the given router and config template; blocks
/// until the port accepts connections.
pub fn start_server(router: Router, mut config: ServerConfig) -> TestServer {
    let port = free_port();
    config.listens = vec![weft::ListenAddr::new("127.0.0.1", port)];
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    std::thread::spawn(move || {
        let _ = Server::new(config).serve_with_shutdown(router, flag);
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(_) => break,
            Err(_) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(20))
            }
            Err(e) => panic!("server did not come up on {}: {}", port, e),
        }
    }
    TestServer { port, shutdown }
}

pub fn connect(server: &TestServer) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", server.port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream
}

#[derive(Debug)]
pub struct Resp {
    pub code: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Resp {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

fn read_line(stream: &mut TcpStream) -> Vec<u8> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).unwrap();
        if n == 0 {
            break;
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    line
}

fn read_exact(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).unwrap();
    buf
}

/// Parse one response off the stream. `head_only` skips body reading
/// (HEAD requests and 304s still advertise framing headers).
pub fn read_response(stream: &mut TcpStream, head_only: bool) -> Resp {
    let status = String::from_utf8(read_line(stream)).unwrap();
    assert!(status.starts_with("HTTP/1.1 "), "bad status line: {}", status);
    let code: u16 = status[9..12].parse().unwrap();

    let mut headers = Vec::new();
    loop {
        let line = read_line(stream);
        if line.is_empty() {
            break;
        }
        let line = String::from_utf8(line).unwrap();
        let (k, v) = line.split_once(':').unwrap();
        headers.push((k.trim().to_string(), v.trim().to_string()));
    }

    let resp = Resp {
        code,
        headers,
        body: Vec::new(),
    };
    if head_only || code == 304 {
        return resp;
    }

    let mut resp = resp;
    if let Some(te) = resp.header("Transfer-Encoding") {
        if te.eq_ignore_ascii_case("chunked") {
            loop {
                let size_line = String::from_utf8(read_line(stream)).unwrap();
                let size = usize::from_str_radix(size_line.trim(), 16).unwrap();
                if size == 0 {
                    // Trailer section up to the blank line.
                    while !read_line(stream).is_empty() {}
                    break;
                }
                let chunk = read_exact(stream, size);
                resp.body.extend_from_slice(&chunk);
                let crlf = read_exact(stream, 2);
                assert_eq!(crlf, b"\r\n");
            }
            return resp;
        }
    }
    if let Some(cl) = resp.header("Content-Length") {
        let n: usize = cl.parse().unwrap();
        resp.body = read_exact(stream, n);
        return resp;
    }
    // No framing: read to EOF.
    stream.read_to_end(&mut resp.body).unwrap();
    resp
}

/// One-shot request helper; sends `Connection: close`.
pub fn get(server: &TestServer, path: &str) -> Resp {
    request(server, "GET", path, &[("Connection", "close")], b"")
}

pub fn request(
    server: &TestServer,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &[u8],
) -> Resp {
    let mut stream = connect(server);
    let mut req = format!("{} {} HTTP/1.1\r\nHost: localhost\r\n", method, path);
    for (k, v) in headers {
        req.push_str(&format!("{}: {}\r\n", k, v));
    }
    if !body.is_empty() && !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("Transfer-Encoding")) {
        req.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    req.push_str("\r\n");
    stream.write_all(req.as_bytes()).unwrap();
    stream.write_all(body).unwrap();
    read_response(&mut stream, method == "HEAD")
}
