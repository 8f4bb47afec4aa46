// Static-directory serving: cache variants, conditional GET, uploads,
// deletes, traversal rejection, directory listings.

mod common;

use std::io::Write;
use std::sync::Arc;

use common::*;
use weft::cache::{CacheStrategy, VariantKind};
use weft::{DirBehavior, DirOptions, Router, Scope, ServerConfig, StaticDir};

struct FixedStrategy(VariantKind);

impl CacheStrategy for FixedStrategy {
    fn choose(&self, _size: u64, _mime: &str) -> VariantKind {
        self.0
    }
}

fn temp_root(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("weft-static-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn spawn_static(root: &std::path::Path, opts: DirOptions) -> TestServer {
    let mut router = Router::new();
    let dir = StaticDir::new(root, opts);
    dir.mount(&mut router, "/static", Scope::any());
    let mut config = ServerConfig::new();
    config.num_threads = 2;
    start_server(router, config)
}

#[test]
fn test_serve_file_with_etag_and_304() {
    let root = temp_root("cond");
    std::fs::write(root.join("x.txt"), b"cached contents").unwrap();
    let server = spawn_static(&root, DirOptions::default());

    let first = get(&server, "/static/x.txt");
    assert_eq!(first.code, 200);
    assert_eq!(first.body_str(), "cached contents");
    assert!(first.header("Last-Modified").is_some());
    let etag = first.header("ETag").unwrap().to_string();
    assert!(etag.starts_with('"') && etag.ends_with('"'));

    let second = request(
        &server,
        "GET",
        "/static/x.txt",
        &[("If-None-Match", &etag), ("Connection", "close")],
        b"",
    );
    assert_eq!(second.code, 304);
    assert!(second.body.is_empty());

    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn test_if_modified_since_304() {
    let root = temp_root("ims");
    std::fs::write(root.join("x.txt"), b"abc").unwrap();
    let server = spawn_static(&root, DirOptions::default());

    let first = get(&server, "/static/x.txt");
    let last_modified = first.header("Last-Modified").unwrap().to_string();
    let second = request(
        &server,
        "GET",
        "/static/x.txt",
        &[("If-Modified-Since", &last_modified), ("Connection", "close")],
        b"",
    );
    assert_eq!(second.code, 304);

    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn test_mtime_change_invalidates_entry() {
    let root = temp_root("inval");
    std::fs::write(root.join("x.txt"), b"old").unwrap();
    let server = spawn_static(&root, DirOptions::default());

    assert_eq!(get(&server, "/static/x.txt").body_str(), "old");

    // Rewrite with a clearly different mtime.
    std::thread::sleep(std::time::Duration::from_millis(20));
    std::fs::write(root.join("x.txt"), b"new contents").unwrap();
    assert_eq!(get(&server, "/static/x.txt").body_str(), "new contents");

    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn test_deflate_variant_honors_accept_encoding() {
    let root = temp_root("deflate");
    let payload = "compress me ".repeat(200);
    std::fs::write(root.join("x.txt"), &payload).unwrap();
    let opts = DirOptions {
        strategy: Arc::new(FixedStrategy(VariantKind::CompressCache)),
        ..Default::default()
    };
    let server = spawn_static(&root, opts);

    let plain = get(&server, "/static/x.txt");
    assert_eq!(plain.code, 200);
    assert!(plain.header("Content-Encoding").is_none());
    assert_eq!(plain.body_str(), payload);

    let compressed = request(
        &server,
        "GET",
        "/static/x.txt",
        &[("Accept-Encoding", "deflate"), ("Connection", "close")],
        b"",
    );
    assert_eq!(compressed.code, 200);
    assert_eq!(compressed.header("Content-Encoding"), Some("deflate"));
    assert!(compressed.body.len() < payload.len());

    // zlib round-trip back to the original.
    let mut decoder = flate2::write::ZlibDecoder::new(Vec::new());
    decoder.write_all(&compressed.body).unwrap();
    assert_eq!(decoder.finish().unwrap(), payload.as_bytes());

    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn test_sendfile_shared_fd_concurrent_requests() {
    let root = temp_root("sendfile");
    let payload: Vec<u8> = (0..128 * 1024).map(|i| (i % 251) as u8).collect();
    std::fs::write(root.join("large.bin"), &payload).unwrap();
    let opts = DirOptions {
        strategy: Arc::new(FixedStrategy(VariantKind::SendFileCache)),
        ..Default::default()
    };
    let server = spawn_static(&root, opts);
    let port = server.port;

    let mut handles = Vec::new();
    for _ in 0..4 {
        let expected = payload.clone();
        handles.push(std::thread::spawn(move || {
            let mut stream = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
            stream
                .write_all(b"GET /static/large.bin HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
                .unwrap();
            let resp = common::read_response(&mut stream, false);
            assert_eq!(resp.code, 200);
            // Every request sees the full file despite the shared fd.
            assert_eq!(resp.body.len(), expected.len());
            assert_eq!(resp.body, expected);
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn test_traversal_rejected_403() {
    let root = temp_root("traversal");
    std::fs::write(root.join("ok.txt"), b"fine").unwrap();
    let server = spawn_static(&root, DirOptions::default());

    assert_eq!(get(&server, "/static/../secret").code, 403);
    assert_eq!(get(&server, "/static/a/../../b").code, 403);
    assert_eq!(get(&server, "/static/%2e%2e/secret").code, 403);
    assert_eq!(get(&server, "/static/ok.txt").code, 200);
    // Dots in the query string are not traversal.
    assert_eq!(get(&server, "/static/ok.txt?range=1..5").code, 200);

    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn test_upload_and_delete_lifecycle() {
    let root = temp_root("upload");
    let opts = DirOptions {
        upload: true,
        delete: true,
        ..Default::default()
    };
    let server = spawn_static(&root, opts);

    let created = request(
        &server,
        "PUT",
        "/static/new.txt",
        &[("Connection", "close")],
        b"uploaded bytes",
    );
    assert_eq!(created.code, 201);
    assert_eq!(std::fs::read(root.join("new.txt")).unwrap(), b"uploaded bytes");

    assert_eq!(get(&server, "/static/new.txt").body_str(), "uploaded bytes");

    let deleted = request(
        &server,
        "DELETE",
        "/static/new.txt",
        &[("Connection", "close")],
        b"",
    );
    assert_eq!(deleted.code, 200);
    assert!(!root.join("new.txt").exists());
    assert_eq!(get(&server, "/static/new.txt").code, 404);

    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn test_upload_over_limit_413() {
    let root = temp_root("toolarge");
    let opts = DirOptions {
        upload: true,
        max_upload_size: 16,
        ..Default::default()
    };
    let server = spawn_static(&root, opts);

    let resp = request(
        &server,
        "PUT",
        "/static/big.bin",
        &[("Connection", "close")],
        &[0u8; 64],
    );
    assert_eq!(resp.code, 413);
    assert!(!root.join("big.bin").exists());

    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn test_upload_disabled_403() {
    let root = temp_root("noupload");
    let server = spawn_static(&root, DirOptions::default());
    let resp = request(
        &server,
        "PUT",
        "/static/x.txt",
        &[("Connection", "close")],
        b"nope",
    );
    assert_eq!(resp.code, 403);
    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn test_directory_listing_modes() {
    let root = temp_root("listing");
    std::fs::write(root.join("index.html"), b"<h1>home</h1>").unwrap();
    std::fs::write(root.join("other.txt"), b"x").unwrap();

    let server = spawn_static(
        &root,
        DirOptions {
            dir_behavior: DirBehavior::Index,
            ..Default::default()
        },
    );
    let resp = get(&server, "/static");
    assert_eq!(resp.code, 200);
    assert_eq!(resp.body_str(), "<h1>home</h1>");
    drop(server);

    let server = spawn_static(
        &root,
        DirOptions {
            dir_behavior: DirBehavior::Lists,
            ..Default::default()
        },
    );
    let resp = get(&server, "/static");
    assert_eq!(resp.code, 200);
    let html = resp.body_str();
    assert!(html.contains("index.html"));
    assert!(html.contains("other.txt"));
    drop(server);

    let server = spawn_static(
        &root,
        DirOptions {
            dir_behavior: DirBehavior::Forbidden,
            ..Default::default()
        },
    );
    assert_eq!(get(&server, "/static").code, 403);

    let _ = std::fs::remove_dir_all(&root);
}
