// src/files.rs
//
// Static-directory handler: download, upload, delete, and directory
// listings over a file cache. Mounted under a rest-pattern route.

use std::os::unix::io::IntoRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::cache::{not_modified, CacheStrategy, DefaultStrategy, FileCache, Variant};
use crate::error::WeftResult;
use crate::http::{Body, ClosePolicy, Method, Request, Response};
use crate::router::{Pattern, Router, Scope};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirBehavior {
    /// Serve `index.html`.
    Index,
    /// Serve a generated listing.
    Lists,
    /// `index.html` when present, listing otherwise.
    IndexOrLists,
    /// Directories answer 403.
    Forbidden,
}

pub struct DirOptions {
    pub download: bool,
    pub dir_behavior: DirBehavior,
    pub delete: bool,
    pub upload: bool,
    pub max_upload_size: u64,
    pub strategy: Arc<dyn CacheStrategy>,
}

impl Default for DirOptions {
    fn default() -> Self {
        DirOptions {
            download: true,
            dir_behavior: DirBehavior::Index,
            delete: false,
            upload: false,
            max_upload_size: 10 * 1024 * 1024,
            strategy: Arc::new(DefaultStrategy::default()),
        }
    }
}

pub struct StaticDir {
    root: PathBuf,
    opts: DirOptions,
    cache: FileCache,
}

impl StaticDir {
    pub fn new(root: impl Into<PathBuf>, opts: DirOptions) -> Arc<Self> {
        let cache = FileCache::new(opts.strategy.clone());
        Arc::new(StaticDir {
            root: root.into(),
            opts,
            cache,
        })
    }

    /// Register this directory under `prefix` for GET/HEAD and, when
    /// enabled, PUT and DELETE.
    pub fn mount(self: &Arc<Self>, router: &mut Router, prefix: &str, scope: Scope) {
        let pattern = || Pattern::literal(prefix).rest();
        for method in [Method::Get, Method::Head, Method::Put, Method::Delete] {
            let me = self.clone();
            router.register::<(Vec<String>,), _, _>(
                method,
                pattern(),
                scope.clone(),
                None,
                move |req, (rest,)| {
                    let me = me.clone();
                    async move { me.serve(req, rest).await }
                },
            );
        }
    }

    pub async fn serve(&self, req: Request, rest: Vec<String>) -> WeftResult<Response> {
        // Traversal is rejected before any cache or filesystem access.
        // The decoded path segments are checked, not the wire path, so a
        // query string containing ".." stays legal.
        if rest.iter().any(|s| s == "..") {
            return Ok(Response::forbidden());
        }
        let mut target = self.root.clone();
        for seg in &rest {
            target.push(seg);
        }

        match req.method() {
            Method::Get | Method::Head => self.download(&req, target).await,
            Method::Put => self.upload(&req, target).await,
            Method::Delete => self.delete(target),
            _ => Ok(Response::method_not_allowed()),
        }
    }

    async fn download(&self, req: &Request, target: PathBuf) -> WeftResult<Response> {
        if !self.opts.download {
            return Ok(Response::forbidden());
        }
        let meta = match std::fs::metadata(&target) {
            Ok(m) => m,
            Err(_) => return Ok(Response::not_found()),
        };
        if meta.is_dir() {
            return self.serve_dir(req, target).await;
        }
        self.serve_file(req, &target).await
    }

    async fn serve_dir(&self, req: &Request, dir: PathBuf) -> WeftResult<Response> {
        match self.opts.dir_behavior {
            DirBehavior::Forbidden => Ok(Response::forbidden()),
            DirBehavior::Index => {
                let index = dir.join("index.html");
                if index.is_file() {
                    self.serve_file(req, &index).await
                } else {
                    Ok(Response::not_found())
                }
            }
            DirBehavior::Lists => Ok(listing(req.path(), &dir)),
            DirBehavior::IndexOrLists => {
                let index = dir.join("index.html");
                if index.is_file() {
                    self.serve_file(req, &index).await
                } else {
                    Ok(listing(req.path(), &dir))
                }
            }
        }
    }

    async fn serve_file(&self, req: &Request, path: &Path) -> WeftResult<Response> {
        // The conditional check runs on a bare stat, before any cache
        // resource is acquired.
        let meta = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(_) => return Ok(Response::not_found()),
        };
        let mtime = crate::cache::mtime_float(&meta);
        let etag = format!("\"{:.6}\"", mtime);
        if not_modified(req.headers(), &etag, mtime as u64) {
            return Ok(Response::not_modified().header("ETag", etag));
        }

        let entry = self.cache.lookup(path).await?;
        let mut resp = Response::new(200)
            .header("Content-Type", entry.mime)
            .header("ETag", entry.etag())
            .header("Last-Modified", entry.last_modified());

        match &entry.variant {
            Variant::InMemory(bytes) => {
                resp.body = Body::Shared(bytes.clone());
            }
            Variant::Compressed {
                encoding,
                bytes,
                raw,
            } => {
                resp.headers.set("Vary", "Accept-Encoding");
                if req.headers().has_token("Accept-Encoding", encoding) {
                    resp.headers.set("Content-Encoding", *encoding);
                    resp.body = Body::Shared(bytes.clone());
                } else {
                    resp.body = Body::Shared(raw.clone());
                }
            }
            Variant::SharedFd(shared) => {
                resp.body = Body::File {
                    fd: shared.fd(),
                    size: shared.size,
                    close: ClosePolicy::Keep,
                };
                // The hook pins the shared descriptor until the response
                // has been flushed.
                let pin = shared.clone();
                resp.post_hook = Some(Box::new(move || drop(pin)));
            }
            Variant::SendFilePerRequest | Variant::Uncached => {
                let file = std::fs::File::open(path)?;
                resp.body = Body::File {
                    fd: file.into_raw_fd(),
                    size: entry.size,
                    close: ClosePolicy::Close,
                };
            }
        }
        Ok(resp)
    }

    async fn upload(&self, req: &Request, target: PathBuf) -> WeftResult<Response> {
        if !self.opts.upload {
            return Ok(Response::forbidden());
        }
        if target.is_dir() {
            return Ok(Response::forbidden());
        }

        let body = req.body();
        let tmp = target.with_extension("part");
        let mut sink = std::fs::File::create(&tmp)?;
        let mut total: u64 = 0;
        let mut buf = [0u8; 16 * 1024];
        loop {
            let n = body.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            total += n as u64;
            if total > self.opts.max_upload_size {
                drop(sink);
                let _ = std::fs::remove_file(&tmp);
                // Over-limit uploads answer 413; the connection closes
                // since the remaining body is not read.
                return Ok(Response::payload_too_large().header("Connection", "close"));
            }
            std::io::Write::write_all(&mut sink, &buf[..n]).map_err(crate::error::WeftError::Io)?;
        }
        std::fs::rename(&tmp, &target)?;
        self.cache.evict(&target);
        debug!(path = %target.display(), bytes = total, "upload stored");
        Ok(Response::created())
    }

    fn delete(&self, target: PathBuf) -> WeftResult<Response> {
        if !self.opts.delete {
            return Ok(Response::forbidden());
        }
        match std::fs::remove_file(&target) {
            Ok(()) => {
                self.cache.evict(&target);
                Ok(Response::with_text(200, "deleted"))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Response::not_found()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Entry names are attacker-chosen when uploads are enabled; everything
/// interpolated into the page goes through this first.
fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

fn listing(request_path: &str, dir: &Path) -> Response {
    let mut names: Vec<String> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| {
                let mut name = e.file_name().to_string_lossy().into_owned();
                if e.path().is_dir() {
                    name.push('/');
                }
                name
            })
            .collect(),
        Err(_) => return Response::forbidden(),
    };
    names.sort();

    let title = escape_html(request_path);
    let mut page = String::with_capacity(256 + names.len() * 64);
    page.push_str("<!DOCTYPE html><html><head><title>Index of ");
    page.push_str(&title);
    page.push_str("</title></head><body><h1>Index of ");
    page.push_str(&title);
    page.push_str("</h1><ul>");
    for name in &names {
        page.push_str("<li><a href=\"");
        page.push_str(&crate::uri::percent_encode(name.trim_end_matches('/')));
        if name.ends_with('/') {
            page.push('/');
        }
        page.push_str("\">");
        page.push_str(&escape_html(name));
        page.push_str("</a></li>");
    }
    page.push_str("</ul></body></html>");
    Response::html(page)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dir_options_defaults() {
        let opts = DirOptions::default();
        assert!(opts.download);
        assert!(!opts.upload);
        assert!(!opts.delete);
        assert_eq!(opts.dir_behavior, DirBehavior::Index);
    }

    #[test]
    fn test_listing_escapes_links() {
        let dir = std::env::temp_dir().join("weft-listing-test");
        let _ = std::fs::create_dir_all(dir.join("sub"));
        std::fs::write(dir.join("a file.txt"), b"x").unwrap();
        let resp = listing("/static", &dir);
        assert_eq!(resp.code, 200);
        if let Body::Bytes(b) = &resp.body {
            let html = String::from_utf8_lossy(b);
            assert!(html.contains("a%20file.txt"));
            assert!(html.contains("sub/"));
        } else {
            panic!("expected bytes body");
        }
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_listing_escapes_markup_in_names() {
        let dir = std::env::temp_dir().join("weft-listing-xss-test");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("<script>alert(1)<_script>.txt"), b"x").unwrap();
        let resp = listing("/a&b<c>", &dir);
        if let Body::Bytes(b) = &resp.body {
            let html = String::from_utf8_lossy(b);
            assert!(!html.contains("<script>"));
            assert!(html.contains("&lt;script&gt;alert(1)&lt;_script&gt;.txt"));
            assert!(html.contains("Index of /a&amp;b&lt;c&gt;"));
        } else {
            panic!("expected bytes body");
        }
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_escape_html_covers_metacharacters() {
        assert_eq!(escape_html(r#"a&<>"z"#), "a&amp;&lt;&gt;&quot;z");
        assert_eq!(escape_html("plain.txt"), "plain.txt");
    }
}
