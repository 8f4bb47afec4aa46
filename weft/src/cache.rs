// src/cache.rs
//
// Per-process static-file cache. A path maps to one ready-to-serve
// variant chosen by a pluggable strategy; entries are invalidated when
// the on-disk mtime changes. Rebuilds on the same key are coalesced: the
// table lock is short-held, and each entry carries a cooperative mutex
// so one task builds while competing readers wait on it.

use std::collections::HashMap;
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, UNIX_EPOCH};

use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::WeftResult;
use crate::http::Headers;
use crate::mime;
use crate::mutex::CoMutex;
use crate::syscalls;

/// Variant selection, parameterised on file size and content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantKind {
    /// Open a fresh descriptor per request.
    NoCache,
    /// Materialise the contents in memory once.
    MemCache,
    /// Store the deflate-compressed bytes once, plus the raw bytes for
    /// clients that do not accept the encoding.
    CompressCache,
    /// One long-lived descriptor shared by all requests via
    /// offset-accepting sendfile.
    SendFileCache,
    /// sendfile with a per-request descriptor.
    SendFile,
}

pub trait CacheStrategy: Send + Sync {
    fn choose(&self, size: u64, mime: &str) -> VariantKind;
}

/// Size-tiered default: small compressible files get the deflate
/// variant, small binaries live in memory, large files share one
/// descriptor.
pub struct DefaultStrategy {
    pub compress_max: u64,
    pub mem_max: u64,
}

impl Default for DefaultStrategy {
    fn default() -> Self {
        DefaultStrategy {
            compress_max: 256 * 1024,
            mem_max: 1024 * 1024,
        }
    }
}

impl CacheStrategy for DefaultStrategy {
    fn choose(&self, size: u64, mime: &str) -> VariantKind {
        if size <= self.compress_max && mime::is_compressible(mime) {
            VariantKind::CompressCache
        } else if size <= self.mem_max {
            VariantKind::MemCache
        } else {
            VariantKind::SendFileCache
        }
    }
}

/// A descriptor shared by concurrent sendfile responses. Users must go
/// through offset-accepting sendfile only; the kernel offset is never
/// relied on.
pub struct SharedFile {
    fd: RawFd,
    pub size: u64,
}

impl SharedFile {
    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for SharedFile {
    fn drop(&mut self) {
        syscalls::close_fd(self.fd);
    }
}

unsafe impl Send for SharedFile {}
unsafe impl Sync for SharedFile {}

pub enum Variant {
    InMemory(Arc<Vec<u8>>),
    Compressed {
        encoding: &'static str,
        bytes: Arc<Vec<u8>>,
        raw: Arc<Vec<u8>>,
    },
    SharedFd(Arc<SharedFile>),
    SendFilePerRequest,
    Uncached,
}

pub struct CacheEntry {
    pub path: PathBuf,
    /// Modification time as fractional seconds since the epoch; also the
    /// entity tag.
    pub mtime: f64,
    pub size: u64,
    pub mime: &'static str,
    pub variant: Variant,
}

impl CacheEntry {
    pub fn etag(&self) -> String {
        format!("\"{:.6}\"", self.mtime)
    }

    pub fn last_modified(&self) -> String {
        httpdate::fmt_http_date(UNIX_EPOCH + Duration::from_secs(self.mtime as u64))
    }
}

type Slot = Arc<CoMutex<Option<Arc<CacheEntry>>>>;

pub struct FileCache {
    table: StdMutex<HashMap<PathBuf, Slot>>,
    strategy: Arc<dyn CacheStrategy>,
}

impl FileCache {
    pub fn new(strategy: Arc<dyn CacheStrategy>) -> Self {
        FileCache {
            table: StdMutex::new(HashMap::new()),
            strategy,
        }
    }

    /// Resolve `path` to a ready-to-serve entry, rebuilding when the
    /// on-disk mtime has moved.
    pub async fn lookup(&self, path: &Path) -> WeftResult<Arc<CacheEntry>> {
        let slot: Slot = {
            let mut table = self.table.lock().unwrap();
            table
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(CoMutex::new(None)))
                .clone()
        };

        let mut guard = slot.lock().await;
        let meta = std::fs::metadata(path)?;
        let mtime = mtime_float(&meta);
        if let Some(entry) = guard.as_ref() {
            if entry.mtime == mtime {
                return Ok(entry.clone());
            }
        }
        let entry = Arc::new(build_entry(path, meta.size(), mtime, &*self.strategy)?);
        *guard = Some(entry.clone());
        Ok(entry)
    }

    /// Drop a cached entry (tests, explicit invalidation).
    pub fn evict(&self, path: &Path) {
        self.table.lock().unwrap().remove(path);
    }
}

pub fn mtime_float(meta: &std::fs::Metadata) -> f64 {
    meta.mtime() as f64 + meta.mtime_nsec() as f64 / 1e9
}

fn build_entry(
    path: &Path,
    size: u64,
    mtime: f64,
    strategy: &dyn CacheStrategy,
) -> WeftResult<CacheEntry> {
    let mime = mime::from_path(path);
    let variant = match strategy.choose(size, mime) {
        VariantKind::MemCache => Variant::InMemory(Arc::new(std::fs::read(path)?)),
        VariantKind::CompressCache => {
            let raw = std::fs::read(path)?;
            let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
            enc.write_all(&raw).map_err(crate::error::WeftError::Io)?;
            let bytes = enc.finish().map_err(crate::error::WeftError::Io)?;
            Variant::Compressed {
                encoding: "deflate",
                bytes: Arc::new(bytes),
                raw: Arc::new(raw),
            }
        }
        VariantKind::SendFileCache => {
            let fd = std::fs::File::open(path)?.into_raw_fd();
            Variant::SharedFd(Arc::new(SharedFile { fd, size }))
        }
        VariantKind::SendFile => Variant::SendFilePerRequest,
        VariantKind::NoCache => Variant::Uncached,
    };
    Ok(CacheEntry {
        path: path.to_path_buf(),
        mtime,
        size,
        mime,
        variant,
    })
}

fn strip_etag_markers(tag: &str) -> &str {
    tag.trim().trim_start_matches("W/").trim_matches('"')
}

/// Conditional-GET check. If-None-Match takes precedence over
/// If-Modified-Since; a hit means 304 with no body and no resource
/// acquisition.
pub fn not_modified(req_headers: &Headers, etag: &str, mtime_secs: u64) -> bool {
    if let Some(inm) = req_headers.get("If-None-Match") {
        if inm.trim() == "*" {
            return true;
        }
        let want = strip_etag_markers(etag);
        return inm.split(',').any(|t| strip_etag_markers(t) == want);
    }
    if let Some(ims) = req_headers.get("If-Modified-Since") {
        if let Ok(since) = httpdate::parse_http_date(ims) {
            return UNIX_EPOCH + Duration::from_secs(mtime_secs) <= since;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        let mut h = Headers::new();
        for (k, v) in pairs {
            h.set(*k, *v);
        }
        h
    }

    #[test]
    fn test_default_strategy_tiers() {
        let s = DefaultStrategy::default();
        assert_eq!(
            s.choose(1000, "text/html; charset=utf-8"),
            VariantKind::CompressCache
        );
        assert_eq!(s.choose(1000, "image/png"), VariantKind::MemCache);
        assert_eq!(
            s.choose(10 * 1024 * 1024, "image/png"),
            VariantKind::SendFileCache
        );
        assert_eq!(
            s.choose(10 * 1024 * 1024, "text/html; charset=utf-8"),
            VariantKind::SendFileCache
        );
    }

    #[test]
    fn test_if_none_match_formats() {
        let etag = "\"1700000000.123456\"";
        assert!(not_modified(
            &headers(&[("If-None-Match", "\"1700000000.123456\"")]),
            etag,
            1700000000
        ));
        assert!(not_modified(
            &headers(&[("If-None-Match", "W/\"1700000000.123456\"")]),
            etag,
            1700000000
        ));
        assert!(not_modified(&headers(&[("If-None-Match", "*")]), etag, 0));
        assert!(not_modified(
            &headers(&[("If-None-Match", "\"other\", \"1700000000.123456\"")]),
            etag,
            1700000000
        ));
        assert!(!not_modified(
            &headers(&[("If-None-Match", "\"stale\"")]),
            etag,
            1700000000
        ));
    }

    #[test]
    fn test_if_modified_since() {
        let mtime = 1_700_000_000u64;
        let at = UNIX_EPOCH + Duration::from_secs(mtime);
        let later = UNIX_EPOCH + Duration::from_secs(mtime + 60);
        let earlier = UNIX_EPOCH + Duration::from_secs(mtime - 60);
        let h = headers(&[("If-Modified-Since", &httpdate::fmt_http_date(at))]);
        assert!(not_modified(&h, "\"x\"", mtime));
        let h = headers(&[("If-Modified-Since", &httpdate::fmt_http_date(later))]);
        assert!(not_modified(&h, "\"x\"", mtime));
        let h = headers(&[("If-Modified-Since", &httpdate::fmt_http_date(earlier))]);
        assert!(!not_modified(&h, "\"x\"", mtime));
    }

    #[test]
    fn test_inm_precedence_over_ims() {
        // A stale ETag forces a full response even if the date matches.
        let mtime = 1_700_000_000u64;
        let date = httpdate::fmt_http_date(UNIX_EPOCH + Duration::from_secs(mtime));
        let h = headers(&[("If-None-Match", "\"stale\""), ("If-Modified-Since", &date)]);
        assert!(!not_modified(&h, "\"fresh\"", mtime));
    }

    #[test]
    fn test_etag_fixed_precision() {
        let e = CacheEntry {
            path: PathBuf::from("/x"),
            mtime: 1700000000.5,
            size: 1,
            mime: "text/plain",
            variant: Variant::Uncached,
        };
        assert_eq!(e.etag(), "\"1700000000.500000\"");
    }
}
