// src/mime.rs

use std::path::Path;

/// Content type from a file extension. Unknown extensions are served as
/// octet-stream.
pub fn from_path(path: &Path) -> &'static str {
    let ext = match path.extension().and_then(|s| s.to_str()) {
        Some(e) => e.to_ascii_lowercase(),
        None => return "application/octet-stream",
    };
    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" => "text/javascript; charset=utf-8",
        "json" => "application/json; charset=utf-8",
        "xml" => "application/xml; charset=utf-8",
        "txt" => "text/plain; charset=utf-8",
        "md" => "text/markdown; charset=utf-8",
        "csv" => "text/csv; charset=utf-8",
        "ico" => "image/x-icon",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "wasm" => "application/wasm",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "eot" => "application/vnd.ms-fontobject",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        _ => "application/octet-stream",
    }
}

/// Whether the deflate cache variant is worth building for this type.
pub fn is_compressible(mime: &str) -> bool {
    mime.starts_with("text/")
        || mime.starts_with("application/json")
        || mime.starts_with("application/xml")
        || mime.starts_with("image/svg")
        || mime.starts_with("application/wasm")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_extensions() {
        assert_eq!(from_path(Path::new("a/index.html")), "text/html; charset=utf-8");
        assert_eq!(from_path(Path::new("style.CSS")), "text/css; charset=utf-8");
        assert_eq!(from_path(Path::new("pic.jpeg")), "image/jpeg");
        assert_eq!(from_path(Path::new("noext")), "application/octet-stream");
        assert_eq!(from_path(Path::new("odd.xyz")), "application/octet-stream");
    }

    #[test]
    fn test_compressibility() {
        assert!(is_compressible("text/html; charset=utf-8"));
        assert!(is_compressible("application/json; charset=utf-8"));
        assert!(!is_compressible("image/png"));
        assert!(!is_compressible("application/zip"));
    }
}
