// src/parser.rs
//
// HTTP/1.1 request-head parsing: request line, headers, body framing
// decision. Bytes come through the client's buffered channel; the parser
// never reads past the end of the head, so body bytes stay in the buffer
// for the body reader.

use thiserror::Error;

use crate::error::{WeftError, WeftResult};
use crate::http::{Headers, Method};
use crate::stream::Channel;
use crate::uri;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed request line")]
    BadRequestLine,
    #[error("unsupported protocol version")]
    BadVersion,
    #[error("malformed header line")]
    BadHeader,
    #[error("header section too large")]
    HeaderTooLarge,
    #[error("invalid percent-encoding in path")]
    BadPath,
    #[error("invalid chunk framing")]
    BadChunk,
}

impl ParseError {
    /// Response code for a protocol error: 4xx, then close.
    pub fn status(&self) -> u16 {
        match self {
            ParseError::HeaderTooLarge => 431,
            _ => 400,
        }
    }
}

const MAX_HEADERS: usize = 100;

/// Parsed request head, before routing.
pub struct Head {
    /// None for a syntactically valid method outside the supported set;
    /// the connection answers 405.
    pub method: Option<Method>,
    pub raw_path: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub http_11: bool,
    pub headers: Headers,
}

/// How the request body is framed, decided in this order: chunked
/// transfer-encoding wins over Content-Length (which is then stripped),
/// and absent both the body is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Empty,
    Identity(u64),
    Chunked,
}

/// Read one request head. `Ok(None)` is a clean close before the first
/// byte of a request.
pub async fn read_head(chan: &mut Channel) -> WeftResult<Option<Head>> {
    // Tolerate stray CRLFs between pipelined requests.
    let line = loop {
        match chan.read_line().await? {
            Some(l) if l.is_empty() => continue,
            Some(l) => break l,
            None => return Ok(None),
        }
    };

    let (method, raw_path, http_11) = parse_request_line(&line)?;

    let (path_part, query_part) = match raw_path.find('?') {
        Some(idx) => (&raw_path[..idx], Some(&raw_path[idx + 1..])),
        None => (raw_path.as_str(), None),
    };
    let path = uri::percent_decode(path_part, false)
        .ok_or(WeftError::Parse(ParseError::BadPath))?;
    let query = query_part.map(uri::parse_query).unwrap_or_default();

    let headers = read_headers(chan).await?;

    Ok(Some(Head {
        method,
        raw_path,
        path,
        query,
        http_11,
        headers,
    }))
}

fn parse_request_line(line: &[u8]) -> WeftResult<(Option<Method>, String, bool)> {
    let mut parts = line.split(|&b| b == b' ').filter(|p| !p.is_empty());
    let method_b = parts.next().ok_or(WeftError::Parse(ParseError::BadRequestLine))?;
    let target_b = parts.next().ok_or(WeftError::Parse(ParseError::BadRequestLine))?;
    let version_b = parts.next().ok_or(WeftError::Parse(ParseError::BadRequestLine))?;
    if parts.next().is_some() {
        return Err(WeftError::Parse(ParseError::BadRequestLine));
    }

    if method_b.is_empty() || !method_b.iter().all(|b| b.is_ascii_uppercase()) {
        return Err(WeftError::Parse(ParseError::BadRequestLine));
    }
    let method = Method::from_bytes(method_b);

    let http_11 = match version_b {
        b"HTTP/1.1" => true,
        b"HTTP/1.0" => false,
        _ => return Err(WeftError::Parse(ParseError::BadVersion)),
    };

    let target = std::str::from_utf8(target_b)
        .map_err(|_| WeftError::Parse(ParseError::BadRequestLine))?
        .to_string();
    if !target.starts_with('/') && target != "*" {
        return Err(WeftError::Parse(ParseError::BadRequestLine));
    }

    Ok((method, target, http_11))
}

async fn read_headers(chan: &mut Channel) -> WeftResult<Headers> {
    let mut headers = Headers::new();
    loop {
        let line = match chan.read_line().await? {
            Some(l) => l,
            None => return Err(WeftError::ConnectionClosed),
        };
        if line.is_empty() {
            return Ok(headers);
        }
        if headers.len() >= MAX_HEADERS {
            return Err(WeftError::Parse(ParseError::HeaderTooLarge));
        }
        // Continuation lines (leading whitespace) are not supported.
        if line[0] == b' ' || line[0] == b'\t' {
            return Err(WeftError::Parse(ParseError::BadHeader));
        }
        let (name, value) = parse_header_line(&line)?;
        headers.append(name, value);
    }
}

fn parse_header_line(line: &[u8]) -> WeftResult<(String, String)> {
    let colon = line
        .iter()
        .position(|&b| b == b':')
        .ok_or(WeftError::Parse(ParseError::BadHeader))?;
    if colon == 0 {
        return Err(WeftError::Parse(ParseError::BadHeader));
    }
    let name = &line[..colon];
    if name.iter().any(|&b| b == b' ' || b == b'\t') {
        return Err(WeftError::Parse(ParseError::BadHeader));
    }
    let name = std::str::from_utf8(name)
        .map_err(|_| WeftError::Parse(ParseError::BadHeader))?
        .to_string();
    let value = std::str::from_utf8(&line[colon + 1..])
        .map_err(|_| WeftError::Parse(ParseError::BadHeader))?
        .trim()
        .to_string();
    Ok((name, value))
}

/// Decide body framing from the parsed headers. When both chunked
/// transfer-encoding and a Content-Length are present, chunked wins and
/// the length header is stripped.
pub fn body_framing(headers: &mut Headers) -> WeftResult<Framing> {
    if headers.has_token("Transfer-Encoding", "chunked") {
        headers.remove("Content-Length");
        return Ok(Framing::Chunked);
    }
    match headers.get("Content-Length") {
        Some(v) => {
            let n: u64 = v
                .trim()
                .parse()
                .map_err(|_| WeftError::Parse(ParseError::BadHeader))?;
            if n == 0 {
                Ok(Framing::Empty)
            } else {
                Ok(Framing::Identity(n))
            }
        }
        None => Ok(Framing::Empty),
    }
}

/// Parse a chunk-size line: hex digits, optional extensions after ';'.
pub fn parse_chunk_size(line: &[u8]) -> WeftResult<u64> {
    let end = line
        .iter()
        .position(|&b| b == b';')
        .unwrap_or(line.len());
    let digits = &line[..end];
    let digits = std::str::from_utf8(digits)
        .map_err(|_| WeftError::Parse(ParseError::BadChunk))?
        .trim();
    if digits.is_empty() {
        return Err(WeftError::Parse(ParseError::BadChunk));
    }
    u64::from_str_radix(digits, 16).map_err(|_| WeftError::Parse(ParseError::BadChunk))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_line_basic() {
        let (m, target, http_11) = parse_request_line(b"GET /some/path?foo=bar HTTP/1.1").unwrap();
        assert_eq!(m, Some(Method::Get));
        assert_eq!(target, "/some/path?foo=bar");
        assert!(http_11);
    }

    #[test]
    fn test_request_line_unsupported_method() {
        let (m, _, _) = parse_request_line(b"PATCH /x HTTP/1.1").unwrap();
        assert_eq!(m, None);
    }

    #[test]
    fn test_request_line_rejects_garbage() {
        assert!(parse_request_line(b"GET /x").is_err());
        assert!(parse_request_line(b"get /x HTTP/1.1").is_err());
        assert!(parse_request_line(b"GET /x HTTP/2.0").is_err());
        assert!(parse_request_line(b"GET x HTTP/1.1").is_err());
    }

    #[test]
    fn test_header_line_trims_value_keeps_case() {
        let (k, v) = parse_header_line(b"Host:   Example.COM  ").unwrap();
        assert_eq!(k, "Host");
        assert_eq!(v, "Example.COM");
    }

    #[test]
    fn test_header_line_rejects_space_in_name() {
        assert!(parse_header_line(b"Bad Name: x").is_err());
        assert!(parse_header_line(b"NoColon").is_err());
        assert!(parse_header_line(b": empty").is_err());
    }

    #[test]
    fn test_framing_precedence() {
        let mut h = Headers::new();
        h.set("Transfer-Encoding", "chunked");
        h.set("Content-Length", "10");
        assert_eq!(body_framing(&mut h).unwrap(), Framing::Chunked);
        // Chunked wins and Content-Length is stripped.
        assert!(h.get("Content-Length").is_none());

        let mut h = Headers::new();
        h.set("Content-Length", "5");
        assert_eq!(body_framing(&mut h).unwrap(), Framing::Identity(5));

        let mut h = Headers::new();
        assert_eq!(body_framing(&mut h).unwrap(), Framing::Empty);
    }

    #[test]
    fn test_chunk_size_line() {
        assert_eq!(parse_chunk_size(b"1A").unwrap(), 26);
        assert_eq!(parse_chunk_size(b"0").unwrap(), 0);
        assert_eq!(parse_chunk_size(b"ff;ext=1").unwrap(), 255);
        assert!(parse_chunk_size(b"xyz").is_err());
        assert!(parse_chunk_size(b"").is_err());
    }
}
