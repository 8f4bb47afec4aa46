// src/writer.rs
//
// Response serialization. The socket is corked around the response so the
// header and the first body bytes leave in full segments.

use std::time::SystemTime;

use crate::error::WeftResult;
use crate::http::{reason, Body, Response};
use crate::stream::Channel;

/// Write `resp` to the channel. For HEAD requests the body is suppressed
/// but its framing headers are still emitted and its resources released.
/// Returns the number of bytes put on the wire.
pub async fn write_response(
    chan: &mut Channel,
    mut resp: Response,
    head_only: bool,
    keep_alive: bool,
) -> WeftResult<u64> {
    let mut body = std::mem::replace(&mut resp.body, Body::Empty);

    if !resp.headers.contains("Date") {
        resp.headers
            .set("Date", httpdate::fmt_http_date(SystemTime::now()));
    }
    if !resp.headers.contains("Connection") {
        resp.headers.set(
            "Connection",
            if keep_alive { "keep-alive" } else { "close" },
        );
    }

    // Body framing. 304 and HEAD still advertise the entity's framing;
    // only the bytes are withheld.
    match &body {
        Body::Empty => {
            if !resp.headers.contains("Content-Type") && !resp.headers.contains("Content-Length") {
                resp.headers.set("Content-Length", "0");
            }
        }
        Body::Bytes(b) => {
            resp.headers.set("Content-Length", b.len().to_string());
        }
        Body::Shared(b) => {
            resp.headers.set("Content-Length", b.len().to_string());
        }
        Body::File { size, .. } => {
            resp.headers.set("Content-Length", size.to_string());
        }
        Body::Stream(_) => {
            resp.headers.set("Transfer-Encoding", "chunked");
        }
    }

    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(b"HTTP/1.1 ");
    head.extend_from_slice(resp.code.to_string().as_bytes());
    head.push(b' ');
    head.extend_from_slice(reason(resp.code).as_bytes());
    head.extend_from_slice(b"\r\n");
    for (k, v) in resp.headers.iter() {
        head.extend_from_slice(k.as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(v.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");

    chan.cork(true);
    let mut written = head.len() as u64;
    chan.write_all(&head).await?;

    if !head_only && resp.code != 304 {
        match &mut body {
            Body::Empty => {}
            Body::Bytes(b) => {
                chan.write_all(b).await?;
                written += b.len() as u64;
            }
            Body::Shared(b) => {
                chan.write_all(b).await?;
                written += b.len() as u64;
            }
            Body::File { fd, size, .. } => {
                let (fd, size) = (*fd, *size);
                let mut offset = 0u64;
                chan.send_file(fd, &mut offset, size).await?;
                written += size;
                // The descriptor is released by the body's drop, per its
                // close policy.
            }
            Body::Stream(source) => {
                while let Some(chunk) = source.next_chunk() {
                    if chunk.is_empty() {
                        continue;
                    }
                    chan.write_chunk(&chunk).await?;
                    written += chunk.len() as u64;
                }
                chan.finish_chunks().await?;
            }
        }
    }
    drop(body);

    chan.flush().await?;
    chan.cork(false);

    if let Some(hook) = resp.post_hook.take() {
        hook();
    }
    Ok(written)
}
