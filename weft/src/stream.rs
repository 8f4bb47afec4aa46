// src/stream.rs
//
// Buffered channel over a client stream. One instance per client, sized
// by `ServerConfig::buf_size`. Every read or write refreshes the idle
// deadline handed to the reactor.

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::error::{WeftError, WeftResult};
use crate::io::Stream;

pub struct Channel {
    stream: Stream,
    rbuf: Vec<u8>,
    rpos: usize,
    rend: usize,
    wbuf: Vec<u8>,
    wcap: usize,
    idle: Option<Duration>,
}

impl Channel {
    pub fn new(stream: Stream, buf_size: usize, idle: Option<Duration>) -> Self {
        let cap = buf_size.max(512);
        Channel {
            stream,
            rbuf: vec![0; cap],
            rpos: 0,
            rend: 0,
            wbuf: Vec::with_capacity(cap),
            wcap: cap,
            idle,
        }
    }

    fn deadline(&self) -> Option<Instant> {
        self.idle.map(|d| Instant::now() + d)
    }

    pub fn fd(&self) -> RawFd {
        self.stream.fd()
    }

    pub fn cork(&self, on: bool) {
        self.stream.cork(on);
    }

    pub async fn handshake(&mut self) -> WeftResult<()> {
        let deadline = self.deadline();
        self.stream.handshake(deadline).await
    }

    pub fn buffered(&self) -> &[u8] {
        &self.rbuf[self.rpos..self.rend]
    }

    pub fn consume(&mut self, n: usize) {
        self.rpos = (self.rpos + n).min(self.rend);
    }

    /// Ensure at least one buffered byte, reading from the stream when
    /// empty. Returns the buffered length; 0 means EOF.
    pub async fn fill(&mut self) -> WeftResult<usize> {
        if self.rpos < self.rend {
            return Ok(self.rend - self.rpos);
        }
        self.rpos = 0;
        self.rend = 0;
        let deadline = self.deadline();
        let n = self.stream.read(&mut self.rbuf, deadline).await?;
        self.rend = n;
        Ok(n)
    }

    /// Read one CRLF-terminated line, stripping the terminator. A bare LF
    /// is tolerated. `Ok(None)` is a clean EOF before any byte of the
    /// line; EOF mid-line is a closed-stream error. A line that outgrows
    /// the read buffer is rejected.
    pub async fn read_line(&mut self) -> WeftResult<Option<Vec<u8>>> {
        loop {
            let buf = &self.rbuf[self.rpos..self.rend];
            if let Some(nl) = buf.iter().position(|&b| b == b'\n') {
                let mut line = buf[..nl].to_vec();
                self.consume(nl + 1);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(Some(line));
            }

            // No newline buffered: compact and read more.
            let pending = self.rend - self.rpos;
            if pending >= self.rbuf.len() {
                return Err(WeftError::Parse(crate::parser::ParseError::HeaderTooLarge));
            }
            if self.rpos > 0 {
                self.rbuf.copy_within(self.rpos..self.rend, 0);
                self.rpos = 0;
                self.rend = pending;
            }
            let deadline = self.deadline();
            let tail = self.rend;
            let n = self.stream.read(&mut self.rbuf[tail..], deadline).await?;
            if n == 0 {
                if pending == 0 {
                    return Ok(None);
                }
                return Err(WeftError::ConnectionClosed);
            }
            self.rend += n;
        }
    }

    /// Read into `out`, serving buffered bytes first. 0 means EOF.
    pub async fn read(&mut self, out: &mut [u8]) -> WeftResult<usize> {
        let buf = self.buffered();
        if !buf.is_empty() {
            let n = buf.len().min(out.len());
            out[..n].copy_from_slice(&buf[..n]);
            self.consume(n);
            return Ok(n);
        }
        let deadline = self.deadline();
        self.stream.read(out, deadline).await
    }

    pub async fn write_all(&mut self, data: &[u8]) -> WeftResult<()> {
        if self.wbuf.len() + data.len() > self.wcap {
            self.flush().await?;
        }
        if data.len() >= self.wcap {
            let deadline = self.deadline();
            return self.stream.write_all(data, deadline).await;
        }
        self.wbuf.extend_from_slice(data);
        Ok(())
    }

    pub async fn flush(&mut self) -> WeftResult<()> {
        if self.wbuf.is_empty() {
            return Ok(());
        }
        let deadline = self.deadline();
        self.stream.write_all(&self.wbuf, deadline).await?;
        self.wbuf.clear();
        Ok(())
    }

    /// Emit one chunk of a chunked response body. Empty chunks are the
    /// caller's responsibility to skip (an empty chunk terminates the
    /// body on the wire).
    pub async fn write_chunk(&mut self, data: &[u8]) -> WeftResult<()> {
        let header = format!("{:X}\r\n", data.len());
        self.write_all(header.as_bytes()).await?;
        self.write_all(data).await?;
        self.write_all(b"\r\n").await
    }

    pub async fn finish_chunks(&mut self) -> WeftResult<()> {
        self.write_all(b"0\r\n\r\n").await
    }

    /// Flush buffered output, then copy the file range to the socket.
    pub async fn send_file(&mut self, file_fd: RawFd, offset: &mut u64, len: u64) -> WeftResult<()> {
        self.flush().await?;
        let deadline = self.deadline();
        self.stream.send_file(file_fd, offset, len, deadline).await
    }
}
